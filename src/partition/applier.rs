use bytes::Bytes;
use log::{debug, error};
use raft::membership::Membership;
use raft::message::{LogEntry, LogIndex};
use storage::Storage;

use crate::cluster::identity::NodeIdentity;
use crate::error::Error;
use crate::partition::command::{Command, Kind};

/// What applying one entry produced, handed back to whoever proposed it.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Noop,
    Written,
    Value(Option<Bytes>),
    Membership(Membership<NodeIdentity>),
}

/// Applies committed entries to the partition storage, strictly in log order.
pub struct Applier {
    storage: Box<dyn Storage>,
    applied_idx: LogIndex,
}

impl Applier {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        Applier {
            storage,
            applied_idx: LogIndex::default(),
        }
    }

    pub fn applied_idx(&self) -> LogIndex {
        self.applied_idx
    }

    /// Applies the entry at `index`, which must directly follow the last applied one.
    ///
    /// An entry which fails to decode or to be stored still counts as applied; the error goes back to its proposer.
    ///
    /// # Panics
    ///
    /// Applying entries out of order would let replicas diverge, so it panics.
    pub fn apply(&mut self, index: LogIndex, entry: &LogEntry) -> Result<Applied, Error> {
        if index != self.applied_idx + 1 {
            panic!(
                "applying entry {} out of order, last applied entry is {}",
                index, self.applied_idx
            );
        }
        self.applied_idx = index;

        let result = self.apply_data(entry.data.clone());
        if let Err(err) = &result {
            error!("failed to apply entry {}: {}", index, err);
        }
        result
    }

    fn apply_data(&mut self, data: Bytes) -> Result<Applied, Error> {
        let command = Command::from_bytes(data)?;

        match command.kind {
            None => Ok(Applied::Noop),
            Some(Kind::Put(put)) => {
                debug!("put {} bytes at {:?}", put.value.len(), put.key);
                self.storage.put(&put.key, &put.value)?;
                Ok(Applied::Written)
            }
            Some(Kind::Read(read)) => Ok(Applied::Value(self.storage.get(&read.key)?.map(Bytes::from))),
            Some(Kind::Membership(change)) => Ok(Applied::Membership(change.to_membership()?)),
        }
    }
}
