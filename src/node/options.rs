use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use raft::node::Config;
use storage::in_memory::InMemoryStorage;
use storage::Storage;

use crate::cluster::identity::NodeIdentity;

/// Builds the storage of a partition replica, given the partition name.
pub type StorageFactory = Arc<dyn Fn(&str) -> Box<dyn Storage> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Options {
    /// Members of an existing cluster to join through. Empty to start a new cluster.
    pub base: Vec<NodeIdentity>,
    pub listen: SocketAddr,
    /// Number of replicas partitions grow to on their own.
    pub replicas: usize,
    pub request_timeout: Duration,
    /// How long a new replica keeps asking to be added to its partition.
    pub join_timeout: Duration,
    pub connect_timeout: Duration,
    pub gossip_interval: Duration,
    /// How long a node stays unreachable before learners hosted on it are removed.
    pub suspect_after: Duration,
    /// Threads running the request handler.
    pub handler_threads: usize,
    pub subnode: SubnodeOptions,
}

#[derive(Debug, Clone, Default)]
pub struct SubnodeOptions {
    pub consensus_backend: ConsensusBackend,
}

#[derive(Clone)]
pub struct ConsensusBackend {
    pub storage: StorageFactory,
    /// Duration of one raft timer tick. Must be the same on every node.
    pub tick_interval: Duration,
    pub raft: Config,
}

impl Options {
    pub fn with_base(base: Vec<NodeIdentity>) -> Self {
        Options {
            base,
            ..Options::default()
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            base: vec![],
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            replicas: 3,
            request_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(1),
            gossip_interval: Duration::from_secs(1),
            suspect_after: Duration::from_secs(3),
            handler_threads: 4,
            subnode: SubnodeOptions::default(),
        }
    }
}

impl Default for ConsensusBackend {
    fn default() -> Self {
        ConsensusBackend {
            storage: Arc::new(|_| Box::new(InMemoryStorage::new())),
            tick_interval: Duration::from_millis(50),
            raft: Config::default(),
        }
    }
}

impl Debug for ConsensusBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusBackend")
            .field("tick_interval", &self.tick_interval)
            .field("raft", &self.raft)
            .finish()
    }
}
