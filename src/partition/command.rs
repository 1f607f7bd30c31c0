use bytes::Bytes;
use prost::Message;
use raft::membership::Membership;

use crate::cluster::identity::NodeIdentity;
use crate::error::Error;
use crate::protocol::encode;

/// The payload of a partition log entry. The empty entry a new leader appends decodes to a command without kind.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Command {
    #[prost(oneof = "Kind", tags = "1, 2, 3")]
    pub kind: Option<Kind>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Kind {
    #[prost(message, tag = "1")]
    Put(Put),
    /// Marks the point in the log a linearizable read is served at.
    #[prost(message, tag = "2")]
    Read(Read),
    #[prost(message, tag = "3")]
    Membership(MembershipChange),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Put {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Read {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
}

/// The whole configuration in effect once the entry is applied.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MembershipChange {
    #[prost(string, repeated, tag = "1")]
    pub voters: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub learners: Vec<String>,
}

impl Command {
    pub fn put<K: Into<Bytes>, V: Into<Bytes>>(key: K, value: V) -> Self {
        Command {
            kind: Some(Kind::Put(Put {
                key: key.into(),
                value: value.into(),
            })),
        }
    }

    pub fn read<K: Into<Bytes>>(key: K) -> Self {
        Command {
            kind: Some(Kind::Read(Read { key: key.into() })),
        }
    }

    pub fn membership(membership: &Membership<NodeIdentity>) -> Self {
        Command {
            kind: Some(Kind::Membership(MembershipChange {
                voters: membership.voters.iter().map(|node| node.to_string()).collect(),
                learners: membership.learners.iter().map(|node| node.to_string()).collect(),
            })),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        Ok(Bytes::from(encode(self)?))
    }

    pub fn from_bytes(data: Bytes) -> Result<Self, Error> {
        Ok(Command::decode(data)?)
    }
}

impl MembershipChange {
    pub fn to_membership(&self) -> Result<Membership<NodeIdentity>, Error> {
        let mut membership = Membership::default();
        for voter in &self.voters {
            membership.voters.insert(voter.parse::<NodeIdentity>()?);
        }
        for learner in &self.learners {
            membership.learners.insert(learner.parse::<NodeIdentity>()?);
        }
        Ok(membership)
    }
}
