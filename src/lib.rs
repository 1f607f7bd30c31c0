//! Borough is an embeddable, partitioned key/value store.
//!
//! Every named partition is replicated by its own Raft group across the nodes of a cluster. A [`Node`] hosts the
//! local replica of each partition it takes part in, routes operations to the leader of the target partition and
//! grows each replica set as nodes join.
//!
//! ```no_run
//! use borough::{Node, NodeState, Options};
//!
//! let node = Node::new(Options::default()).unwrap();
//! assert_eq!(node.start(), NodeState::Started);
//!
//! let partition = node.partition("users").unwrap();
//! partition.put("alice", "1").unwrap();
//! assert_eq!(partition.get("alice").unwrap().as_deref(), Some(&b"1"[..]));
//!
//! assert_eq!(node.stop(), NodeState::Stopped);
//! ```

#[cfg(test)]
#[macro_use]
extern crate serial_test;

mod cluster;
mod error;
mod node;
mod partition;
mod protocol;
mod router;
mod topology;

pub use cluster::identity::NodeIdentity;
pub use error::Error;
pub use node::options::{ConsensusBackend, Options, StorageFactory, SubnodeOptions};
pub use node::{Node, NodeState};
pub use partition::{PartitionHandle, PartitionInfo, Role};
pub use router::{Operation, Reply, Request};
pub use storage::in_memory::InMemoryStorage;
pub use storage::{Storage, StorageError};
