//! Higher-level API for a Raft node.

use std::collections::BTreeSet;
use std::fmt::Display;

use bytes::Bytes;
use rand_core::RngCore;

use crate::core::{ReplicationState, State};
use crate::log::{CommittedIter, Log};
use crate::membership::Membership;
use crate::message::{LogIndex, Message, SendableMessage, TermId};

/// A Raft node, used for replicating a strongly-consistent distributed log of entries with arbitrary data amongst its
/// peers.
///
/// # Appending entries to the distributed log
///
/// Log entries passed to [`append`] are not guaranteed to ultimately be appended to the distributed log, and may be
/// cancelled any time [`receive`] is called before they are committed. An entry is known to have survived when it is
/// returned from [`take_committed`] at the same index with the same term it was appended with.
///
/// The distributed log may only be appended to by the node returned by [`leader`]. The leader may change at any time,
/// and therefore an entry may be first returned from [`take_committed`] on a node different than that to which it was
/// submitted. However, [`take_committed`] is guaranteed to return the same entries in the same order on every node.
///
/// # Membership
///
/// A node is either a voter, a learner, or not yet part of any configuration. Only voters time out and campaign, and
/// only votes and acknowledgements from voters count towards a quorum. Learners replicate like any follower. The
/// configuration is changed with [`reconfigure`], which the application calls when a configuration entry it appended
/// through [`append`] is returned by [`take_committed`]. Changing more than one voter per configuration entry is not
/// safe.
///
/// # Timer ticks
///
/// Timeouts in [`Node`] are driven by a timer ticking at fixed interval, with the number of ticks between timeouts
/// configured by the provided [`Config`]. The time interval and [`Config`] must be the same on all peers in a group.
///
/// # Message delivery
///
/// Messages may be lost, duplicated or delivered out of order. A leader which gets no answer to an append request
/// within an election timeout probes the peer again, so a lost message only delays replication to that peer.
///
/// [`append`]: Self::append
/// [`leader`]: Self::leader
/// [`receive`]: Self::receive
/// [`reconfigure`]: Self::reconfigure
/// [`take_committed`]: Self::take_committed
pub struct Node<Log, Random, NodeId: Ord> {
    state: State<Log, Random, NodeId>,
}

/// Configurable parameters of a Raft node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// The minimum number of timer ticks between leadership elections.
    pub election_timeout_ticks: u32,

    /// The number of timer ticks between sending heartbeats to peers.
    pub heartbeat_interval_ticks: u32,

    /// The maximum number of bytes to replicate to a peer at a time.
    pub replication_chunk_size: usize,
}

/// An error returned while attempting to append to a Raft log.
#[derive(Debug)]
pub enum AppendError<E> {
    /// The append was refused because this node is not the leader; it should be resubmitted to the current leader.
    Cancelled {
        /// Arbitrary data associated with the log entry.
        data: Bytes,
    },
    /// An error was returned by the [`Log`](crate::log::Log) implementation.
    LogErr(E),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            election_timeout_ticks: 10,
            heartbeat_interval_ticks: 3,
            replication_chunk_size: 64 * 1024,
        }
    }
}

impl<L, Random, NodeId> Node<L, Random, NodeId>
where
    L: Log,
    Random: RngCore,
    NodeId: Ord + Clone + Display,
{
    /// Constructs a voter of a group whose voters are `peers` and `node_id`.
    ///
    /// The `log` provided should be empty. `peers` may contain `node_id` or omit it to the same effect. `random` must
    /// produce different values on every node in a group.
    pub fn new(node_id: NodeId, peers: BTreeSet<NodeId>, log: L, random: Random, config: Config) -> Self {
        Self {
            state: State::new(node_id, peers, log, random, config),
        }
    }

    /// Constructs a node which is not part of any configuration yet.
    ///
    /// It accepts replication from whichever leader contacts it and never campaigns until a configuration naming it
    /// as a voter is passed to [`reconfigure`](Self::reconfigure).
    pub fn learner(node_id: NodeId, log: L, random: Random, config: Config) -> Self {
        Self {
            state: State::with_membership(node_id, Membership::default(), log, random, config),
        }
    }

    /// Request appending an entry with arbitrary `data` to the Raft log, returning messages to be sent.
    ///
    /// # Errors
    ///
    /// If this request would immediately be cancelled, then an error is returned.
    #[must_use = "This function returns Raft messages to be sent."]
    pub fn append<T: Into<Bytes>>(
        &mut self,
        data: T,
    ) -> Result<impl Iterator<Item = SendableMessage<NodeId>> + '_, AppendError<L::Error>> {
        let () = self.state.client_request(data.into())?;
        Ok(self.append_entries())
    }

    /// Starts an election right away instead of waiting for the election timeout.
    ///
    /// Does nothing on a leader or on a node which is not a voter. A group with a single voter elects it immediately.
    #[must_use = "This function returns Raft messages to be sent."]
    pub fn campaign(&mut self) -> impl Iterator<Item = SendableMessage<NodeId>> + '_ {
        let message = self.state.timeout();
        message.into_iter().chain(self.append_entries())
    }

    /// Returns whether this node is campaigning for leadership.
    pub fn is_candidate(&self) -> bool {
        self.state.is_candidate()
    }

    /// Returns whether this node is the leader of the latest known term.
    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    /// Returns whether this node is a voter of its current configuration.
    pub fn is_voter(&self) -> bool {
        self.state.is_voter()
    }

    /// Returns whether this node leads and has committed an entry of its current term.
    ///
    /// Until then a new leader cannot tell which entries of previous terms are committed, so configuration changes
    /// should wait for this.
    pub fn has_committed_in_term(&mut self) -> bool {
        self.state.has_committed_in_term()
    }

    /// Returns the index of the last [`LogEntry`] which has been committed and thus may be returned by
    /// [`take_committed`].
    ///
    /// [`take_committed`]: Self::take_committed
    /// [`LogEntry`]: crate::message::LogEntry
    pub fn last_committed_log_index(&self) -> LogIndex {
        *self.state.commit_idx()
    }

    /// Returns the index of the last entry in the log, committed or not.
    pub fn last_log_index(&self) -> LogIndex {
        self.state.last_index()
    }

    /// Returns the ID of the leader, if there is one, of the latest known term, along with the term.
    pub fn leader(&self) -> (Option<&NodeId>, TermId) {
        let (leader, term) = self.state.leader();
        (leader, *term)
    }

    /// Returns a reference to the Raft log storage.
    pub fn log(&self) -> &L {
        self.state.log()
    }

    /// Returns the current configuration of the group.
    pub fn membership(&self) -> &Membership<NodeId> {
        self.state.membership()
    }

    /// Processes receipt of a `message` from a peer with ID `from`, returning messages to be sent.
    #[must_use = "This function returns Raft messages to be sent."]
    pub fn receive(&mut self, message: Message, from: NodeId) -> impl Iterator<Item = SendableMessage<NodeId>> + '_ {
        let message = self.state.receive(message, from);
        message.into_iter().chain(self.append_entries())
    }

    /// Replaces the group configuration, returning messages to be sent to newly added members.
    #[must_use = "This function returns Raft messages to be sent."]
    pub fn reconfigure(
        &mut self,
        membership: Membership<NodeId>,
    ) -> impl Iterator<Item = SendableMessage<NodeId>> + '_ {
        self.state.reconfigure(membership);
        self.append_entries()
    }

    /// Returns the replication state corresponding to the peer with ID `peer_node_id`.
    pub fn replication_state(&self, peer_node_id: &NodeId) -> Option<&ReplicationState> {
        self.state.replication_state(peer_node_id)
    }

    /// Returns an iterator yielding committed [log entries][`LogEntry`]. A given [`LogEntry`] will be yielded only once
    /// over the lifetime of a [`Node`].
    ///
    /// [`LogEntry`]: crate::message::LogEntry
    pub fn take_committed(&mut self) -> CommittedIter<'_, L> {
        self.state.take_committed()
    }

    /// Ticks forward this node's internal clock by one tick, returning messages to be sent.
    #[must_use = "This function returns Raft messages to be sent."]
    pub fn timer_tick(&mut self) -> impl Iterator<Item = SendableMessage<NodeId>> + '_ {
        let message = self.state.timer_tick();
        message.into_iter().chain(self.append_entries())
    }

    #[must_use = "This function returns Raft messages to be sent."]
    fn append_entries(&mut self) -> impl Iterator<Item = SendableMessage<NodeId>> + '_ {
        let peers = self.state.peers().clone().into_iter();
        peers.flat_map(move |peer| self.state.append_entries(peer))
    }
}
