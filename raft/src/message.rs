//! Raft message types for sending between nodes.
//!
//! The top-level message type is [`Message`]. Every type here derives [`prost::Message`] so that messages can be
//! embedded directly inside an application's own protobuf envelopes.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use bytes::Bytes;

/// A [`Message`] to be sent to a destination.
pub struct SendableMessage<NodeId> {
    /// The message to be sent.
    pub message: Message,

    /// The destination for the message.
    pub dest: MessageDestination<NodeId>,
}

/// The destination for a [`SendableMessage`].
pub enum MessageDestination<NodeId> {
    /// The associated message should be sent to every voter of the group.
    Broadcast,
    /// The associated message should be sent to one particular peer.
    To(NodeId),
}

/// A message sent between Raft nodes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    /// The greatest Raft leadership term ID seen by the sender.
    #[prost(message, required, tag = "2")]
    pub term: TermId,

    /// The Remote Procedure Call contained by this message.
    ///
    /// This field is only optional in order to support protobuf serialization.
    #[prost(oneof = "Rpc", tags = "3, 4, 5, 6")]
    pub rpc: Option<Rpc>,
}

/// A Remote Procedure Call message to a Raft node.
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Rpc {
    /// A request to obtain leadership amongst Raft nodes.
    #[prost(message, tag = "3")]
    VoteRequest(VoteRequest),

    /// A response to a [`VoteRequest`] granting or denying leadership.
    #[prost(message, tag = "4")]
    VoteResponse(VoteResponse),

    /// A request to append entries to a Raft node's log.
    #[prost(message, tag = "5")]
    AppendRequest(AppendRequest),

    /// A response to an [`AppendRequest`] allowing or denying an append to the Raft node's log.
    #[prost(message, tag = "6")]
    AppendResponse(AppendResponse),
}

/// A request to obtain leadership amongst Raft nodes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct VoteRequest {
    /// The Raft log index of the last log entry stored by the candidate.
    #[prost(message, required, tag = "2")]
    pub last_log_idx: LogIndex,

    /// The Raft leadership term of the last log entry stored by the candidate.
    #[prost(message, required, tag = "3")]
    pub last_log_term: TermId,
}

/// The response to a [`VoteRequest`] granting or denying leadership.
#[derive(Clone, PartialEq, prost::Message)]
pub struct VoteResponse {
    /// Whether the [`VoteRequest`] was granted or not.
    #[prost(bool, required, tag = "2")]
    pub vote_granted: bool,
}

/// A request to append entries to a Raft node's log.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AppendRequest {
    /// The Raft log index immediately before the index of the first entry in [`entries`](Self::entries).
    #[prost(message, required, tag = "1")]
    pub prev_log_idx: LogIndex,

    /// The Raft leadership term of the log entry immediately before the first entry in [`entries`](Self::entries).
    #[prost(message, required, tag = "2")]
    pub prev_log_term: TermId,

    /// The Raft log index of the last log entry known by the requester to be committed.
    #[prost(message, required, tag = "3")]
    pub leader_commit: LogIndex,

    /// A list of consecutive Raft log entries to append.
    #[prost(message, repeated, tag = "4")]
    pub entries: Vec<LogEntry>,
}

/// The response to an [`AppendRequest`] allowing or denying an append to the Raft node's log.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AppendResponse {
    /// Whether the [`AppendRequest`] was accepted or not.
    #[prost(bool, required, tag = "1")]
    pub success: bool,

    /// The Raft log index of the last log entry up to which the responder's log is known to match the requester's log.
    #[prost(message, required, tag = "2")]
    pub match_idx: LogIndex,

    /// The Raft log index of the last log entry in the responder's log.
    #[prost(message, required, tag = "3")]
    pub last_log_idx: LogIndex,
}

/// An entry in a [Raft log](crate::log::Log).
#[derive(Clone, PartialEq, prost::Message)]
pub struct LogEntry {
    /// The term of leadership of the node which appended this log entry.
    #[prost(message, required, tag = "1")]
    pub term: TermId,

    /// Arbitrary data associated with the log entry. Empty for the no-op appended by a new leader.
    #[prost(bytes = "bytes", required, tag = "2")]
    pub data: Bytes,
}

/// The unique, monotonically-increasing ID for a term of Raft group leadership.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TermId {
    /// The non-negative integer assigned to this term.
    #[prost(uint64, required, tag = "1")]
    pub id: u64,
}

/// A 1-based index into a [Raft log](crate::log::Log).
#[derive(Clone, PartialEq, prost::Message)]
pub struct LogIndex {
    /// The integer representing this log index.
    #[prost(uint64, required, tag = "1")]
    pub id: u64,
}

impl fmt::Display for Message {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { term, rpc } = self;
        let mut debug = fmt.debug_tuple("");
        debug.field(&format_args!("{}", term));
        match rpc {
            Some(rpc) => debug.field(&format_args!("{}", rpc)),
            None => debug.field(&"None"),
        };
        debug.finish()
    }
}

impl fmt::Display for Rpc {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            Rpc::VoteRequest(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::VoteResponse(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::AppendRequest(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::AppendResponse(msg) => fmt::Display::fmt(msg, fmt),
        }
    }
}

impl fmt::Display for VoteRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("VoteRequest")
            .field("last_log_idx", &format_args!("{}", self.last_log_idx))
            .field("last_log_term", &format_args!("{}", self.last_log_term))
            .finish()
    }
}

impl fmt::Display for VoteResponse {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("VoteResponse")
            .field("vote_granted", &self.vote_granted)
            .finish()
    }
}

impl fmt::Display for AppendRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("AppendRequest")
            .field("prev_log_idx", &format_args!("{}", self.prev_log_idx))
            .field("prev_log_term", &format_args!("{}", self.prev_log_term))
            .field("leader_commit", &format_args!("{}", self.leader_commit))
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl fmt::Display for AppendResponse {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("AppendResponse")
            .field("success", &self.success)
            .field("match_idx", &format_args!("{}", self.match_idx))
            .field("last_log_idx", &format_args!("{}", self.last_log_idx))
            .finish()
    }
}

//
// TermId impls
//

impl fmt::Display for TermId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_tuple("TermId").field(&self.id).finish()
    }
}

impl Copy for TermId {}

impl Eq for TermId {}

impl PartialOrd for TermId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TermId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl AddAssign<u64> for TermId {
    fn add_assign(&mut self, rhs: u64) {
        self.id = self
            .id
            .checked_add(rhs)
            .unwrap_or_else(|| panic!("term overflow"));
    }
}

//
// LogIndex impls
//

impl LogIndex {
    /// Subtraction with a non-negative integer, returning `None` on underflow.
    pub fn checked_sub(self, dec: u64) -> Option<Self> {
        self.id.checked_sub(dec).map(|id| Self { id })
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_tuple("LogIdx").field(&self.id).finish()
    }
}

impl Copy for LogIndex {}

impl Eq for LogIndex {}

impl PartialOrd for LogIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Add<u64> for LogIndex {
    type Output = Self;
    fn add(self, inc: u64) -> Self {
        Self {
            id: self
                .id
                .checked_add(inc)
                .unwrap_or_else(|| panic!("log index overflow")),
        }
    }
}

impl Sub<u64> for LogIndex {
    type Output = Self;
    fn sub(self, dec: u64) -> Self {
        Self {
            id: self.id.saturating_sub(dec),
        }
    }
}

#[cfg(test)]
mod tests {
    use prost::Message as _;

    use super::*;

    #[test]
    fn append_request_survives_encoding() {
        let message = Message {
            term: TermId { id: 7 },
            rpc: Some(Rpc::AppendRequest(AppendRequest {
                prev_log_idx: LogIndex { id: 3 },
                prev_log_term: TermId { id: 6 },
                leader_commit: LogIndex { id: 2 },
                entries: vec![LogEntry {
                    term: TermId { id: 7 },
                    data: Bytes::from_static(b"put a"),
                }],
            })),
        };
        let mut buf = Vec::with_capacity(message.encoded_len());
        message.encode(&mut buf).unwrap();
        assert_eq!(Message::decode(&buf[..]).unwrap(), message);
    }

    #[test]
    fn log_index_arithmetic_saturates_downwards() {
        assert_eq!(LogIndex { id: 1 } - 3, LogIndex::default());
        assert_eq!(LogIndex { id: 1 }.checked_sub(2), None);
        assert_eq!(LogIndex { id: 4 } + 1, LogIndex { id: 5 });
    }
}
