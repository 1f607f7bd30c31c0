//! Node to node wire messages.
//!
//! Every frame carries one [`Envelope`]: either a one-way raft message for a partition, or a request answered by a
//! response bearing the same id.

pub mod frame;

use bytes::Bytes;
use prost::Message;

use crate::cluster::identity::NodeIdentity;
use crate::error::Error;
use crate::router::Operation;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(oneof = "Body", tags = "1, 2, 3")]
    pub body: Option<Body>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Body {
    #[prost(message, tag = "1")]
    Raft(RaftFrame),
    #[prost(message, tag = "2")]
    Request(RequestFrame),
    #[prost(message, tag = "3")]
    Response(ResponseFrame),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RaftFrame {
    #[prost(string, tag = "1")]
    pub from: String,
    #[prost(string, tag = "2")]
    pub partition: String,
    #[prost(message, optional, tag = "3")]
    pub message: Option<raft::message::Message>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestFrame {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(oneof = "RequestKind", tags = "2, 3, 4, 5, 6, 7")]
    pub kind: Option<RequestKind>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum RequestKind {
    #[prost(message, tag = "2")]
    Hello(Hello),
    #[prost(message, tag = "3")]
    Join(Join),
    #[prost(message, tag = "4")]
    Remove(Remove),
    /// An encoded partition command to propose on the leader.
    #[prost(message, tag = "5")]
    Command(Propose),
    /// An application operation for the leader's request handler.
    #[prost(message, tag = "6")]
    Operation(Forward),
    #[prost(message, tag = "7")]
    Info(InfoRequest),
}

/// Gossip: who the sender is and whom it knows.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Hello {
    #[prost(string, tag = "1")]
    pub from: String,
    #[prost(string, repeated, tag = "2")]
    pub known: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Join {
    #[prost(string, tag = "1")]
    pub partition: String,
    #[prost(string, tag = "2")]
    pub node: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Remove {
    #[prost(string, tag = "1")]
    pub partition: String,
    #[prost(string, tag = "2")]
    pub node: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Propose {
    #[prost(string, tag = "1")]
    pub partition: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub command: Bytes,
    #[prost(uint64, tag = "3")]
    pub timeout_ms: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Forward {
    #[prost(string, tag = "1")]
    pub partition: String,
    #[prost(message, optional, tag = "2")]
    pub operation: Option<Operation>,
    #[prost(uint64, tag = "3")]
    pub timeout_ms: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InfoRequest {
    #[prost(string, tag = "1")]
    pub partition: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ResponseFrame {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(oneof = "Outcome", tags = "2, 3, 4, 5")]
    pub outcome: Option<Outcome>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Outcome {
    #[prost(message, tag = "2")]
    Value(ValueReply),
    #[prost(message, tag = "3")]
    Error(ErrorReply),
    #[prost(message, tag = "4")]
    Hello(Hello),
    #[prost(message, tag = "5")]
    Info(InfoReply),
}

/// A possibly absent value. Operations without a result answer with `found: false`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ValueReply {
    #[prost(bool, tag = "1")]
    pub found: bool,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorReply {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    /// Known leader for `NotLeader`, the unreachable node for `Unreachable`.
    #[prost(string, tag = "2")]
    pub leader: String,
    #[prost(string, tag = "3")]
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Internal = 0,
    NotLeader = 1,
    NoLeader = 2,
    Timeout = 3,
    UnknownOperation = 4,
    Application = 5,
    Stopped = 6,
    Unreachable = 7,
    Storage = 8,
    Codec = 9,
    Io = 10,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InfoReply {
    #[prost(string, tag = "1")]
    pub source: String,
    #[prost(string, repeated, tag = "2")]
    pub peers: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub learners: Vec<String>,
    #[prost(string, tag = "4")]
    pub leader: String,
    #[prost(uint64, tag = "5")]
    pub term: u64,
    #[prost(string, tag = "6")]
    pub role: String,
    #[prost(uint64, tag = "7")]
    pub commit_index: u64,
    #[prost(uint64, tag = "8")]
    pub applied_index: u64,
}

impl Envelope {
    pub fn raft(from: NodeIdentity, partition: &str, message: raft::message::Message) -> Self {
        Envelope {
            body: Some(Body::Raft(RaftFrame {
                from: from.to_string(),
                partition: partition.to_string(),
                message: Some(message),
            })),
        }
    }

    pub fn request(id: String, kind: RequestKind) -> Self {
        Envelope {
            body: Some(Body::Request(RequestFrame { id, kind: Some(kind) })),
        }
    }

    pub fn response(id: String, outcome: Outcome) -> Self {
        Envelope {
            body: Some(Body::Response(ResponseFrame {
                id,
                outcome: Some(outcome),
            })),
        }
    }
}

impl ValueReply {
    pub fn empty() -> Self {
        ValueReply::default()
    }

    pub fn from_value(value: Option<Bytes>) -> Self {
        match value {
            Some(value) => ValueReply { found: true, value },
            None => ValueReply::empty(),
        }
    }

    pub fn into_value(self) -> Option<Bytes> {
        if self.found {
            Some(self.value)
        } else {
            None
        }
    }
}

impl From<&Error> for ErrorReply {
    fn from(err: &Error) -> Self {
        let (code, leader, detail) = match err {
            Error::NotLeader(leader) => (
                ErrorCode::NotLeader,
                leader.map(|leader| leader.to_string()).unwrap_or_default(),
                String::new(),
            ),
            Error::NoLeader => (ErrorCode::NoLeader, String::new(), String::new()),
            Error::Timeout => (ErrorCode::Timeout, String::new(), String::new()),
            Error::UnknownOperation(kind) => (ErrorCode::UnknownOperation, String::new(), kind.clone()),
            Error::Application(message) => (ErrorCode::Application, String::new(), message.clone()),
            Error::Unreachable(node) => (ErrorCode::Unreachable, node.to_string(), String::new()),
            Error::Storage(message) => (ErrorCode::Storage, String::new(), message.clone()),
            Error::Codec(message) => (ErrorCode::Codec, String::new(), message.clone()),
            Error::Io(message) => (ErrorCode::Io, String::new(), message.clone()),
            Error::Stopped => (ErrorCode::Stopped, String::new(), String::new()),
        };

        ErrorReply {
            code: code as i32,
            leader,
            detail,
        }
    }
}

impl ErrorReply {
    pub fn into_error(self) -> Error {
        let node = self.leader.parse::<NodeIdentity>().ok();

        match ErrorCode::from_i32(self.code) {
            Some(ErrorCode::NotLeader) => Error::NotLeader(node),
            Some(ErrorCode::NoLeader) => Error::NoLeader,
            Some(ErrorCode::Timeout) => Error::Timeout,
            Some(ErrorCode::UnknownOperation) => Error::UnknownOperation(self.detail),
            Some(ErrorCode::Application) => Error::Application(self.detail),
            Some(ErrorCode::Stopped) => Error::Stopped,
            Some(ErrorCode::Unreachable) => match node {
                Some(node) => Error::Unreachable(node),
                None => Error::NoLeader,
            },
            Some(ErrorCode::Storage) => Error::Storage(self.detail),
            Some(ErrorCode::Codec) => Error::Codec(self.detail),
            Some(ErrorCode::Io) => Error::Io(self.detail),
            Some(ErrorCode::Internal) | None => {
                Error::Application(format!("remote error {}: {}", self.code, self.detail))
            }
        }
    }
}

impl Outcome {
    /// Turns an answer expected to carry a value into that value.
    pub fn into_value(self) -> Result<Option<Bytes>, Error> {
        match self {
            Outcome::Value(value) => Ok(value.into_value()),
            Outcome::Error(err) => Err(err.into_error()),
            Outcome::Hello(_) | Outcome::Info(_) => Err(Error::Codec("expected a value".to_string())),
        }
    }
}

impl From<Result<Option<Bytes>, Error>> for Outcome {
    fn from(result: Result<Option<Bytes>, Error>) -> Self {
        match result {
            Ok(value) => Outcome::Value(ValueReply::from_value(value)),
            Err(err) => Outcome::Error(ErrorReply::from(&err)),
        }
    }
}

pub fn encode<M: Message>(message: &M) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(message.encoded_len());
    message.encode(&mut buf)?;
    Ok(buf)
}
