use std::fmt::{Display, Formatter};
use std::io;

use rayon::ThreadPoolBuildError;
use storage::StorageError;

use crate::cluster::identity::NodeIdentity;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// This replica does not lead the partition; holds the leader it knows of, if any.
    NotLeader(Option<NodeIdentity>),
    /// The partition has no elected leader right now.
    NoLeader,
    /// The operation did not complete in time. Its outcome is unknown.
    Timeout,
    /// The request handler does not know the operation kind.
    UnknownOperation(String),
    /// Any other error raised by the request handler.
    Application(String),
    Unreachable(NodeIdentity),
    Storage(String),
    Codec(String),
    Io(String),
    /// The node or partition has been stopped.
    Stopped,
}

impl Error {
    /// Whether trying again, possibly against another node, may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader(_) | Error::NoLeader | Error::Unreachable(_)
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLeader(Some(leader)) => write!(f, "not the leader, try {}", leader),
            Self::NotLeader(None) => write!(f, "not the leader"),
            Self::NoLeader => write!(f, "no leader elected"),
            Self::Timeout => write!(f, "timed out"),
            Self::UnknownOperation(kind) => write!(f, "unknown operation {}", kind),
            Self::Application(message) => write!(f, "{}", message),
            Self::Unreachable(node) => write!(f, "{} is unreachable", node),
            Self::Storage(message) => write!(f, "storage: {}", message),
            Self::Codec(message) => write!(f, "codec: {}", message),
            Self::Io(message) => write!(f, "io: {}", message),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::error::Error for Error {}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Self::Storage(err.message().to_string())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<prost::EncodeError> for Error {
    fn from(err: prost::EncodeError) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<ThreadPoolBuildError> for Error {
    fn from(err: ThreadPoolBuildError) -> Self {
        Self::Io(err.to_string())
    }
}
