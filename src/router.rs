//! Routing of partition operations to the partition leader, and the seam through which the application handles
//! operations.

use std::cmp::min;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Sender;
use log::debug;
use rand::Rng;

use crate::cluster::identity::NodeIdentity;
use crate::error::Error;
use crate::partition::{PartitionHandle, Role};

const MIN_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// An application level operation, e.g. `{kind: "put", key, value}`. Its meaning belongs to the request handler.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Operation {
    #[prost(string, tag = "1")]
    pub kind: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub key: Bytes,
    #[prost(bytes = "bytes", tag = "3")]
    pub value: Bytes,
}

impl Operation {
    pub fn new<T: Into<String>, K: Into<Bytes>, V: Into<Bytes>>(kind: T, key: K, value: V) -> Self {
        Operation {
            kind: kind.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn put<K: Into<Bytes>, V: Into<Bytes>>(key: K, value: V) -> Self {
        Operation::new("put", key, value)
    }

    pub fn get<K: Into<Bytes>>(key: K) -> Self {
        Operation::new("get", key, Bytes::new())
    }
}

/// An operation addressed to a partition this node leads, waiting for the request handler to answer it.
pub struct Request {
    partition: PartitionHandle,
    operation: Operation,
    reply: Reply,
}

impl Request {
    pub(crate) fn new(partition: PartitionHandle, operation: Operation, reply: Reply) -> Self {
        Request {
            partition,
            operation,
            reply,
        }
    }

    pub fn partition(&self) -> &PartitionHandle {
        &self.partition
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn into_parts(self) -> (PartitionHandle, Operation, Reply) {
        (self.partition, self.operation, self.reply)
    }

    pub fn reply(self, result: Result<Option<Bytes>, Error>) {
        self.reply.send(result)
    }
}

/// Answers one request, exactly once: sending consumes the reply, and a reply dropped unsent answers with an
/// application error.
pub struct Reply {
    sender: Option<Sender<Result<Option<Bytes>, Error>>>,
}

impl Reply {
    pub(crate) fn new(sender: Sender<Result<Option<Bytes>, Error>>) -> Self {
        Reply {
            sender: Some(sender),
        }
    }

    pub fn send(mut self, result: Result<Option<Bytes>, Error>) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(result);
        }
    }

    pub fn ok(self, value: Option<Bytes>) {
        self.send(Ok(value))
    }

    pub fn error(self, err: Error) {
        self.send(Err(err))
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Err(Error::Application(
                "request dropped without a reply".to_string(),
            )));
        }
    }
}

/// Jittered exponential backoff between routing attempts.
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Backoff { next: MIN_BACKOFF }
    }

    /// Sleeps, never past `deadline`.
    fn wait(&mut self, deadline: Instant) {
        let jittered = rand::thread_rng().gen_range(self.next / 2..=self.next);
        let remaining = deadline.saturating_duration_since(Instant::now());
        thread::sleep(min(jittered, remaining));
        self.next = min(self.next * 2, MAX_BACKOFF);
    }
}

/// Runs an operation on the leader of `partition`: `local` when this node leads, `remote` with the leader to ask
/// otherwise.
///
/// Leader changes, elections, unreachable nodes and remote nodes shutting down are retried until `deadline`, then the
/// operation fails with [`Error::Timeout`]. Every other error is returned as is.
pub(crate) fn route<T, L, R>(
    partition: &PartitionHandle,
    deadline: Instant,
    mut local: L,
    mut remote: R,
) -> Result<T, Error>
where
    L: FnMut() -> Result<T, Error>,
    R: FnMut(NodeIdentity) -> Result<T, Error>,
{
    let whoami = partition.whoami();
    let mut backoff = Backoff::new();
    let mut hint: Option<NodeIdentity> = None;
    let mut attempt = 0_usize;

    loop {
        if partition.is_stopped() {
            return Err(Error::Stopped);
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }

        let target = hint.take().or_else(|| partition.leader()).or_else(|| {
            if partition.role() == Role::Leader {
                Some(whoami)
            } else {
                let fallback = partition.fallback();
                fallback.get(attempt % fallback.len().max(1)).cloned()
            }
        });
        attempt += 1;

        let (result, is_remote) = match target {
            Some(target) if target == whoami => (local(), false),
            Some(target) => (remote(target), true),
            None => (Err(Error::NoLeader), false),
        };

        match result {
            Err(Error::NotLeader(Some(leader))) if leader != whoami => {
                debug!("{} redirected to {}", partition.name(), leader);
                hint = Some(leader);
            }
            // the node asked is shutting down, another one takes over
            Err(Error::Stopped) if is_remote => {
                debug!("retrying on {}: remote node is stopping", partition.name());
            }
            Err(err) if err.is_retryable() => {
                debug!("retrying on {}: {}", partition.name(), err);
            }
            result => return result,
        }

        backoff.wait(deadline);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use bytes::Bytes;
    use crossbeam_channel::bounded;

    use crate::error::Error;
    use crate::router::{Backoff, Reply};

    #[test]
    fn reply_is_sent_once() {
        let (sender, receiver) = bounded(2);
        Reply::new(sender).ok(Some(Bytes::from("1")));
        assert_eq!(receiver.try_recv().unwrap(), Ok(Some(Bytes::from("1"))));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn dropped_reply_answers_with_an_error() {
        let (sender, receiver) = bounded(1);
        drop(Reply::new(sender));
        assert!(matches!(receiver.try_recv().unwrap(), Err(Error::Application(_))));
    }

    #[test]
    fn backoff_respects_deadline() {
        let mut backoff = Backoff::new();
        let started = Instant::now();
        for _ in 0..10 {
            backoff.wait(started + Duration::from_millis(50));
        }
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
