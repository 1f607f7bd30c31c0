//! The local replica of a partition and the handle the application holds on it.

pub mod applier;
pub mod command;
pub mod worker;

use std::convert::TryFrom;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::warn;
use raft::membership::Membership;
use raft::message::Message;

use crate::cluster::identity::NodeIdentity;
use crate::cluster::ClusterContext;
use crate::error::Error;
use crate::node::options::Options;
use crate::partition::applier::Applied;
use crate::partition::command::Command;
use crate::partition::worker::{Event, Worker};
use crate::protocol::{InfoReply, InfoRequest, Outcome, Propose, Remove, RequestKind};
use crate::router;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Leader,
    Candidate,
    Follower,
    /// Replicates the log without voting, or is not part of the replica set yet.
    Learner,
}

/// How a replica comes to life.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Mode {
    /// First replica of a new partition: elects itself and commits a configuration naming only itself.
    Bootstrap,
    /// Empty learner which asks the cluster to be added.
    Join,
    /// Empty learner created because a leader started replicating to us.
    Replica,
}

/// A replica's own view of its partition.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PartitionInfo {
    /// `<whoami>/p/<partition name>`
    pub source: String,
    /// Voting replicas.
    pub peers: Vec<NodeIdentity>,
    pub learners: Vec<NodeIdentity>,
    pub leader: Option<NodeIdentity>,
    pub term: u64,
    pub role: Role,
    pub commit_index: u64,
    pub applied_index: u64,
}

/// Snapshot of a worker's state, published after every event it processes.
#[derive(Debug, Clone)]
pub struct View {
    pub role: Role,
    pub leader: Option<NodeIdentity>,
    pub term: u64,
    pub membership: Membership<NodeIdentity>,
    pub commit_index: u64,
    pub applied_index: u64,
}

impl View {
    pub fn empty() -> Self {
        View {
            role: Role::Learner,
            leader: None,
            term: 0,
            membership: Membership::default(),
            commit_index: 0,
            applied_index: 0,
        }
    }
}

/// Handle on the local replica of a partition. Cheap to clone.
///
/// Reads and writes are routed to the partition leader, wherever it is, and block until the entry they go through
/// is applied there or the timeout elapses. A timed out write may still be applied later.
#[derive(Clone)]
pub struct PartitionHandle {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    context: Arc<ClusterContext>,
    events: Sender<Event>,
    view: Arc<RwLock<View>>,
    request_timeout: Duration,
    /// Nodes to ask while no leader is known.
    fallback: Vec<NodeIdentity>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl PartitionHandle {
    pub(crate) fn spawn(
        name: &str,
        mode: Mode,
        context: Arc<ClusterContext>,
        options: &Options,
    ) -> Result<Self, Error> {
        let storage = (options.subnode.consensus_backend.storage)(name);
        let worker = Worker::new(name, mode, context.clone(), storage, options);
        let view = worker.view();

        let (events, events_recv) = unbounded::<Event>();
        let worker = thread::Builder::new()
            .name(format!("partition {}", name))
            .spawn(move || worker.run(events_recv))?;

        Ok(PartitionHandle {
            shared: Arc::new(Shared {
                name: name.to_string(),
                context,
                events,
                view,
                request_timeout: options.request_timeout,
                fallback: options.base.clone(),
                worker: Mutex::new(Some(worker)),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn whoami(&self) -> NodeIdentity {
        self.shared.context.whoami
    }

    pub fn put<K: Into<Bytes>, V: Into<Bytes>>(&self, key: K, value: V) -> Result<(), Error> {
        self.put_with_timeout(key, value, self.shared.request_timeout)
    }

    pub fn put_with_timeout<K: Into<Bytes>, V: Into<Bytes>>(
        &self,
        key: K,
        value: V,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.execute(Command::put(key, value), timeout).map(|_| ())
    }

    /// Reads the value committed last for `key`, as seen by the leader.
    pub fn get<K: Into<Bytes>>(&self, key: K) -> Result<Option<Bytes>, Error> {
        self.get_with_timeout(key, self.shared.request_timeout)
    }

    pub fn get_with_timeout<K: Into<Bytes>>(&self, key: K, timeout: Duration) -> Result<Option<Bytes>, Error> {
        self.execute(Command::read(key), timeout)
    }

    /// This replica's view of the partition. Peers reported by a follower may lag behind the leader's.
    pub fn info(&self) -> Result<PartitionInfo, Error> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        Ok(self.local_info())
    }

    /// The view the replica hosted by `node` has of this partition.
    pub fn remote_info(&self, node: NodeIdentity) -> Result<PartitionInfo, Error> {
        if node == self.whoami() {
            return self.info();
        }

        let deadline = Instant::now() + self.shared.request_timeout;
        let request = RequestKind::Info(InfoRequest {
            partition: self.name().to_string(),
        });

        match self.shared.context.transport.call(node, request, deadline)? {
            Outcome::Info(info) => PartitionInfo::try_from(info),
            Outcome::Error(err) => Err(err.into_error()),
            Outcome::Value(_) | Outcome::Hello(_) => Err(Error::Codec("expected partition info".to_string())),
        }
    }

    /// Removes `node` from the replica set, going through the leader.
    pub fn remove_peer(&self, node: NodeIdentity) -> Result<(), Error> {
        let deadline = Instant::now() + self.shared.request_timeout;

        router::route(
            self,
            deadline,
            || self.remove_local(node, deadline),
            |leader| {
                let request = RequestKind::Remove(Remove {
                    partition: self.name().to_string(),
                    node: node.to_string(),
                });
                self.shared
                    .context
                    .transport
                    .call(leader, request, deadline)?
                    .into_value()
                    .map(|_| ())
            },
        )
    }

    pub fn role(&self) -> Role {
        self.view().role
    }

    /// The leader this replica knows of, possibly itself.
    pub fn leader(&self) -> Option<NodeIdentity> {
        self.view().leader
    }

    /// Whether the replica set includes this node, as a voter or as a learner.
    pub fn is_member(&self) -> bool {
        self.view().membership.contains(&self.whoami())
    }

    pub(crate) fn fallback(&self) -> &[NodeIdentity] {
        &self.shared.fallback
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn view(&self) -> View {
        match self.shared.view.read() {
            Ok(view) => view.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn local_info(&self) -> PartitionInfo {
        let view = self.view();
        PartitionInfo {
            source: self.whoami().source(self.name()),
            peers: view.membership.voters.iter().cloned().collect(),
            learners: view.membership.learners.iter().cloned().collect(),
            leader: view.leader,
            term: view.term,
            role: view.role,
            commit_index: view.commit_index,
            applied_index: view.applied_index,
        }
    }

    /// Proposes `command` through whichever node leads the partition, returning the value it read, if any.
    pub(crate) fn execute(&self, command: Command, timeout: Duration) -> Result<Option<Bytes>, Error> {
        let deadline = Instant::now() + timeout;
        let data = command.to_bytes()?;

        router::route(
            self,
            deadline,
            || {
                self.propose_local(command.clone(), deadline)
                    .map(Applied::into_value)
            },
            |leader| {
                let request = RequestKind::Command(Propose {
                    partition: self.name().to_string(),
                    command: data.clone(),
                    timeout_ms: remaining_millis(deadline),
                });
                self.shared
                    .context
                    .transport
                    .call(leader, request, deadline)?
                    .into_value()
            },
        )
    }

    /// Proposes `command` to the local replica, which must lead the partition.
    pub(crate) fn propose_local(&self, command: Command, deadline: Instant) -> Result<Applied, Error> {
        let (reply, receiver) = bounded(1);
        self.submit(Event::Propose {
            command,
            deadline,
            reply,
        })?;
        wait(receiver, deadline)
    }

    pub(crate) fn join_local(&self, node: NodeIdentity, deadline: Instant) -> Result<(), Error> {
        let (reply, receiver) = bounded(1);
        self.submit(Event::Join { node, deadline, reply })?;
        wait(receiver, deadline)
    }

    pub(crate) fn remove_local(&self, node: NodeIdentity, deadline: Instant) -> Result<(), Error> {
        let (reply, receiver) = bounded(1);
        self.submit(Event::Remove { node, deadline, reply })?;
        wait(receiver, deadline)
    }

    pub(crate) fn deliver(&self, from: NodeIdentity, message: Message) {
        if self.submit(Event::Raft { from, message }).is_err() {
            warn!("partition {} is stopped, dropping message from {}", self.name(), from);
        }
    }

    /// Stops the worker and waits for it to exit. Callers still waiting get [`Error::Stopped`], which a node answering
    /// for another one turns into [`Error::NotLeader`].
    pub(crate) fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shared.events.send(Event::Stop);
        let worker = match self.shared.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }

    fn submit(&self, event: Event) -> Result<(), Error> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        self.shared.events.send(event).map_err(|_| Error::Stopped)
    }
}

impl fmt::Debug for PartitionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionHandle")
            .field("name", &self.name())
            .field("whoami", &self.whoami())
            .finish()
    }
}

impl Applied {
    pub(crate) fn into_value(self) -> Option<Bytes> {
        match self {
            Applied::Value(value) => value,
            Applied::Noop | Applied::Written | Applied::Membership(_) => None,
        }
    }
}

fn wait<T>(receiver: Receiver<Result<T, Error>>, deadline: Instant) -> Result<T, Error> {
    let timeout = deadline.saturating_duration_since(Instant::now());
    match receiver.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
        Err(RecvTimeoutError::Disconnected) => Err(Error::Stopped),
    }
}

pub(crate) fn remaining_millis(deadline: Instant) -> u64 {
    deadline.saturating_duration_since(Instant::now()).as_millis() as u64
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let role = match self {
            Role::Leader => "leader",
            Role::Candidate => "candidate",
            Role::Follower => "follower",
            Role::Learner => "learner",
        };
        write!(f, "{}", role)
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leader" => Ok(Role::Leader),
            "candidate" => Ok(Role::Candidate),
            "follower" => Ok(Role::Follower),
            "learner" => Ok(Role::Learner),
            _ => Err(Error::Codec(format!("unknown role {:?}", s))),
        }
    }
}

impl From<&PartitionInfo> for InfoReply {
    fn from(info: &PartitionInfo) -> Self {
        InfoReply {
            source: info.source.clone(),
            peers: info.peers.iter().map(|node| node.to_string()).collect(),
            learners: info.learners.iter().map(|node| node.to_string()).collect(),
            leader: info.leader.map(|node| node.to_string()).unwrap_or_default(),
            term: info.term,
            role: info.role.to_string(),
            commit_index: info.commit_index,
            applied_index: info.applied_index,
        }
    }
}

impl TryFrom<InfoReply> for PartitionInfo {
    type Error = Error;

    fn try_from(reply: InfoReply) -> Result<Self, Self::Error> {
        let parse_all = |nodes: Vec<String>| {
            nodes
                .iter()
                .map(|node| node.parse::<NodeIdentity>())
                .collect::<Result<Vec<_>, Error>>()
        };

        Ok(PartitionInfo {
            source: reply.source,
            peers: parse_all(reply.peers)?,
            learners: parse_all(reply.learners)?,
            leader: reply.leader.parse::<NodeIdentity>().ok(),
            term: reply.term,
            role: reply.role.parse::<Role>()?,
            commit_index: reply.commit_index,
            applied_index: reply.applied_index,
        })
    }
}
