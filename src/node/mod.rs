#[cfg(test)]
mod tests;

pub mod options;

use std::cmp::min;
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use mpb::MPB;
use rayon::ThreadPool;

use crate::cluster::identity::NodeIdentity;
use crate::cluster::transport::{Inbound, Transport};
use crate::cluster::util::advertised_address;
use crate::cluster::ClusterContext;
use crate::error::Error;
use crate::node::options::Options;
use crate::partition::command::Command;
use crate::partition::{remaining_millis, Mode, PartitionHandle, Role};
use crate::protocol::{
    Body, Envelope, ErrorReply, Forward, Hello, InfoReply, Join, Outcome, RaftFrame, RequestFrame, RequestKind,
    ValueReply,
};
use crate::router::{self, Operation, Reply, Request};
use crate::topology::address_book::AddressBook;

const STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(5);
const JOIN_RETRY_INTERVAL: Duration = Duration::from_millis(100);

type Handler = Arc<dyn Fn(Request) + Send + Sync>;

/// Lifecycle of a [`Node`], as broadcast on its state bus.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum NodeState {
    Start,
    Started,
    Stop,
    Stopped,
    Timeout,
    Error(String),
}

/// A member of the cluster, hosting one replica of every partition it takes part in.
pub struct Node {
    node_state_bus: MPB<NodeState>,
    inner: Arc<Inner>,
}

struct Inner {
    options: Options,
    context: Arc<ClusterContext>,
    partitions: RwLock<HashMap<String, PartitionHandle>>,
    handler: RwLock<Option<Handler>>,
    requests: Sender<Request>,
    running: AtomicBool,
    stopped: AtomicBool,
}

/// Why a partition is being created on this node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Origin {
    /// Referenced by the application.
    Local,
    /// Another node asked to join it through us.
    Join,
    /// A leader started replicating it to us.
    Replication,
}

impl Node {
    /// Binds `options.listen` without accepting connections yet. Nothing happens until [`start`](Node::start).
    pub fn new(options: Options) -> Result<Self, Error> {
        let listener = TcpListener::bind(options.listen)?;
        let whoami = NodeIdentity::new(advertised_address(listener.local_addr()?));

        let address_book = Arc::new(AddressBook::new(whoami));
        address_book.learn_all(options.base.iter().cloned());
        let transport = Arc::new(Transport::new(whoami, address_book.clone(), options.connect_timeout));
        let context = Arc::new(ClusterContext::new(whoami, address_book, transport));

        let pool = rayon::ThreadPoolBuilder::new()
            .thread_name(|_| "request handler".to_string())
            .num_threads(options.handler_threads.max(1))
            .build()?;

        let (requests, requests_recv) = unbounded::<Request>();
        let node = Node {
            node_state_bus: MPB::new(),
            inner: Arc::new(Inner {
                options,
                context,
                partitions: RwLock::new(HashMap::new()),
                handler: RwLock::new(None),
                requests,
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        };

        node.init_listener(listener)?;
        node.init_dispatcher(requests_recv, pool)?;
        node.init_gossip()?;

        info!("created node {}", whoami);
        Ok(node)
    }

    pub fn whoami(&self) -> NodeIdentity {
        self.inner.context.whoami
    }

    /// Every node this one has heard of, itself excluded.
    pub fn known_nodes(&self) -> Vec<NodeIdentity> {
        self.inner.context.address_book.known()
    }

    /// start node
    pub fn start(&self) -> NodeState {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return NodeState::Error("a stopped node cannot be started again".to_string());
        }
        if self.inner.running.load(Ordering::SeqCst) {
            return NodeState::Started;
        }

        self.change_state(NodeState::Start)
    }

    /// stop node
    pub fn stop(&self) -> NodeState {
        if !self.inner.running.load(Ordering::SeqCst) {
            return if self.inner.stopped.load(Ordering::SeqCst) {
                NodeState::Stopped
            } else {
                NodeState::Error("node is not started".to_string())
            };
        }

        let state = self.change_state(NodeState::Stop);
        self.inner.shutdown();
        state
    }

    /// The local replica of partition `name`, created on first use.
    ///
    /// A node started without a base bootstraps the partition alone. Otherwise the replica asks the cluster to be
    /// added to the partition and catches up once it is.
    pub fn partition(&self, name: &str) -> Result<PartitionHandle, Error> {
        self.inner.partition(name, Origin::Local)
    }

    /// Registers the function serving [`request`](Node::request)s on the partitions this node leads. Replaces any
    /// previous handler.
    pub fn on_request<F>(&self, handler: F)
    where
        F: Fn(Request) + Send + Sync + 'static,
    {
        *write(&self.inner.handler) = Some(Arc::new(handler));
    }

    /// Runs `operation` through the request handler of the node leading `partition`.
    pub fn request(&self, partition: &str, operation: Operation) -> Result<Option<Bytes>, Error> {
        self.request_with_timeout(partition, operation, self.inner.options.request_timeout)
    }

    pub fn request_with_timeout(
        &self,
        partition: &str,
        operation: Operation,
        timeout: Duration,
    ) -> Result<Option<Bytes>, Error> {
        let handle = self.partition(partition)?;
        let deadline = Instant::now() + timeout;
        let inner = &self.inner;

        router::route(
            &handle,
            deadline,
            || inner.dispatch(&handle, operation.clone(), deadline),
            |leader| {
                let request = RequestKind::Operation(Forward {
                    partition: partition.to_string(),
                    operation: Some(operation.clone()),
                    timeout_ms: remaining_millis(deadline),
                });
                inner.context.transport.call(leader, request, deadline)?.into_value()
            },
        )
    }

    fn init_listener(&self, listener: TcpListener) -> Result<(), Error> {
        let state_send = self.node_state_bus.sender();
        let state_recv = self.node_state_bus.receiver();
        let inner = self.inner.clone();

        thread::Builder::new()
            .name("listener".to_string())
            .spawn(move || {
                while let Ok(node_state) = state_recv.recv() {
                    match node_state {
                        NodeState::Start => {
                            inner.running.store(true, Ordering::SeqCst);
                            let inbound: Inbound = {
                                let inner = inner.clone();
                                Arc::new(move |envelope| inner.inbound(envelope))
                            };
                            inner
                                .context
                                .transport
                                .serve(listener, &state_send, &state_recv, inbound);
                            return;
                        }
                        // dropped before being started
                        NodeState::Stop => return,
                        _ => {}
                    }
                }
            })?;

        Ok(())
    }

    /// Hands queued requests to the handler pool until the node stops.
    fn init_dispatcher(&self, requests: Receiver<Request>, pool: ThreadPool) -> Result<(), Error> {
        let state_recv = self.node_state_bus.receiver();
        let inner = self.inner.clone();

        thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || loop {
                select! {
                    recv(requests) -> request => match request {
                        Ok(request) => match read(&inner.handler).clone() {
                            Some(handler) => pool.spawn(move || handler(request)),
                            None => request.reply(Err(Error::Application(
                                "no request handler registered".to_string(),
                            ))),
                        },
                        Err(_) => return,
                    },
                    recv(state_recv) -> node_state => match node_state {
                        Ok(NodeState::Stop) | Err(_) => return,
                        Ok(_) => {}
                    },
                }
            })?;

        Ok(())
    }

    /// Greets the base once started, then a random known node every gossip interval.
    fn init_gossip(&self) -> Result<(), Error> {
        let state_recv = self.node_state_bus.receiver();
        let inner = self.inner.clone();

        thread::Builder::new()
            .name("gossip".to_string())
            .spawn(move || {
                loop {
                    match state_recv.recv() {
                        Ok(NodeState::Started) => break,
                        Ok(NodeState::Stop) | Err(_) => return,
                        Ok(_) => {}
                    }
                }

                for seed in inner.options.base.iter() {
                    inner.hello(*seed);
                }

                let mut rng = rand::thread_rng();
                loop {
                    select! {
                        recv(state_recv) -> node_state => match node_state {
                            Ok(NodeState::Stop) | Err(_) => return,
                            Ok(_) => {}
                        },
                        default(inner.options.gossip_interval) => {
                            if let Some(peer) = inner.context.address_book.random_peer(&mut rng) {
                                inner.hello(peer);
                            }
                        }
                    }
                }
            })?;

        Ok(())
    }

    fn change_state(&self, change_to: NodeState) -> NodeState {
        let post_change_to_state = match change_to {
            NodeState::Start => NodeState::Started,
            NodeState::Stop => NodeState::Stopped,
            NodeState::Started | NodeState::Stopped | NodeState::Timeout | NodeState::Error(_) => {
                return NodeState::Error(format!("cannot change state to {:?}", change_to))
            }
        };

        // subscribe first so the answer cannot be missed
        let receiver = self.node_state_bus.receiver();
        let _ = self.node_state_bus.sender().send(change_to);

        let deadline = Instant::now() + STATE_CHANGE_TIMEOUT;
        loop {
            match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(node_state) if node_state == post_change_to_state => return node_state,
                Ok(NodeState::Error(err)) => return NodeState::Error(err),
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return NodeState::Timeout,
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.inner.running.load(Ordering::SeqCst) {
            let _ = self.stop();
        } else if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            // releases the listener and the background threads waiting for a start that will never come
            let _ = self.node_state_bus.sender().send(NodeState::Stop);
        }
    }
}

impl Inner {
    fn partition(&self, name: &str, origin: Origin) -> Result<PartitionHandle, Error> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        if let Some(partition) = read(&self.partitions).get(name) {
            return Ok(partition.clone());
        }

        let mut partitions = write(&self.partitions);
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        if let Some(partition) = partitions.get(name) {
            return Ok(partition.clone());
        }

        let mode = match origin {
            Origin::Replication => Mode::Replica,
            Origin::Local | Origin::Join if self.options.base.is_empty() => Mode::Bootstrap,
            Origin::Local | Origin::Join => Mode::Join,
        };

        let partition = PartitionHandle::spawn(name, mode, self.context.clone(), &self.options)?;
        if mode == Mode::Join {
            let joining = partition.clone();
            let transport = self.context.transport.clone();
            let seeds = self.options.base.clone();
            let join_timeout = self.options.join_timeout;
            let request_timeout = self.options.request_timeout;
            thread::Builder::new()
                .name(format!("join {}", name))
                .spawn(move || join(joining, transport, seeds, join_timeout, request_timeout))?;
        }

        partitions.insert(name.to_string(), partition.clone());
        Ok(partition)
    }

    fn hosted(&self, name: &str) -> Option<PartitionHandle> {
        if !self.running.load(Ordering::SeqCst) {
            return None;
        }
        read(&self.partitions)
            .get(name)
            .filter(|partition| !partition.is_stopped())
            .cloned()
    }

    /// A partition this node takes requests for. Callers are sent elsewhere when it is not hosted here, or no longer.
    fn existing(&self, name: &str) -> Result<PartitionHandle, Error> {
        self.hosted(name).ok_or(Error::NotLeader(None))
    }

    /// Answers a frame received from another node.
    fn inbound(&self, envelope: Envelope) -> Option<Envelope> {
        match envelope.body {
            Some(Body::Raft(frame)) => {
                self.deliver(frame);
                None
            }
            Some(Body::Request(RequestFrame { id, kind: Some(kind) })) => {
                Some(Envelope::response(id, self.handle_request(kind)))
            }
            Some(Body::Request(RequestFrame { id, kind: None })) => Some(Envelope::response(
                id,
                Outcome::Error(ErrorReply::from(&Error::Codec("empty request".to_string()))),
            )),
            Some(Body::Response(_)) | None => {
                warn!("dropping unexpected frame");
                None
            }
        }
    }

    fn deliver(&self, frame: RaftFrame) {
        let from = match frame.from.parse::<NodeIdentity>() {
            Ok(from) => from,
            Err(err) => {
                warn!("dropping raft message with bad sender {}: {}", frame.from, err);
                return;
            }
        };
        let message = match frame.message {
            Some(message) => message,
            None => return,
        };

        match self.partition(&frame.partition, Origin::Replication) {
            Ok(partition) => partition.deliver(from, message),
            Err(err) => debug!("dropping raft message for {}: {}", frame.partition, err),
        }
    }

    fn handle_request(&self, kind: RequestKind) -> Outcome {
        match kind {
            RequestKind::Hello(hello) => {
                self.learn(hello);
                Outcome::Hello(self.hello_message())
            }
            RequestKind::Join(join) => self.answer(|| {
                let node = join.node.parse::<NodeIdentity>()?;
                self.context.address_book.learn(node);
                let partition = self.partition(&join.partition, Origin::Join)?;
                partition.join_local(node, Instant::now() + self.options.join_timeout)?;
                Ok(None)
            }),
            RequestKind::Remove(remove) => self.answer(|| {
                let node = remove.node.parse::<NodeIdentity>()?;
                let partition = self.existing(&remove.partition)?;
                partition.remove_local(node, Instant::now() + self.options.request_timeout)?;
                Ok(None)
            }),
            RequestKind::Command(propose) => self.answer(|| {
                let command = Command::from_bytes(propose.command.clone())?;
                let partition = self.existing(&propose.partition)?;
                let applied = partition.propose_local(command, self.deadline(propose.timeout_ms))?;
                Ok(applied.into_value())
            }),
            RequestKind::Operation(forward) => self.answer(|| {
                let partition = self.existing(&forward.partition)?;
                let operation = forward.operation.clone().unwrap_or_default();
                self.dispatch(&partition, operation, self.deadline(forward.timeout_ms))
            }),
            RequestKind::Info(request) => match self.hosted(&request.partition) {
                Some(partition) => Outcome::Info(InfoReply::from(&partition.local_info())),
                None => Outcome::Error(ErrorReply::from(&Error::Application(format!(
                    "partition {} is not hosted here",
                    request.partition
                )))),
            },
        }
    }

    fn answer<F>(&self, f: F) -> Outcome
    where
        F: FnOnce() -> Result<Option<Bytes>, Error>,
    {
        match f() {
            Ok(value) => Outcome::Value(ValueReply::from_value(value)),
            // this node is going away, the caller has to find the partition elsewhere
            Err(Error::Stopped) => Outcome::Error(ErrorReply::from(&Error::NotLeader(None))),
            Err(err) => Outcome::Error(ErrorReply::from(&err)),
        }
    }

    /// Deadline of a forwarded request, never later than our own request timeout.
    fn deadline(&self, timeout_ms: u64) -> Instant {
        let timeout = min(Duration::from_millis(timeout_ms), self.options.request_timeout);
        Instant::now() + timeout
    }

    /// Queues `operation` for the request handler, provided this node leads `partition`.
    fn dispatch(
        &self,
        partition: &PartitionHandle,
        operation: Operation,
        deadline: Instant,
    ) -> Result<Option<Bytes>, Error> {
        if partition.role() != Role::Leader {
            let leader = partition.leader().filter(|leader| *leader != self.context.whoami);
            return Err(Error::NotLeader(leader));
        }

        let (sender, receiver) = bounded(1);
        self.requests
            .send(Request::new(partition.clone(), operation, Reply::new(sender)))
            .map_err(|_| Error::Stopped)?;

        match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Stopped),
        }
    }

    fn hello_message(&self) -> Hello {
        Hello {
            from: self.context.whoami.to_string(),
            known: self
                .context
                .address_book
                .known()
                .iter()
                .map(|node| node.to_string())
                .collect(),
        }
    }

    fn hello(&self, peer: NodeIdentity) {
        let deadline = Instant::now() + self.options.connect_timeout * 2;
        match self
            .context
            .transport
            .call(peer, RequestKind::Hello(self.hello_message()), deadline)
        {
            Ok(Outcome::Hello(hello)) => self.learn(hello),
            Ok(_) => warn!("{} answered hello with something else", peer),
            Err(err) => debug!("hello to {} failed: {}", peer, err),
        }
    }

    fn learn(&self, hello: Hello) {
        let address_book = &self.context.address_book;
        match hello.from.parse::<NodeIdentity>() {
            Ok(from) => {
                address_book.learn(from);
                address_book.mark_reachable(from);
            }
            Err(err) => warn!("hello from unparsable node {}: {}", hello.from, err),
        }

        address_book.learn_all(hello.known.iter().filter_map(|node| node.parse::<NodeIdentity>().ok()));
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);

        // connections first, so requests still in flight fail over to another node
        self.context.transport.shutdown();

        let partitions: Vec<PartitionHandle> = write(&self.partitions).drain().map(|(_, p)| p).collect();
        for partition in partitions {
            partition.stop();
        }

        info!("stopped node {}", self.context.whoami);
    }
}

/// Asks the cluster to add this node to `partition` until it shows up in the replica set.
///
/// Requests go to the seeds in turn, or to the leader once one is known.
fn join(
    partition: PartitionHandle,
    transport: Arc<Transport>,
    seeds: Vec<NodeIdentity>,
    join_timeout: Duration,
    request_timeout: Duration,
) {
    let whoami = partition.whoami();
    let deadline = Instant::now() + join_timeout;
    let mut hint: Option<NodeIdentity> = None;
    let mut attempt = 0_usize;

    while !partition.is_stopped() && Instant::now() < deadline {
        if partition.is_member() {
            info!("{} joined partition {}", whoami, partition.name());
            return;
        }

        let target = hint
            .take()
            .or_else(|| partition.leader().filter(|leader| *leader != whoami))
            .or_else(|| seeds.get(attempt % seeds.len().max(1)).cloned());
        attempt += 1;

        if let Some(target) = target {
            let request = RequestKind::Join(Join {
                partition: partition.name().to_string(),
                node: whoami.to_string(),
            });
            let call_deadline = min(deadline, Instant::now() + request_timeout);

            match transport
                .call(target, request, call_deadline)
                .and_then(Outcome::into_value)
            {
                Ok(_) => debug!("{} accepted {} into {}", target, whoami, partition.name()),
                Err(Error::NotLeader(Some(leader))) => hint = Some(leader),
                Err(err) => debug!("joining {} through {} failed: {}", partition.name(), target, err),
            }
        }

        thread::sleep(JOIN_RETRY_INTERVAL);
    }

    if !partition.is_stopped() && !partition.is_member() {
        warn!("{} gave up joining partition {}", whoami, partition.name());
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
