use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::cluster::identity::NodeIdentity;
use crate::error::Error;
use crate::node::NodeState;
use crate::protocol::frame::{read_frame, write_frame};
use crate::protocol::{Body, Envelope, Outcome, RequestKind, ResponseFrame};
use crate::topology::address_book::AddressBook;

/// Frames waiting for a peer's writer thread; more are dropped, raft retries on its own.
const OUTBOUND_QUEUE: usize = 1024;
/// How long a writer drops frames after failing to connect.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

pub type Inbound = Arc<dyn Fn(Envelope) -> Option<Envelope> + Send + Sync>;

/// Node to node connections.
///
/// One-way raft frames go through a writer thread per peer, so a slow or dead peer never blocks a partition worker.
/// Requests use a pool of connections per peer, one request at a time per connection.
pub struct Transport {
    whoami: NodeIdentity,
    address_book: Arc<AddressBook>,
    connect_timeout: Duration,
    writers: Mutex<HashMap<NodeIdentity, Sender<Envelope>>>,
    idle: Mutex<HashMap<NodeIdentity, Vec<TcpStream>>>,
    accepted: Mutex<HashMap<u64, TcpStream>>,
    next_connection: AtomicU64,
    closed: AtomicBool,
}

impl Transport {
    pub fn new(whoami: NodeIdentity, address_book: Arc<AddressBook>, connect_timeout: Duration) -> Self {
        Transport {
            whoami,
            address_book,
            connect_timeout,
            writers: Mutex::new(HashMap::new()),
            idle: Mutex::new(HashMap::new()),
            accepted: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Queues a one-way frame for `to`. Frames are dropped when the peer is unreachable or too far behind.
    pub fn send(&self, to: NodeIdentity, envelope: Envelope) {
        if self.closed.load(Ordering::SeqCst) || to == self.whoami {
            return;
        }

        let mut writers = lock(&self.writers);
        let writer = writers
            .entry(to)
            .or_insert_with(|| spawn_writer(to, self.address_book.clone(), self.connect_timeout));

        match writer.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("outbound queue to {} is full, dropping frame", to),
            Err(TrySendError::Disconnected(envelope)) => {
                // the writer thread died, start over with a new one
                let writer = spawn_writer(to, self.address_book.clone(), self.connect_timeout);
                let _ = writer.try_send(envelope);
                writers.insert(to, writer);
            }
        }
    }

    /// Sends a request to `to` and waits for its response until `deadline`.
    pub fn call(&self, to: NodeIdentity, kind: RequestKind, deadline: Instant) -> Result<Outcome, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }

        let id = Uuid::new_v4().to_string();
        let envelope = Envelope::request(id.clone(), kind);

        // a pooled connection may have been closed by the peer in the meantime
        if let Some(stream) = self.checkout(to) {
            match self.exchange(to, stream, &envelope, &id, deadline) {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.kind() == ErrorKind::TimedOut || err.kind() == ErrorKind::WouldBlock => {
                    return Err(Error::Timeout)
                }
                Err(_) => {}
            }
        }

        let stream = self.connect(to, deadline)?;
        match self.exchange(to, stream, &envelope, &id, deadline) {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.kind() == ErrorKind::TimedOut || err.kind() == ErrorKind::WouldBlock => {
                Err(Error::Timeout)
            }
            Err(err) if err.kind() == ErrorKind::InvalidData => Err(Error::Codec(err.to_string())),
            Err(err) => {
                debug!("request to {} failed: {}", to, err);
                self.address_book.mark_unreachable(to);
                Err(Error::Unreachable(to))
            }
        }
    }

    fn exchange(
        &self,
        to: NodeIdentity,
        mut stream: TcpStream,
        envelope: &Envelope,
        id: &str,
        deadline: Instant,
    ) -> io::Result<Outcome> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining == Duration::from_secs(0) {
            return Err(io::Error::new(ErrorKind::TimedOut, "deadline reached"));
        }
        stream.set_read_timeout(Some(remaining))?;
        stream.set_write_timeout(Some(remaining))?;

        write_frame(&mut stream, envelope)?;
        let response = read_frame(&mut stream)?;

        match response.body {
            Some(Body::Response(ResponseFrame {
                id: response_id,
                outcome: Some(outcome),
            })) if response_id == id => {
                self.address_book.mark_reachable(to);
                self.checkin(to, stream);
                Ok(outcome)
            }
            _ => Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("unexpected response from {}", to),
            )),
        }
    }

    fn connect(&self, to: NodeIdentity, deadline: Instant) -> Result<TcpStream, Error> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining == Duration::from_secs(0) {
            return Err(Error::Timeout);
        }

        match TcpStream::connect_timeout(&to.socket_addr(), remaining.min(self.connect_timeout)) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Err(err) => {
                debug!("failed to connect to {}: {}", to, err);
                self.address_book.mark_unreachable(to);
                Err(Error::Unreachable(to))
            }
        }
    }

    fn checkout(&self, to: NodeIdentity) -> Option<TcpStream> {
        lock(&self.idle).get_mut(&to).and_then(|streams| streams.pop())
    }

    fn checkin(&self, to: NodeIdentity, stream: TcpStream) {
        if !self.closed.load(Ordering::SeqCst) {
            lock(&self.idle).entry(to).or_insert_with(Vec::new).push(stream);
        }
    }

    /// Accepts connections until `Stop` shows up on the lifecycle bus, handing every frame received to `inbound` and
    /// writing back whatever it answers.
    pub fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        state_send: &Sender<NodeState>,
        state_recv: &Receiver<NodeState>,
        inbound: Inbound,
    ) {
        if let Err(err) = listener.set_nonblocking(true) {
            error!("failed to configure listener: {}", err);
            let _ = state_send.send(NodeState::Error(err.to_string()));
            return;
        }

        info!("{} is listening", self.whoami);
        // notify that the node has been started
        let _ = state_send.send(NodeState::Started);

        for stream in listener.incoming() {
            match stream {
                Ok(tcp_stream) => {
                    let _ = tcp_stream.set_nonblocking(false);
                    let _ = tcp_stream.set_nodelay(true);
                    let connection = self.next_connection.fetch_add(1, Ordering::SeqCst);
                    if let Ok(clone) = tcp_stream.try_clone() {
                        lock(&self.accepted).insert(connection, clone);
                    }

                    let transport = self.clone();
                    let inbound = inbound.clone();
                    let _ = thread::Builder::new()
                        .name("connection".to_string())
                        .spawn(move || {
                            handle_connection(tcp_stream, inbound);
                            lock(&transport.accepted).remove(&connection);
                        });
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => {
                    error!("listener failed: {}", err);
                    break;
                }
            }

            if stop_sig_received(state_recv, state_send) {
                // let's gracefully shutdown the listener
                break;
            }
        }
    }

    /// Closes every connection. Later sends are dropped and calls fail with [`Error::Stopped`].
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        // writer threads exit once their queue is dropped
        lock(&self.writers).clear();
        lock(&self.idle).clear();
        for (_, stream) in lock(&self.accepted).drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn handle_connection(mut stream: TcpStream, inbound: Inbound) {
    loop {
        let envelope = match read_frame(&mut stream) {
            Ok(envelope) => envelope,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return,
            Err(err) => {
                debug!("closing connection: {}", err);
                return;
            }
        };

        if let Some(response) = inbound(envelope) {
            if let Err(err) = write_frame(&mut stream, &response) {
                debug!("failed to answer: {}", err);
                return;
            }
        }
    }
}

fn spawn_writer(to: NodeIdentity, address_book: Arc<AddressBook>, connect_timeout: Duration) -> Sender<Envelope> {
    let (sender, receiver) = bounded::<Envelope>(OUTBOUND_QUEUE);

    let spawned = thread::Builder::new()
        .name(format!("writer {}", to))
        .spawn(move || {
            let mut stream: Option<TcpStream> = None;
            let mut retry_at = Instant::now();

            for envelope in receiver {
                if stream.is_none() {
                    if Instant::now() < retry_at {
                        continue;
                    }

                    match TcpStream::connect_timeout(&to.socket_addr(), connect_timeout) {
                        Ok(connected) => {
                            let _ = connected.set_nodelay(true);
                            let _ = connected.set_write_timeout(Some(connect_timeout));
                            address_book.mark_reachable(to);
                            stream = Some(connected);
                        }
                        Err(err) => {
                            debug!("failed to connect to {}: {}", to, err);
                            address_book.mark_unreachable(to);
                            retry_at = Instant::now() + RECONNECT_BACKOFF;
                            continue;
                        }
                    }
                }

                if let Some(connected) = stream.as_mut() {
                    if let Err(err) = write_frame(connected, &envelope) {
                        debug!("lost connection to {}: {}", to, err);
                        address_book.mark_unreachable(to);
                        stream = None;
                        retry_at = Instant::now() + RECONNECT_BACKOFF;
                    }
                }
            }
        });

    if let Err(err) = spawned {
        warn!("failed to start writer to {}: {}", to, err);
    }

    sender
}

pub fn stop_sig_received(recv: &Receiver<NodeState>, sender: &Sender<NodeState>) -> bool {
    if let Ok(recv_state) = recv.try_recv() {
        if recv_state == NodeState::Stop {
            // notify that the node has been stopped
            let _ = sender.send(NodeState::Stopped);
            return true;
        }
    }

    false
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
