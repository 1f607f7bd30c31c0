use std::collections::BTreeMap;
use std::iter;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use rand::rngs::OsRng;
use raft::log::memory::InMemoryLog;
use raft::log::Log;
use raft::membership::Membership;
use raft::message::{LogIndex, Message, MessageDestination, SendableMessage, TermId};
use raft::node::{AppendError, Node};
use storage::Storage;

use crate::cluster::identity::NodeIdentity;
use crate::cluster::ClusterContext;
use crate::error::Error;
use crate::node::options::Options;
use crate::partition::applier::{Applied, Applier};
use crate::partition::command::Command;
use crate::partition::{Mode, Role, View};
use crate::protocol::Envelope;
use crate::topology::planner::{Topology, Waiter};

pub type RaftNode = Node<InMemoryLog, OsRng, NodeIdentity>;

/// Everything a partition worker reacts to besides its own timer.
pub enum Event {
    Raft {
        from: NodeIdentity,
        message: Message,
    },
    Propose {
        command: Command,
        deadline: Instant,
        reply: Sender<Result<Applied, Error>>,
    },
    Join {
        node: NodeIdentity,
        deadline: Instant,
        reply: Waiter,
    },
    Remove {
        node: NodeIdentity,
        deadline: Instant,
        reply: Waiter,
    },
    Stop,
}

struct Proposal {
    term: TermId,
    deadline: Instant,
    reply: Sender<Result<Applied, Error>>,
}

/// Sole owner of one partition replica: its raft node, its storage and its topology planner.
///
/// Runs on a dedicated thread, so every state transition of the replica happens in order, on one thread.
pub struct Worker {
    name: String,
    context: Arc<ClusterContext>,
    raft: RaftNode,
    applier: Applier,
    topology: Topology,
    proposals: BTreeMap<LogIndex, Proposal>,
    view: Arc<RwLock<View>>,
    tick_interval: Duration,
    was_leader: bool,
}

impl Worker {
    pub fn new(
        name: &str,
        mode: Mode,
        context: Arc<ClusterContext>,
        storage: Box<dyn Storage>,
        options: &Options,
    ) -> Self {
        let backend = &options.subnode.consensus_backend;
        let whoami = context.whoami;

        let raft = match mode {
            Mode::Bootstrap => RaftNode::new(
                whoami,
                iter::once(whoami).collect(),
                InMemoryLog::new(),
                OsRng,
                backend.raft.clone(),
            ),
            Mode::Join | Mode::Replica => {
                RaftNode::learner(whoami, InMemoryLog::new(), OsRng, backend.raft.clone())
            }
        };

        let mut worker = Worker {
            name: name.to_string(),
            topology: Topology::new(whoami, options.replicas, options.suspect_after),
            context,
            raft,
            applier: Applier::new(storage),
            proposals: BTreeMap::new(),
            view: Arc::new(RwLock::new(View::empty())),
            tick_interval: backend.tick_interval,
            was_leader: false,
        };

        info!("{} hosts partition {} ({:?})", whoami, name, mode);
        if let Mode::Bootstrap = mode {
            worker.bootstrap();
        }
        worker.publish();
        worker
    }

    pub fn view(&self) -> Arc<RwLock<View>> {
        self.view.clone()
    }

    pub fn run(mut self, events: Receiver<Event>) {
        let mut next_tick = Instant::now() + self.tick_interval;

        loop {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match events.recv_timeout(timeout) {
                Ok(Event::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => {}
            }

            // a busy channel must not starve the timer
            if Instant::now() >= next_tick {
                self.tick();
                next_tick = Instant::now() + self.tick_interval;
            }

            self.apply_committed();
            self.publish();
        }

        self.shutdown();
    }

    fn bootstrap(&mut self) {
        let messages = self.raft.campaign().collect::<Vec<_>>();
        self.send(messages);

        let membership = Membership::new(vec![self.context.whoami]);
        let appended = Command::membership(&membership)
            .to_bytes()
            .and_then(|data| self.append(data));
        if let Err(err) = appended {
            warn!("failed to bootstrap partition {}: {}", self.name, err);
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Raft { from, message } => {
                self.context.address_book.mark_reachable(from);
                let messages = self.raft.receive(message, from).collect::<Vec<_>>();
                self.send(messages);
            }
            Event::Propose {
                command,
                deadline,
                reply,
            } => self.propose(command, deadline, reply),
            Event::Join { node, deadline, reply } => {
                if !self.raft.is_leader() {
                    let _ = reply.send(Err(self.not_leader()));
                    return;
                }
                let _ = self.context.address_book.learn(node);
                self.topology
                    .join(node, self.raft.membership(), reply, deadline);
            }
            Event::Remove { node, deadline, reply } => {
                if !self.raft.is_leader() {
                    let _ = reply.send(Err(self.not_leader()));
                    return;
                }
                self.topology
                    .remove(node, self.raft.membership(), reply, deadline);
            }
            Event::Stop => {}
        }
    }

    fn propose(&mut self, command: Command, deadline: Instant, reply: Sender<Result<Applied, Error>>) {
        if !self.raft.is_leader() {
            let _ = reply.send(Err(self.not_leader()));
            return;
        }

        match command.to_bytes().and_then(|data| self.append(data)) {
            Ok(index) => {
                let (_, term) = self.raft.leader();
                let _ = self.proposals.insert(
                    index,
                    Proposal {
                        term,
                        deadline,
                        reply,
                    },
                );
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    /// Appends `data` to the log and returns its index.
    fn append(&mut self, data: Bytes) -> Result<LogIndex, Error> {
        let appended = self
            .raft
            .append(data)
            .map(|messages| messages.collect::<Vec<_>>());

        let messages = match appended {
            Ok(messages) => messages,
            Err(AppendError::Cancelled { .. }) => return Err(self.not_leader()),
            Err(AppendError::LogErr(())) => {
                return Err(Error::Storage("raft log refused the entry".to_string()))
            }
        };

        let index = self.raft.last_log_index();
        self.send(messages);
        Ok(index)
    }

    fn tick(&mut self) {
        let messages = self.raft.timer_tick().collect::<Vec<_>>();
        self.send(messages);

        let now = Instant::now();
        self.expire(now);
        self.topology.expire(now);
        self.plan_topology();
    }

    fn expire(&mut self, now: Instant) {
        let expired = self
            .proposals
            .iter()
            .filter(|(_, proposal)| proposal.deadline <= now)
            .map(|(index, _)| *index)
            .collect::<Vec<_>>();

        for index in expired {
            if let Some(proposal) = self.proposals.remove(&index) {
                debug!("proposal {} of {} timed out", index, self.name);
                let _ = proposal.reply.send(Err(Error::Timeout));
            }
        }
    }

    /// Proposes the next configuration change, once everything committed so far is applied and no other change is
    /// in flight.
    fn plan_topology(&mut self) {
        if !self.raft.has_committed_in_term()
            || self.applier.applied_idx() != self.raft.last_committed_log_index()
            || self.topology.is_pending()
        {
            return;
        }

        let commit_idx = self.raft.last_committed_log_index();
        let raft = &self.raft;
        let plan = self.topology.plan(
            raft.membership(),
            commit_idx,
            |node| {
                raft.replication_state(node)
                    .map(|replication| replication.match_idx)
                    .unwrap_or_default()
            },
            &self.context.address_book,
        );

        if let Some((change, membership)) = plan {
            let appended = Command::membership(&membership)
                .to_bytes()
                .and_then(|data| self.append(data));
            match appended {
                Ok(index) => self.topology.proposed(index, change),
                Err(err) => warn!("failed to propose {} on {}: {}", change, self.name, err),
            }
        }
    }

    fn apply_committed(&mut self) {
        let entries = self.raft.take_committed().collect::<Vec<_>>();
        if entries.is_empty() {
            return;
        }

        let first = self.raft.log().last_taken_index() + 1 - entries.len() as u64;
        for (index, entry) in (first.id..).map(|id| LogIndex { id }).zip(entries) {
            let outcome = self.applier.apply(index, &entry);

            if let Ok(Applied::Membership(membership)) = &outcome {
                self.reconfigure(membership.clone());
            }

            if let Some(proposal) = self.proposals.remove(&index) {
                // another leader overwrote our entry at that index
                let result = if proposal.term == entry.term {
                    outcome
                } else {
                    Err(self.not_leader())
                };
                let _ = proposal.reply.send(result);
            }
        }

        self.topology
            .applied(self.applier.applied_idx(), self.raft.membership());
    }

    fn reconfigure(&mut self, membership: Membership<NodeIdentity>) {
        if &membership == self.raft.membership() {
            return;
        }

        info!("{} applies {} on {}", self.context.whoami, membership, self.name);
        self.context
            .address_book
            .learn_all(membership.replicas().cloned());
        let messages = self.raft.reconfigure(membership).collect::<Vec<_>>();
        self.send(messages);
    }

    fn publish(&mut self) {
        let is_leader = self.raft.is_leader();
        if self.was_leader && !is_leader {
            info!("{} no longer leads {}", self.context.whoami, self.name);
            let err = self.not_leader();
            // entries of a deposed leader may still commit, but nothing tells us they will
            for (_, proposal) in std::mem::take(&mut self.proposals) {
                let _ = proposal.reply.send(Err(err.clone()));
            }
            self.topology.abandon(err);
        } else if !self.was_leader && is_leader {
            info!("{} leads {}", self.context.whoami, self.name);
        }
        self.was_leader = is_leader;

        let role = self.role();
        let (leader, term) = self.raft.leader();
        let view = View {
            role,
            leader: leader.cloned(),
            term: term.id,
            membership: self.raft.membership().clone(),
            commit_index: self.raft.last_committed_log_index().id,
            applied_index: self.applier.applied_idx().id,
        };

        match self.view.write() {
            Ok(mut guard) => *guard = view,
            Err(poisoned) => *poisoned.into_inner() = view,
        }
    }

    fn role(&self) -> Role {
        if self.raft.is_leader() {
            Role::Leader
        } else if !self.raft.is_voter() {
            Role::Learner
        } else if self.raft.is_candidate() {
            Role::Candidate
        } else {
            Role::Follower
        }
    }

    fn not_leader(&self) -> Error {
        let (leader, _) = self.raft.leader();
        Error::NotLeader(leader.filter(|leader| **leader != self.context.whoami).cloned())
    }

    fn send(&self, messages: Vec<SendableMessage<NodeIdentity>>) {
        let whoami = self.context.whoami;

        for SendableMessage { message, dest } in messages {
            match dest {
                MessageDestination::Broadcast => {
                    for voter in self.raft.membership().voters.iter().filter(|voter| **voter != whoami) {
                        self.context
                            .transport
                            .send(*voter, Envelope::raft(whoami, &self.name, message.clone()));
                    }
                }
                MessageDestination::To(node) => {
                    self.context
                        .transport
                        .send(node, Envelope::raft(whoami, &self.name, message));
                }
            }
        }
    }

    fn shutdown(&mut self) {
        info!("{} stops partition {}", self.context.whoami, self.name);

        for (_, proposal) in std::mem::take(&mut self.proposals) {
            let _ = proposal.reply.send(Err(Error::Stopped));
        }
        self.topology.abandon(Error::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crossbeam_channel::bounded;
    use raft::message::{Message, Rpc, TermId};

    use crate::cluster::identity::NodeIdentity;
    use crate::cluster::transport::Transport;
    use crate::cluster::ClusterContext;
    use crate::error::Error;
    use crate::node::options::Options;
    use crate::partition::command::Command;
    use crate::partition::worker::{Event, Worker};
    use crate::partition::Mode;
    use crate::topology::address_book::AddressBook;

    fn bootstrapped(whoami: NodeIdentity) -> Worker {
        let address_book = Arc::new(AddressBook::new(whoami));
        let transport = Arc::new(Transport::new(whoami, address_book.clone(), Duration::from_millis(100)));
        let context = Arc::new(ClusterContext::new(whoami, address_book, transport));
        let options = Options::default();
        let storage = (options.subnode.consensus_backend.storage)("p");
        Worker::new("p", Mode::Bootstrap, context, storage, &options)
    }

    #[test]
    fn deposed_leader_fails_pending_proposals() {
        let whoami: NodeIdentity = "127.0.0.1:4000".parse().unwrap();
        let usurper: NodeIdentity = "127.0.0.1:4001".parse().unwrap();
        let mut worker = bootstrapped(whoami);
        assert!(worker.raft.is_leader());

        let (reply, receiver) = bounded(1);
        worker.handle(Event::Propose {
            command: Command::put("k", "v"),
            deadline: Instant::now() + Duration::from_secs(60),
            reply,
        });
        assert_eq!(worker.proposals.len(), 1);

        let (_, term) = worker.raft.leader();
        worker.handle(Event::Raft {
            from: usurper,
            message: Message {
                term: TermId { id: term.id + 1 },
                rpc: Some(Rpc::AppendRequest(Default::default())),
            },
        });
        worker.publish();

        assert!(!worker.raft.is_leader());
        assert!(worker.proposals.is_empty());
        assert!(matches!(receiver.try_recv().unwrap(), Err(Error::NotLeader(_))));
    }
}
