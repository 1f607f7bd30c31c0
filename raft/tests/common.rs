#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::debug;
use rand_chacha::ChaChaRng;
use rand_core::{RngCore, SeedableRng};

use raft::core::State;
use raft::log::memory::InMemoryLog;
use raft::membership::Membership;
use raft::message::{LogEntry, Message, MessageDestination, Rpc, SendableMessage, TermId};
use raft::node::Config;

pub const CONFIG: Config = Config {
    election_timeout_ticks: 10,
    heartbeat_interval_ticks: 9,
    replication_chunk_size: 1024,
};
const RANDOM_SEED: u64 = 0;
const MAX_TICKS: u32 = 100_000;

pub type TestRaft = State<InMemoryLog, ChaChaRng, NodeId>;

type Outbox = VecDeque<(NodeId, SendableMessage<NodeId>)>;

#[derive(Clone, Copy, Debug, derive_more::Display, Eq, derive_more::From, PartialEq, PartialOrd, Ord)]
#[display(fmt = "{:?}", self)]
pub struct NodeId(u64);

/// Nodes wired through a simulated network, one timer tick at a time.
///
/// Every message is delivered synchronously within the tick it was sent in, unless the network drops it. After each
/// delivery the group checks that no two nodes ever lead the same term.
pub struct TestRaftGroup {
    pub nodes: Vec<TestRaft>,
    pub tick: u32,
    pub config: TestRaftGroupConfig,
    leaders: BTreeMap<u64, NodeId>,
}

/// Network faults: links that drop messages, and nodes that are down.
#[derive(Clone, Default)]
pub struct TestRaftGroupConfig {
    pub drops: BTreeSet<(Option<NodeId>, Option<NodeId>)>,
    pub down: BTreeSet<NodeId>,
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn init_random() -> ChaChaRng {
    ChaChaRng::seed_from_u64(RANDOM_SEED)
}

pub fn rpc_types() -> [Rpc; 4] {
    [
        Rpc::VoteRequest(Default::default()),
        Rpc::VoteResponse(Default::default()),
        Rpc::AppendRequest(Default::default()),
        Rpc::AppendResponse(Default::default()),
    ]
}

pub fn raft(node_id: u64, peers: Vec<u64>, log: Option<InMemoryLog>, random: &mut impl RngCore) -> TestRaft {
    init_logger();
    State::new(
        NodeId(node_id),
        peers.into_iter().map(NodeId).collect(),
        log.unwrap_or_else(InMemoryLog::new),
        ChaChaRng::seed_from_u64(random.next_u64()),
        CONFIG,
    )
}

/// A node which belongs to no configuration yet, as a freshly joined node does.
pub fn learner(node_id: u64, random: &mut impl RngCore) -> TestRaft {
    with_membership(node_id, Membership::default(), random)
}

fn with_membership(node_id: u64, membership: Membership<NodeId>, random: &mut impl RngCore) -> TestRaft {
    init_logger();
    State::with_membership(
        NodeId(node_id),
        membership,
        InMemoryLog::new(),
        ChaChaRng::seed_from_u64(random.next_u64()),
        CONFIG,
    )
}

pub fn membership(voters: &[u64], learners: &[u64]) -> Membership<NodeId> {
    Membership {
        voters: voters.iter().cloned().map(NodeId).collect(),
        learners: learners.iter().cloned().map(NodeId).collect(),
    }
}

pub fn config() -> TestRaftGroupConfig {
    TestRaftGroupConfig::default()
}

/// Hands `rpc` to `raft` as if `from` had sent it at `term`, returning the answer.
pub fn send(raft: &mut TestRaft, from: u64, term: TermId, rpc: Rpc) -> Option<SendableMessage<NodeId>> {
    raft.receive(Message { term, rpc: Some(rpc) }, NodeId(from))
}

impl TestRaftGroup {
    pub fn new(size: u64, random: &mut impl RngCore, config: TestRaftGroupConfig) -> Self {
        let ids: Vec<u64> = (0..size).collect();
        let nodes = ids.iter().map(|id| raft(*id, ids.clone(), None, random)).collect();
        Self::of(nodes, config)
    }

    /// A group of `voters` voting nodes followed by `learners` learners, all sharing the same configuration.
    pub fn with_learners(voters: u64, learners: u64, random: &mut impl RngCore, config: TestRaftGroupConfig) -> Self {
        let voter_ids: Vec<u64> = (0..voters).collect();
        let learner_ids: Vec<u64> = (voters..voters + learners).collect();
        let shared = membership(&voter_ids, &learner_ids);
        let nodes = (0..voters + learners)
            .map(|id| with_membership(id, shared.clone(), random))
            .collect();
        Self::of(nodes, config)
    }

    fn of(nodes: Vec<TestRaft>, config: TestRaftGroupConfig) -> Self {
        TestRaftGroup {
            nodes,
            tick: 0,
            config,
            leaders: BTreeMap::new(),
        }
    }

    /// Applies `membership` on every node, as if a configuration entry had just been applied everywhere.
    pub fn reconfigure(&mut self, membership: Membership<NodeId>) -> &mut Self {
        for node in &mut self.nodes {
            node.reconfigure(membership.clone());
        }
        self
    }

    pub fn run_until(&mut self, mut until: impl FnMut(&mut Self) -> bool) -> &mut Self {
        let started = self.tick;
        while !until(self) {
            assert!(
                self.tick - started < MAX_TICKS,
                "condition still false after {} ticks",
                MAX_TICKS
            );
            self.step();
        }
        self
    }

    /// Runs until some node commits a non empty entry matching `until`. Every committed entry is consumed.
    pub fn run_until_commit(&mut self, mut until: impl FnMut(&LogEntry) -> bool) -> &mut Self {
        self.run_until(|group| {
            let committed: Vec<LogEntry> = group.take_committed().collect();
            committed.iter().any(|entry| !entry.data.is_empty() && until(entry))
        })
    }

    pub fn run_for(&mut self, ticks: u32) -> &mut Self {
        self.run_for_inspect(ticks, |_| ())
    }

    pub fn run_for_inspect(&mut self, ticks: u32, mut inspect: impl FnMut(&mut Self)) -> &mut Self {
        for _ in 0..ticks {
            self.step();
            inspect(self);
        }
        self
    }

    /// Runs `action` on one node, then delivers whatever it sent without advancing the clock.
    pub fn run_on_node(
        &mut self,
        node_idx: usize,
        action: impl FnOnce(&mut TestRaft) -> Option<SendableMessage<NodeId>>,
    ) -> &mut Self {
        let from = *self.nodes[node_idx].node_id();
        let mut outbox: Outbox = action(&mut self.nodes[node_idx]).map(|sent| (from, sent)).into_iter().collect();
        outbox.extend(self.replicate(node_idx));
        self.deliver(outbox);
        self
    }

    pub fn inspect(&mut self, inspect: impl FnOnce(&Self)) -> &mut Self {
        inspect(self);
        self
    }

    pub fn modify(&mut self, modify: impl FnOnce(&mut Self)) -> &mut Self {
        modify(self);
        self
    }

    pub fn take_committed(&mut self) -> impl Iterator<Item = LogEntry> + '_ {
        self.nodes.iter_mut().flat_map(|node| node.take_committed())
    }

    pub fn has_leader(&self) -> bool {
        self.nodes.iter().any(|node| node.is_leader())
    }

    fn step(&mut self) {
        self.tick += 1;
        debug!("tick {:03}", self.tick);

        let mut outbox = Outbox::new();
        for idx in 0..self.nodes.len() {
            let id = *self.nodes[idx].node_id();
            if self.config.is_node_down(id) {
                continue;
            }
            outbox.extend(self.nodes[idx].timer_tick().map(|sent| (id, sent)));
            outbox.extend(self.replicate(idx));
        }
        self.deliver(outbox);
    }

    fn deliver(&mut self, mut outbox: Outbox) {
        while let Some((from, SendableMessage { message, dest })) = outbox.pop_front() {
            let recipients: Vec<usize> = (0..self.nodes.len())
                .filter(|idx| {
                    let id = *self.nodes[*idx].node_id();
                    match &dest {
                        MessageDestination::To(to) => id == *to,
                        MessageDestination::Broadcast => id != from,
                    }
                })
                .collect();

            for idx in recipients {
                let to = *self.nodes[idx].node_id();
                if self.config.should_drop(from, to) {
                    debug!("{} -> {} dropped {}", from, to, message);
                    continue;
                }

                debug!("{} -> {} {}", from, to, message);
                outbox.extend(self.nodes[idx].receive(message.clone(), from).map(|sent| (to, sent)));
                outbox.extend(self.replicate(idx));
            }

            self.check_one_leader_per_term();
        }
    }

    /// Append requests node `idx` has due for every other node.
    fn replicate(&mut self, idx: usize) -> Outbox {
        let ids: Vec<NodeId> = self.nodes.iter().map(|node| *node.node_id()).collect();
        let node = &mut self.nodes[idx];
        let from = *node.node_id();

        ids.into_iter()
            .filter(|id| *id != from)
            .filter_map(|id| node.append_entries(id))
            .map(|sent| (from, sent))
            .collect()
    }

    fn check_one_leader_per_term(&mut self) {
        for node in self.nodes.iter().filter(|node| node.is_leader()) {
            let (_, term) = node.leader();
            let leader = *self.leaders.entry(term.id).or_insert(*node.node_id());
            assert_eq!(
                leader,
                *node.node_id(),
                "{} and {} both lead term {}",
                leader,
                node.node_id(),
                term
            );
        }
    }
}

impl TestRaftGroupConfig {
    pub fn node_down(mut self, node_id: u64) -> Self {
        self.down.insert(NodeId(node_id));
        self
    }

    pub fn isolate(mut self, node_id: u64) -> Self {
        self.drops.insert((Some(NodeId(node_id)), None));
        self.drops.insert((None, Some(NodeId(node_id))));
        self
    }

    pub fn drop_between(mut self, from: u64, to: u64) -> Self {
        self.drops.insert((Some(NodeId(from)), Some(NodeId(to))));
        self.drops.insert((Some(NodeId(to)), Some(NodeId(from))));
        self
    }

    pub fn drop_to(mut self, node_id: u64) -> Self {
        self.drops.insert((None, Some(NodeId(node_id))));
        self
    }

    pub fn is_node_down(&self, node_id: NodeId) -> bool {
        self.down.contains(&node_id)
    }

    pub fn should_drop(&self, from: NodeId, to: NodeId) -> bool {
        self.drops.contains(&(Some(from), Some(to)))
            || self.drops.contains(&(Some(from), None))
            || self.drops.contains(&(None, Some(to)))
            || self.down.contains(&from)
            || self.down.contains(&to)
    }
}
