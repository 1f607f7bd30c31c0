use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{info, warn};
use raft::membership::Membership;
use raft::message::LogIndex;

use crate::cluster::identity::NodeIdentity;
use crate::error::Error;
use crate::topology::address_book::AddressBook;

pub type Waiter = Sender<Result<(), Error>>;

struct Pending {
    reply: Waiter,
    deadline: Instant,
}

/// One step of a replica set change. Each step is committed on its own before the next is planned.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Change {
    AddLearner(NodeIdentity),
    Promote(NodeIdentity),
    Remove(NodeIdentity),
}

/// Decides, on the leader of a partition, the next configuration to propose.
///
/// Requests to join or leave are queued per node, so asking twice for the same node only adds a waiter. Nodes are
/// added as learners, promoted to voters once they caught up with the commit index, and removed when asked to or
/// when they have been unreachable for too long while still learning.
pub struct Topology {
    whoami: NodeIdentity,
    replicas: usize,
    suspect_after: Duration,
    joins: BTreeMap<NodeIdentity, Vec<Pending>>,
    removals: BTreeMap<NodeIdentity, Vec<Pending>>,
    /// Index of the configuration entry proposed and not applied yet.
    proposed: Option<(LogIndex, Change)>,
}

impl Topology {
    pub fn new(whoami: NodeIdentity, replicas: usize, suspect_after: Duration) -> Self {
        Topology {
            whoami,
            replicas,
            suspect_after,
            joins: BTreeMap::new(),
            removals: BTreeMap::new(),
            proposed: None,
        }
    }

    /// Queues a request for `node` to join, answered once a configuration including it is applied.
    pub fn join(
        &mut self,
        node: NodeIdentity,
        membership: &Membership<NodeIdentity>,
        reply: Waiter,
        deadline: Instant,
    ) {
        if membership.contains(&node) {
            let _ = reply.send(Ok(()));
            return;
        }

        self.removals.remove(&node);
        self.joins
            .entry(node)
            .or_insert_with(Vec::new)
            .push(Pending { reply, deadline });
    }

    /// Queues a request for `node` to leave, answered once a configuration without it is applied.
    pub fn remove(
        &mut self,
        node: NodeIdentity,
        membership: &Membership<NodeIdentity>,
        reply: Waiter,
        deadline: Instant,
    ) {
        if !membership.contains(&node) {
            let _ = reply.send(Ok(()));
            return;
        }

        if membership.is_voter(&node) && membership.voters.len() == 1 {
            let _ = reply.send(Err(Error::Application(format!(
                "cannot remove {}, the last voter",
                node
            ))));
            return;
        }

        self.joins.remove(&node);
        self.removals
            .entry(node)
            .or_insert_with(Vec::new)
            .push(Pending { reply, deadline });
    }

    pub fn is_pending(&self) -> bool {
        self.proposed.is_some()
    }

    /// Returns the next change and the configuration resulting from it, if any is needed.
    ///
    /// `match_idx` gives how far the log of a member is known to match ours.
    pub fn plan<F>(
        &self,
        membership: &Membership<NodeIdentity>,
        commit_idx: LogIndex,
        match_idx: F,
        address_book: &AddressBook,
    ) -> Option<(Change, Membership<NodeIdentity>)>
    where
        F: Fn(&NodeIdentity) -> LogIndex,
    {
        if self.proposed.is_some() {
            return None;
        }

        let change = self
            .removals
            .keys()
            .find(|node| membership.contains(node))
            .filter(|node| !(membership.is_voter(node) && membership.voters.len() == 1))
            .map(|node| Change::Remove(*node))
            .or_else(|| {
                self.joins
                    .keys()
                    .find(|node| !membership.contains(node))
                    .map(|node| Change::AddLearner(*node))
            })
            .or_else(|| {
                membership
                    .learners
                    .iter()
                    .find(|learner| {
                        commit_idx > LogIndex::default() && match_idx(learner) >= commit_idx
                    })
                    .map(|learner| Change::Promote(*learner))
            })
            .or_else(|| {
                membership
                    .learners
                    .iter()
                    .find(|learner| address_book.is_suspect(learner, self.suspect_after))
                    .map(|learner| Change::Remove(*learner))
            })
            .or_else(|| {
                if membership.len() >= self.replicas {
                    return None;
                }
                address_book
                    .known()
                    .into_iter()
                    .find(|node| {
                        *node != self.whoami
                            && !membership.contains(node)
                            && address_book.is_reachable(node)
                    })
                    .map(Change::AddLearner)
            })?;

        let next = match &change {
            Change::AddLearner(node) => membership.with_learner(*node),
            Change::Promote(node) => membership.promote(node),
            Change::Remove(node) => membership.remove(node),
        };

        Some((change, next))
    }

    /// Records that the configuration entry for `change` was appended at `index`.
    pub fn proposed(&mut self, index: LogIndex, change: Change) {
        info!("{} proposed {} at {}", self.whoami, change, index);
        self.proposed = Some((index, change));
    }

    /// Called after entries up to `applied_idx` have been applied, `membership` being the configuration in effect.
    pub fn applied(&mut self, applied_idx: LogIndex, membership: &Membership<NodeIdentity>) {
        if let Some((index, _)) = &self.proposed {
            if *index <= applied_idx {
                self.proposed = None;
            }
        }

        let joined = self
            .joins
            .keys()
            .filter(|node| membership.contains(node))
            .cloned()
            .collect::<Vec<_>>();
        for node in joined {
            answer(self.joins.remove(&node), Ok(()));
        }

        let removed = self
            .removals
            .keys()
            .filter(|node| !membership.contains(node))
            .cloned()
            .collect::<Vec<_>>();
        for node in removed {
            answer(self.removals.remove(&node), Ok(()));
        }
    }

    /// Answers waiters whose deadline passed with [`Error::Timeout`]. Their request stays queued.
    pub fn expire(&mut self, now: Instant) {
        for waiters in self.joins.values_mut().chain(self.removals.values_mut()) {
            waiters.retain(|waiter| {
                if waiter.deadline <= now {
                    let _ = waiter.reply.send(Err(Error::Timeout));
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Gives up everything in flight after losing leadership.
    pub fn abandon(&mut self, err: Error) {
        if self.proposed.is_some() || !self.joins.is_empty() || !self.removals.is_empty() {
            warn!("{} abandons topology changes: {}", self.whoami, err);
        }

        self.proposed = None;
        for (_, waiters) in std::mem::take(&mut self.joins)
            .into_iter()
            .chain(std::mem::take(&mut self.removals))
        {
            answer(Some(waiters), Err(err.clone()));
        }
    }
}

fn answer(waiters: Option<Vec<Pending>>, result: Result<(), Error>) {
    for waiter in waiters.unwrap_or_default() {
        let _ = waiter.reply.send(result.clone());
    }
}

impl Display for Change {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Change::AddLearner(node) => write!(f, "adding learner {}", node),
            Change::Promote(node) => write!(f, "promoting {}", node),
            Change::Remove(node) => write!(f, "removing {}", node),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crossbeam_channel::bounded;
    use raft::membership::Membership;
    use raft::message::LogIndex;

    use crate::cluster::identity::NodeIdentity;
    use crate::error::Error;
    use crate::topology::address_book::AddressBook;
    use crate::topology::planner::{Change, Topology};

    fn node(port: u16) -> NodeIdentity {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn idx(id: u64) -> LogIndex {
        LogIndex { id }
    }

    fn topology(replicas: usize) -> Topology {
        Topology::new(node(1), replicas, Duration::from_secs(60))
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn joining_twice_proposes_once() {
        let book = AddressBook::new(node(1));
        let membership = Membership::new(vec![node(1)]);
        let mut topology = topology(1);

        let (first, first_rx) = bounded(1);
        let (second, second_rx) = bounded(1);
        topology.join(node(2), &membership, first, later());
        topology.join(node(2), &membership, second, later());

        let (change, next) = topology.plan(&membership, idx(2), |_| idx(0), &book).unwrap();
        assert_eq!(change, Change::AddLearner(node(2)));
        topology.proposed(idx(3), change);
        assert!(topology.plan(&next, idx(2), |_| idx(0), &book).is_none());

        topology.applied(idx(3), &next);
        assert_eq!(first_rx.try_recv().unwrap(), Ok(()));
        assert_eq!(second_rx.try_recv().unwrap(), Ok(()));
        assert!(!topology.is_pending());

        let (again, again_rx) = bounded(1);
        topology.join(node(2), &next, again, later());
        assert_eq!(again_rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn promote_caught_up_learners_only() {
        let book = AddressBook::new(node(1));
        let membership = Membership::new(vec![node(1)]).with_learner(node(2));
        let topology = topology(3);

        assert!(topology.plan(&membership, idx(5), |_| idx(4), &book).is_none());

        let (change, next) = topology.plan(&membership, idx(5), |_| idx(5), &book).unwrap();
        assert_eq!(change, Change::Promote(node(2)));
        assert!(next.is_voter(&node(2)));
    }

    #[test]
    fn absorb_known_nodes_up_to_replicas() {
        let book = AddressBook::new(node(1));
        book.learn_all(vec![node(2), node(3), node(4)]);
        book.mark_unreachable(node(2));
        let topology = topology(2);

        let membership = Membership::new(vec![node(1)]);
        let (change, next) = topology.plan(&membership, idx(1), |_| idx(0), &book).unwrap();
        assert_eq!(change, Change::AddLearner(node(3)));

        let next = next.promote(&node(3));
        assert!(topology.plan(&next, idx(2), |_| idx(2), &book).is_none());
    }

    #[test]
    fn explicit_joins_exceed_replicas() {
        let book = AddressBook::new(node(1));
        let membership = Membership::new(vec![node(1)]);
        let mut topology = topology(1);

        let (reply, _reply_rx) = bounded(1);
        topology.join(node(5), &membership, reply, later());
        let (change, _) = topology.plan(&membership, idx(1), |_| idx(0), &book).unwrap();
        assert_eq!(change, Change::AddLearner(node(5)));
    }

    #[test]
    fn evict_suspect_learners() {
        let book = AddressBook::new(node(1));
        book.learn(node(2));
        book.mark_unreachable(node(2));
        let topology = Topology::new(node(1), 1, Duration::from_millis(0));

        let membership = Membership::new(vec![node(1)]).with_learner(node(2));
        let (change, next) = topology.plan(&membership, idx(3), |_| idx(0), &book).unwrap();
        assert_eq!(change, Change::Remove(node(2)));
        assert_eq!(next, Membership::new(vec![node(1)]));
    }

    #[test]
    fn add_then_remove_restores_membership() {
        let book = AddressBook::new(node(1));
        let initial = Membership::new(vec![node(1)]);
        let mut topology = topology(1);

        let (reply, _reply_rx) = bounded(1);
        topology.join(node(2), &initial, reply, later());
        let (change, added) = topology.plan(&initial, idx(1), |_| idx(0), &book).unwrap();
        topology.proposed(idx(2), change);
        topology.applied(idx(2), &added);

        let (reply, reply_rx) = bounded(1);
        topology.remove(node(2), &added, reply, later());
        let (change, removed) = topology.plan(&added, idx(2), |_| idx(0), &book).unwrap();
        assert_eq!(change, Change::Remove(node(2)));
        topology.proposed(idx(3), change);
        topology.applied(idx(3), &removed);

        assert_eq!(removed, initial);
        assert_eq!(reply_rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn refuse_to_remove_last_voter() {
        let membership = Membership::new(vec![node(1)]);
        let mut topology = topology(1);

        let (reply, reply_rx) = bounded(1);
        topology.remove(node(1), &membership, reply, later());
        assert!(matches!(reply_rx.try_recv().unwrap(), Err(Error::Application(_))));
    }

    #[test]
    fn abandon_and_expire_answer_waiters() {
        let membership = Membership::new(vec![node(1)]);
        let mut topology = topology(1);

        let (expired, expired_rx) = bounded(1);
        topology.join(node(2), &membership, expired, Instant::now());
        topology.expire(Instant::now());
        assert_eq!(expired_rx.try_recv().unwrap(), Err(Error::Timeout));

        let (waiting, waiting_rx) = bounded(1);
        topology.join(node(3), &membership, waiting, later());
        topology.abandon(Error::NotLeader(Some(node(4))));
        assert_eq!(waiting_rx.try_recv().unwrap(), Err(Error::NotLeader(Some(node(4)))));
    }
}
