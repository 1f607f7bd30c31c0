//! Voters and learners of a Raft group.

use std::collections::BTreeSet;
use std::fmt;
use std::iter::FromIterator;

/// The configuration of a Raft group: the nodes that vote and the nodes that only replicate.
///
/// Every transformation returns a new configuration, leaving `self` untouched, so that a leader can compute the
/// configuration to propose before anything changes locally. A node is never both a voter and a learner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Membership<NodeId: Ord> {
    /// Nodes which vote in elections and count towards the commit quorum.
    pub voters: BTreeSet<NodeId>,

    /// Nodes which receive replicated entries without voting.
    pub learners: BTreeSet<NodeId>,
}

impl<NodeId: Ord> Default for Membership<NodeId> {
    fn default() -> Self {
        Self {
            voters: BTreeSet::new(),
            learners: BTreeSet::new(),
        }
    }
}

impl<NodeId: Ord + Clone> Membership<NodeId> {
    /// A configuration made only of `voters`.
    pub fn new<I: IntoIterator<Item = NodeId>>(voters: I) -> Self {
        Self {
            voters: BTreeSet::from_iter(voters),
            learners: BTreeSet::new(),
        }
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.voters.contains(node_id) || self.learners.contains(node_id)
    }

    pub fn is_voter(&self, node_id: &NodeId) -> bool {
        self.voters.contains(node_id)
    }

    pub fn is_learner(&self, node_id: &NodeId) -> bool {
        self.learners.contains(node_id)
    }

    /// The number of voters whose agreement is needed to elect a leader or commit an entry.
    pub fn quorum_size(&self) -> usize {
        quorum_size(self.voters.len())
    }

    /// Every node of the group, voters first.
    pub fn replicas(&self) -> impl Iterator<Item = &NodeId> + '_ {
        self.voters.iter().chain(self.learners.iter())
    }

    pub fn len(&self) -> usize {
        self.voters.len() + self.learners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds `node_id` as a learner. A node already in the group keeps its role.
    pub fn with_learner(&self, node_id: NodeId) -> Self {
        let mut next = self.clone();
        if !next.contains(&node_id) {
            next.learners.insert(node_id);
        }
        next
    }

    /// Turns the learner `node_id` into a voter.
    pub fn promote(&self, node_id: &NodeId) -> Self {
        let mut next = self.clone();
        if next.learners.remove(node_id) {
            next.voters.insert(node_id.clone());
        }
        next
    }

    /// Removes `node_id` from the group, whatever its role.
    pub fn remove(&self, node_id: &NodeId) -> Self {
        let mut next = self.clone();
        next.voters.remove(node_id);
        next.learners.remove(node_id);
        next
    }
}

impl<NodeId: Ord + fmt::Display> fmt::Display for Membership<NodeId> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("voters [")?;
        for (i, voter) in self.voters.iter().enumerate() {
            if i > 0 {
                fmt.write_str(", ")?;
            }
            fmt::Display::fmt(voter, fmt)?;
        }
        fmt.write_str("] learners [")?;
        for (i, learner) in self.learners.iter().enumerate() {
            if i > 0 {
                fmt.write_str(", ")?;
            }
            fmt::Display::fmt(learner, fmt)?;
        }
        fmt.write_str("]")
    }
}

/// Computes the minimum size of a quorum out of `voter_count` voters.
///
/// A quorum of reachable voters is needed to elect a leader and to commit to the distributed log. An empty voter set
/// still needs one vote, so a node which knows of no voters can never elect itself.
pub fn quorum_size(voter_count: usize) -> usize {
    voter_count / 2 + 1
}
