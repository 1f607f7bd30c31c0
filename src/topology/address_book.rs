use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use log::{info, warn};
use rand::seq::IteratorRandom;
use rand::Rng;

use crate::cluster::identity::NodeIdentity;

#[derive(Debug, Clone, Copy)]
struct Liveness {
    reachable: bool,
    changed_at: Instant,
}

/// Every node this node has heard of, along with whether it answered last time we tried.
///
/// Shared by all partitions of a node. It never contains the local node itself.
pub struct AddressBook {
    whoami: NodeIdentity,
    nodes: RwLock<BTreeMap<NodeIdentity, Liveness>>,
}

impl AddressBook {
    pub fn new(whoami: NodeIdentity) -> Self {
        AddressBook {
            whoami,
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Records `node`, returning whether it was unknown.
    pub fn learn(&self, node: NodeIdentity) -> bool {
        if node == self.whoami {
            return false;
        }

        let mut nodes = self.write();
        if nodes.contains_key(&node) {
            return false;
        }

        info!("{} learned about {}", self.whoami, node);
        nodes.insert(
            node,
            Liveness {
                reachable: true,
                changed_at: Instant::now(),
            },
        );
        true
    }

    pub fn learn_all<I: IntoIterator<Item = NodeIdentity>>(&self, nodes: I) {
        for node in nodes {
            let _ = self.learn(node);
        }
    }

    pub fn known(&self) -> Vec<NodeIdentity> {
        self.read().keys().cloned().collect()
    }

    pub fn mark_reachable(&self, node: NodeIdentity) {
        self.set_reachable(node, true);
    }

    pub fn mark_unreachable(&self, node: NodeIdentity) {
        self.set_reachable(node, false);
    }

    /// Unknown nodes are considered reachable until proven otherwise.
    pub fn is_reachable(&self, node: &NodeIdentity) -> bool {
        self.read()
            .get(node)
            .map(|liveness| liveness.reachable)
            .unwrap_or(true)
    }

    /// Whether `node` has been unreachable for at least `grace`.
    pub fn is_suspect(&self, node: &NodeIdentity, grace: Duration) -> bool {
        self.read()
            .get(node)
            .map(|liveness| !liveness.reachable && liveness.changed_at.elapsed() >= grace)
            .unwrap_or(false)
    }

    /// A known node picked at random, reachable or not.
    pub fn random_peer<R: Rng>(&self, rng: &mut R) -> Option<NodeIdentity> {
        self.read().keys().choose(rng).cloned()
    }

    fn set_reachable(&self, node: NodeIdentity, reachable: bool) {
        if node == self.whoami {
            return;
        }

        let mut nodes = self.write();
        let liveness = nodes.entry(node).or_insert(Liveness {
            reachable: !reachable,
            changed_at: Instant::now(),
        });

        if liveness.reachable != reachable {
            if reachable {
                info!("{} is reachable", node);
            } else {
                warn!("{} is unreachable", node);
            }
            liveness.reachable = reachable;
            liveness.changed_at = Instant::now();
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<NodeIdentity, Liveness>> {
        match self.nodes.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<NodeIdentity, Liveness>> {
        match self.nodes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
