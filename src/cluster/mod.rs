pub mod identity;
pub mod transport;
pub mod util;

use std::sync::Arc;

use crate::cluster::identity::NodeIdentity;
use crate::cluster::transport::Transport;
use crate::topology::address_book::AddressBook;

/// What a partition needs from the node hosting it: who we are, whom we know and how to reach them.
pub(crate) struct ClusterContext {
    pub whoami: NodeIdentity,
    pub address_book: Arc<AddressBook>,
    pub transport: Arc<Transport>,
}

impl ClusterContext {
    pub fn new(whoami: NodeIdentity, address_book: Arc<AddressBook>, transport: Arc<Transport>) -> Self {
        ClusterContext {
            whoami,
            address_book,
            transport,
        }
    }
}
