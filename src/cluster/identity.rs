use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::Error;

/// Network address a cluster member is reachable at. Two members are the same node if and only if their
/// identities are equal.
///
/// Renders as `/ip4/<ip>/tcp/<port>` (or `/ip6/...`); parses either that form or a plain `ip:port`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeIdentity(SocketAddr);

impl NodeIdentity {
    pub fn new(socket_addr: SocketAddr) -> Self {
        NodeIdentity(socket_addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Identifies the replica of `partition` hosted by this node.
    pub fn source(&self, partition: &str) -> String {
        format!("{}/p/{}", self, partition)
    }
}

impl From<SocketAddr> for NodeIdentity {
    fn from(socket_addr: SocketAddr) -> Self {
        NodeIdentity(socket_addr)
    }
}

impl Display for NodeIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0.ip() {
            IpAddr::V4(ip) => write!(f, "/ip4/{}/tcp/{}", ip, self.0.port()),
            IpAddr::V6(ip) => write!(f, "/ip6/{}/tcp/{}", ip, self.0.port()),
        }
    }
}

impl FromStr for NodeIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Codec(format!("invalid node identity {:?}", s));

        if !s.starts_with('/') {
            return s.parse::<SocketAddr>().map(NodeIdentity).map_err(|_| invalid());
        }

        match s.split('/').collect::<Vec<_>>().as_slice() {
            ["", family, ip, "tcp", port] => {
                let ip = ip.parse::<IpAddr>().map_err(|_| invalid())?;
                let port = port.parse::<u16>().map_err(|_| invalid())?;
                match (*family, ip) {
                    ("ip4", IpAddr::V4(_)) | ("ip6", IpAddr::V6(_)) => {
                        Ok(NodeIdentity(SocketAddr::new(ip, port)))
                    }
                    _ => Err(invalid()),
                }
            }
            _ => Err(invalid()),
        }
    }
}
