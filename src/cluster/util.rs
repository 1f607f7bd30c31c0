use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use log::warn;

/// Keeps the private IPv4 addresses other hosts of the local network can reach us on.
pub fn local_network_addresses<I: IntoIterator<Item = IpAddr>>(ip_addresses: I) -> Vec<IpAddr> {
    ip_addresses
        .into_iter()
        .filter(|ip_address| match ip_address {
            IpAddr::V4(ip_address) => {
                ip_address.is_private() && !ip_address.is_loopback() && !ip_address.is_unspecified()
            }
            IpAddr::V6(_) => false,
        })
        .collect()
}

/// Addresses of every interface of this host.
pub fn interface_addresses() -> Vec<IpAddr> {
    match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces.into_iter().map(|interface| interface.ip()).collect(),
        Err(err) => {
            warn!("failed to list network interfaces: {}", err);
            vec![]
        }
    }
}

/// The address other nodes can reach a listener `bound` to.
///
/// A listener bound to `0.0.0.0` accepts on every interface, so the node advertises its first local network address,
/// or loopback when there is none.
pub fn advertised_address(bound: SocketAddr) -> SocketAddr {
    if !bound.ip().is_unspecified() {
        return bound;
    }

    let ip = local_network_addresses(interface_addresses())
        .into_iter()
        .next()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    SocketAddr::new(ip, bound.port())
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

    use crate::cluster::util::{advertised_address, interface_addresses, local_network_addresses};

    #[test]
    fn list_interface_addresses() {
        // loopback at least
        assert!(!interface_addresses().is_empty());
    }

    #[test]
    fn keep_private_ipv4_addresses() {
        let ip_addresses = local_network_addresses(vec![
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::new(10, 3, 0, 6)),
            IpAddr::V4(Ipv4Addr::BROADCAST),
            IpAddr::V4(Ipv4Addr::new(86, 66, 43, 4)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 4)),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ]);

        assert_eq!(
            ip_addresses,
            vec![
                IpAddr::V4(Ipv4Addr::new(10, 3, 0, 6)),
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 4)),
            ]
        );
    }

    #[test]
    fn advertise_specific_address_as_is() {
        let bound = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4100);
        assert_eq!(advertised_address(bound), bound);

        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 4100);
        let advertised = advertised_address(unspecified);
        assert!(!advertised.ip().is_unspecified());
        assert_eq!(advertised.port(), 4100);
    }
}
