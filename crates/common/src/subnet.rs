//! Local subnet guard
//!
//! Keeps a mesh tunnel from claiming routes that already belong to a local
//! physical interface. Without it a peer advertising the LAN this node sits on
//! would black-hole local traffic into the tunnel.

use crate::types::Host;
use crate::Result;
use ipnetwork::IpNetwork;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use tracing::debug;

/// Enumerate the subnets of every local interface address.
///
/// Interfaces named in `exclude` are skipped; the agent passes its own tunnel
/// interfaces here so a running mesh never filters its own routes.
pub fn local_subnets(exclude: &[String]) -> Result<Vec<IpNetwork>> {
    let mut subnets = Vec::new();

    for ifaddr in nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)? {
        if exclude.iter().any(|name| *name == ifaddr.interface_name) {
            continue;
        }
        let (Some(address), Some(netmask)) = (ifaddr.address, ifaddr.netmask) else {
            continue;
        };
        let (Some(ip), Some(mask)) = (sockaddr_ip(&address), sockaddr_ip(&netmask)) else {
            continue;
        };
        match IpNetwork::with_netmask(ip, mask) {
            Ok(net) => subnets.push(net),
            Err(e) => debug!("Skipping {} on {}: {}", ip, ifaddr.interface_name, e),
        }
    }

    Ok(subnets)
}

fn sockaddr_ip(addr: &nix::sys::socket::SockaddrStorage) -> Option<IpAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Some(IpAddr::V4(*SocketAddrV4::from(*v4).ip()));
    }
    if let Some(v6) = addr.as_sockaddr_in6() {
        return Some(IpAddr::V6(*SocketAddrV6::from(*v6).ip()));
    }
    None
}

/// True when the network address of `cidr` lies inside any of `subnets`.
///
/// Malformed CIDRs never match.
pub fn collides(cidr: &str, subnets: &[IpNetwork]) -> bool {
    let Ok(net) = cidr.trim().parse::<IpNetwork>() else {
        return false;
    };
    let network = net.network();
    subnets.iter().any(|s| s.contains(network))
}

/// Drop every allowed-IP of `peer` that collides with a local subnet.
///
/// Returns the removed entries.
pub fn filter_allowed_ips(peer: &mut Host, subnets: &[IpNetwork]) -> Vec<String> {
    let mut removed = Vec::new();
    peer.current.allowed_ips.retain(|cidr| {
        if collides(cidr, subnets) {
            removed.push(cidr.clone());
            false
        } else {
            true
        }
    });

    if !removed.is_empty() {
        debug!("Filtered local routes {:?} from peer {}", removed, peer.name);
    }
    removed
}
