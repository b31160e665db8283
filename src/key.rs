//! Addressing primitives shared by every stateful table in the crate.
//!
//! The observer never participates in the conversations it watches; all it
//! has is a capture-order stream of packets between a RegionServer and some
//! number of clients. [`ClientKey`] is how the rest of the crate refers to
//! "the other end of this TCP connection" without caring which physical
//! socket a given packet travelled on.

use std::fmt;
use std::net::IpAddr;

/// One endpoint of a captured TCP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Identity of the non-server correspondent of a packet.
///
/// Two packets belong to the same client iff their non-server endpoints are
/// equal, regardless of which direction either packet travelled. This is the
/// key every per-connection table (fragment buffers, call records, pending
/// scans) is indexed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientKey(pub Endpoint);

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl ClientKey {
    /// Derives the client identity from a packet's src/dst given the set of
    /// ports that identify a RegionServer. Returns `None` if neither
    /// endpoint is a RegionServer port (the packet shouldn't have reached
    /// this far — see [`crate::packet::PacketView`]) or if both are, which
    /// can happen for intra-cluster loopback traffic between two
    /// RegionServers; such packets carry no usable client identity so they
    /// are dropped.
    pub fn from_endpoints(
        src: Endpoint,
        dst: Endpoint,
        server_ports: &[u16],
    ) -> Option<(ClientKey, Direction)> {
        let src_is_server = server_ports.contains(&src.port);
        let dst_is_server = server_ports.contains(&dst.port);
        match (src_is_server, dst_is_server) {
            (false, true) => Some((ClientKey(src), Direction::Inbound)),
            (true, false) => Some((ClientKey(dst), Direction::Outbound)),
            _ => None,
        }
    }
}

/// Direction of an RPC frame relative to the RegionServer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server: a request.
    Inbound,
    /// Server to client: a response.
    Outbound,
}

impl Direction {
    pub fn is_inbound(self) -> bool {
        matches!(self, Direction::Inbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(ip: &str, port: u16) -> Endpoint {
        Endpoint { addr: ip.parse().unwrap(), port }
    }

    #[test]
    fn inbound_when_dst_is_server() {
        let client = ep("10.0.0.1", 5555);
        let server = ep("10.0.0.2", 16020);
        let (key, dir) = ClientKey::from_endpoints(client, server, &[16020, 60020]).unwrap();
        assert_eq!(key, ClientKey(client));
        assert_eq!(dir, Direction::Inbound);
    }

    #[test]
    fn outbound_when_src_is_server() {
        let client = ep("10.0.0.1", 5555);
        let server = ep("10.0.0.2", 16020);
        let (key, dir) = ClientKey::from_endpoints(server, client, &[16020, 60020]).unwrap();
        assert_eq!(key, ClientKey(client));
        assert_eq!(dir, Direction::Outbound);
    }

    #[test]
    fn neither_endpoint_a_server_port_is_rejected() {
        let a = ep("10.0.0.1", 5555);
        let b = ep("10.0.0.3", 5556);
        assert!(ClientKey::from_endpoints(a, b, &[16020, 60020]).is_none());
    }

    #[test]
    fn both_endpoints_server_ports_is_rejected() {
        let a = ep("10.0.0.2", 16020);
        let b = ep("10.0.0.3", 60020);
        assert!(ClientKey::from_endpoints(a, b, &[16020, 60020]).is_none());
    }
}
