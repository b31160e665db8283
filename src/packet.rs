//! Normalizes one captured frame to the shape the rest of the pipeline
//! needs (C1, spec §4.1).
//!
//! This is the only place raw bytes off the wire get parsed as Ethernet/IP/
//! TCP headers; everything past this module only ever sees a
//! [`PacketView`]. Anything that isn't an IPv4 TCP segment with a non-empty
//! payload, or that doesn't touch one of the configured RegionServer ports,
//! never becomes a `PacketView` at all.

use std::net::{IpAddr, Ipv4Addr};

use etherparse::{IpHeader, PacketHeaders, TransportHeader};

use crate::key::Endpoint;

/// One captured TCP segment, reduced to what the framer and key derivation
/// need.
#[derive(Debug, Clone)]
pub struct PacketView {
    pub src: Endpoint,
    pub dst: Endpoint,
    /// Length of the captured frame on the wire (not just the payload).
    pub length: u32,
    pub payload: Vec<u8>,
}

/// Parses `frame` (an entire captured Ethernet frame) into a [`PacketView`],
/// or returns `None` if it isn't a non-empty IPv4 TCP segment touching one
/// of `server_ports`.
pub fn parse(frame: &[u8], server_ports: &[u16]) -> Option<PacketView> {
    let headers = PacketHeaders::from_ethernet_slice(frame).ok()?;

    let ipv4 = match headers.ip? {
        IpHeader::Version4(header, _) => header,
        IpHeader::Version6(..) => return None,
    };
    let tcp = match headers.transport? {
        TransportHeader::Tcp(tcp) => tcp,
        _ => return None,
    };
    if headers.payload.is_empty() {
        return None;
    }

    let src_port = tcp.source_port;
    let dst_port = tcp.destination_port;
    if !server_ports.contains(&src_port) && !server_ports.contains(&dst_port) {
        return None;
    }

    let src = Endpoint { addr: IpAddr::V4(Ipv4Addr::from(ipv4.source)), port: src_port };
    let dst = Endpoint { addr: IpAddr::V4(Ipv4Addr::from(ipv4.destination)), port: dst_port };

    Some(PacketView { src, dst, length: frame.len() as u32, payload: headers.payload.to_vec() })
}
