//! The packet source boundary (spec §6, "Packet source interface").
//!
//! Live capture and offline capture-file replay are both `pcap` handles
//! under the hood; this module just gives them one shape so [`crate::capture`]
//! never has to know which it's driving. `pcap` is the same crate the
//! nearest comparable tool in the retrieval pack (`ddshark`) uses for this
//! exact role.

use pcap::{Active, Capture, Offline};
use thiserror::Error;

/// One captured frame plus its capture-time timestamp, in milliseconds.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub data: Vec<u8>,
    pub ts_ms: i64,
}

/// Running capture statistics (spec §6: `stats(handle) -> {received, dropped}`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    pub received: u32,
    pub dropped: u32,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("pcap error: {0}")]
    Pcap(#[from] pcap::Error),
}

enum Handle {
    Live(Capture<Active>),
    Offline(Capture<Offline>),
}

/// A packet source: a live NIC or an offline capture file, fronted by one
/// polling interface.
pub struct PacketSource {
    handle: Handle,
}

/// Outcome of one `next_packet` call (spec §6).
pub enum NextPacket {
    Frame(CapturedFrame),
    /// No packet arrived within the read timeout; the caller retries.
    TimedOut,
    /// The capture file is exhausted, or the live handle was closed.
    Eof,
}

impl PacketSource {
    /// Opens `iface` for live capture with a BPF filter restricting to
    /// `server_ports` (spec §6: "BPF filter of `port P1 or port P2 …`,
    /// snaplen 65536, non-promiscuous, 1000 ms timeout").
    pub fn open_live(iface: &str, server_ports: &[u16]) -> Result<Self, SourceError> {
        let mut capture = Capture::from_device(iface)?
            .snaplen(65536)
            .promisc(false)
            .timeout(1000)
            .open()?;
        capture.filter(&port_filter(server_ports), true)?;
        Ok(Self { handle: Handle::Live(capture) })
    }

    /// Opens a previously captured file for offline replay.
    pub fn open_offline(path: &str) -> Result<Self, SourceError> {
        let capture = Capture::from_file(path)?;
        Ok(Self { handle: Handle::Offline(capture) })
    }

    /// Reads the next frame, or reports a timeout/EOF (spec §6,
    /// §4.7 "Failure": "The capture source may raise a 'no packet yet'
    /// timeout").
    pub fn next_packet(&mut self) -> NextPacket {
        let result = match &mut self.handle {
            Handle::Live(cap) => cap.next_packet(),
            Handle::Offline(cap) => cap.next_packet(),
        };
        match result {
            Ok(packet) => {
                let ts_ms = packet.header.ts.tv_sec * 1000 + packet.header.ts.tv_usec / 1000;
                NextPacket::Frame(CapturedFrame { data: packet.data.to_vec(), ts_ms })
            }
            Err(pcap::Error::TimeoutExpired) => NextPacket::TimedOut,
            Err(pcap::Error::NoMorePackets) => NextPacket::Eof,
            Err(_) => NextPacket::Eof,
        }
    }

    pub fn stats(&mut self) -> CaptureStats {
        let stats = match &mut self.handle {
            Handle::Live(cap) => cap.stats().ok(),
            Handle::Offline(cap) => cap.stats().ok(),
        };
        match stats {
            Some(s) => CaptureStats { received: s.received, dropped: s.dropped },
            None => CaptureStats::default(),
        }
    }

    /// No explicit `close` is needed: both `Capture` variants release their
    /// handle on drop. Kept as a named method so call sites read the way
    /// spec §6's `close(handle)` does and so a future non-drop-based
    /// backend has somewhere to hook in.
    pub fn close(self) {
        drop(self);
    }
}

fn port_filter(server_ports: &[u16]) -> String {
    server_ports
        .iter()
        .map(|p| format!("port {p}"))
        .collect::<Vec<_>>()
        .join(" or ")
}
