//! Per-client TCP reassembly (C2, spec §4.2).
//!
//! The RegionServer RPC wire format is length-prefixed: a 4-byte
//! big-endian count `N` followed by `N` bytes of framed message. A single
//! message can be split across TCP segments and a single segment can carry
//! more than one message back to back — though in practice the latter
//! happens rarely enough on this wire that callers feed the framer one
//! captured payload at a time and only ever get at most one completed
//! frame back per call (spec §4.2 step 1).

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;
use tracing::trace;

use crate::key::{ClientKey, Direction};
use crate::state::Expirable;

/// Frame lengths must fall in `0 < N < 2^30`; anything else is either a
/// non-RPC payload (preamble, SASL, connection header) or a mid-stream
/// fragment whose leading bytes happen to look like a huge length. Either
/// way spec §4.2 says to drop it silently.
const MAX_FRAME_LEN: u32 = 1 << 30;

/// A frame still being assembled for one client.
#[derive(Debug)]
pub struct FragmentBuffer {
    pub ts: i64,
    accumulator: BytesMut,
    total: u32,
    remains: u32,
}

impl Expirable for FragmentBuffer {
    fn ts(&self) -> i64 {
        self.ts
    }

    fn expected_memory(&self) -> usize {
        self.remains as usize + self.accumulator.len()
    }
}

/// Outcome of feeding one payload into the framer.
pub enum FramerEvent {
    /// No complete frame yet; payload was buffered or silently dropped.
    None,
    /// A complete RPC frame is ready for the decoder.
    Frame(Vec<u8>),
}

/// Owns the in-flight [`FragmentBuffer`] for every client with a
/// partially-received frame. Invariant I1 (spec §3): at most one buffer per
/// `ClientKey`.
#[derive(Debug, Default)]
pub struct Framer {
    buffers: HashMap<ClientKey, FragmentBuffer>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffers(&self) -> &HashMap<ClientKey, FragmentBuffer> {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut HashMap<ClientKey, FragmentBuffer> {
        &mut self.buffers
    }

    /// Drops any in-flight buffer for `client`. Called by the capture loop
    /// when a downstream decode fails (spec §4.2 "Failure").
    pub fn discard(&mut self, client: ClientKey) {
        self.buffers.remove(&client);
    }

    /// Feeds one captured payload through reassembly.
    ///
    /// `direction` is accepted for symmetry with the rest of the pipeline
    /// but reassembly itself is direction-agnostic: a `ClientKey` names one
    /// TCP connection's non-server endpoint regardless of which way a given
    /// segment travelled.
    pub fn ingest(
        &mut self,
        client: ClientKey,
        _direction: Direction,
        payload: &[u8],
        ts: i64,
    ) -> FramerEvent {
        if self.buffers.contains_key(&client) {
            self.continue_fragment(client, payload, ts)
        } else {
            self.start_fragment(client, payload, ts)
        }
    }

    fn start_fragment(&mut self, client: ClientKey, payload: &[u8], ts: i64) -> FramerEvent {
        if payload.len() < 4 {
            trace!(%client, "payload too short for a length prefix, dropping");
            return FramerEvent::None;
        }
        let n = BigEndian::read_u32(&payload[0..4]);
        if n == 0 || n >= MAX_FRAME_LEN {
            trace!(%client, n, "frame length outside validity window, dropping");
            return FramerEvent::None;
        }
        let available = (payload.len() - 4) as u32;
        if available >= n {
            return FramerEvent::Frame(payload[4..4 + n as usize].to_vec());
        }
        let mut accumulator = BytesMut::with_capacity(n as usize);
        accumulator.extend_from_slice(&payload[4..]);
        let remains = n - available;
        trace!(%client, total = n, remains, "starting multi-packet frame");
        self.buffers.insert(client, FragmentBuffer { ts, accumulator, total: n, remains });
        FramerEvent::None
    }

    fn continue_fragment(&mut self, client: ClientKey, payload: &[u8], ts: i64) -> FramerEvent {
        let buf = self.buffers.get_mut(&client).expect("checked by caller");
        let take = (buf.remains as usize).min(payload.len());
        buf.accumulator.extend_from_slice(&payload[..take]);
        buf.remains -= take as u32;
        buf.ts = ts;
        if buf.remains == 0 {
            let buf = self.buffers.remove(&client).expect("just matched");
            debug_assert_eq!(buf.accumulator.len(), buf.total as usize);
            FramerEvent::Frame(buf.accumulator.to_vec())
        } else {
            FramerEvent::None
        }
    }
}
