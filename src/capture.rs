//! The capture loop (C7, spec §4.7) — the thing that actually drives C1
//! through C6 and talks to a [`Sink`].
//!
//! Single-threaded and cooperative (spec §5): this loop is the sole mutator
//! of [`PipelineState`], reading one packet at a time from a [`PacketSource`]
//! and feeding it through framing, decoding, call correlation, and scanner
//! tracking before handing the resulting event to the sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::calls::CallRecord;
use crate::decoder::{self, DecodeError, DecodedRequest, DecodedResponse, RpcDecoder};
use crate::event::Event;
use crate::evictor;
use crate::framer::FramerEvent;
use crate::key::{ClientKey, Direction};
use crate::packet::{self, PacketView};
use crate::sink::{self, Sink};
use crate::source::{CaptureStats, NextPacket, PacketSource};
use crate::state::PipelineState;

/// How often the loop reports progress and runs eviction, in either
/// dimension (spec §4.7's pseudocode).
const REPORT_INTERVAL: Duration = Duration::from_millis(2000);
const REPORT_PACKET_INTERVAL: u64 = 10_000;
/// Retry delay after a capture-read timeout (spec §4.7, §7: "Sleep ~100 ms; retry").
const RETRY_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureLimits {
    pub count: Option<u64>,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureSummary {
    pub seen: u64,
    pub stats: CaptureStats,
}

/// Drives `source` to completion (EOF), to a limit in `limits`, or until
/// `cancel` is set, dispatching every produced event to `sink`.
pub fn run(
    source: &mut PacketSource,
    server_ports: &[u16],
    decoder: &dyn RpcDecoder,
    sink: &mut dyn Sink,
    limits: CaptureLimits,
    cancel: &AtomicBool,
) -> anyhow::Result<CaptureSummary> {
    let mut state = PipelineState::new();
    let max_memory = evictor::detect_max_memory();

    let mut first_ts: Option<i64> = None;
    let mut latest_ts: i64 = 0;
    let mut seen: u64 = 0;
    let mut prev_report_seen: u64 = 0;
    let mut prev_report_wall = Instant::now();
    let started = Instant::now();

    loop {
        if cancel.load(Ordering::Relaxed) {
            info!("capture cancelled");
            break;
        }

        match source.next_packet() {
            NextPacket::TimedOut => {
                thread::sleep(RETRY_SLEEP);
            }
            NextPacket::Eof => break,
            NextPacket::Frame(frame) => {
                latest_ts = frame.ts_ms;
                first_ts.get_or_insert(latest_ts);

                if let Some(view) = packet::parse(&frame.data, server_ports) {
                    process_packet(view, latest_ts, server_ports, &mut state, decoder, sink)?;
                }
                seen += 1;
            }
        }

        let wall_elapsed = prev_report_wall.elapsed();
        if wall_elapsed >= REPORT_INTERVAL || seen - prev_report_seen >= REPORT_PACKET_INTERVAL {
            log_progress(seen, first_ts, latest_ts);
            evictor::evict(&mut state, latest_ts, max_memory);
            prev_report_seen = seen;
            prev_report_wall = Instant::now();
        }

        if let Some(count) = limits.count {
            if seen >= count {
                break;
            }
        }
        if let Some(duration) = limits.duration {
            if started.elapsed() >= duration {
                break;
            }
        }
    }

    log_progress(seen, first_ts, latest_ts);
    sink.close()?;
    let stats = source.stats();
    Ok(CaptureSummary { seen, stats })
}

fn log_progress(seen: u64, first_ts: Option<i64>, latest_ts: i64) {
    let span_ms = first_ts.map(|t| latest_ts - t).unwrap_or(0);
    info!(packets = seen, span_ms, "progress");
}

/// The composition of C1–C5 for one packet (spec §4.7's `process`).
///
/// Any failure from the framer, decoder, or scanner tracker discards the
/// in-flight [`crate::framer::FragmentBuffer`] for this client and otherwise
/// leaves state untouched (spec §4.7 "Failure", §7) — nothing here is fatal
/// to the loop.
///
/// `pub(crate)` rather than private so the scenario tests below drive the
/// exact composition `run` uses, instead of reimplementing it.
pub(crate) fn process_packet(
    view: PacketView,
    ts: i64,
    server_ports: &[u16],
    state: &mut PipelineState,
    decoder: &dyn RpcDecoder,
    sink: &mut dyn Sink,
) -> anyhow::Result<()> {
    let Some((client, direction)) = ClientKey::from_endpoints(view.src, view.dst, server_ports)
    else {
        return Ok(());
    };

    let frame = match state.framer.ingest(client, direction, &view.payload, ts) {
        FramerEvent::None => return Ok(()),
        FramerEvent::Frame(f) => f,
    };
    let size = frame.len() as u32;

    let Some((header, body)) = decoder::split_frame(&frame) else {
        warn!(%client, "malformed frame: could not split header/body");
        state.framer.discard(client);
        return Ok(());
    };

    let event = if direction.is_inbound() {
        match decoder.decode_request(header, body) {
            Ok(req) => Some(build_request_event(view, client, ts, size, req, state)),
            Err(err) => {
                handle_decode_error(client, state, err);
                None
            }
        }
    } else {
        let lookup = |call_id: i32| state.calls.peek(client, call_id).map(|r| r.summary());
        match decoder.decode_response(header, body, &lookup) {
            Ok(resp) => Some(build_response_event(view, client, ts, size, resp, state)),
            Err(err) => {
                handle_decode_error(client, state, err);
                None
            }
        }
    };

    if let Some(mut event) = event {
        state.scanners.track(&mut event);
        sink::dispatch(sink, event)?;
    }
    Ok(())
}

fn handle_decode_error(client: ClientKey, state: &mut PipelineState, err: DecodeError) {
    match err {
        // spec §7: "invalid protobuf" is swallowed without logging.
        DecodeError::InvalidProtobuf(_) => {}
        other => warn!(%client, error = %other, "decode failed"),
    }
    state.framer.discard(client);
}

fn build_request_event(
    view: PacketView,
    client: ClientKey,
    ts: i64,
    size: u32,
    req: DecodedRequest,
    state: &mut PipelineState,
) -> Event {
    let (server_ep, client_ep) = (view.dst, view.src);
    let event = Event {
        method: req.method.clone(),
        call_id: req.call_id,
        inbound: true,
        ts,
        server: server_ep.addr,
        client: client_ep.addr,
        port: client_ep.port,
        size,
        table: req.table.clone(),
        region: req.region.clone(),
        row: req.row.clone(),
        cells: req.cells,
        scanner: req.scanner,
        elapsed_ms: None,
        error: None,
        actions: req.actions.clone().map(|sv| sv.into_vec()),
        extra: Default::default(),
    };
    state.calls.insert(client, req.call_id, CallRecord::from_decoded(&req, ts));
    event
}

fn build_response_event(
    view: PacketView,
    client: ClientKey,
    ts: i64,
    size: u32,
    resp: DecodedResponse,
    state: &mut PipelineState,
) -> Event {
    let (server_ep, client_ep) = (view.src, view.dst);
    let record = state.calls.take(client, resp.call_id);
    let (table, region, row, elapsed_ms) = match &record {
        // spec §7: "Unknown call_id on outbound: emit event without request
        // merge; elapsed_ms unset."
        None => (None, None, None, None),
        Some(record) => {
            (record.table.clone(), record.region.clone(), record.row.clone(), Some(ts - record.ts))
        }
    };
    let method = if record.is_none() && resp.method.is_empty() {
        "unknown".to_string()
    } else {
        resp.method.clone()
    };

    Event {
        method,
        call_id: resp.call_id,
        inbound: false,
        ts,
        server: server_ep.addr,
        client: client_ep.addr,
        port: client_ep.port,
        size,
        table,
        region,
        row,
        cells: resp.cells,
        scanner: resp.scanner,
        elapsed_ms,
        error: resp.error.clone(),
        actions: resp.actions.clone().map(|sv| sv.into_vec()),
        extra: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::RequestSummary;
    use crate::sink::CollectingSink;
    use byteorder::{BigEndian, ByteOrder};
    use etherparse::PacketBuilder;

    struct FakeDecoder;

    fn encode_frame(header: &[u8], body: &[u8]) -> Vec<u8> {
        let mut out = vec![header.len() as u8];
        out.extend_from_slice(header);
        out.push(body.len() as u8);
        out.extend_from_slice(body);
        out
    }

    impl RpcDecoder for FakeDecoder {
        fn decode_request(&self, _header: &[u8], body: &[u8]) -> Result<DecodedRequest, DecodeError> {
            Ok(DecodedRequest {
                method: "get".into(),
                call_id: i32::from(body[0]),
                table: Some("T1".into()),
                region: Some("R1".into()),
                row: Some("k".into()),
                cells: None,
                actions: None,
                scanner: None,
            })
        }

        fn decode_response(
            &self,
            _header: &[u8],
            body: &[u8],
            request_lookup: &dyn Fn(i32) -> Option<RequestSummary>,
        ) -> Result<DecodedResponse, DecodeError> {
            let call_id = i32::from(body[0]);
            // Leave the method empty on an unmatched call_id instead of
            // naming "unknown" here, so the fallback at `build_response_event`
            // below is what the test actually exercises.
            let method = request_lookup(call_id).map(|s| s.method).unwrap_or_default();
            Ok(DecodedResponse {
                method,
                call_id,
                error: None,
                cells: Some(3),
                actions: None,
                scanner: None,
            })
        }
    }

    fn tcp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(src_port, dst_port, 0, 1024);
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, payload).unwrap();
        out
    }

    fn prefixed(body: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 4];
        BigEndian::write_u32(&mut out, body.len() as u32);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn single_get_request_and_response_are_correlated() {
        let mut state = PipelineState::new();
        let decoder = FakeDecoder;
        let mut sink = CollectingSink::default();
        let ports = [16020u16];

        let request_body = encode_frame(b"h", &[7]);
        let req_frame = tcp_frame(5555, 16020, &prefixed(&request_body));
        let view = packet::parse(&req_frame, &ports).unwrap();
        process_packet(view, 1000, &ports, &mut state, &decoder, &mut sink).unwrap();

        let response_body = encode_frame(b"h", &[7]);
        let resp_frame = tcp_frame(16020, 5555, &prefixed(&response_body));
        let view = packet::parse(&resp_frame, &ports).unwrap();
        process_packet(view, 1005, &ports, &mut state, &decoder, &mut sink).unwrap();

        assert_eq!(sink.events.len(), 2);
        let response = &sink.events[1];
        assert_eq!(response.method, "get");
        assert_eq!(response.cells, Some(3));
        assert_eq!(response.table.as_deref(), Some("T1"));
        assert_eq!(response.row.as_deref(), Some("k"));
        assert_eq!(response.elapsed_ms, Some(5));
        assert!(state.calls.is_empty());
    }

    #[test]
    fn response_with_no_matching_request_has_no_elapsed() {
        let mut state = PipelineState::new();
        let decoder = FakeDecoder;
        let mut sink = CollectingSink::default();
        let ports = [16020u16];

        let response_body = encode_frame(b"h", &[42]);
        let resp_frame = tcp_frame(16020, 5555, &prefixed(&response_body));
        let view = packet::parse(&resp_frame, &ports).unwrap();
        process_packet(view, 1005, &ports, &mut state, &decoder, &mut sink).unwrap();

        assert_eq!(sink.events.len(), 1);
        assert_eq!(sink.events[0].method, "unknown");
        assert!(sink.events[0].elapsed_ms.is_none());
    }

    // The scenarios below (spec §8, "End-to-end scenarios") drive
    // `process_packet` directly rather than reimplementing its composition,
    // so they exercise the exact code `run` calls per packet — including
    // the direction→server/client/port assignment in `build_request_event`/
    // `build_response_event` and the `method = "unknown"` fallback above.
    // `FakeDecoder` above is byte-oriented and only knows `get`; these
    // scenarios need `open-scanner`/`next-rows`/`close-scanner`/`multi`, so
    // `JsonDecoder` stands in as a second fixture decoder reading the same
    // fields off a small JSON object instead of a protobuf message (the
    // real decoder is out of scope for this crate — spec §1).
    use crate::event::Action;
    use crate::key::Endpoint;
    use serde_json::{json, Value};
    use smallvec::SmallVec;

    struct JsonDecoder;

    impl RpcDecoder for JsonDecoder {
        fn decode_request(&self, _header: &[u8], body: &[u8]) -> Result<DecodedRequest, DecodeError> {
            let v: Value = serde_json::from_slice(body)
                .map_err(|e| DecodeError::InvalidProtobuf(e.to_string()))?;
            let method = v["method"].as_str().ok_or(DecodeError::InvalidMethodName)?.to_string();
            if !method.chars().all(|c| c.is_ascii_alphabetic() || c == '-') {
                return Err(DecodeError::InvalidMethodName);
            }
            Ok(DecodedRequest {
                method,
                call_id: v["call_id"].as_i64().unwrap_or_default() as i32,
                table: v["table"].as_str().map(String::from),
                region: v["region"].as_str().map(String::from),
                row: v["row"].as_str().map(String::from),
                cells: v["cells"].as_u64(),
                actions: json_actions(&v["actions"]),
                scanner: v["scanner"].as_u64(),
            })
        }

        fn decode_response(
            &self,
            _header: &[u8],
            body: &[u8],
            request_lookup: &dyn Fn(i32) -> Option<RequestSummary>,
        ) -> Result<DecodedResponse, DecodeError> {
            let v: Value = serde_json::from_slice(body)
                .map_err(|e| DecodeError::InvalidProtobuf(e.to_string()))?;
            let call_id = v["call_id"].as_i64().unwrap_or_default() as i32;
            // Same fallback discipline as `FakeDecoder` above: leave the
            // method empty on an unmatched call rather than naming
            // "unknown" here, so `build_response_event`'s fallback is what
            // gets exercised.
            let method = match v["method"].as_str() {
                Some(m) => m.to_string(),
                None => request_lookup(call_id).map(|s| s.method).unwrap_or_default(),
            };
            Ok(DecodedResponse {
                method,
                call_id,
                error: v["error"].as_str().map(String::from),
                cells: v["cells"].as_u64(),
                actions: json_actions(&v["actions"]),
                scanner: v["scanner"].as_u64(),
            })
        }
    }

    fn json_actions(v: &Value) -> Option<SmallVec<[Action; 4]>> {
        let arr = v.as_array()?;
        Some(
            arr.iter()
                .map(|a| Action {
                    method: a["method"].as_str().unwrap_or_default().to_string(),
                    table: a["table"].as_str().map(String::from),
                    region: a["region"].as_str().map(String::from),
                    row: a["row"].as_str().map(String::from),
                    cells: a["cells"].as_u64(),
                    error: a["error"].as_str().map(String::from),
                })
                .collect(),
        )
    }

    fn json_request(method: &str, call_id: i32, extra: Value) -> Value {
        let mut obj = json!({ "method": method, "call_id": call_id });
        merge(&mut obj, extra);
        obj
    }

    fn json_response(call_id: i32, extra: Value) -> Value {
        let mut obj = json!({ "call_id": call_id });
        merge(&mut obj, extra);
        obj
    }

    fn merge(base: &mut Value, extra: Value) {
        if let (Value::Object(base), Value::Object(extra)) = (base, extra) {
            base.extend(extra);
        }
    }

    /// Varint header/body framing (what `decoder::split_frame` expects)
    /// wrapped in the 4-byte big-endian length prefix the framer expects.
    fn json_frame(header: &[u8], body: &Value) -> Vec<u8> {
        let body_bytes = serde_json::to_vec(body).unwrap();
        let mut inner = Vec::new();
        write_varint(&mut inner, header.len());
        inner.extend_from_slice(header);
        write_varint(&mut inner, body_bytes.len());
        inner.extend_from_slice(&body_bytes);

        let mut framed = Vec::with_capacity(4 + inner.len());
        framed.extend_from_slice(&(inner.len() as u32).to_be_bytes());
        framed.extend_from_slice(&inner);
        framed
    }

    fn write_varint(out: &mut Vec<u8>, mut value: usize) {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    const JSON_CLIENT_PORT: u16 = 5555;
    const JSON_SERVER_PORT: u16 = 16020;

    fn json_endpoints() -> (Endpoint, Endpoint) {
        (
            Endpoint { addr: "10.0.0.1".parse().unwrap(), port: JSON_CLIENT_PORT },
            Endpoint { addr: "10.0.0.2".parse().unwrap(), port: JSON_SERVER_PORT },
        )
    }

    fn json_inbound_view(payload: Vec<u8>) -> PacketView {
        let (client, server) = json_endpoints();
        PacketView { src: client, dst: server, length: payload.len() as u32, payload }
    }

    fn json_outbound_view(payload: Vec<u8>) -> PacketView {
        let (client, server) = json_endpoints();
        PacketView { src: server, dst: client, length: payload.len() as u32, payload }
    }

    /// Scenario 2: fragmented scan open split across two packets.
    #[test]
    fn fragmented_scan_open_reassembles_across_packets() {
        let mut state = PipelineState::new();
        let decoder = JsonDecoder;
        let mut sink = CollectingSink::default();
        let ports = [JSON_SERVER_PORT];

        let whole = json_frame(b"h", &json_request("open-scanner", 1, json!({ "table": "T1" })));
        let split_at = whole.len() - 16;
        let (first, second) = whole.split_at(split_at);

        process_packet(json_inbound_view(first.to_vec()), 2000, &ports, &mut state, &decoder, &mut sink)
            .unwrap();
        assert!(sink.events.is_empty(), "no event until the frame completes");
        assert_eq!(state.framer.buffers().len(), 1);

        process_packet(json_inbound_view(second.to_vec()), 2001, &ports, &mut state, &decoder, &mut sink)
            .unwrap();
        assert_eq!(sink.events.len(), 1);
        assert_eq!(sink.events[0].method, "open-scanner");
        assert!(state.framer.buffers().is_empty());
    }

    /// Scenario 3: full open/next/close scanner lifecycle.
    #[test]
    fn scanner_lifecycle_tracks_region_and_cleans_up() {
        let mut state = PipelineState::new();
        let decoder = JsonDecoder;
        let mut sink = CollectingSink::default();
        let ports = [JSON_SERVER_PORT];

        let open_req =
            json_frame(b"h", &json_request("open-scanner", 1, json!({ "table": "T1", "region": "R1" })));
        process_packet(json_inbound_view(open_req), 3000, &ports, &mut state, &decoder, &mut sink).unwrap();

        let open_resp = json_frame(b"h", &json_response(1, json!({ "method": "open-scanner", "scanner": 42 })));
        process_packet(json_outbound_view(open_resp), 3001, &ports, &mut state, &decoder, &mut sink).unwrap();
        assert!(state.scanners.scanner(42).is_some());

        let next_req = json_frame(b"h", &json_request("next-rows", 2, json!({ "scanner": 42 })));
        process_packet(json_inbound_view(next_req), 3002, &ports, &mut state, &decoder, &mut sink).unwrap();

        let next_resp =
            json_frame(b"h", &json_response(2, json!({ "method": "next-rows", "scanner": 42, "cells": 100 })));
        process_packet(json_outbound_view(next_resp), 3003, &ports, &mut state, &decoder, &mut sink).unwrap();

        let close_req = json_frame(b"h", &json_request("close-scanner", 3, json!({ "scanner": 42 })));
        process_packet(json_inbound_view(close_req), 3004, &ports, &mut state, &decoder, &mut sink).unwrap();

        assert!(state.scanners.scanner(42).is_none());
        let next_events: Vec<_> = sink.events.iter().filter(|e| e.method == "next-rows").collect();
        assert_eq!(next_events.len(), 2);
        for ev in next_events {
            assert_eq!(ev.table.as_deref(), Some("T1"));
            assert_eq!(ev.region.as_deref(), Some("R1"));
        }
    }

    /// Scenario 4: a scanner opened but never closed is reclaimed once it
    /// has been dangling for more than 120s.
    #[test]
    fn dangling_scanner_is_evicted_after_120s() {
        let mut state = PipelineState::new();
        let decoder = JsonDecoder;
        let mut sink = CollectingSink::default();
        let ports = [JSON_SERVER_PORT];

        let open_req = json_frame(b"h", &json_request("open-scanner", 1, json!({ "table": "T1" })));
        process_packet(json_inbound_view(open_req), 4000, &ports, &mut state, &decoder, &mut sink).unwrap();
        let open_resp = json_frame(b"h", &json_response(1, json!({ "method": "open-scanner", "scanner": 99 })));
        process_packet(json_outbound_view(open_resp), 4000, &ports, &mut state, &decoder, &mut sink).unwrap();
        assert!(state.scanners.scanner(99).is_some());

        let still_alive = evictor::evict(&mut state, 4000 + evictor::MAX_AGE_MS, usize::MAX);
        assert_eq!(still_alive.aged_out, 0);
        assert!(state.scanners.scanner(99).is_some());

        let report = evictor::evict(&mut state, 4000 + evictor::MAX_AGE_MS + 1, usize::MAX);
        assert_eq!(report.aged_out, 1);
        assert!(state.scanners.scanner(99).is_none());
    }

    /// Scenario 5: a `:multi` request/response with two actions.
    #[test]
    fn multi_request_sums_cells_and_emits_sub_events() {
        let mut state = PipelineState::new();
        let decoder = JsonDecoder;
        let mut sink = CollectingSink::default();
        let ports = [JSON_SERVER_PORT];

        let req = json_frame(
            b"h",
            &json_request(
                "multi",
                1,
                json!({ "actions": [
                    { "method": "get", "table": "T1" },
                    { "method": "put", "table": "T1" },
                ] }),
            ),
        );
        process_packet(json_inbound_view(req), 5000, &ports, &mut state, &decoder, &mut sink).unwrap();

        let resp = json_frame(
            b"h",
            &json_response(
                1,
                json!({ "method": "multi", "actions": [
                    { "method": "get", "cells": 4 },
                    { "method": "put", "cells": 2 },
                ] }),
            ),
        );
        process_packet(json_outbound_view(resp), 5001, &ports, &mut state, &decoder, &mut sink).unwrap();

        assert_eq!(sink.events.len(), 2);
        let response = &sink.events[1];
        assert_eq!(response.method, "multi");
        assert_eq!(response.cells, Some(6));
        assert_eq!(response.elapsed_ms, Some(1));
        assert_eq!(sink.sub_events.len(), 2, "each action gets its own results row");
    }

    /// Scenario 6: a payload whose 4-byte prefix is an absurd length is
    /// silently dropped; no buffer is created and no event emitted.
    #[test]
    fn invalid_length_prefix_is_dropped() {
        let mut state = PipelineState::new();
        let decoder = JsonDecoder;
        let mut sink = CollectingSink::default();
        let ports = [JSON_SERVER_PORT];

        let mut payload = vec![0xFFu8; 8];
        payload[0..4].copy_from_slice(&0xFFFF_FFFFu32.to_be_bytes());

        process_packet(json_inbound_view(payload), 6000, &ports, &mut state, &decoder, &mut sink).unwrap();

        assert!(sink.events.is_empty());
        assert!(state.framer.buffers().is_empty());
    }
}
