//! The RPC decoder boundary (C3, spec §4.3).
//!
//! Decoding the actual HBase protobuf request/response bodies is
//! deliberately out of scope for this crate (spec §1): it is a pure
//! function of `(direction, header, body, request_lookup)` with no state of
//! its own, and the core only needs the shape of what comes back. This
//! module defines that shape and the trait a concrete decoder implements;
//! [`crate::calls::CallRecord`] is what the core remembers from a decoded
//! request so the matching response can be enriched and timed.

use smallvec::SmallVec;
use thiserror::Error;

use crate::event::Action;

/// Four HBase RPC methods are distinguished from the generic "HBase scan
/// protocol" bucket because the scanner tracker (C5) keys its state
/// machine on them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSubMethod {
    OpenScanner,
    NextRows,
    CloseScanner,
    SmallScan,
}

impl ScanSubMethod {
    /// Classifies a `scan` RPC into one of the four sub-methods per spec
    /// §4.3: *open* has no scanner id on the request, *close* has the
    /// `close_scanner` flag set, both set means *small-scan*, neither means
    /// *next-rows*. Decoder implementations call this once they've pulled
    /// `scanner_id`/`close_scanner` out of the protobuf body.
    pub fn classify(has_scanner_id: bool, close_scanner: bool) -> ScanSubMethod {
        match (has_scanner_id, close_scanner) {
            (false, false) => ScanSubMethod::OpenScanner,
            (false, true) => ScanSubMethod::SmallScan,
            (true, true) => ScanSubMethod::CloseScanner,
            (true, false) => ScanSubMethod::NextRows,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanSubMethod::OpenScanner => "open-scanner",
            ScanSubMethod::NextRows => "next-rows",
            ScanSubMethod::CloseScanner => "close-scanner",
            ScanSubMethod::SmallScan => "small-scan",
        }
    }
}

/// Errors a decoder may raise. The two non-generic variants exist because
/// §7 logs them differently: `InvalidProtobuf` is swallowed silently,
/// everything else is logged at WARN with its message.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid method name")]
    InvalidMethodName,
    #[error("invalid protobuf: {0}")]
    InvalidProtobuf(String),
    #[error("{0}")]
    Other(String),
}

/// Fields recovered from an inbound (client→server) frame.
///
/// `method` is already the final, lowercase identifier the rest of the
/// pipeline uses — for `scan` requests that means one of
/// `{open-scanner, next-rows, close-scanner, small-scan}`, not the literal
/// string `"scan"` (spec §4.3, §4.5).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRequest {
    pub method: String,
    pub call_id: i32,
    pub table: Option<String>,
    pub region: Option<String>,
    pub row: Option<String>,
    pub cells: Option<u64>,
    pub actions: Option<SmallVec<[Action; 4]>>,
    pub scanner: Option<u64>,
}

/// Fields recovered from an outbound (server→client) frame. The decoder is
/// handed a `request_lookup` closure because the response schema depends
/// on which method the matching request named (spec §4.3).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedResponse {
    pub method: String,
    pub call_id: i32,
    pub error: Option<String>,
    pub cells: Option<u64>,
    pub actions: Option<SmallVec<[Action; 4]>>,
    /// The scanner id minted by an `open-scanner` response, if any.
    pub scanner: Option<u64>,
}

/// A previously decoded inbound request, as handed back to the decoder
/// through `request_lookup` while decoding the matching response.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSummary {
    pub method: String,
    pub table: Option<String>,
    pub region: Option<String>,
}

/// Splits a reassembled frame into `(header_bytes, body_bytes)` ahead of
/// handing it to an [`RpcDecoder`].
///
/// The wire format delimits each submessage with a protobuf varint length
/// prefix (the same convention Hadoop RPC uses for its header/param pair);
/// reading those two varints is still just frame shape, not protobuf field
/// decoding, so it stays on this side of the decode boundary (spec §4.3) —
/// the decoder never has to find its own header/body split, only interpret
/// the bytes once handed them.
pub fn split_frame(frame: &[u8]) -> Option<(&[u8], &[u8])> {
    let (header_len, rest) = read_varint(frame)?;
    if rest.len() < header_len {
        return None;
    }
    let (header, rest) = rest.split_at(header_len);
    let (body_len, rest) = read_varint(rest)?;
    if rest.len() < body_len {
        return None;
    }
    let (body, _) = rest.split_at(body_len);
    Some((header, body))
}

fn read_varint(buf: &[u8]) -> Option<(usize, &[u8])> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((value as usize, &buf[i + 1..]));
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
    None
}

/// External collaborator that turns header/body bytes into the fields the
/// core needs. See spec §4.3 for the exact contract.
pub trait RpcDecoder: Send + Sync {
    fn decode_request(
        &self,
        header: &[u8],
        body: &[u8],
    ) -> Result<DecodedRequest, DecodeError>;

    fn decode_response(
        &self,
        header: &[u8],
        body: &[u8],
        request_lookup: &dyn Fn(i32) -> Option<RequestSummary>,
    ) -> Result<DecodedResponse, DecodeError>;
}
