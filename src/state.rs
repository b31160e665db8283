//! The owned bundle of per-loop state, and the common trait the evictor
//! (C6) walks all four tables through.
//!
//! Design note (spec §9, "Persistent-map state threading" /
//! "Global state"): the source this crate is modeled on threads an
//! immutable state map through each step and returns an updated copy. In
//! Rust that contract collapses to a single struct of owned `HashMap`s
//! mutated through `&mut self` — there's no persistent-map value to return,
//! just ordinary interior mutation behind one owner. [`PipelineState`] is
//! that owner; the capture loop (C7) holds exactly one instance for the
//! lifetime of a capture.

use crate::calls::CallTable;
use crate::framer::Framer;
use crate::scanner::ScannerTracker;

/// Anything the evictor can age out or weigh for the memory cap (spec §4.6).
/// `FragmentBuffer` is the only state category with non-zero
/// `expected_memory`; call/scanner/pending-scan records report zero, since
/// §4.6 defines `expected_memory` only in terms of buffered bytes.
pub trait Expirable {
    fn ts(&self) -> i64;
    fn expected_memory(&self) -> usize {
        0
    }
}

/// The complete in-memory state of one capture: fragment buffers, call
/// records, scanner records, and pending scans. Four distinct containers
/// keyed by their natural tuple, per spec §9's "Composite keys" note,
/// rather than one map keyed by a tagged union.
#[derive(Debug, Default)]
pub struct PipelineState {
    pub framer: Framer,
    pub calls: CallTable,
    pub scanners: ScannerTracker,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }
}
