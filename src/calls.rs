//! The call table (C4, spec §4.4).
//!
//! Stores the most recently seen inbound request per `(client, call_id)` so
//! that the matching outbound response can be enriched with the request's
//! `table`/`region`/`actions` and timed against the request's timestamp.
//! `call_id` is only unique per TCP connection and gets reused once a
//! connection has been alive a while, so the composite key is mandatory —
//! see spec §4.4's note and the "Composite keys" design note in §9.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::decoder::{DecodedRequest, RequestSummary};
use crate::event::Action;
use crate::key::ClientKey;
use crate::state::Expirable;

/// What the core remembers about an inbound request once it's been
/// decoded. A narrower projection of [`crate::event::Event`] — only the
/// fields a later response needs to merge back in (spec §3's definition of
/// `CallRecord`).
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub method: String,
    pub table: Option<String>,
    pub region: Option<String>,
    pub row: Option<String>,
    pub ts: i64,
    pub actions: Option<SmallVec<[Action; 4]>>,
}

impl Expirable for CallRecord {
    fn ts(&self) -> i64 {
        self.ts
    }
}

impl CallRecord {
    pub fn from_decoded(decoded: &DecodedRequest, ts: i64) -> Self {
        CallRecord {
            method: decoded.method.clone(),
            table: decoded.table.clone(),
            region: decoded.region.clone(),
            row: decoded.row.clone(),
            ts,
            actions: decoded.actions.clone(),
        }
    }

    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            method: self.method.clone(),
            table: self.table.clone(),
            region: self.region.clone(),
        }
    }
}

/// Maps `(client, call_id)` to the request awaiting its response.
///
/// Invariant I2 (spec §3): a `CallRecord` is created only on an inbound
/// frame, and removed as soon as its response is emitted (or on eviction).
#[derive(Debug, Default)]
pub struct CallTable {
    inner: HashMap<(ClientKey, i32), CallRecord>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Installs the request seen on an inbound frame, overwriting any
    /// stale entry sharing the same key (spec §4.4: "overwriting any prior
    /// entry with the same key").
    pub fn insert(&mut self, client: ClientKey, call_id: i32, record: CallRecord) {
        self.inner.insert((client, call_id), record);
    }

    /// Reads without consuming — used to build the `request_lookup`
    /// closure handed to the decoder while it decodes the response body.
    pub fn peek(&self, client: ClientKey, call_id: i32) -> Option<&CallRecord> {
        self.inner.get(&(client, call_id))
    }

    /// Removes and returns the request record for an outbound frame. Spec
    /// §4.4: "On an outbound frame the entry is read... and then removed."
    pub fn take(&mut self, client: ClientKey, call_id: i32) -> Option<CallRecord> {
        self.inner.remove(&(client, call_id))
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&CallRecord) -> bool) {
        self.inner.retain(|_, v| keep(v));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(ClientKey, i32), &CallRecord)> {
        self.inner.iter()
    }
}
