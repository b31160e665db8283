//! The [`Event`] shape handed from the core to a [`crate::sink::Sink`].
//!
//! An `Event` is deliberately a loose, string-keyed bag rather than one
//! `enum` per RPC method: the set of interesting fields varies by method
//! (`get` carries `row`, `scan` carries `scanner`, `multi` carries
//! `actions`) and the decoder that fills most of them lives outside this
//! crate (§4.3). A struct of `Option<Value>` fields with a fixed core plus
//! an open `extra` map mirrors that variability without forcing every
//! caller through a giant enum match.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::ClientKey;

/// A single sub-action of a `:multi` request or response (one `get`/`put`/
/// `delete` inside a batch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cells: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One observed RPC frame, request or response, fully attributed.
///
/// Every event produced by the pipeline satisfies P5 (spec §8): `method`,
/// `call_id`, `inbound`, `ts`, `server`, `client`, `port`, `size` are always
/// present; everything else is filled in as the decoder, call table, and
/// scanner tracker learn more about the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub method: String,
    pub call_id: i32,
    pub inbound: bool,
    /// Capture timestamp of the packet that completed this frame, in ms.
    pub ts: i64,
    pub server: IpAddr,
    pub client: IpAddr,
    pub port: u16,
    /// Size in bytes of the decoded RPC frame (post length-prefix).
    pub size: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cells: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scanner: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Action>>,

    /// Anything the decoder produced that doesn't have a first-class field
    /// above. Kept so a sink can still surface it (e.g. in a JSON column)
    /// without the core needing to know about it.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub extra: BTreeMap<String, Value>,
}

impl Event {
    pub fn client_key(&self) -> ClientKey {
        ClientKey(crate::key::Endpoint { addr: self.client, port: self.port })
    }

    /// Sum of `cells` across `actions`, or `None` if there are no actions
    /// or none of them carry a cell count.
    pub fn summed_action_cells(&self) -> Option<u64> {
        let actions = self.actions.as_ref()?;
        let total: u64 = actions.iter().filter_map(|a| a.cells).sum();
        if actions.iter().any(|a| a.cells.is_some()) {
            Some(total)
        } else {
            None
        }
    }
}
