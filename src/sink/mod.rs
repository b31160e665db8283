//! The sink boundary (spec §6, "Sink interface") and the `:multi`
//! unpacking policy that sits in front of every concrete sink.
//!
//! Two concrete backends are behind Cargo features, since neither belongs
//! in every build: [`sqlite`] is an in-process tabular store (the
//! `requests`/`responses`/`actions`/`results` tables from spec §6), and
//! [`kafka`] serializes events onto a named topic. The unconditional
//! default is [`JsonLinesSink`], which is what the binary uses when
//! neither `--kafka` nor a database path is given, and what the test suite
//! uses to assert on emitted events without needing either dependency.

use std::io::Write;

use tracing::error;

use crate::event::{Action, Event};
use crate::key::ClientKey;

#[cfg(feature = "sqlite-sink")]
pub mod sqlite;

#[cfg(feature = "kafka-sink")]
pub mod kafka;

/// What downstream consumes produced events (spec §6).
///
/// Sink methods are synchronous and fallible: spec §7 requires write
/// failures to surface to the caller without the core retrying. A sink
/// backed by something slow or remote (a database pool, a Kafka producer)
/// is expected to front its own asynchronous machinery behind this
/// synchronous `emit`, the way [`crate::capture`]'s own background workers
/// do — enqueue is the only thing that has to be fast.
pub trait Sink: Send {
    fn emit(&mut self, event: &Event) -> anyhow::Result<()>;

    /// Per-action row for a `:multi` batch with more than one action. The
    /// default implementation does nothing, for sinks that only care about
    /// the merged top-level event.
    fn emit_sub(
        &mut self,
        _kind: &str,
        _action: &Action,
        _client: ClientKey,
        _call_id: i32,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Applies the `:multi` unpacking rule from spec §6 and hands the result to
/// `sink`. Every other event is emitted as-is.
///
/// - `batch == 1`: the lone action's fields are merged into the top-level
///   event (only where the top-level doesn't already have a value).
/// - `batch > 1`: each action is additionally emitted through `emit_sub`
///   with `client`/`port`/`call_id` copied down from the parent event, and
///   `cells` on the parent is set to the sum of the actions' `cells` if it
///   isn't already set. The request side of the batch unpacks into the
///   `actions` table, the response side into `results` (spec §6's four
///   sink tables).
pub fn dispatch(sink: &mut dyn Sink, mut event: Event) -> anyhow::Result<()> {
    let Some(actions) = event.actions.clone() else {
        return sink.emit(&event);
    };

    match actions.len() {
        0 => sink.emit(&event),
        1 => {
            merge_action_into_event(&mut event, &actions[0]);
            sink.emit(&event)
        }
        _ => {
            if event.cells.is_none() {
                event.cells = event.summed_action_cells();
            }
            sink.emit(&event)?;
            let client = event.client_key();
            // spec §6 names four sink tables: the request side of a `:multi`
            // batch unpacks into `actions`, the response side into `results`.
            let kind = if event.inbound { "actions" } else { "results" };
            for action in &actions {
                if let Err(e) = sink.emit_sub(kind, action, client, event.call_id) {
                    error!(call_id = event.call_id, "sink emit_sub failed: {e}");
                    return Err(e);
                }
            }
            Ok(())
        }
    }
}

fn merge_action_into_event(event: &mut Event, action: &Action) {
    event.table = event.table.clone().or_else(|| action.table.clone());
    event.region = event.region.clone().or_else(|| action.region.clone());
    event.row = event.row.clone().or_else(|| action.row.clone());
    event.cells = event.cells.or(action.cells);
    event.error = event.error.clone().or_else(|| action.error.clone());
}

/// Writes one JSON object per line to any [`Write`]r — stdout by default.
/// The closest thing this crate has to a "null" sink with observable
/// output, and what the integration tests assert against.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> Sink for JsonLinesSink<W> {
    fn emit(&mut self, event: &Event) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn emit_sub(
        &mut self,
        kind: &str,
        action: &Action,
        client: ClientKey,
        call_id: i32,
    ) -> anyhow::Result<()> {
        let row = serde_json::json!({
            "kind": kind,
            "client": client.0.addr,
            "port": client.0.port,
            "call_id": call_id,
            "action": action,
        });
        serde_json::to_writer(&mut self.writer, &row)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Discards everything. Useful for benchmarking the core pipeline without
/// I/O, or for `--count`-limited dry runs.
#[derive(Debug, Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn emit(&mut self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Records every call for inspection by tests, without any serialization
/// overhead.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub events: Vec<Event>,
    pub sub_events: Vec<(String, Action, ClientKey, i32)>,
}

impl Sink for CollectingSink {
    fn emit(&mut self, event: &Event) -> anyhow::Result<()> {
        self.events.push(event.clone());
        Ok(())
    }

    fn emit_sub(
        &mut self,
        kind: &str,
        action: &Action,
        client: ClientKey,
        call_id: i32,
    ) -> anyhow::Result<()> {
        self.sub_events.push((kind.to_string(), action.clone(), client, call_id));
        Ok(())
    }
}
