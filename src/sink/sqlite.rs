//! In-process tabular sink (spec §6: "An in-process tabular store into
//! which events are inserted as rows in tables `requests`, `responses`,
//! `actions`, `results`").
//!
//! `rusqlite` is the obvious choice for a local, zero-setup tabular store —
//! it's already the wider retrieval pack's pick for this exact role
//! (`ProRT-IP`'s scanner crate persists results the same way).

use rusqlite::{params, Connection};

use crate::event::{Action, Event};
use crate::key::ClientKey;
use crate::sink::Sink;

pub struct SqliteSink {
    conn: Connection,
}

impl SqliteSink {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS requests (
                call_id INTEGER, method TEXT, ts INTEGER, server TEXT, client TEXT,
                port INTEGER, size INTEGER, tbl TEXT, region TEXT, row TEXT
            );
            CREATE TABLE IF NOT EXISTS responses (
                call_id INTEGER, method TEXT, ts INTEGER, server TEXT, client TEXT,
                port INTEGER, size INTEGER, tbl TEXT, region TEXT, cells INTEGER,
                scanner INTEGER, elapsed_ms INTEGER, error TEXT
            );
            CREATE TABLE IF NOT EXISTS actions (
                call_id INTEGER, client TEXT, port INTEGER, method TEXT,
                tbl TEXT, region TEXT, row TEXT, cells INTEGER
            );
            CREATE TABLE IF NOT EXISTS results (
                call_id INTEGER, client TEXT, port INTEGER, method TEXT,
                cells INTEGER, error TEXT
            );",
        )?;
        Ok(Self { conn })
    }

    fn insert_request(&self, event: &Event) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO requests (call_id, method, ts, server, client, port, size, tbl, region, row)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.call_id,
                event.method,
                event.ts,
                event.server.to_string(),
                event.client.to_string(),
                event.port,
                event.size,
                event.table,
                event.region,
                event.row,
            ],
        )?;
        Ok(())
    }

    fn insert_response(&self, event: &Event) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO responses (call_id, method, ts, server, client, port, size, tbl, region, cells, scanner, elapsed_ms, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                event.call_id,
                event.method,
                event.ts,
                event.server.to_string(),
                event.client.to_string(),
                event.port,
                event.size,
                event.table,
                event.region,
                event.cells,
                event.scanner.map(|s| s as i64),
                event.elapsed_ms,
                event.error,
            ],
        )?;
        Ok(())
    }
}

impl Sink for SqliteSink {
    fn emit(&mut self, event: &Event) -> anyhow::Result<()> {
        if event.inbound {
            self.insert_request(event)
        } else {
            self.insert_response(event)
        }
    }

    fn emit_sub(
        &mut self,
        kind: &str,
        action: &Action,
        client: ClientKey,
        call_id: i32,
    ) -> anyhow::Result<()> {
        let table = if kind == "results" { "results" } else { "actions" };
        if table == "actions" {
            self.conn.execute(
                "INSERT INTO actions (call_id, client, port, method, tbl, region, row, cells)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    call_id,
                    client.0.addr.to_string(),
                    client.0.port,
                    action.method,
                    action.table,
                    action.region,
                    action.row,
                    action.cells,
                ],
            )?;
        } else {
            self.conn.execute(
                "INSERT INTO results (call_id, client, port, method, cells, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    call_id,
                    client.0.addr.to_string(),
                    client.0.port,
                    action.method,
                    action.cells,
                    action.error,
                ],
            )?;
        }
        Ok(())
    }
}
