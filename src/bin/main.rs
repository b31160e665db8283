//! Binary entrypoint: parses the CLI, wires a packet source and a sink, and
//! drives the capture loop until EOF, a limit, or Ctrl-C.

use std::io::stdout;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use hbase_packet_inspector::capture::{self, CaptureLimits};
use hbase_packet_inspector::cli::Cli;
use hbase_packet_inspector::decoder::{DecodeError, DecodedRequest, DecodedResponse, RequestSummary, RpcDecoder};
use hbase_packet_inspector::sink::{JsonLinesSink, Sink};
use hbase_packet_inspector::source::PacketSource;

/// Stand-in for the real protobuf decoder (out of scope for this crate —
/// see the crate's module docs). Reads a tiny illustrative framing of its
/// own (`[name_len][name bytes][call_id: 4 bytes BE]`) so the binary is
/// runnable end to end against synthetic traffic without vendoring an
/// HBase protobuf schema.
struct PlaceholderDecoder;

impl RpcDecoder for PlaceholderDecoder {
    fn decode_request(&self, _header: &[u8], body: &[u8]) -> Result<DecodedRequest, DecodeError> {
        let (method, call_id) = read_method_and_call_id(body)?;
        Ok(DecodedRequest {
            method,
            call_id,
            table: None,
            region: None,
            row: None,
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
        let (_, call_id) = read_method_and_call_id(body)?;
        let method = request_lookup(call_id).map(|s| s.method).unwrap_or_else(|| "unknown".into());
        Ok(DecodedResponse { method, call_id, error: None, cells: None, actions: None, scanner: None })
    }
}

fn read_method_and_call_id(body: &[u8]) -> Result<(String, i32), DecodeError> {
    let name_len = *body.first().ok_or(DecodeError::InvalidProtobuf("empty body".into()))? as usize;
    if body.len() < 1 + name_len + 4 {
        return Err(DecodeError::InvalidProtobuf("body too short".into()));
    }
    let name = std::str::from_utf8(&body[1..1 + name_len])
        .map_err(|_| DecodeError::InvalidMethodName)?
        .to_ascii_lowercase();
    if !name.chars().all(|c| c.is_ascii_alphabetic() || c == '-') {
        return Err(DecodeError::InvalidMethodName);
    }
    let call_id_bytes = &body[1 + name_len..1 + name_len + 4];
    let call_id = i32::from_be_bytes(call_id_bytes.try_into().unwrap());
    Ok((name, call_id))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let server_ports = cli.server_ports();
    let decoder = PlaceholderDecoder;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.store(true, Ordering::Relaxed))?;
    }

    let limits = CaptureLimits { count: cli.count, duration: cli.duration() };

    let mut sink = build_sink(cli)?;

    if let Some(iface) = &cli.interface {
        let mut source = PacketSource::open_live(iface, &server_ports)?;
        let summary = capture::run(&mut source, &server_ports, &decoder, &mut *sink, limits, &cancel)?;
        tracing::info!(packets = summary.seen, received = summary.stats.received, dropped = summary.stats.dropped, "done");
    } else if !cli.offline.is_empty() {
        let mut total_seen = 0u64;
        for path in &cli.offline {
            let mut source = PacketSource::open_offline(path)?;
            let summary = capture::run(&mut source, &server_ports, &decoder, &mut *sink, limits, &cancel)?;
            total_seen += summary.seen;
        }
        tracing::info!(packets = total_seen, "done");
    } else {
        anyhow::bail!("either --interface or --offline must be given");
    }

    Ok(())
}

fn build_sink(cli: &Cli) -> anyhow::Result<Box<dyn Sink>> {
    if let Some((servers, topic)) = cli.kafka_target() {
        #[cfg(feature = "kafka-sink")]
        {
            return Ok(Box::new(hbase_packet_inspector::sink::kafka::KafkaSink::new(&servers, &topic)?));
        }
        #[cfg(not(feature = "kafka-sink"))]
        {
            let _ = (servers, topic);
            anyhow::bail!("built without the kafka-sink feature");
        }
    }
    if let Some(path) = &cli.sqlite {
        #[cfg(feature = "sqlite-sink")]
        {
            return Ok(Box::new(hbase_packet_inspector::sink::sqlite::SqliteSink::open(path)?));
        }
        #[cfg(not(feature = "sqlite-sink"))]
        {
            let _ = path;
            anyhow::bail!("built without the sqlite-sink feature");
        }
    }
    Ok(Box::new(JsonLinesSink::new(stdout())))
}
