//! Command-line surface (spec §6, "CLI surface (external)").

use std::time::Duration;

use clap::Parser;

fn default_ports() -> Vec<u16> {
    vec![16020, 60020]
}

#[derive(Debug, Parser)]
#[command(
    name = "hbase-packet-inspector",
    about = "Passively reconstructs HBase RegionServer RPC workload from captured traffic",
    version
)]
pub struct Cli {
    /// RegionServer port to watch. May be repeated. Defaults to {16020, 60020}.
    #[arg(long = "port", value_name = "PORT")]
    pub ports: Vec<u16>,

    /// Stop after this many packets have been processed.
    #[arg(long)]
    pub count: Option<u64>,

    /// Stop after this many seconds have elapsed.
    #[arg(long)]
    pub duration: Option<u64>,

    /// Network interface to capture live from.
    #[arg(long, conflicts_with = "offline")]
    pub interface: Option<String>,

    /// Capture file to replay. May be repeated to chain several files.
    #[arg(long, conflicts_with = "interface")]
    pub offline: Vec<String>,

    /// Kafka sink, given as `servers/topic` (e.g. `broker1:9092/hbase-rpc`).
    #[arg(long, value_name = "SERVERS/TOPIC")]
    pub kafka: Option<String>,

    /// Sqlite database path for the tabular sink.
    #[arg(long, value_name = "PATH")]
    pub sqlite: Option<String>,

    /// Increase log verbosity. May be repeated (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn server_ports(&self) -> Vec<u16> {
        if self.ports.is_empty() {
            default_ports()
        } else {
            self.ports.clone()
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration.map(Duration::from_secs)
    }

    /// Splits `--kafka servers/topic` into its two parts. Returns `None` if
    /// the flag wasn't given or doesn't contain the separator.
    pub fn kafka_target(&self) -> Option<(String, String)> {
        let raw = self.kafka.as_ref()?;
        let (servers, topic) = raw.split_once('/')?;
        Some((servers.to_string(), topic.to_string()))
    }
}
