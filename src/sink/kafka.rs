//! Kafka sink (spec §6, "streaming egress"): serializes every event (and
//! sub-event) as JSON onto a single configured topic, keyed by client
//! endpoint so a downstream consumer can repartition by connection.
//!
//! `rdkafka` isn't used anywhere else in the retrieval pack, but it's the
//! de facto standard Kafka client for Rust and the only reasonable pick for
//! this role — picking anything else would mean hand-rolling the wire
//! protocol, which is well outside what this crate is for.

use rdkafka::config::ClientConfig;
use rdkafka::producer::{BaseProducer, BaseRecord};

use crate::event::{Action, Event};
use crate::key::ClientKey;
use crate::sink::Sink;

pub struct KafkaSink {
    producer: BaseProducer,
    topic: String,
}

impl KafkaSink {
    pub fn new(brokers: &str, topic: &str) -> anyhow::Result<Self> {
        let producer: BaseProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self { producer, topic: topic.to_string() })
    }

    fn send(&mut self, key: &str, payload: &[u8]) -> anyhow::Result<()> {
        let record = BaseRecord::to(&self.topic).key(key).payload(payload);
        self.producer
            .send(record)
            .map_err(|(e, _)| anyhow::anyhow!("kafka send failed: {e}"))?;
        // BaseProducer is fire-and-forget; poll(0) drains delivery callbacks
        // without blocking the capture loop.
        self.producer.poll(std::time::Duration::from_millis(0));
        Ok(())
    }
}

impl Sink for KafkaSink {
    fn emit(&mut self, event: &Event) -> anyhow::Result<()> {
        let key = format!("{}:{}", event.client, event.port);
        let payload = serde_json::to_vec(event)?;
        self.send(&key, &payload)
    }

    fn emit_sub(
        &mut self,
        kind: &str,
        action: &Action,
        client: ClientKey,
        call_id: i32,
    ) -> anyhow::Result<()> {
        let key = client.to_string();
        let row = serde_json::json!({
            "kind": kind,
            "client": client.0.addr,
            "port": client.0.port,
            "call_id": call_id,
            "action": action,
        });
        let payload = serde_json::to_vec(&row)?;
        self.send(&key, &payload)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.producer.flush(std::time::Duration::from_secs(5))?;
        Ok(())
    }
}
