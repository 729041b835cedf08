//! Outbound boundary: finished records leave the agent through a
//! [`RecordSink`]. The network queue client itself lives in the embedding
//! application, which receives records through a [`ChannelSink`].

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::message::{Message, Payload, Source};

/// A record handed to the outbound queue: payload, routing key and the
/// handler that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundRecord {
    pub payload: BTreeMap<String, serde_json::Value>,
    pub routing_key: String,
    pub source: String,
}

impl OutboundRecord {
    /// Convert a routable message. Returns `None` for any other kind.
    ///
    /// Per-socket payloads are flattened to `<key>_<socket>` fields.
    pub fn from_message(msg: &Message) -> Option<Self> {
        let routing_key = msg.routing_key()?.to_string();

        let mut payload = BTreeMap::new();
        match msg.payload() {
            Payload::Record(record) => {
                for (key, value) in record.iter() {
                    payload.insert(key.to_string(), value.into());
                }
            }
            Payload::PerSocket(sockets) => {
                for (socket, record) in sockets.iter().enumerate() {
                    for (key, value) in record.iter() {
                        payload.insert(format!("{key}_{socket}"), value.into());
                    }
                }
            }
        }

        let source = match msg.source() {
            Source::Monitor(kind) => kind.as_str().to_string(),
            Source::Handler(name) => name.clone(),
        };

        Some(Self {
            payload,
            routing_key,
            source,
        })
    }
}

/// Receives outbound records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Hand over one record.
    async fn publish(&self, record: OutboundRecord) -> Result<()>;
}

/// Forwards records over a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<OutboundRecord>,
}

impl ChannelSink {
    /// Create a sink and the receiver the queue client drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    async fn publish(&self, record: OutboundRecord) -> Result<()> {
        self.tx
            .send(record)
            .await
            .map_err(|_| anyhow!("outbound channel closed"))
    }
}

/// Logs every record as JSON. Used when no queue client is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl RecordSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, record: OutboundRecord) -> Result<()> {
        let json = serde_json::to_string(&record.payload).context("encoding record")?;
        info!(
            routing_key = %record.routing_key,
            source = %record.source,
            payload = %json,
            "outbound record"
        );
        Ok(())
    }
}
