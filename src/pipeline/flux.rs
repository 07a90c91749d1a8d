//! SolarFlux publication of freshly computed rows
//!
//! Workers hand updates to a bounded channel after their transaction commits.
//! Delivery is best effort: a full or closed channel drops the update, and a
//! publish failure never reaches the engine.

use super::ingestion::DatumWriter;
use super::types::{AggregateDatum, AuditDatum, StreamId};
use super::usage::UsageTally;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "row", rename_all = "snake_case")]
pub enum FluxUpdate {
    Aggregate(AggregateDatum),
    Audit(AuditDatum),
}

impl FluxUpdate {
    pub fn stream_id(&self) -> StreamId {
        match self {
            FluxUpdate::Aggregate(agg) => agg.stream_id,
            FluxUpdate::Audit(aud) => aud.stream_id,
        }
    }

    /// e.g. `datum/agg/h/<stream>` or `datum/aud/M/<stream>`
    pub fn topic(&self) -> String {
        match self {
            FluxUpdate::Aggregate(agg) => format!("datum/agg/{}/{}", agg.kind.key(), agg.stream_id),
            FluxUpdate::Audit(aud) => format!("datum/aud/{}/{}", aud.kind().key(), aud.stream_id),
        }
    }

    pub fn payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug)]
pub enum FluxError {
    Serialization(serde_json::Error),
    Publish(String),
}

impl From<serde_json::Error> for FluxError {
    fn from(err: serde_json::Error) -> Self {
        FluxError::Serialization(err)
    }
}

impl std::fmt::Display for FluxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FluxError::Serialization(e) => write!(f, "Serialization error: {}", e),
            FluxError::Publish(e) => write!(f, "Publish error: {}", e),
        }
    }
}

impl std::error::Error for FluxError {}

#[async_trait]
pub trait FluxPublisher: Send {
    /// Publish one update; returns the number of payload bytes sent
    async fn publish(&mut self, update: &FluxUpdate) -> Result<usize, FluxError>;

    /// Get publisher type for logging
    fn publisher_type(&self) -> &'static str;
}

/// Publisher that only logs topics and payload sizes
#[derive(Debug, Default)]
pub struct LogFluxPublisher {
    published: u64,
}

impl LogFluxPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> u64 {
        self.published
    }
}

#[async_trait]
impl FluxPublisher for LogFluxPublisher {
    async fn publish(&mut self, update: &FluxUpdate) -> Result<usize, FluxError> {
        let payload = update.payload()?;
        self.published += 1;
        log::debug!("📡 {} ({} bytes)", update.topic(), payload.len());
        Ok(payload.len())
    }

    fn publisher_type(&self) -> &'static str {
        "log"
    }
}

/// Worker-side handle to the publication channel
#[derive(Debug, Clone)]
pub struct FluxSender {
    tx: mpsc::Sender<FluxUpdate>,
}

impl FluxSender {
    /// Queue an update without waiting; returns false if it was dropped
    pub fn notify(&self, update: FluxUpdate) -> bool {
        match self.tx.try_send(update) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(update)) => {
                log::warn!("⚠️  Flux channel full, dropping {}", update.topic());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Flux channel closed, update dropped");
                false
            }
        }
    }
}

pub fn flux_channel(buffer: usize) -> (FluxSender, mpsc::Receiver<FluxUpdate>) {
    let (tx, rx) = mpsc::channel(buffer);
    (FluxSender { tx }, rx)
}

/// Drain the publication channel until every sender is gone
///
/// Published bytes are tallied per stream and, when a `usage_writer` is
/// given, flushed into the usage rows every `usage_flush_interval`.
pub async fn flux_publisher_task<P: FluxPublisher>(
    mut rx: mpsc::Receiver<FluxUpdate>,
    mut publisher: P,
    mut usage_writer: Option<DatumWriter>,
    usage_flush_interval: Duration,
) -> P {
    log::info!("📡 Starting SolarFlux publisher ({})", publisher.publisher_type());

    let mut tally = UsageTally::new();
    let mut flush_timer = interval(usage_flush_interval);
    flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_update = rx.recv() => {
                let Some(update) = maybe_update else {
                    break;
                };
                match publisher.publish(&update).await {
                    Ok(bytes) => tally.record_flux_bytes(update.stream_id(), Utc::now(), bytes as i64),
                    Err(e) => log::warn!("⚠️  Failed to publish {}: {}", update.topic(), e),
                }
            }
            _ = flush_timer.tick() => {
                flush_usage(&mut tally, usage_writer.as_mut());
            }
        }
    }

    flush_usage(&mut tally, usage_writer.as_mut());
    log::info!("📡 SolarFlux publisher stopped");
    publisher
}

fn flush_usage(tally: &mut UsageTally, writer: Option<&mut DatumWriter>) {
    let Some(writer) = writer else {
        return;
    };
    if let Err(e) = tally.flush(writer) {
        log::warn!("⚠️  Failed to flush flux usage: {}", e);
    }
}
