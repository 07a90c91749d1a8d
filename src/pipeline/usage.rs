//! Query and publication usage counting
//!
//! A `UsageTally` is owned by whoever serves queries or publishes updates; it
//! is never shared between workers. `flush` merges the counters into the Hour
//! usage rows and marks the affected days' audit stale.

use super::error::StaleError;
use super::ingestion::DatumWriter;
use super::types::{AggregationKind, StreamId, UsageCounts};
use super::windows::bucket_start;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct UsageTally {
    counts: HashMap<(StreamId, DateTime<Utc>), UsageCounts>,
}

impl UsageTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `datum_count` datum returned by a query for `stream_id`
    pub fn record_query(&mut self, stream_id: StreamId, at: DateTime<Utc>, datum_count: i64) {
        self.entry(stream_id, at).query_count += datum_count;
    }

    pub fn record_flux_bytes(&mut self, stream_id: StreamId, at: DateTime<Utc>, bytes: i64) {
        self.entry(stream_id, at).flux_byte_count += bytes;
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Counters pending for the UTC hour containing `at`
    pub fn pending(&self, stream_id: StreamId, at: DateTime<Utc>) -> UsageCounts {
        self.counts
            .get(&(stream_id, utc_hour(at)))
            .copied()
            .unwrap_or_default()
    }

    /// Write pending counters; they are kept if the write fails
    pub fn flush(&mut self, writer: &mut DatumWriter) -> Result<usize, StaleError> {
        if self.counts.is_empty() {
            return Ok(0);
        }
        let mut entries: Vec<(StreamId, DateTime<Utc>, UsageCounts)> = self
            .counts
            .iter()
            .map(|((stream_id, hour), usage)| (*stream_id, *hour, *usage))
            .collect();
        entries.sort_by_key(|(stream_id, hour, _)| (*hour, *stream_id));

        let applied = writer.apply_usage(&entries)?;
        self.counts.clear();
        log::debug!("Flushed usage for {} stream-hours", applied);
        Ok(applied)
    }

    fn entry(&mut self, stream_id: StreamId, at: DateTime<Utc>) -> &mut UsageCounts {
        self.counts.entry((stream_id, utc_hour(at))).or_default()
    }
}

fn utc_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    bucket_start(at, AggregationKind::Hour, Tz::UTC)
}
