//! Datum ingestion - stream directory and mark-dirty trigger
//!
//! Every raw change (store, overwrite, delete, reset) ensures exactly one Hour
//! stale marker for the touched bucket inside the same transaction as the
//! change, and keeps the Hour usage row current. Everything downstream of that
//! marker is driven by the stale processing engine.

use super::config::ConfigError;
use super::db::{add_usage, insert_marker, load_stream_meta, to_millis};
use super::error::StaleError;
use super::types::{
    AggregationKind, AuditKind, MarkerKey, ObjectKind, PropertyNames, StaleKind, StreamId,
    StreamMeta, UsageCounts,
};
use super::windows::bucket_start;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One raw reading keyed by property name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatumSamples {
    pub timestamp: DateTime<Utc>,
    pub instantaneous: BTreeMap<String, f64>,
    pub accumulating: BTreeMap<String, f64>,
    pub status: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

impl DatumSamples {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }

    pub fn with_instantaneous(mut self, name: &str, value: f64) -> Self {
        self.instantaneous.insert(name.to_string(), value);
        self
    }

    pub fn with_accumulating(mut self, name: &str, value: f64) -> Self {
        self.accumulating.insert(name.to_string(), value);
        self
    }

    pub fn with_status(mut self, name: &str, value: &str) -> Self {
        self.status.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    fn property_count(&self) -> i64 {
        (self.instantaneous.len() + self.accumulating.len() + self.status.len()) as i64
    }
}

/// Writer for raw datum on its own connection
pub struct DatumWriter {
    conn: Connection,
}

impl DatumWriter {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Stream for (object, source), created on first use
    ///
    /// An existing stream keeps its original time zone.
    pub fn resolve_or_create_stream(
        &mut self,
        object_kind: ObjectKind,
        object_id: i64,
        source_id: &str,
        time_zone: &str,
    ) -> Result<StreamMeta, StaleError> {
        let tz: Tz = time_zone
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("unknown time zone '{}'", time_zone)))?;

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT stream_id FROM streams WHERE object_kind = ?1 AND object_id = ?2 AND source_id = ?3",
                params![object_kind.key(), object_id, source_id],
                |row| row.get(0),
            )
            .optional()?;

        let stream_id = match existing {
            Some(raw) => Uuid::parse_str(&raw)
                .map_err(|e| StaleError::DataIntegrity(format!("bad stream id '{}': {}", raw, e)))?,
            None => {
                let stream_id = Uuid::new_v4();
                tx.execute(
                    "INSERT INTO streams (stream_id, object_kind, object_id, source_id, time_zone, created)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        stream_id.to_string(),
                        object_kind.key(),
                        object_id,
                        source_id,
                        tz.name(),
                        to_millis(Utc::now()),
                    ],
                )?;
                log::info!(
                    "🆕 Created stream {} for {:?} {} / {} ({})",
                    stream_id,
                    object_kind,
                    object_id,
                    source_id,
                    tz.name()
                );
                stream_id
            }
        };

        let meta = load_stream_meta(&tx, stream_id)?.ok_or_else(|| {
            StaleError::DataIntegrity(format!("stream {} vanished during creation", stream_id))
        })?;
        tx.commit()?;
        Ok(meta)
    }

    pub fn stream_meta(&self, stream_id: StreamId) -> Result<Option<StreamMeta>, StaleError> {
        load_stream_meta(&self.conn, stream_id)
    }

    /// Store (or overwrite) one reading and mark its hour stale
    pub fn store_datum(&mut self, stream_id: StreamId, samples: &DatumSamples) -> Result<(), StaleError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let meta = load_stream_meta(&tx, stream_id)?
            .ok_or_else(|| StaleError::DataIntegrity(format!("unknown stream {}", stream_id)))?;

        let mut names = meta.names.clone();
        extend_names(&mut names.instantaneous, samples.instantaneous.keys());
        extend_names(&mut names.accumulating, samples.accumulating.keys());
        extend_names(&mut names.status, samples.status.keys());
        if names != meta.names {
            save_names(&tx, stream_id, &names)?;
        }

        let instantaneous: Vec<Option<f64>> = names
            .instantaneous
            .iter()
            .map(|n| samples.instantaneous.get(n).copied())
            .collect();
        let accumulating: Vec<Option<f64>> = names
            .accumulating
            .iter()
            .map(|n| samples.accumulating.get(n).copied())
            .collect();
        let status: Vec<Option<String>> = names
            .status
            .iter()
            .map(|n| samples.status.get(n).cloned())
            .collect();

        let ts = to_millis(samples.timestamp);
        let overwrite = tx
            .prepare("SELECT 1 FROM datum WHERE stream_id = ?1 AND ts = ?2")?
            .exists(params![stream_id.to_string(), ts])?;

        tx.execute(
            "INSERT OR REPLACE INTO datum (stream_id, ts, data_i, data_a, data_s, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                stream_id.to_string(),
                ts,
                serde_json::to_string(&instantaneous)?,
                serde_json::to_string(&accumulating)?,
                serde_json::to_string(&status)?,
                serde_json::to_string(&samples.tags)?,
            ],
        )?;

        let hour = bucket_start(samples.timestamp, AggregationKind::Hour, meta.time_zone);
        insert_marker(&tx, &MarkerKey::new(stream_id, hour, StaleKind::Aggregate(AggregationKind::Hour)))?;

        let (datum_delta, usage) = if overwrite {
            (
                0,
                UsageCounts {
                    prop_update_count: samples.property_count(),
                    ..UsageCounts::default()
                },
            )
        } else {
            (
                1,
                UsageCounts {
                    prop_count: samples.property_count(),
                    ..UsageCounts::default()
                },
            )
        };
        add_usage(&tx, stream_id, hour, datum_delta, &usage)?;

        tx.commit()?;
        log::debug!("Stored datum {}@{} (overwrite: {})", stream_id, samples.timestamp, overwrite);
        Ok(())
    }

    /// Delete one reading; its hour is re-dirtied when a row was removed
    pub fn delete_datum(&mut self, stream_id: StreamId, timestamp: DateTime<Utc>) -> Result<bool, StaleError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let meta = load_stream_meta(&tx, stream_id)?.unwrap_or_else(|| StreamMeta::unknown(stream_id));

        let deleted = tx.execute(
            "DELETE FROM datum WHERE stream_id = ?1 AND ts = ?2",
            params![stream_id.to_string(), to_millis(timestamp)],
        )?;
        if deleted > 0 {
            let hour = bucket_start(timestamp, AggregationKind::Hour, meta.time_zone);
            insert_marker(&tx, &MarkerKey::new(stream_id, hour, StaleKind::Aggregate(AggregationKind::Hour)))?;
        }

        tx.commit()?;
        Ok(deleted > 0)
    }

    /// Record a meter reset for accumulating properties
    ///
    /// `final_values` are the readings just before the reset, `start_values`
    /// the readings just after.
    pub fn store_reset(
        &mut self,
        stream_id: StreamId,
        timestamp: DateTime<Utc>,
        final_values: &BTreeMap<String, f64>,
        start_values: &BTreeMap<String, f64>,
    ) -> Result<(), StaleError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let meta = load_stream_meta(&tx, stream_id)?
            .ok_or_else(|| StaleError::DataIntegrity(format!("unknown stream {}", stream_id)))?;

        let mut names = meta.names.clone();
        extend_names(&mut names.accumulating, final_values.keys().chain(start_values.keys()));
        if names != meta.names {
            save_names(&tx, stream_id, &names)?;
        }

        tx.execute(
            "INSERT OR REPLACE INTO datum_aux (stream_id, ts, aux_kind, data_final, data_start)
             VALUES (?1, ?2, 'Reset', ?3, ?4)",
            params![
                stream_id.to_string(),
                to_millis(timestamp),
                serde_json::to_string(final_values)?,
                serde_json::to_string(start_values)?,
            ],
        )?;

        let hour = bucket_start(timestamp, AggregationKind::Hour, meta.time_zone);
        insert_marker(&tx, &MarkerKey::new(stream_id, hour, StaleKind::Aggregate(AggregationKind::Hour)))?;

        tx.commit()?;
        Ok(())
    }

    /// Merge usage counters into Hour usage rows and mark each day's audit stale
    ///
    /// `at` may be any instant in the hour; it is re-bucketed in the stream's
    /// time zone.
    pub fn apply_usage(&mut self, entries: &[(StreamId, DateTime<Utc>, UsageCounts)]) -> Result<usize, StaleError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut applied = 0;

        for (stream_id, at, usage) in entries {
            if usage.is_empty() {
                continue;
            }
            let tz = load_stream_meta(&tx, *stream_id)?
                .map(|m| m.time_zone)
                .unwrap_or(Tz::UTC);
            let hour = bucket_start(*at, AggregationKind::Hour, tz);
            add_usage(&tx, *stream_id, hour, 0, usage)?;

            let day = bucket_start(*at, AggregationKind::Day, tz);
            insert_marker(&tx, &MarkerKey::new(*stream_id, day, StaleKind::Audit(AuditKind::Day)))?;
            applied += 1;
        }

        tx.commit()?;
        Ok(applied)
    }
}

/// Append unseen names; existing positions never move
fn extend_names<'a>(names: &mut Vec<String>, incoming: impl Iterator<Item = &'a String>) {
    for name in incoming {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
}

fn save_names(conn: &Connection, stream_id: StreamId, names: &PropertyNames) -> Result<(), StaleError> {
    conn.execute(
        "UPDATE streams SET names_i = ?2, names_a = ?3, names_s = ?4 WHERE stream_id = ?1",
        params![
            stream_id.to_string(),
            serde_json::to_string(&names.instantaneous)?,
            serde_json::to_string(&names.accumulating)?,
            serde_json::to_string(&names.status)?,
        ],
    )?;
    Ok(())
}
