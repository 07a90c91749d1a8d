//! SQLite storage for streams, datum, aggregates, audit rows and stale markers
//!
//! `StaleStore` owns the database path, the marker row-lock table and the busy
//! timeout; every worker opens its own `Connection` through it. The free
//! functions take `&Connection` so they run equally inside a `Transaction`.
//!
//! Tables:
//! - `streams` - stream directory (property names as JSON arrays)
//! - `datum` / `datum_aux` - raw readings and reset records
//! - `agg_datum` / `agg_stale_datum` - aggregates and their stale markers
//! - `aud_datum` / `aud_stale_datum` - audit counters and their stale markers
//!
//! Timestamps are epoch milliseconds; positional value arrays are JSON text.

use super::audit::AuditUpdate;
use super::error::StaleError;
use super::ingestion::DatumWriter;
use super::locks::{RowLockGuard, RowLocks};
use super::types::{
    AggregateDatum, AggregateValues, AggregationKind, AuditDatum, AuditKind, AuditTierCounts,
    Datum, MarkerKey, ObjectKind, PropertyNames, ResetBoundary, StaleKind, StaleMarker,
    StreamId, StreamMeta, UsageCounts,
};
use super::windows::BucketWindow;
use crate::sqlite_pragma::apply_optimized_pragmas;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS streams (
    stream_id    TEXT PRIMARY KEY,
    object_kind  TEXT NOT NULL,
    object_id    INTEGER NOT NULL,
    source_id    TEXT NOT NULL,
    names_i      TEXT NOT NULL DEFAULT '[]',
    names_a      TEXT NOT NULL DEFAULT '[]',
    names_s      TEXT NOT NULL DEFAULT '[]',
    time_zone    TEXT NOT NULL DEFAULT 'UTC',
    created      INTEGER NOT NULL,
    UNIQUE (object_kind, object_id, source_id)
);

CREATE TABLE IF NOT EXISTS datum (
    stream_id    TEXT NOT NULL,
    ts           INTEGER NOT NULL,
    data_i       TEXT NOT NULL DEFAULT '[]',
    data_a       TEXT NOT NULL DEFAULT '[]',
    data_s       TEXT NOT NULL DEFAULT '[]',
    tags         TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (stream_id, ts)
);

CREATE TABLE IF NOT EXISTS datum_aux (
    stream_id    TEXT NOT NULL,
    ts           INTEGER NOT NULL,
    aux_kind     TEXT NOT NULL DEFAULT 'Reset',
    data_final   TEXT NOT NULL DEFAULT '{}',
    data_start   TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (stream_id, ts, aux_kind)
);

CREATE TABLE IF NOT EXISTS agg_datum (
    stream_id    TEXT NOT NULL,
    ts_start     INTEGER NOT NULL,
    agg_kind     TEXT NOT NULL,
    datum_count  INTEGER NOT NULL DEFAULT 0,
    data_i       TEXT NOT NULL DEFAULT '[]',
    data_a       TEXT NOT NULL DEFAULT '[]',
    data_s       TEXT NOT NULL DEFAULT '[]',
    tags         TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (stream_id, ts_start, agg_kind)
);

CREATE TABLE IF NOT EXISTS agg_stale_datum (
    stream_id    TEXT NOT NULL,
    ts_start     INTEGER NOT NULL,
    agg_kind     TEXT NOT NULL,
    created      INTEGER NOT NULL,
    PRIMARY KEY (agg_kind, ts_start, stream_id)
);

CREATE TABLE IF NOT EXISTS aud_datum (
    stream_id            TEXT NOT NULL,
    ts_start             INTEGER NOT NULL,
    aud_kind             TEXT NOT NULL,
    datum_count          INTEGER NOT NULL DEFAULT 0,
    prop_count           INTEGER NOT NULL DEFAULT 0,
    prop_u_count         INTEGER NOT NULL DEFAULT 0,
    datum_q_count        INTEGER NOT NULL DEFAULT 0,
    flux_byte_count      INTEGER NOT NULL DEFAULT 0,
    datum_hourly_count   INTEGER NOT NULL DEFAULT 0,
    datum_daily_count    INTEGER NOT NULL DEFAULT 0,
    datum_monthly_count  INTEGER NOT NULL DEFAULT 0,
    datum_daily_pres     INTEGER NOT NULL DEFAULT 0,
    datum_monthly_pres   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (stream_id, ts_start, aud_kind)
);

CREATE TABLE IF NOT EXISTS aud_stale_datum (
    stream_id    TEXT NOT NULL,
    ts_start     INTEGER NOT NULL,
    aud_kind     TEXT NOT NULL,
    created      INTEGER NOT NULL,
    PRIMARY KEY (aud_kind, ts_start, stream_id)
);
"#;

/// Handle to the rollup database shared by all workers
#[derive(Debug, Clone)]
pub struct StaleStore {
    db_path: PathBuf,
    locks: Arc<RowLocks>,
    busy_timeout: Duration,
}

impl StaleStore {
    /// Open (and create if needed) the database at `db_path`
    pub fn open(db_path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StaleError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let store = Self {
            db_path,
            locks: RowLocks::new(),
            busy_timeout,
        };

        let conn = store.connect()?;
        conn.execute_batch(SCHEMA_SQL)?;
        log::info!("📊 Rollup store ready at {}", store.db_path.display());

        Ok(store)
    }

    /// Fresh connection with WAL pragmas applied
    pub fn connect(&self) -> Result<Connection, StaleError> {
        let conn = Connection::open(&self.db_path)?;
        apply_optimized_pragmas(&conn, self.busy_timeout)?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn locks(&self) -> &Arc<RowLocks> {
        &self.locks
    }

    /// Hold a marker's row lock from outside the engine
    pub fn lock_marker(&self, key: &MarkerKey) -> Option<RowLockGuard> {
        self.locks.try_lock(key)
    }

    pub fn datum_writer(&self) -> Result<DatumWriter, StaleError> {
        Ok(DatumWriter::new(self.connect()?))
    }

    /// All pending markers of `kind`, oldest bucket first
    pub fn list_markers(&self, kind: StaleKind) -> Result<Vec<StaleMarker>, StaleError> {
        let conn = self.connect()?;
        let (table, column, key) = marker_table(kind);
        let sql = format!(
            "SELECT stream_id, ts_start, created FROM {} WHERE {} = ?1 ORDER BY ts_start, stream_id",
            table, column
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![key], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(stream_id, ts_start, created)| -> Result<StaleMarker, StaleError> {
                Ok(StaleMarker {
                    stream_id: parse_stream_id(&stream_id)?,
                    bucket_start: from_millis(ts_start)?,
                    kind,
                    created_at: from_millis(created)?,
                })
            })
            .collect()
    }

    pub fn get_aggregate(
        &self,
        stream_id: StreamId,
        bucket_start: DateTime<Utc>,
        kind: AggregationKind,
    ) -> Result<Option<AggregateDatum>, StaleError> {
        let conn = self.connect()?;
        let window = BucketWindow {
            start: bucket_start,
            end: bucket_start + chrono::Duration::milliseconds(1),
        };
        Ok(select_aggregates(&conn, stream_id, kind, &window)?.into_iter().next())
    }

    pub fn get_audit(
        &self,
        stream_id: StreamId,
        bucket_start: DateTime<Utc>,
        kind: AuditKind,
    ) -> Result<Option<AuditDatum>, StaleError> {
        let conn = self.connect()?;
        select_audit_row(&conn, stream_id, bucket_start, kind)
    }
}

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> Result<DateTime<Utc>, StaleError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StaleError::DataIntegrity(format!("timestamp {} out of range", ms)))
}

fn parse_stream_id(raw: &str) -> Result<StreamId, StaleError> {
    Uuid::parse_str(raw)
        .map_err(|e| StaleError::DataIntegrity(format!("bad stream id '{}': {}", raw, e)))
}

/// (table, kind column, kind key) holding markers of `kind`
fn marker_table(kind: StaleKind) -> (&'static str, &'static str, &'static str) {
    match kind {
        StaleKind::Aggregate(k) => ("agg_stale_datum", "agg_kind", k.key()),
        StaleKind::Audit(k) => ("aud_stale_datum", "aud_kind", k.key()),
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

pub fn load_stream_meta(conn: &Connection, stream_id: StreamId) -> Result<Option<StreamMeta>, StaleError> {
    let row = conn
        .query_row(
            "SELECT object_kind, object_id, source_id, names_i, names_a, names_s, time_zone
             FROM streams WHERE stream_id = ?1",
            params![stream_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((object_kind, object_id, source_id, names_i, names_a, names_s, time_zone)) = row else {
        return Ok(None);
    };

    let object_kind = ObjectKind::from_key(&object_kind).ok_or_else(|| {
        StaleError::DataIntegrity(format!("stream {} has unknown object kind '{}'", stream_id, object_kind))
    })?;
    let time_zone: Tz = time_zone.parse().map_err(|_| {
        StaleError::DataIntegrity(format!("stream {} has unknown time zone '{}'", stream_id, time_zone))
    })?;

    Ok(Some(StreamMeta {
        stream_id,
        object_kind,
        object_id,
        source_id,
        names: PropertyNames {
            instantaneous: serde_json::from_str(&names_i)?,
            accumulating: serde_json::from_str(&names_a)?,
            status: serde_json::from_str(&names_s)?,
        },
        time_zone,
    }))
}

// ---------------------------------------------------------------------------
// Raw datum and resets
// ---------------------------------------------------------------------------

/// Raw datum of a stream inside `window`, oldest first
///
/// Rows whose JSON cannot be decoded are logged and skipped.
pub fn select_raw_datum(
    conn: &Connection,
    stream_id: StreamId,
    window: &BucketWindow,
) -> Result<Vec<Datum>, StaleError> {
    let mut stmt = conn.prepare(
        "SELECT ts, data_i, data_a, data_s, tags FROM datum
         WHERE stream_id = ?1 AND ts >= ?2 AND ts < ?3 ORDER BY ts",
    )?;
    let rows = stmt
        .query_map(
            params![stream_id.to_string(), window.start_millis(), window.end_millis()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut datum = Vec::with_capacity(rows.len());
    for (ts, data_i, data_a, data_s, tags) in rows {
        match decode_datum(stream_id, ts, &data_i, &data_a, &data_s, &tags) {
            Ok(d) => datum.push(d),
            Err(e) => log::warn!("⚠️  Skipping datum {}@{}: {}", stream_id, ts, e),
        }
    }
    Ok(datum)
}

fn decode_datum(
    stream_id: StreamId,
    ts: i64,
    data_i: &str,
    data_a: &str,
    data_s: &str,
    tags: &str,
) -> Result<Datum, StaleError> {
    Ok(Datum {
        stream_id,
        timestamp: from_millis(ts)?,
        instantaneous: serde_json::from_str(data_i)?,
        accumulating: serde_json::from_str(data_a)?,
        status: serde_json::from_str(data_s)?,
        tags: serde_json::from_str(tags)?,
    })
}

/// Timestamps of raw datum inside `window`
pub fn select_raw_timestamps(
    conn: &Connection,
    stream_id: StreamId,
    window: &BucketWindow,
) -> Result<Vec<DateTime<Utc>>, StaleError> {
    let mut stmt = conn.prepare(
        "SELECT ts FROM datum WHERE stream_id = ?1 AND ts >= ?2 AND ts < ?3 ORDER BY ts",
    )?;
    let stamps = stmt
        .query_map(
            params![stream_id.to_string(), window.start_millis(), window.end_millis()],
            |row| row.get::<_, i64>(0),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    stamps.into_iter().map(from_millis).collect()
}

/// Reset records inside `window`, aligned to the stream's accumulating names
pub fn select_resets(
    conn: &Connection,
    meta: &StreamMeta,
    window: &BucketWindow,
) -> Result<Vec<ResetBoundary>, StaleError> {
    let mut stmt = conn.prepare(
        "SELECT ts, data_final, data_start FROM datum_aux
         WHERE stream_id = ?1 AND aux_kind = 'Reset' AND ts >= ?2 AND ts < ?3 ORDER BY ts",
    )?;
    let rows = stmt
        .query_map(
            params![meta.stream_id.to_string(), window.start_millis(), window.end_millis()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut resets = Vec::with_capacity(rows.len());
    for (ts, data_final, data_start) in rows {
        let decoded = serde_json::from_str::<BTreeMap<String, f64>>(&data_final).and_then(|f| {
            serde_json::from_str::<BTreeMap<String, f64>>(&data_start).map(|s| (f, s))
        });
        match decoded {
            Ok((final_map, start_map)) => resets.push(ResetBoundary {
                timestamp: from_millis(ts)?,
                final_values: align(&meta.names.accumulating, &final_map),
                start_values: align(&meta.names.accumulating, &start_map),
            }),
            Err(e) => log::warn!("⚠️  Skipping reset {}@{}: {}", meta.stream_id, ts, e),
        }
    }
    Ok(resets)
}

fn align(names: &[String], values: &BTreeMap<String, f64>) -> Vec<Option<f64>> {
    names.iter().map(|name| values.get(name).copied()).collect()
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Aggregate rows of `kind` whose bucket starts inside `window`
pub fn select_aggregates(
    conn: &Connection,
    stream_id: StreamId,
    kind: AggregationKind,
    window: &BucketWindow,
) -> Result<Vec<AggregateDatum>, StaleError> {
    let mut stmt = conn.prepare(
        "SELECT ts_start, datum_count, data_i, data_a, data_s, tags FROM agg_datum
         WHERE stream_id = ?1 AND agg_kind = ?2 AND ts_start >= ?3 AND ts_start < ?4
         ORDER BY ts_start",
    )?;
    let rows = stmt
        .query_map(
            params![stream_id.to_string(), kind.key(), window.start_millis(), window.end_millis()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut aggregates = Vec::with_capacity(rows.len());
    for (ts_start, datum_count, data_i, data_a, data_s, tags) in rows {
        let decoded = (|| -> Result<AggregateDatum, StaleError> {
            Ok(AggregateDatum {
                stream_id,
                bucket_start: from_millis(ts_start)?,
                kind,
                values: AggregateValues {
                    datum_count: datum_count.max(0) as u64,
                    instantaneous: serde_json::from_str(&data_i)?,
                    accumulating: serde_json::from_str(&data_a)?,
                    status: serde_json::from_str(&data_s)?,
                    tags: serde_json::from_str(&tags)?,
                },
            })
        })();
        match decoded {
            Ok(agg) => aggregates.push(agg),
            Err(e) => log::warn!("⚠️  Skipping {:?} aggregate {}@{}: {}", kind, stream_id, ts_start, e),
        }
    }
    Ok(aggregates)
}

/// Bucket starts of existing `kind` aggregates inside `window`
pub fn select_aggregate_starts(
    conn: &Connection,
    stream_id: StreamId,
    kind: AggregationKind,
    window: &BucketWindow,
) -> Result<Vec<DateTime<Utc>>, StaleError> {
    let mut stmt = conn.prepare(
        "SELECT ts_start FROM agg_datum
         WHERE stream_id = ?1 AND agg_kind = ?2 AND ts_start >= ?3 AND ts_start < ?4
         ORDER BY ts_start",
    )?;
    let stamps = stmt
        .query_map(
            params![stream_id.to_string(), kind.key(), window.start_millis(), window.end_millis()],
            |row| row.get::<_, i64>(0),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    stamps.into_iter().map(from_millis).collect()
}

pub fn aggregate_exists(
    conn: &Connection,
    stream_id: StreamId,
    bucket_start: DateTime<Utc>,
    kind: AggregationKind,
) -> Result<bool, StaleError> {
    let mut stmt = conn.prepare(
        "SELECT 1 FROM agg_datum WHERE stream_id = ?1 AND ts_start = ?2 AND agg_kind = ?3",
    )?;
    Ok(stmt.exists(params![stream_id.to_string(), to_millis(bucket_start), kind.key()])?)
}

/// Insert or overwrite an aggregate row
pub fn upsert_aggregate(conn: &Connection, agg: &AggregateDatum) -> Result<(), StaleError> {
    conn.execute(
        r#"
        INSERT INTO agg_datum (stream_id, ts_start, agg_kind, datum_count, data_i, data_a, data_s, tags)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(stream_id, ts_start, agg_kind) DO UPDATE SET
            datum_count = excluded.datum_count,
            data_i = excluded.data_i,
            data_a = excluded.data_a,
            data_s = excluded.data_s,
            tags = excluded.tags
        "#,
        params![
            agg.stream_id.to_string(),
            to_millis(agg.bucket_start),
            agg.kind.key(),
            agg.values.datum_count as i64,
            serde_json::to_string(&agg.values.instantaneous)?,
            serde_json::to_string(&agg.values.accumulating)?,
            serde_json::to_string(&agg.values.status)?,
            serde_json::to_string(&agg.values.tags)?,
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Audit rows
// ---------------------------------------------------------------------------

const AUDIT_COLUMNS: &str = "ts_start, datum_count, prop_count, prop_u_count, datum_q_count, \
     flux_byte_count, datum_hourly_count, datum_daily_count, datum_monthly_count, \
     datum_daily_pres, datum_monthly_pres";

struct AuditRow {
    ts_start: i64,
    datum_count: i64,
    usage: UsageCounts,
    hourly_count: i64,
    daily_count: i64,
    monthly_count: i64,
    daily_pres: bool,
    monthly_pres: bool,
}

fn read_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRow> {
    Ok(AuditRow {
        ts_start: row.get(0)?,
        datum_count: row.get(1)?,
        usage: UsageCounts {
            prop_count: row.get(2)?,
            prop_update_count: row.get(3)?,
            query_count: row.get(4)?,
            flux_byte_count: row.get(5)?,
        },
        hourly_count: row.get(6)?,
        daily_count: row.get(7)?,
        monthly_count: row.get(8)?,
        daily_pres: row.get::<_, i64>(9)? != 0,
        monthly_pres: row.get::<_, i64>(10)? != 0,
    })
}

/// Shape a stored audit row by its kind
fn decode_audit_row(stream_id: StreamId, kind: AuditKind, row: AuditRow) -> Result<AuditDatum, StaleError> {
    let tier = match kind {
        AuditKind::Hour => AuditTierCounts::Hour,
        AuditKind::Day => AuditTierCounts::Day {
            hourly_count: row.hourly_count,
            daily_present: row.daily_pres,
        },
        AuditKind::Month => AuditTierCounts::Month {
            hourly_count: row.hourly_count,
            daily_count: row.daily_count,
            monthly_present: row.monthly_pres,
        },
        AuditKind::RunningTotal => AuditTierCounts::RunningTotal {
            hourly_count: row.hourly_count,
            daily_count: row.daily_count,
            monthly_count: row.monthly_count,
        },
        AuditKind::Raw => {
            return Err(StaleError::DataIntegrity(
                "raw audit kind has no stored rows".to_string(),
            ))
        }
    };
    Ok(AuditDatum {
        stream_id,
        bucket_start: from_millis(row.ts_start)?,
        datum_count: row.datum_count,
        usage: row.usage,
        tier,
    })
}

fn query_audit_rows(
    conn: &Connection,
    stream_id: StreamId,
    kind: AuditKind,
    from_ms: i64,
    until_ms: i64,
) -> Result<Vec<AuditDatum>, StaleError> {
    if kind == AuditKind::Raw {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {} FROM aud_datum
         WHERE stream_id = ?1 AND aud_kind = ?2 AND ts_start >= ?3 AND ts_start < ?4
         ORDER BY ts_start",
        AUDIT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![stream_id.to_string(), kind.key(), from_ms, until_ms],
            read_audit_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|row| decode_audit_row(stream_id, kind, row))
        .collect()
}

/// Audit rows of `kind` whose bucket starts inside `window`
pub fn select_audit_rows(
    conn: &Connection,
    stream_id: StreamId,
    kind: AuditKind,
    window: &BucketWindow,
) -> Result<Vec<AuditDatum>, StaleError> {
    query_audit_rows(conn, stream_id, kind, window.start_millis(), window.end_millis())
}

/// Audit rows of `kind` whose bucket starts at or before `through`
pub fn select_audit_rows_through(
    conn: &Connection,
    stream_id: StreamId,
    kind: AuditKind,
    through: DateTime<Utc>,
) -> Result<Vec<AuditDatum>, StaleError> {
    query_audit_rows(conn, stream_id, kind, i64::MIN, to_millis(through).saturating_add(1))
}

pub fn select_audit_row(
    conn: &Connection,
    stream_id: StreamId,
    bucket_start: DateTime<Utc>,
    kind: AuditKind,
) -> Result<Option<AuditDatum>, StaleError> {
    let ms = to_millis(bucket_start);
    Ok(query_audit_rows(conn, stream_id, kind, ms, ms + 1)?.into_iter().next())
}

/// Bucket starts of `kind` audit rows strictly after `after`
pub fn select_audit_starts_after(
    conn: &Connection,
    stream_id: StreamId,
    kind: AuditKind,
    after: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, StaleError> {
    let mut stmt = conn.prepare(
        "SELECT ts_start FROM aud_datum
         WHERE stream_id = ?1 AND aud_kind = ?2 AND ts_start > ?3 ORDER BY ts_start",
    )?;
    let stamps = stmt
        .query_map(
            params![stream_id.to_string(), kind.key(), to_millis(after)],
            |row| row.get::<_, i64>(0),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    stamps.into_iter().map(from_millis).collect()
}

/// Write only the columns `update` owns, creating the row if missing
pub fn upsert_audit(
    conn: &Connection,
    stream_id: StreamId,
    bucket_start: DateTime<Utc>,
    update: &AuditUpdate,
) -> Result<(), StaleError> {
    let id = stream_id.to_string();
    let ts = to_millis(bucket_start);
    let kind = update.row_kind().key();

    match *update {
        AuditUpdate::RawCount { datum_count } => {
            conn.execute(
                "INSERT INTO aud_datum (stream_id, ts_start, aud_kind, datum_count)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(stream_id, ts_start, aud_kind) DO UPDATE SET
                     datum_count = excluded.datum_count",
                params![id, ts, kind, datum_count],
            )?;
        }
        AuditUpdate::HourlyCount { hourly_count } => {
            conn.execute(
                "INSERT INTO aud_datum (stream_id, ts_start, aud_kind, datum_hourly_count)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(stream_id, ts_start, aud_kind) DO UPDATE SET
                     datum_hourly_count = excluded.datum_hourly_count",
                params![id, ts, kind, hourly_count],
            )?;
        }
        AuditUpdate::DailySummary { daily_present, usage } => {
            conn.execute(
                "INSERT INTO aud_datum (stream_id, ts_start, aud_kind, datum_daily_pres,
                     prop_count, prop_u_count, datum_q_count, flux_byte_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(stream_id, ts_start, aud_kind) DO UPDATE SET
                     datum_daily_pres = excluded.datum_daily_pres,
                     prop_count = excluded.prop_count,
                     prop_u_count = excluded.prop_u_count,
                     datum_q_count = excluded.datum_q_count,
                     flux_byte_count = excluded.flux_byte_count",
                params![
                    id,
                    ts,
                    kind,
                    daily_present as i64,
                    usage.prop_count,
                    usage.prop_update_count,
                    usage.query_count,
                    usage.flux_byte_count,
                ],
            )?;
        }
        AuditUpdate::Monthly {
            datum_count,
            hourly_count,
            daily_count,
            monthly_present,
            usage,
        } => {
            conn.execute(
                "INSERT INTO aud_datum (stream_id, ts_start, aud_kind, datum_count,
                     datum_hourly_count, datum_daily_count, datum_monthly_pres,
                     prop_count, prop_u_count, datum_q_count, flux_byte_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(stream_id, ts_start, aud_kind) DO UPDATE SET
                     datum_count = excluded.datum_count,
                     datum_hourly_count = excluded.datum_hourly_count,
                     datum_daily_count = excluded.datum_daily_count,
                     datum_monthly_pres = excluded.datum_monthly_pres,
                     prop_count = excluded.prop_count,
                     prop_u_count = excluded.prop_u_count,
                     datum_q_count = excluded.datum_q_count,
                     flux_byte_count = excluded.flux_byte_count",
                params![
                    id,
                    ts,
                    kind,
                    datum_count,
                    hourly_count,
                    daily_count,
                    monthly_present as i64,
                    usage.prop_count,
                    usage.prop_update_count,
                    usage.query_count,
                    usage.flux_byte_count,
                ],
            )?;
        }
        AuditUpdate::RunningTotal {
            datum_count,
            hourly_count,
            daily_count,
            monthly_count,
        } => {
            conn.execute(
                "INSERT INTO aud_datum (stream_id, ts_start, aud_kind, datum_count,
                     datum_hourly_count, datum_daily_count, datum_monthly_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(stream_id, ts_start, aud_kind) DO UPDATE SET
                     datum_count = excluded.datum_count,
                     datum_hourly_count = excluded.datum_hourly_count,
                     datum_daily_count = excluded.datum_daily_count,
                     datum_monthly_count = excluded.datum_monthly_count",
                params![id, ts, kind, datum_count, hourly_count, daily_count, monthly_count],
            )?;
        }
    }
    Ok(())
}

/// Add to an Hour usage row, creating it if missing
pub fn add_usage(
    conn: &Connection,
    stream_id: StreamId,
    hour_start: DateTime<Utc>,
    datum_delta: i64,
    usage: &UsageCounts,
) -> Result<(), StaleError> {
    conn.execute(
        "INSERT INTO aud_datum (stream_id, ts_start, aud_kind, datum_count,
             prop_count, prop_u_count, datum_q_count, flux_byte_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(stream_id, ts_start, aud_kind) DO UPDATE SET
             datum_count = datum_count + excluded.datum_count,
             prop_count = prop_count + excluded.prop_count,
             prop_u_count = prop_u_count + excluded.prop_u_count,
             datum_q_count = datum_q_count + excluded.datum_q_count,
             flux_byte_count = flux_byte_count + excluded.flux_byte_count",
        params![
            stream_id.to_string(),
            to_millis(hour_start),
            AuditKind::Hour.key(),
            datum_delta,
            usage.prop_count,
            usage.prop_update_count,
            usage.query_count,
            usage.flux_byte_count,
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Stale markers
// ---------------------------------------------------------------------------

/// Ensure a marker exists; returns false when it was already pending
pub fn insert_marker(conn: &Connection, key: &MarkerKey) -> Result<bool, StaleError> {
    let (table, column, kind) = marker_table(key.kind);
    let sql = format!(
        "INSERT OR IGNORE INTO {} (stream_id, ts_start, {}, created) VALUES (?1, ?2, ?3, ?4)",
        table, column
    );
    let inserted = conn.execute(
        &sql,
        params![
            key.stream_id.to_string(),
            to_millis(key.bucket_start),
            kind,
            to_millis(Utc::now()),
        ],
    )?;
    Ok(inserted > 0)
}

pub fn delete_marker(conn: &Connection, key: &MarkerKey) -> Result<bool, StaleError> {
    let (table, column, kind) = marker_table(key.kind);
    let sql = format!(
        "DELETE FROM {} WHERE stream_id = ?1 AND ts_start = ?2 AND {} = ?3",
        table, column
    );
    let deleted = conn.execute(
        &sql,
        params![key.stream_id.to_string(), to_millis(key.bucket_start), kind],
    )?;
    Ok(deleted > 0)
}

/// One keyset page of pending markers of `kind`, ordered by (bucket, stream)
///
/// `after` is the last key of the previous page.
pub fn select_marker_page(
    conn: &Connection,
    kind: StaleKind,
    after: Option<&MarkerKey>,
    limit: usize,
) -> Result<Vec<MarkerKey>, StaleError> {
    let (table, column, key) = marker_table(kind);
    let (after_ts, after_id) = match after {
        Some(k) => (to_millis(k.bucket_start), k.stream_id.to_string()),
        None => (i64::MIN, String::new()),
    };
    let sql = format!(
        "SELECT stream_id, ts_start FROM {table}
         WHERE {column} = ?1 AND (ts_start > ?2 OR (ts_start = ?2 AND stream_id > ?3))
         ORDER BY ts_start, stream_id
         LIMIT ?4",
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![key, after_ts, after_id, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(stream_id, ts_start)| -> Result<MarkerKey, StaleError> {
            Ok(MarkerKey::new(parse_stream_id(&stream_id)?, from_millis(ts_start)?, kind))
        })
        .collect()
}
