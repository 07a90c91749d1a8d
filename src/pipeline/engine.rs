//! Stale processing engine - claim, recompute, upsert, cascade
//!
//! One `process_one` call is one immediate SQLite transaction:
//!
//! ```text
//! BEGIN IMMEDIATE
//!     ↓
//! walk pending markers of `kind` (bucket, stream order), try-lock each
//!     ↓
//! read finer rows in the stream's calendar window
//!     ↓
//! recompute (rollup / audit calculator)
//!     ↓
//! upsert row (audit: owned columns only)
//!     ↓
//! delete marker, insert cascade markers
//!     ↓
//! COMMIT, release row lock, notify SolarFlux
//! ```
//!
//! Any error before COMMIT drops the transaction, which rolls it back and
//! leaves the marker in place for a later run.

use super::audit::{self, AuditUpdate};
use super::cascade;
use super::coordinator::{StaleProcessor, WorkerFactory};
use super::db::{
    aggregate_exists, delete_marker, insert_marker, load_stream_meta, select_aggregate_starts,
    select_aggregates, select_audit_row, select_audit_rows, select_audit_rows_through,
    select_audit_starts_after, select_marker_page, select_raw_datum, select_raw_timestamps,
    select_resets, upsert_aggregate, upsert_audit, StaleStore,
};
use super::error::StaleError;
use super::flux::{FluxSender, FluxUpdate};
use super::locks::{RowLockGuard, RowLocks};
use super::rollup::{recompute, FinerRows};
use super::types::{
    AggregateDatum, AggregationKind, AuditDatum, AuditKind, MarkerKey, ProcessOutcome, StaleKind, StreamId,
    StreamMeta,
};
use super::windows::BucketWindow;
use rusqlite::{Connection, TransactionBehavior};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Markers fetched per keyset page while looking for an unlocked one
const CLAIM_PAGE_SIZE: usize = 64;

/// Builds workers sharing one store and its row-lock table
#[derive(Debug, Clone)]
pub struct StaleEngine {
    store: StaleStore,
    flux: Option<FluxSender>,
}

impl StaleEngine {
    pub fn new(store: StaleStore, flux: Option<FluxSender>) -> Self {
        Self { store, flux }
    }

    pub fn store(&self) -> &StaleStore {
        &self.store
    }
}

impl WorkerFactory for StaleEngine {
    type Worker = StaleWorker;

    fn open_worker(&self, worker_id: usize) -> Result<StaleWorker, StaleError> {
        let conn = self.store.connect()?;
        Ok(StaleWorker::new(
            worker_id,
            conn,
            Arc::clone(self.store.locks()),
            self.flux.clone(),
        ))
    }
}

/// A single worker: its own connection, stream cache and failure memory
pub struct StaleWorker {
    worker_id: usize,
    conn: Connection,
    locks: Arc<RowLocks>,
    streams: HashMap<StreamId, Arc<StreamMeta>>,
    /// Markers that failed during this worker's lifetime; not retried by it.
    /// Per worker, so with N workers a failing marker is attempted up to N
    /// times per run.
    failed: HashSet<MarkerKey>,
    flux: Option<FluxSender>,
}

enum Claim {
    Locked(RowLockGuard),
    Empty,
    AllLocked,
}

impl StaleWorker {
    pub fn new(worker_id: usize, conn: Connection, locks: Arc<RowLocks>, flux: Option<FluxSender>) -> Self {
        Self {
            worker_id,
            conn,
            locks,
            streams: HashMap::new(),
            failed: HashSet::new(),
            flux,
        }
    }

    pub fn failed_markers(&self) -> &HashSet<MarkerKey> {
        &self.failed
    }
}

impl StaleProcessor for StaleWorker {
    fn process_one(&mut self, kind: StaleKind) -> Result<ProcessOutcome, StaleError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let guard = match claim(&tx, &self.locks, kind, &self.failed)? {
            Claim::Locked(guard) => guard,
            Claim::Empty => return Ok(ProcessOutcome::NoWork),
            Claim::AllLocked => return Ok(ProcessOutcome::Skipped),
        };
        let key = *guard.key();

        let processed = cached_meta(&mut self.streams, &tx, key.stream_id)
            .and_then(|meta| process_claimed(&tx, &meta, &key));

        let update = match processed.and_then(|update| {
            tx.commit()?;
            Ok(update)
        }) {
            Ok(update) => update,
            Err(e) => {
                drop(guard);
                self.failed.insert(key);
                log::warn!("⚠️  Worker {} rolled back {}: {}", self.worker_id, key, e);
                return Err(e);
            }
        };
        drop(guard);

        if let Some(flux) = &self.flux {
            flux.notify(update);
        }
        Ok(ProcessOutcome::Processed(key))
    }
}

/// First pending marker of `kind` this worker can lock
fn claim(
    conn: &Connection,
    locks: &Arc<RowLocks>,
    kind: StaleKind,
    failed: &HashSet<MarkerKey>,
) -> Result<Claim, StaleError> {
    let mut after: Option<MarkerKey> = None;
    let mut pending = false;

    loop {
        let page = select_marker_page(conn, kind, after.as_ref(), CLAIM_PAGE_SIZE)?;
        if page.is_empty() {
            break;
        }
        pending = true;

        for key in &page {
            if failed.contains(key) {
                continue;
            }
            if let Some(guard) = locks.try_lock(key) {
                return Ok(Claim::Locked(guard));
            }
            log::debug!("Marker {} is locked elsewhere, skipping", key);
        }

        if page.len() < CLAIM_PAGE_SIZE {
            break;
        }
        after = page.last().copied();
    }

    Ok(if pending { Claim::AllLocked } else { Claim::Empty })
}

fn cached_meta(
    streams: &mut HashMap<StreamId, Arc<StreamMeta>>,
    conn: &Connection,
    stream_id: StreamId,
) -> Result<Arc<StreamMeta>, StaleError> {
    if let Some(meta) = streams.get(&stream_id) {
        return Ok(Arc::clone(meta));
    }
    let meta = match load_stream_meta(conn, stream_id) {
        Ok(Some(meta)) => meta,
        Ok(None) => {
            log::warn!("⚠️  Marker references unknown stream {}, using UTC", stream_id);
            StreamMeta::unknown(stream_id)
        }
        // Undecodable metadata must not pin the marker forever
        Err(e @ (StaleError::DataIntegrity(_) | StaleError::Serialization(_))) => {
            log::warn!("⚠️  Stream {} metadata unreadable ({}), using UTC and no names", stream_id, e);
            StreamMeta::unknown(stream_id)
        }
        Err(e) => return Err(e),
    };
    let meta = Arc::new(meta);
    streams.insert(stream_id, Arc::clone(&meta));
    Ok(meta)
}

/// Recompute, upsert, consume and cascade one claimed marker
fn process_claimed(conn: &Connection, meta: &StreamMeta, key: &MarkerKey) -> Result<FluxUpdate, StaleError> {
    let (update, cascades) = match key.kind {
        StaleKind::Aggregate(kind) => {
            let agg = recompute_aggregate(conn, meta, key, kind)?;
            let cascades = cascade::after_aggregate(key.stream_id, key.bucket_start, kind, meta.time_zone);
            (FluxUpdate::Aggregate(agg), cascades)
        }
        StaleKind::Audit(kind) => {
            let row = recompute_audit(conn, meta, key, kind)?;
            let later_totals = if kind == AuditKind::Month {
                select_audit_starts_after(conn, key.stream_id, AuditKind::RunningTotal, key.bucket_start)?
            } else {
                Vec::new()
            };
            let cascades = cascade::after_audit(key.stream_id, key.bucket_start, kind, meta.time_zone, &later_totals);
            (FluxUpdate::Audit(row), cascades)
        }
    };

    delete_marker(conn, key)?;
    for marker in &cascades {
        insert_marker(conn, marker)?;
    }

    log::debug!("Recomputed {} (+{} cascade markers)", key, cascades.len());
    Ok(update)
}

fn recompute_aggregate(
    conn: &Connection,
    meta: &StreamMeta,
    key: &MarkerKey,
    kind: AggregationKind,
) -> Result<AggregateDatum, StaleError> {
    let window = BucketWindow::for_bucket(key.bucket_start, kind, meta.time_zone);

    let values = match kind.finer() {
        None => {
            let datum = select_raw_datum(conn, key.stream_id, &window)?;
            let resets = select_resets(conn, meta, &window)?;
            recompute(&window, kind, FinerRows::Raw(&datum), &resets)
        }
        Some(finer) => {
            let children = select_aggregates(conn, key.stream_id, finer, &window)?;
            recompute(&window, kind, FinerRows::Aggregates(&children), &[])
        }
    };

    let agg = AggregateDatum {
        stream_id: key.stream_id,
        bucket_start: key.bucket_start,
        kind,
        values,
    };
    upsert_aggregate(conn, &agg)?;
    Ok(agg)
}

fn recompute_audit(
    conn: &Connection,
    meta: &StreamMeta,
    key: &MarkerKey,
    kind: AuditKind,
) -> Result<AuditDatum, StaleError> {
    let stream_id = key.stream_id;
    let bucket = key.bucket_start;
    let window = BucketWindow::for_bucket(bucket, kind.bucket_granularity(), meta.time_zone);

    let update: AuditUpdate = match kind {
        AuditKind::Raw => audit::raw_count(&window, &select_raw_timestamps(conn, stream_id, &window)?),
        AuditKind::Hour => audit::hourly_count(
            &window,
            &select_aggregate_starts(conn, stream_id, AggregationKind::Hour, &window)?,
        ),
        AuditKind::Day => audit::daily_summary(
            &window,
            aggregate_exists(conn, stream_id, bucket, AggregationKind::Day)?,
            &select_audit_rows(conn, stream_id, AuditKind::Hour, &window)?,
        ),
        AuditKind::Month => audit::monthly_rollup(
            &window,
            &select_audit_rows(conn, stream_id, AuditKind::Day, &window)?,
            aggregate_exists(conn, stream_id, bucket, AggregationKind::Month)?,
        ),
        AuditKind::RunningTotal => audit::running_total(
            bucket,
            &select_audit_rows_through(conn, stream_id, AuditKind::Month, bucket)?,
        ),
    };

    let existing = select_audit_row(conn, stream_id, bucket, update.row_kind())?;
    upsert_audit(conn, stream_id, bucket, &update)?;
    Ok(update.apply(stream_id, bucket, existing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ingestion::DatumSamples;
    use crate::pipeline::types::{AuditTierCounts, ObjectKind};
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;
    use tempfile::TempDir;

    const HOUR: StaleKind = StaleKind::Aggregate(AggregationKind::Hour);
    const DAY: StaleKind = StaleKind::Aggregate(AggregationKind::Day);

    fn setup(tz: &str) -> (TempDir, StaleEngine, StreamMeta) {
        let dir = tempfile::tempdir().unwrap();
        let store = StaleStore::open(dir.path().join("rollup.db"), Duration::from_secs(5)).unwrap();
        let meta = store
            .datum_writer()
            .unwrap()
            .resolve_or_create_stream(ObjectKind::Node, 7, "meter/7", tz)
            .unwrap();
        (dir, StaleEngine::new(store, None), meta)
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn drain(worker: &mut StaleWorker, kind: StaleKind) -> usize {
        let mut processed = 0;
        while let ProcessOutcome::Processed(_) = worker.process_one(kind).unwrap() {
            processed += 1;
        }
        processed
    }

    #[test]
    fn test_hour_marker_becomes_aggregate() {
        let (_dir, engine, meta) = setup("UTC");
        let mut writer = engine.store().datum_writer().unwrap();
        writer
            .store_datum(meta.stream_id, &DatumSamples::new(at(10, 5)).with_instantaneous("watts", 4.0))
            .unwrap();
        writer
            .store_datum(meta.stream_id, &DatumSamples::new(at(10, 35)).with_instantaneous("watts", 8.0))
            .unwrap();

        let mut worker = engine.open_worker(0).unwrap();
        assert_eq!(drain(&mut worker, HOUR), 1);
        assert_eq!(worker.process_one(HOUR).unwrap(), ProcessOutcome::NoWork);

        let agg = engine
            .store()
            .get_aggregate(meta.stream_id, at(10, 0), AggregationKind::Hour)
            .unwrap()
            .unwrap();
        assert_eq!(agg.values.datum_count, 2);
        let stats = agg.values.instantaneous[0].unwrap();
        assert_eq!((stats.min, stats.max, stats.average), (4.0, 8.0, 6.0));

        assert!(engine.store().list_markers(HOUR).unwrap().is_empty());
        assert_eq!(engine.store().list_markers(DAY).unwrap().len(), 1);
        assert_eq!(
            engine
                .store()
                .list_markers(StaleKind::Audit(AuditKind::Hour))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_locked_marker_is_skipped() {
        let (_dir, engine, meta) = setup("UTC");
        let mut writer = engine.store().datum_writer().unwrap();
        writer
            .store_datum(meta.stream_id, &DatumSamples::new(at(1, 0)).with_instantaneous("watts", 1.0))
            .unwrap();

        let key = MarkerKey::new(meta.stream_id, at(1, 0), HOUR);
        let _guard = engine.store().lock_marker(&key).unwrap();

        let mut worker = engine.open_worker(0).unwrap();
        assert_eq!(worker.process_one(HOUR).unwrap(), ProcessOutcome::Skipped);
        assert_eq!(engine.store().list_markers(HOUR).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_stream_processes_with_utc() {
        let (_dir, engine, _meta) = setup("UTC");
        let orphan = uuid::Uuid::new_v4();
        let conn = engine.store().connect().unwrap();
        insert_marker(&conn, &MarkerKey::new(orphan, at(4, 0), HOUR)).unwrap();

        let mut worker = engine.open_worker(0).unwrap();
        assert_eq!(
            worker.process_one(HOUR).unwrap(),
            ProcessOutcome::Processed(MarkerKey::new(orphan, at(4, 0), HOUR))
        );
        let agg = engine
            .store()
            .get_aggregate(orphan, at(4, 0), AggregationKind::Hour)
            .unwrap()
            .unwrap();
        assert_eq!(agg.values, Default::default());
    }

    #[test]
    fn test_unreadable_stream_metadata_falls_back_to_utc() {
        let (_dir, engine, _meta) = setup("UTC");
        let conn = engine.store().connect().unwrap();
        let broken = uuid::Uuid::new_v4();
        conn.execute(
            "INSERT INTO streams (stream_id, object_kind, object_id, source_id, names_i, time_zone, created)
             VALUES (?1, 'n', 99, 'broken', 'not json', 'Not/AZone', 0)",
            [broken.to_string()],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO datum (stream_id, ts, data_i) VALUES (?1, ?2, '[5.0]')",
            rusqlite::params![broken.to_string(), at(2, 30).timestamp_millis()],
        )
        .unwrap();
        let key = MarkerKey::new(broken, at(2, 0), HOUR);
        insert_marker(&conn, &key).unwrap();

        let mut worker = engine.open_worker(0).unwrap();
        assert_eq!(worker.process_one(HOUR).unwrap(), ProcessOutcome::Processed(key));
        assert!(worker.failed_markers().is_empty());
        assert!(engine.store().list_markers(HOUR).unwrap().is_empty());

        let agg = engine
            .store()
            .get_aggregate(broken, at(2, 0), AggregationKind::Hour)
            .unwrap()
            .unwrap();
        assert_eq!(agg.values.datum_count, 1);
    }

    #[test]
    fn test_failed_marker_rolls_back_and_is_not_retried() {
        let (_dir, engine, meta) = setup("UTC");
        engine
            .store()
            .datum_writer()
            .unwrap()
            .store_datum(meta.stream_id, &DatumSamples::new(at(2, 10)).with_instantaneous("watts", 1.0))
            .unwrap();
        let conn = engine.store().connect().unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_hour BEFORE INSERT ON agg_datum
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();
        let key = MarkerKey::new(meta.stream_id, at(2, 0), HOUR);

        let mut worker = engine.open_worker(0).unwrap();
        assert!(matches!(worker.process_one(HOUR), Err(StaleError::Database(_))));
        assert!(worker.failed_markers().contains(&key));
        assert_eq!(worker.process_one(HOUR).unwrap(), ProcessOutcome::Skipped);

        // Rolled back: marker kept, no cascade markers written
        assert_eq!(engine.store().list_markers(HOUR).unwrap().len(), 1);
        assert!(engine.store().list_markers(DAY).unwrap().is_empty());
    }

    #[test]
    fn test_audit_pipeline_reaches_running_total() {
        let (_dir, engine, meta) = setup("UTC");
        let mut writer = engine.store().datum_writer().unwrap();
        for h in [0, 6, 12] {
            writer
                .store_datum(meta.stream_id, &DatumSamples::new(at(h, 0)).with_instantaneous("watts", 1.0))
                .unwrap();
        }

        let mut worker = engine.open_worker(0).unwrap();
        for kind in StaleKind::LEVEL_ORDER {
            drain(&mut worker, kind);
        }

        let day = at(0, 0);
        let month = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let day_row = engine
            .store()
            .get_audit(meta.stream_id, day, AuditKind::Day)
            .unwrap()
            .unwrap();
        assert_eq!(day_row.datum_count, 3);
        assert_eq!(day_row.usage.prop_count, 3);
        assert_eq!(
            day_row.tier,
            AuditTierCounts::Day {
                hourly_count: 3,
                daily_present: true,
            }
        );

        let total = engine
            .store()
            .get_audit(meta.stream_id, month, AuditKind::RunningTotal)
            .unwrap()
            .unwrap();
        assert_eq!(
            total.tier,
            AuditTierCounts::RunningTotal {
                hourly_count: 3,
                daily_count: 1,
                monthly_count: 1,
            }
        );
        assert_eq!(total.datum_count, 3);

        for kind in StaleKind::LEVEL_ORDER {
            assert!(engine.store().list_markers(kind).unwrap().is_empty(), "{} left", kind);
        }
    }
}
