//! Cascade rules: which markers a completed recompute invalidates
//!
//! ```text
//! Hour aggregate   -> Day aggregate, Audit Hour (same day)
//! Day aggregate    -> Month aggregate, Audit Raw + Hour + Day (same day)
//! Month aggregate  -> Audit Month
//! Audit Day        -> Audit Month
//! Audit Month      -> Audit RunningTotal (this month and every later total)
//! ```

use super::types::{AggregationKind, AuditKind, MarkerKey, StaleKind, StreamId};
use super::windows::bucket_start;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

pub fn after_aggregate(
    stream_id: StreamId,
    bucket: DateTime<Utc>,
    kind: AggregationKind,
    tz: Tz,
) -> Vec<MarkerKey> {
    let day = || bucket_start(bucket, AggregationKind::Day, tz);
    match kind {
        AggregationKind::Hour => vec![
            MarkerKey::new(stream_id, day(), StaleKind::Aggregate(AggregationKind::Day)),
            MarkerKey::new(stream_id, day(), StaleKind::Audit(AuditKind::Hour)),
        ],
        AggregationKind::Day => {
            let month = bucket_start(bucket, AggregationKind::Month, tz);
            vec![
                MarkerKey::new(stream_id, month, StaleKind::Aggregate(AggregationKind::Month)),
                MarkerKey::new(stream_id, bucket, StaleKind::Audit(AuditKind::Raw)),
                MarkerKey::new(stream_id, bucket, StaleKind::Audit(AuditKind::Hour)),
                MarkerKey::new(stream_id, bucket, StaleKind::Audit(AuditKind::Day)),
            ]
        }
        AggregationKind::Month => vec![MarkerKey::new(stream_id, bucket, StaleKind::Audit(AuditKind::Month))],
    }
}

/// `later_totals` are the starts of existing RunningTotal rows after `bucket`
pub fn after_audit(
    stream_id: StreamId,
    bucket: DateTime<Utc>,
    kind: AuditKind,
    tz: Tz,
    later_totals: &[DateTime<Utc>],
) -> Vec<MarkerKey> {
    let total = StaleKind::Audit(AuditKind::RunningTotal);
    match kind {
        AuditKind::Day => vec![MarkerKey::new(
            stream_id,
            bucket_start(bucket, AggregationKind::Month, tz),
            StaleKind::Audit(AuditKind::Month),
        )],
        AuditKind::Month => std::iter::once(bucket)
            .chain(later_totals.iter().copied().filter(|ts| *ts > bucket))
            .map(|ts| MarkerKey::new(stream_id, ts, total))
            .collect(),
        AuditKind::Raw | AuditKind::Hour | AuditKind::RunningTotal => Vec::new(),
    }
}
