//! Core data structures for the rollup engine
//!
//! Streams, raw datum, aggregates, audit rows and the stale markers that
//! drive recomputation.

use super::config::ConfigError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type StreamId = Uuid;

/// Aggregation tier of an aggregate datum
///
/// Ordered finest first: `Hour < Day < Month`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AggregationKind {
    Hour,
    Day,
    Month,
}

impl AggregationKind {
    pub const ALL: [AggregationKind; 3] = [
        AggregationKind::Hour,
        AggregationKind::Day,
        AggregationKind::Month,
    ];

    /// Storage key, as persisted in `agg_kind` columns
    pub fn key(&self) -> &'static str {
        match self {
            AggregationKind::Hour => "h",
            AggregationKind::Day => "d",
            AggregationKind::Month => "M",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "h" => Some(AggregationKind::Hour),
            "d" => Some(AggregationKind::Day),
            "M" => Some(AggregationKind::Month),
            _ => None,
        }
    }

    /// Tier whose rows this tier is computed from (`None` = raw datum)
    pub fn finer(&self) -> Option<AggregationKind> {
        match self {
            AggregationKind::Hour => None,
            AggregationKind::Day => Some(AggregationKind::Hour),
            AggregationKind::Month => Some(AggregationKind::Day),
        }
    }

    /// Tier that consumes this tier's rows
    pub fn coarser(&self) -> Option<AggregationKind> {
        match self {
            AggregationKind::Hour => Some(AggregationKind::Day),
            AggregationKind::Day => Some(AggregationKind::Month),
            AggregationKind::Month => None,
        }
    }
}

/// Audit tier
///
/// `Raw` (the "None" level) only exists as a marker kind: it recounts raw
/// datum into the Day audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AuditKind {
    Raw,
    Hour,
    Day,
    Month,
    RunningTotal,
}

impl AuditKind {
    pub const ALL: [AuditKind; 5] = [
        AuditKind::Raw,
        AuditKind::Hour,
        AuditKind::Day,
        AuditKind::Month,
        AuditKind::RunningTotal,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            AuditKind::Raw => "r",
            AuditKind::Hour => "h",
            AuditKind::Day => "d",
            AuditKind::Month => "M",
            AuditKind::RunningTotal => "a",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "r" => Some(AuditKind::Raw),
            "h" => Some(AuditKind::Hour),
            "d" => Some(AuditKind::Day),
            "M" => Some(AuditKind::Month),
            "a" => Some(AuditKind::RunningTotal),
            _ => None,
        }
    }

    /// Calendar granularity of this kind's marker buckets
    pub fn bucket_granularity(&self) -> AggregationKind {
        match self {
            AuditKind::Raw | AuditKind::Hour | AuditKind::Day => AggregationKind::Day,
            AuditKind::Month | AuditKind::RunningTotal => AggregationKind::Month,
        }
    }
}

/// A unit of stale work: an aggregate tier or an audit tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StaleKind {
    Aggregate(AggregationKind),
    Audit(AuditKind),
}

impl StaleKind {
    /// Order in which a scheduling cycle drains kinds
    pub const LEVEL_ORDER: [StaleKind; 8] = [
        StaleKind::Aggregate(AggregationKind::Hour),
        StaleKind::Aggregate(AggregationKind::Day),
        StaleKind::Aggregate(AggregationKind::Month),
        StaleKind::Audit(AuditKind::Raw),
        StaleKind::Audit(AuditKind::Hour),
        StaleKind::Audit(AuditKind::Day),
        StaleKind::Audit(AuditKind::Month),
        StaleKind::Audit(AuditKind::RunningTotal),
    ];

    pub fn level(&self) -> usize {
        match self {
            StaleKind::Aggregate(kind) => *kind as usize,
            StaleKind::Audit(kind) => AggregationKind::ALL.len() + *kind as usize,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StaleKind::Aggregate(AggregationKind::Hour) => "hour",
            StaleKind::Aggregate(AggregationKind::Day) => "day",
            StaleKind::Aggregate(AggregationKind::Month) => "month",
            StaleKind::Audit(AuditKind::Raw) => "audit-raw",
            StaleKind::Audit(AuditKind::Hour) => "audit-hour",
            StaleKind::Audit(AuditKind::Day) => "audit-day",
            StaleKind::Audit(AuditKind::Month) => "audit-month",
            StaleKind::Audit(AuditKind::RunningTotal) => "audit-total",
        }
    }

    pub fn bucket_granularity(&self) -> AggregationKind {
        match self {
            StaleKind::Aggregate(kind) => *kind,
            StaleKind::Audit(kind) => kind.bucket_granularity(),
        }
    }
}

impl fmt::Display for StaleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StaleKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StaleKind::LEVEL_ORDER
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigError::InvalidValue(format!("unknown stale kind '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Node,
    Location,
}

impl ObjectKind {
    pub fn key(&self) -> &'static str {
        match self {
            ObjectKind::Node => "n",
            ObjectKind::Location => "l",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "n" => Some(ObjectKind::Node),
            "l" => Some(ObjectKind::Location),
            _ => None,
        }
    }
}

/// Property-name schema of a stream; positions never move once assigned
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyNames {
    pub instantaneous: Vec<String>,
    pub accumulating: Vec<String>,
    pub status: Vec<String>,
}

/// Immutable stream identity
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMeta {
    pub stream_id: StreamId,
    pub object_kind: ObjectKind,
    pub object_id: i64,
    pub source_id: String,
    pub names: PropertyNames,
    pub time_zone: Tz,
}

impl StreamMeta {
    /// Metadata used when a marker references a stream the directory no
    /// longer knows about
    pub fn unknown(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            object_kind: ObjectKind::Node,
            object_id: 0,
            source_id: String::new(),
            names: PropertyNames::default(),
            time_zone: Tz::UTC,
        }
    }
}

/// Raw datum, positionally aligned to the stream's property names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    pub stream_id: StreamId,
    pub timestamp: DateTime<Utc>,
    pub instantaneous: Vec<Option<f64>>,
    pub accumulating: Vec<Option<f64>>,
    pub status: Vec<Option<String>>,
    pub tags: Vec<String>,
}

/// Reset of accumulating properties, positionally aligned
///
/// `final_values` are the readings just before the discontinuity,
/// `start_values` the readings just after.
#[derive(Debug, Clone, PartialEq)]
pub struct ResetBoundary {
    pub timestamp: DateTime<Utc>,
    pub final_values: Vec<Option<f64>>,
    pub start_values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstantaneousStats {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub average: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AccumulatingStats {
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub difference: f64,
}

/// Statistics produced by the rollup calculator for one bucket
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateValues {
    pub datum_count: u64,
    pub instantaneous: Vec<Option<InstantaneousStats>>,
    pub accumulating: Vec<AccumulatingStats>,
    pub status: Vec<Option<String>>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDatum {
    pub stream_id: StreamId,
    pub bucket_start: DateTime<Utc>,
    pub kind: AggregationKind,
    pub values: AggregateValues,
}

/// Usage counters shared by every audit row kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounts {
    pub prop_count: i64,
    pub prop_update_count: i64,
    pub query_count: i64,
    pub flux_byte_count: i64,
}

impl UsageCounts {
    pub fn add(&mut self, other: &UsageCounts) {
        self.prop_count += other.prop_count;
        self.prop_update_count += other.prop_update_count;
        self.query_count += other.query_count;
        self.flux_byte_count += other.flux_byte_count;
    }

    pub fn is_empty(&self) -> bool {
        *self == UsageCounts::default()
    }
}

/// Child-tier counters, shaped per audit row kind
///
/// Day rows track presence as a boolean, Month rows track day counts plus a
/// boolean, running totals track counts only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum AuditTierCounts {
    Hour,
    Day {
        hourly_count: i64,
        daily_present: bool,
    },
    Month {
        hourly_count: i64,
        daily_count: i64,
        monthly_present: bool,
    },
    RunningTotal {
        hourly_count: i64,
        daily_count: i64,
        monthly_count: i64,
    },
}

impl AuditTierCounts {
    pub fn kind(&self) -> AuditKind {
        match self {
            AuditTierCounts::Hour => AuditKind::Hour,
            AuditTierCounts::Day { .. } => AuditKind::Day,
            AuditTierCounts::Month { .. } => AuditKind::Month,
            AuditTierCounts::RunningTotal { .. } => AuditKind::RunningTotal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditDatum {
    pub stream_id: StreamId,
    pub bucket_start: DateTime<Utc>,
    pub datum_count: i64,
    pub usage: UsageCounts,
    pub tier: AuditTierCounts,
}

impl AuditDatum {
    pub fn kind(&self) -> AuditKind {
        self.tier.kind()
    }
}

/// Identity of a stale marker row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkerKey {
    pub stream_id: StreamId,
    pub bucket_start: DateTime<Utc>,
    pub kind: StaleKind,
}

impl MarkerKey {
    pub fn new(stream_id: StreamId, bucket_start: DateTime<Utc>, kind: StaleKind) -> Self {
        Self {
            stream_id,
            bucket_start,
            kind,
        }
    }
}

impl fmt::Display for MarkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({})",
            self.stream_id,
            self.bucket_start.to_rfc3339(),
            self.kind
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaleMarker {
    pub stream_id: StreamId,
    pub bucket_start: DateTime<Utc>,
    pub kind: StaleKind,
    pub created_at: DateTime<Utc>,
}

impl StaleMarker {
    pub fn key(&self) -> MarkerKey {
        MarkerKey::new(self.stream_id, self.bucket_start, self.kind)
    }
}

/// Result of one claim attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Processed(MarkerKey),
    /// No pending marker of the requested kind
    NoWork,
    /// Pending markers exist but every one is locked elsewhere
    Skipped,
}
