//! Audit rollups
//!
//! Pure computation of usage-audit values. Every stale audit kind owns a fixed
//! set of columns on exactly one audit row kind; an `AuditUpdate` carries only
//! those columns so the store can upsert them without touching the rest:
//!
//! | marker kind   | row kind     | owned columns                                  |
//! |---------------|--------------|------------------------------------------------|
//! | Raw           | Day          | datum_count                                    |
//! | Hour          | Day          | hourly_count                                   |
//! | Day           | Day          | daily_present, usage counters                  |
//! | Month         | Month        | all                                            |
//! | RunningTotal  | RunningTotal | all                                            |

use super::types::{AuditDatum, AuditKind, AuditTierCounts, StreamId, UsageCounts};
use super::windows::BucketWindow;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditUpdate {
    RawCount {
        datum_count: i64,
    },
    HourlyCount {
        hourly_count: i64,
    },
    DailySummary {
        daily_present: bool,
        usage: UsageCounts,
    },
    Monthly {
        datum_count: i64,
        hourly_count: i64,
        daily_count: i64,
        monthly_present: bool,
        usage: UsageCounts,
    },
    RunningTotal {
        datum_count: i64,
        hourly_count: i64,
        daily_count: i64,
        monthly_count: i64,
    },
}

impl AuditUpdate {
    /// Marker kind that produces this update
    pub fn owner(&self) -> AuditKind {
        match self {
            AuditUpdate::RawCount { .. } => AuditKind::Raw,
            AuditUpdate::HourlyCount { .. } => AuditKind::Hour,
            AuditUpdate::DailySummary { .. } => AuditKind::Day,
            AuditUpdate::Monthly { .. } => AuditKind::Month,
            AuditUpdate::RunningTotal { .. } => AuditKind::RunningTotal,
        }
    }

    /// Audit row kind whose columns this update writes
    pub fn row_kind(&self) -> AuditKind {
        match self {
            AuditUpdate::RawCount { .. }
            | AuditUpdate::HourlyCount { .. }
            | AuditUpdate::DailySummary { .. } => AuditKind::Day,
            AuditUpdate::Monthly { .. } => AuditKind::Month,
            AuditUpdate::RunningTotal { .. } => AuditKind::RunningTotal,
        }
    }

    /// Merge the owned columns into `existing`, keeping every other column
    pub fn apply(
        &self,
        stream_id: StreamId,
        bucket_start: DateTime<Utc>,
        existing: Option<AuditDatum>,
    ) -> AuditDatum {
        let mut row = existing.unwrap_or_else(|| empty_row(stream_id, bucket_start, self.row_kind()));
        match *self {
            AuditUpdate::RawCount { datum_count } => row.datum_count = datum_count,
            AuditUpdate::HourlyCount { hourly_count } => {
                if let AuditTierCounts::Day { hourly_count: slot, .. } = &mut row.tier {
                    *slot = hourly_count;
                }
            }
            AuditUpdate::DailySummary { daily_present, usage } => {
                if let AuditTierCounts::Day { daily_present: slot, .. } = &mut row.tier {
                    *slot = daily_present;
                }
                row.usage = usage;
            }
            AuditUpdate::Monthly {
                datum_count,
                hourly_count,
                daily_count,
                monthly_present,
                usage,
            } => {
                row.datum_count = datum_count;
                row.usage = usage;
                row.tier = AuditTierCounts::Month {
                    hourly_count,
                    daily_count,
                    monthly_present,
                };
            }
            AuditUpdate::RunningTotal {
                datum_count,
                hourly_count,
                daily_count,
                monthly_count,
            } => {
                row.datum_count = datum_count;
                row.tier = AuditTierCounts::RunningTotal {
                    hourly_count,
                    daily_count,
                    monthly_count,
                };
            }
        }
        row
    }
}

/// All-zero row of the given kind
pub fn empty_row(stream_id: StreamId, bucket_start: DateTime<Utc>, kind: AuditKind) -> AuditDatum {
    let tier = match kind {
        AuditKind::Raw | AuditKind::Hour => AuditTierCounts::Hour,
        AuditKind::Day => AuditTierCounts::Day {
            hourly_count: 0,
            daily_present: false,
        },
        AuditKind::Month => AuditTierCounts::Month {
            hourly_count: 0,
            daily_count: 0,
            monthly_present: false,
        },
        AuditKind::RunningTotal => AuditTierCounts::RunningTotal {
            hourly_count: 0,
            daily_count: 0,
            monthly_count: 0,
        },
    };
    AuditDatum {
        stream_id,
        bucket_start,
        datum_count: 0,
        usage: UsageCounts::default(),
        tier,
    }
}

/// Raw datum count for a day
pub fn raw_count(window: &BucketWindow, raw_timestamps: &[DateTime<Utc>]) -> AuditUpdate {
    AuditUpdate::RawCount {
        datum_count: raw_timestamps.iter().filter(|ts| window.contains(**ts)).count() as i64,
    }
}

/// Number of Hour aggregate rows in a day
pub fn hourly_count(window: &BucketWindow, hour_starts: &[DateTime<Utc>]) -> AuditUpdate {
    AuditUpdate::HourlyCount {
        hourly_count: hour_starts.iter().filter(|ts| window.contains(**ts)).count() as i64,
    }
}

/// Day presence plus usage summed over the day's Hour usage rows
pub fn daily_summary(window: &BucketWindow, day_aggregate_present: bool, usage_rows: &[AuditDatum]) -> AuditUpdate {
    let mut usage = UsageCounts::default();
    for row in usage_rows
        .iter()
        .filter(|r| r.kind() == AuditKind::Hour && window.contains(r.bucket_start))
    {
        usage.add(&row.usage);
    }
    AuditUpdate::DailySummary {
        daily_present: day_aggregate_present,
        usage,
    }
}

/// Month row summed from the month's Day audit rows
pub fn monthly_rollup(window: &BucketWindow, day_rows: &[AuditDatum], month_aggregate_present: bool) -> AuditUpdate {
    let mut datum_count = 0;
    let mut hourly = 0;
    let mut daily = 0;
    let mut usage = UsageCounts::default();
    for row in day_rows.iter().filter(|r| window.contains(r.bucket_start)) {
        if let AuditTierCounts::Day {
            hourly_count,
            daily_present,
        } = row.tier
        {
            datum_count += row.datum_count;
            hourly += hourly_count;
            if daily_present {
                daily += 1;
            }
            usage.add(&row.usage);
        }
    }
    AuditUpdate::Monthly {
        datum_count,
        hourly_count: hourly,
        daily_count: daily,
        monthly_present: month_aggregate_present,
        usage,
    }
}

/// Running totals over every Month audit row at or before `bucket_start`
pub fn running_total(bucket_start: DateTime<Utc>, month_rows: &[AuditDatum]) -> AuditUpdate {
    let mut datum_count = 0;
    let mut hourly = 0;
    let mut daily = 0;
    let mut monthly = 0;
    for row in month_rows.iter().filter(|r| r.bucket_start <= bucket_start) {
        if let AuditTierCounts::Month {
            hourly_count,
            daily_count,
            monthly_present,
        } = row.tier
        {
            datum_count += row.datum_count;
            hourly += hourly_count;
            daily += daily_count;
            if monthly_present {
                monthly += 1;
            }
        }
    }
    AuditUpdate::RunningTotal {
        datum_count,
        hourly_count: hourly,
        daily_count: daily,
        monthly_count: monthly,
    }
}
