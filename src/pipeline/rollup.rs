//! Rollup calculator
//!
//! Pure computation of aggregate statistics for one bucket from the rows of
//! the next finer tier. No I/O: the storage adapter reads the rows, this module
//! turns them into `AggregateValues`.
//!
//! Accumulating properties:
//! - Hour buckets walk raw readings and reset boundaries in time order. A reset
//!   closes the running segment at its `final` value and opens a new one at its
//!   `start` value; the bucket difference is the sum of per-segment
//!   `last - first`. A reading at the same instant as a reset belongs to the
//!   segment before it.
//! - Day and Month buckets sum child differences and bridge the gap between
//!   consecutive children (`next.start - previous.end`). Child start/end values
//!   already sit on the correct side of any reset, so a bridge never spans one.

use super::types::{
    AccumulatingStats, AggregateDatum, AggregateValues, AggregationKind, Datum,
    InstantaneousStats, ResetBoundary,
};
use super::windows::BucketWindow;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Rows feeding a recompute, tagged by their tier
#[derive(Debug, Clone, Copy)]
pub enum FinerRows<'a> {
    Raw(&'a [Datum]),
    Aggregates(&'a [AggregateDatum]),
}

/// Recompute the statistics of one bucket
///
/// Rows outside `window` are ignored, as are aggregate rows not of the tier
/// directly below `kind`. `resets` only apply to raw input.
pub fn recompute(
    window: &BucketWindow,
    kind: AggregationKind,
    finer: FinerRows<'_>,
    resets: &[ResetBoundary],
) -> AggregateValues {
    match finer {
        FinerRows::Raw(datum) => {
            let mut rows: Vec<&Datum> = datum
                .iter()
                .filter(|d| window.contains(d.timestamp))
                .collect();
            rows.sort_by_key(|d| d.timestamp);
            let mut resets: Vec<&ResetBoundary> = resets
                .iter()
                .filter(|r| window.contains(r.timestamp))
                .collect();
            resets.sort_by_key(|r| r.timestamp);
            rollup_raw(&rows, &resets)
        }
        FinerRows::Aggregates(children) => {
            let child_kind = kind.finer();
            let mut rows: Vec<&AggregateDatum> = children
                .iter()
                .filter(|c| Some(c.kind) == child_kind && window.contains(c.bucket_start))
                .collect();
            rows.sort_by_key(|c| c.bucket_start);
            rollup_aggregates(&rows)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InstantaneousAccumulator {
    count: u64,
    min: f64,
    max: f64,
    sum: f64,
}

impl InstantaneousAccumulator {
    fn new() -> Self {
        Self {
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
        }
    }

    fn add_sample(&mut self, value: f64) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
    }

    fn add_stats(&mut self, stats: &InstantaneousStats) {
        if stats.count == 0 {
            return;
        }
        self.count += stats.count;
        self.min = self.min.min(stats.min);
        self.max = self.max.max(stats.max);
        self.sum += stats.average * stats.count as f64;
    }

    fn finish(&self) -> Option<InstantaneousStats> {
        if self.count == 0 {
            return None;
        }
        Some(InstantaneousStats {
            count: self.count,
            min: self.min,
            max: self.max,
            average: self.sum / self.count as f64,
        })
    }
}

/// Segment walker for one accumulating property
#[derive(Debug, Clone, Copy, Default)]
struct SegmentAccumulator {
    segment_first: Option<f64>,
    segment_last: Option<f64>,
    difference: f64,
    start: Option<f64>,
    end: Option<f64>,
}

impl SegmentAccumulator {
    fn reading(&mut self, value: f64) {
        self.segment_first.get_or_insert(value);
        self.segment_last = Some(value);
        self.start.get_or_insert(value);
        self.end = Some(value);
    }

    fn reset(&mut self, final_value: Option<f64>, start_value: Option<f64>) {
        if let Some(value) = final_value {
            self.reading(value);
        }
        self.close_segment();
        self.segment_first = start_value;
        self.segment_last = start_value;
        if start_value.is_some() {
            self.end = start_value;
        }
    }

    fn close_segment(&mut self) {
        if let (Some(first), Some(last)) = (self.segment_first, self.segment_last) {
            self.difference += last - first;
        }
        self.segment_first = None;
        self.segment_last = None;
    }

    fn finish(mut self) -> AccumulatingStats {
        self.close_segment();
        AccumulatingStats {
            start: self.start,
            end: self.end,
            difference: self.difference,
        }
    }
}

enum AccumulatingEvent<'a> {
    Reading(&'a Datum),
    Reset(&'a ResetBoundary),
}

impl AccumulatingEvent<'_> {
    // Readings sort ahead of a reset at the same instant
    fn sort_key(&self) -> (DateTime<Utc>, u8) {
        match self {
            AccumulatingEvent::Reading(d) => (d.timestamp, 0),
            AccumulatingEvent::Reset(r) => (r.timestamp, 1),
        }
    }
}

fn rollup_raw(rows: &[&Datum], resets: &[&ResetBoundary]) -> AggregateValues {
    let instantaneous_len = rows.iter().map(|d| d.instantaneous.len()).max().unwrap_or(0);
    let accumulating_len = rows
        .iter()
        .map(|d| d.accumulating.len())
        .chain(resets.iter().map(|r| r.final_values.len().max(r.start_values.len())))
        .max()
        .unwrap_or(0);

    let mut instantaneous = vec![InstantaneousAccumulator::new(); instantaneous_len];
    for datum in rows {
        for (acc, value) in instantaneous.iter_mut().zip(datum.instantaneous.iter()) {
            if let Some(v) = value {
                acc.add_sample(*v);
            }
        }
    }

    let mut events: Vec<AccumulatingEvent<'_>> = rows
        .iter()
        .map(|d| AccumulatingEvent::Reading(*d))
        .chain(resets.iter().map(|r| AccumulatingEvent::Reset(*r)))
        .collect();
    events.sort_by_key(|e| e.sort_key());

    let mut accumulating = vec![SegmentAccumulator::default(); accumulating_len];
    for event in &events {
        for (idx, acc) in accumulating.iter_mut().enumerate() {
            match event {
                AccumulatingEvent::Reading(datum) => {
                    if let Some(Some(v)) = datum.accumulating.get(idx) {
                        acc.reading(*v);
                    }
                }
                AccumulatingEvent::Reset(reset) => {
                    let final_value = reset.final_values.get(idx).copied().flatten();
                    let start_value = reset.start_values.get(idx).copied().flatten();
                    if final_value.is_some() || start_value.is_some() {
                        acc.reset(final_value, start_value);
                    }
                }
            }
        }
    }

    let status = latest_status(rows.iter().map(|d| d.status.as_slice()));
    let tags = union_tags(rows.iter().map(|d| d.tags.as_slice()));

    AggregateValues {
        datum_count: rows.len() as u64,
        instantaneous: instantaneous.iter().map(|a| a.finish()).collect(),
        accumulating: accumulating.into_iter().map(|a| a.finish()).collect(),
        status,
        tags,
    }
}

fn rollup_aggregates(children: &[&AggregateDatum]) -> AggregateValues {
    let instantaneous_len = children
        .iter()
        .map(|c| c.values.instantaneous.len())
        .max()
        .unwrap_or(0);
    let accumulating_len = children
        .iter()
        .map(|c| c.values.accumulating.len())
        .max()
        .unwrap_or(0);

    let mut instantaneous = vec![InstantaneousAccumulator::new(); instantaneous_len];
    for child in children {
        for (acc, stats) in instantaneous.iter_mut().zip(child.values.instantaneous.iter()) {
            if let Some(stats) = stats {
                acc.add_stats(stats);
            }
        }
    }

    let accumulating = (0..accumulating_len)
        .map(|idx| {
            let mut result = AccumulatingStats::default();
            let mut previous_end: Option<f64> = None;
            for child in children {
                let Some(stats) = child.values.accumulating.get(idx) else {
                    continue;
                };
                if let (Some(prev), Some(start)) = (previous_end, stats.start) {
                    result.difference += start - prev;
                }
                result.difference += stats.difference;
                if result.start.is_none() {
                    result.start = stats.start.or(stats.end);
                }
                if stats.end.is_some() {
                    previous_end = stats.end;
                    result.end = stats.end;
                }
            }
            result
        })
        .collect();

    AggregateValues {
        datum_count: children.iter().map(|c| c.values.datum_count).sum(),
        instantaneous: instantaneous.iter().map(|a| a.finish()).collect(),
        accumulating,
        status: latest_status(children.iter().map(|c| c.values.status.as_slice())),
        tags: union_tags(children.iter().map(|c| c.values.tags.as_slice())),
    }
}

/// Latest non-null value per status position, rows given oldest first
fn latest_status<'a>(rows: impl Iterator<Item = &'a [Option<String>]>) -> Vec<Option<String>> {
    let mut latest: Vec<Option<String>> = Vec::new();
    for status in rows {
        if status.len() > latest.len() {
            latest.resize(status.len(), None);
        }
        for (slot, value) in latest.iter_mut().zip(status.iter()) {
            if value.is_some() {
                *slot = value.clone();
            }
        }
    }
    latest
}

fn union_tags<'a>(rows: impl Iterator<Item = &'a [String]>) -> Vec<String> {
    rows.flatten()
        .cloned()
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use chrono_tz::Tz;
    use uuid::Uuid;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn datum(stream_id: Uuid, ts: &str, inst: Vec<Option<f64>>, acc: Vec<Option<f64>>) -> Datum {
        Datum {
            stream_id,
            timestamp: utc(ts),
            instantaneous: inst,
            accumulating: acc,
            status: vec![],
            tags: vec![],
        }
    }

    fn hour_window(start: &str) -> BucketWindow {
        BucketWindow::for_bucket(utc(start), AggregationKind::Hour, Tz::UTC)
    }

    #[test]
    fn test_instantaneous_stats() {
        let id = Uuid::new_v4();
        let rows = vec![
            datum(id, "2024-01-01T10:05:00Z", vec![Some(3.0), None], vec![]),
            datum(id, "2024-01-01T10:25:00Z", vec![Some(1.0), Some(7.0)], vec![]),
            datum(id, "2024-01-01T10:45:00Z", vec![Some(5.0)], vec![]),
            // outside the window
            datum(id, "2024-01-01T11:00:00Z", vec![Some(100.0)], vec![]),
        ];
        let values = recompute(
            &hour_window("2024-01-01T10:00:00Z"),
            AggregationKind::Hour,
            FinerRows::Raw(&rows),
            &[],
        );

        assert_eq!(values.datum_count, 3);
        let first = values.instantaneous[0].unwrap();
        assert_eq!(first.count, 3);
        assert_eq!(first.min, 1.0);
        assert_eq!(first.max, 5.0);
        assert_eq!(first.average, 3.0);
        let second = values.instantaneous[1].unwrap();
        assert_eq!(second.count, 1);
        assert_eq!(second.min, 7.0);
    }

    #[test]
    fn test_accumulating_difference_without_reset() {
        let id = Uuid::new_v4();
        let rows = vec![
            datum(id, "2024-01-01T10:00:00Z", vec![], vec![Some(100.0)]),
            datum(id, "2024-01-01T10:30:00Z", vec![], vec![Some(130.0)]),
            datum(id, "2024-01-01T10:59:00Z", vec![], vec![Some(175.0)]),
        ];
        let values = recompute(
            &hour_window("2024-01-01T10:00:00Z"),
            AggregationKind::Hour,
            FinerRows::Raw(&rows),
            &[],
        );
        assert_eq!(
            values.accumulating[0],
            AccumulatingStats {
                start: Some(100.0),
                end: Some(175.0),
                difference: 75.0,
            }
        );
    }

    #[test]
    fn test_reset_splits_segments() {
        let id = Uuid::new_v4();
        let rows = vec![
            datum(id, "2024-01-01T10:00:00Z", vec![], vec![Some(1000.0)]),
            datum(id, "2024-01-01T10:20:00Z", vec![], vec![Some(1010.0)]),
            datum(id, "2024-01-01T10:40:00Z", vec![], vec![Some(5.0)]),
            datum(id, "2024-01-01T10:50:00Z", vec![], vec![Some(12.0)]),
        ];
        let resets = vec![ResetBoundary {
            timestamp: utc("2024-01-01T10:30:00Z"),
            final_values: vec![Some(1015.0)],
            start_values: vec![Some(0.0)],
        }];
        let values = recompute(
            &hour_window("2024-01-01T10:00:00Z"),
            AggregationKind::Hour,
            FinerRows::Raw(&rows),
            &resets,
        );
        // (1015 - 1000) + (12 - 0)
        assert_eq!(values.accumulating[0].difference, 27.0);
        assert_eq!(values.accumulating[0].start, Some(1000.0));
        assert_eq!(values.accumulating[0].end, Some(12.0));
    }

    #[test]
    fn test_multiple_resets_each_break_segment() {
        let id = Uuid::new_v4();
        let rows = vec![
            datum(id, "2024-01-01T10:00:00Z", vec![], vec![Some(50.0)]),
            datum(id, "2024-01-01T10:20:00Z", vec![], vec![Some(3.0)]),
            datum(id, "2024-01-01T10:40:00Z", vec![], vec![Some(8.0)]),
        ];
        let resets = vec![
            ResetBoundary {
                timestamp: utc("2024-01-01T10:10:00Z"),
                final_values: vec![Some(55.0)],
                start_values: vec![Some(1.0)],
            },
            ResetBoundary {
                timestamp: utc("2024-01-01T10:30:00Z"),
                final_values: vec![Some(4.0)],
                start_values: vec![Some(2.0)],
            },
        ];
        let values = recompute(
            &hour_window("2024-01-01T10:00:00Z"),
            AggregationKind::Hour,
            FinerRows::Raw(&rows),
            &resets,
        );
        // (55 - 50) + (4 - 1) + (8 - 2)
        assert_eq!(values.accumulating[0].difference, 14.0);
    }

    #[test]
    fn test_reading_at_reset_instant_belongs_before_reset() {
        let id = Uuid::new_v4();
        let rows = vec![
            datum(id, "2024-01-01T10:00:00Z", vec![], vec![Some(10.0)]),
            datum(id, "2024-01-01T10:30:00Z", vec![], vec![Some(20.0)]),
            datum(id, "2024-01-01T10:45:00Z", vec![], vec![Some(4.0)]),
        ];
        let resets = vec![ResetBoundary {
            timestamp: utc("2024-01-01T10:30:00Z"),
            final_values: vec![Some(20.0)],
            start_values: vec![Some(0.0)],
        }];
        let values = recompute(
            &hour_window("2024-01-01T10:00:00Z"),
            AggregationKind::Hour,
            FinerRows::Raw(&rows),
            &resets,
        );
        assert_eq!(values.accumulating[0].difference, 14.0);
    }

    #[test]
    fn test_empty_bucket_is_zero() {
        let values = recompute(
            &hour_window("2024-01-01T10:00:00Z"),
            AggregationKind::Hour,
            FinerRows::Raw(&[]),
            &[],
        );
        assert_eq!(values, AggregateValues::default());
    }

    fn hour_aggregate(id: Uuid, start: DateTime<Utc>, acc: AccumulatingStats, count: u64) -> AggregateDatum {
        AggregateDatum {
            stream_id: id,
            bucket_start: start,
            kind: AggregationKind::Hour,
            values: AggregateValues {
                datum_count: count,
                instantaneous: vec![Some(InstantaneousStats {
                    count,
                    min: 1.0,
                    max: 2.0 * count as f64,
                    average: count as f64,
                })],
                accumulating: vec![acc],
                status: vec![Some(format!("s{}", count))],
                tags: vec![format!("t{}", count)],
            },
        }
    }

    #[test]
    fn test_day_rollup_bridges_children() {
        let id = Uuid::new_v4();
        let day = utc("2024-01-01T00:00:00Z");
        let children = vec![
            hour_aggregate(
                id,
                day + Duration::hours(1),
                AccumulatingStats { start: Some(10.0), end: Some(15.0), difference: 5.0 },
                2,
            ),
            hour_aggregate(
                id,
                day + Duration::hours(5),
                AccumulatingStats { start: Some(18.0), end: Some(20.0), difference: 2.0 },
                4,
            ),
        ];
        let window = BucketWindow::for_bucket(day, AggregationKind::Day, Tz::UTC);
        let values = recompute(&window, AggregationKind::Day, FinerRows::Aggregates(&children), &[]);

        assert_eq!(values.datum_count, 6);
        // 5 + (18 - 15) + 2
        assert_eq!(values.accumulating[0].difference, 10.0);
        assert_eq!(values.accumulating[0].start, Some(10.0));
        assert_eq!(values.accumulating[0].end, Some(20.0));

        let stats = values.instantaneous[0].unwrap();
        assert_eq!(stats.count, 6);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 8.0);
        // (2 * 2 + 4 * 4) / 6
        assert!((stats.average - 20.0 / 6.0).abs() < 1e-12);
        assert_eq!(values.status, vec![Some("s4".to_string())]);
        assert_eq!(values.tags, vec!["t2".to_string(), "t4".to_string()]);
    }

    #[test]
    fn test_reset_only_hour_does_not_bridge_across_reset() {
        let id = Uuid::new_v4();
        let day = utc("2024-01-01T00:00:00Z");
        // Hour 1 has readings, hour 2 only a reset (final 120, start 0),
        // hour 3 continues from the reset start value
        let reset_hour = {
            let rows: Vec<Datum> = vec![];
            let resets = vec![ResetBoundary {
                timestamp: day + Duration::minutes(130),
                final_values: vec![Some(120.0)],
                start_values: vec![Some(0.0)],
            }];
            let window = BucketWindow::for_bucket(day + Duration::hours(2), AggregationKind::Hour, Tz::UTC);
            recompute(&window, AggregationKind::Hour, FinerRows::Raw(&rows), &resets)
        };
        assert_eq!(reset_hour.accumulating[0].start, Some(120.0));
        assert_eq!(reset_hour.accumulating[0].end, Some(0.0));
        assert_eq!(reset_hour.accumulating[0].difference, 0.0);

        let mut middle = hour_aggregate(id, day + Duration::hours(2), AccumulatingStats::default(), 0);
        middle.values = reset_hour;
        let children = vec![
            hour_aggregate(
                id,
                day + Duration::hours(1),
                AccumulatingStats { start: Some(100.0), end: Some(110.0), difference: 10.0 },
                1,
            ),
            middle,
            hour_aggregate(
                id,
                day + Duration::hours(3),
                AccumulatingStats { start: Some(3.0), end: Some(9.0), difference: 6.0 },
                1,
            ),
        ];
        let window = BucketWindow::for_bucket(day, AggregationKind::Day, Tz::UTC);
        let values = recompute(&window, AggregationKind::Day, FinerRows::Aggregates(&children), &[]);
        // 10 + (120 - 110) + 0 + (3 - 0) + 6
        assert_eq!(values.accumulating[0].difference, 29.0);
    }

    #[test]
    fn test_recompute_is_deterministic() {
        let id = Uuid::new_v4();
        let rows = vec![
            datum(id, "2024-01-01T10:40:00Z", vec![Some(0.1)], vec![Some(1.1)]),
            datum(id, "2024-01-01T10:10:00Z", vec![Some(0.2)], vec![Some(0.3)]),
            datum(id, "2024-01-01T10:20:00Z", vec![Some(0.7)], vec![Some(0.9)]),
        ];
        let window = hour_window("2024-01-01T10:00:00Z");
        let first = recompute(&window, AggregationKind::Hour, FinerRows::Raw(&rows), &[]);
        let mut reversed = rows.clone();
        reversed.reverse();
        let second = recompute(&window, AggregationKind::Hour, FinerRows::Raw(&reversed), &[]);
        assert_eq!(first, second);
        assert_eq!(
            first.instantaneous[0].unwrap().average.to_bits(),
            second.instantaneous[0].unwrap().average.to_bits()
        );
    }
}
