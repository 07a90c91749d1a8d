//! Stale processing scheduler
//!
//! Each cycle drains the configured kinds strictly in level order (Hour, Day,
//! Month, then the audit tiers) so that a coarser tier always sees the rows
//! its finer tier just produced.

use super::config::ConfigError;
use super::coordinator::{RunOptions, RunReport, TaskCoordinator, WorkerFactory};
use super::types::StaleKind;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Run one coordinator pass per kind, lowest level first
pub async fn run_cycle<F: WorkerFactory>(
    coordinator: &TaskCoordinator<F>,
    kinds: &[StaleKind],
    options: RunOptions,
) -> Result<Vec<RunReport>, ConfigError> {
    options.validate()?;

    let mut ordered = kinds.to_vec();
    ordered.sort_by_key(|k| k.level());
    ordered.dedup();

    let mut reports = Vec::with_capacity(ordered.len());
    for kind in ordered {
        let report = coordinator.run(kind, options).await?;
        if report.tally.processed > 0 || report.tally.failures > 0 {
            log::info!(
                "   ├─ {}: {} processed, {} failed, {} skipped ({:?})",
                kind,
                report.tally.processed,
                report.tally.failures,
                report.tally.skipped,
                report.elapsed
            );
        }
        if !report.all_completed {
            log::warn!("   ├─ ⚠️  {} run did not complete", kind);
        }
        reports.push(report);
    }
    Ok(reports)
}

/// Scheduler task - repeat `run_cycle` every `interval_ms` until `shutdown`
///
/// A notification sent while a cycle is running is kept and stops the loop
/// right after that cycle.
pub async fn scheduler_task<F: WorkerFactory>(
    coordinator: Arc<TaskCoordinator<F>>,
    kinds: Vec<StaleKind>,
    options: RunOptions,
    interval_ms: u64,
    shutdown: Arc<Notify>,
) -> Result<(), ConfigError> {
    log::info!("⏰ Starting stale scheduler (interval: {}ms)", interval_ms);
    log::info!(
        "   └─ Kinds: {}",
        kinds.iter().map(|k| k.name()).collect::<Vec<_>>().join(", ")
    );

    let mut timer = interval(Duration::from_millis(interval_ms));
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycles = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            _ = timer.tick() => {}
        }

        cycles += 1;
        let reports = run_cycle(coordinator.as_ref(), &kinds, options).await?;
        let processed: usize = reports.iter().map(|r| r.tally.processed).sum();
        if processed > 0 {
            log::info!("✅ Cycle {} processed {} markers", cycles, processed);
        } else {
            log::debug!("Cycle {}: nothing stale", cycles);
        }
    }

    log::info!("⏰ Stale scheduler stopped after {} cycles", cycles);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::coordinator::StaleProcessor;
    use crate::pipeline::error::StaleError;
    use crate::pipeline::types::{AggregationKind, AuditKind, ProcessOutcome};
    use std::sync::Mutex;
    use std::time::Instant;

    /// Records which kinds were asked for, in order
    struct RecordingFactory {
        seen: Arc<Mutex<Vec<StaleKind>>>,
    }

    struct RecordingWorker {
        seen: Arc<Mutex<Vec<StaleKind>>>,
    }

    impl StaleProcessor for RecordingWorker {
        fn process_one(&mut self, kind: StaleKind) -> Result<ProcessOutcome, StaleError> {
            self.seen.lock().unwrap().push(kind);
            Ok(ProcessOutcome::NoWork)
        }
    }

    impl WorkerFactory for RecordingFactory {
        type Worker = RecordingWorker;

        fn open_worker(&self, _worker_id: usize) -> Result<RecordingWorker, StaleError> {
            Ok(RecordingWorker {
                seen: Arc::clone(&self.seen),
            })
        }
    }

    #[tokio::test]
    async fn test_cycle_runs_in_level_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let coordinator = TaskCoordinator::new(Arc::new(RecordingFactory {
            seen: Arc::clone(&seen),
        }));
        let options = RunOptions {
            max_iterations_per_worker: 10,
            parallelism: 1,
            wall_clock_timeout: Duration::from_secs(5),
        };
        let kinds = vec![
            StaleKind::Audit(AuditKind::Month),
            StaleKind::Aggregate(AggregationKind::Month),
            StaleKind::Aggregate(AggregationKind::Hour),
            StaleKind::Audit(AuditKind::Raw),
        ];

        let reports = run_cycle(&coordinator, &kinds, options).await.unwrap();
        assert_eq!(reports.len(), 4);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                StaleKind::Aggregate(AggregationKind::Hour),
                StaleKind::Aggregate(AggregationKind::Month),
                StaleKind::Audit(AuditKind::Raw),
                StaleKind::Audit(AuditKind::Month),
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_does_not_wait_for_next_tick() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let coordinator = Arc::new(TaskCoordinator::new(Arc::new(RecordingFactory {
            seen: Arc::clone(&seen),
        })));
        let options = RunOptions {
            max_iterations_per_worker: 10,
            parallelism: 1,
            wall_clock_timeout: Duration::from_secs(5),
        };
        let shutdown = Arc::new(Notify::new());

        let handle = tokio::spawn(scheduler_task(
            coordinator,
            vec![StaleKind::Aggregate(AggregationKind::Hour)],
            options,
            3_600_000,
            Arc::clone(&shutdown),
        ));

        // First tick fires immediately; wait for that cycle
        while seen.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let started = Instant::now();
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
