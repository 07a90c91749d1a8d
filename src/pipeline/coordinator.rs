//! Parallel task coordinator
//!
//! Runs `parallelism` blocking workers that each drain markers of one kind
//! until there is nothing claimable, their iteration budget is spent, or the
//! run's wall-clock deadline passes. On timeout the stop flag is raised and the
//! remaining workers are abandoned; whatever transaction they are inside still
//! commits or rolls back as a unit.

use super::config::ConfigError;
use super::error::StaleError;
use super::types::{ProcessOutcome, StaleKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One claim-process step against the store
pub trait StaleProcessor {
    fn process_one(&mut self, kind: StaleKind) -> Result<ProcessOutcome, StaleError>;
}

/// Opens a fresh worker (own connection, own caches) per pool slot
pub trait WorkerFactory: Send + Sync + 'static {
    type Worker: StaleProcessor + Send + 'static;

    fn open_worker(&self, worker_id: usize) -> Result<Self::Worker, StaleError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub max_iterations_per_worker: usize,
    pub parallelism: usize,
    pub wall_clock_timeout: Duration,
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism == 0 {
            return Err(ConfigError::InvalidValue(
                "parallelism must be at least 1".to_string(),
            ));
        }
        if self.max_iterations_per_worker == 0 {
            return Err(ConfigError::InvalidValue(
                "max iterations per worker must be at least 1".to_string(),
            ));
        }
        if self.wall_clock_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "wall-clock timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerTally {
    pub processed: usize,
    pub skipped: usize,
    pub failures: usize,
}

impl WorkerTally {
    fn merge(&mut self, other: &WorkerTally) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.failures += other.failures;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub kind: StaleKind,
    /// Every worker started and was joined before the deadline
    pub all_completed: bool,
    pub timed_out: bool,
    pub tally: WorkerTally,
    pub elapsed: Duration,
}

pub struct TaskCoordinator<F: WorkerFactory> {
    factory: Arc<F>,
}

impl<F: WorkerFactory> TaskCoordinator<F> {
    pub fn new(factory: Arc<F>) -> Self {
        Self { factory }
    }

    pub fn factory(&self) -> &Arc<F> {
        &self.factory
    }

    /// Drain markers of `kind` with a pool of workers
    ///
    /// Options are validated before any worker starts. Individual marker
    /// failures are counted in the report, never returned as an error.
    pub async fn run(&self, kind: StaleKind, options: RunOptions) -> Result<RunReport, ConfigError> {
        options.validate()?;

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + options.wall_clock_timeout;
        let stop = Arc::new(AtomicBool::new(false));

        log::debug!(
            "🔄 Run {} (workers: {}, budget: {}, timeout: {:?})",
            kind,
            options.parallelism,
            options.max_iterations_per_worker,
            options.wall_clock_timeout
        );

        let handles: Vec<_> = (0..options.parallelism)
            .map(|worker_id| {
                let factory = Arc::clone(&self.factory);
                let stop = Arc::clone(&stop);
                let budget = options.max_iterations_per_worker;
                tokio::task::spawn_blocking(move || -> Result<WorkerTally, StaleError> {
                    let mut worker = factory.open_worker(worker_id)?;
                    Ok(drain_worker(&mut worker, kind, budget, &stop))
                })
            })
            .collect();

        let mut report = RunReport {
            kind,
            all_completed: true,
            timed_out: false,
            tally: WorkerTally::default(),
            elapsed: Duration::ZERO,
        };

        for (worker_id, handle) in handles.into_iter().enumerate() {
            if report.timed_out {
                // Abandoned: the worker sees the stop flag after its current step
                drop(handle);
                continue;
            }
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(tally))) => report.tally.merge(&tally),
                Ok(Ok(Err(e))) => {
                    log::error!("❌ Worker {} could not start: {}", worker_id, e);
                    report.all_completed = false;
                }
                Ok(Err(e)) => {
                    log::error!("❌ Worker {} panicked: {}", worker_id, e);
                    report.all_completed = false;
                }
                Err(_) => {
                    log::warn!("⏱️  Run {} hit its {:?} timeout", kind, options.wall_clock_timeout);
                    stop.store(true, Ordering::SeqCst);
                    report.timed_out = true;
                    report.all_completed = false;
                }
            }
        }

        report.elapsed = started.elapsed();
        Ok(report)
    }
}

/// Loop `process_one` until no claimable work, budget spent, or stop
pub fn drain_worker<W: StaleProcessor>(
    worker: &mut W,
    kind: StaleKind,
    budget: usize,
    stop: &AtomicBool,
) -> WorkerTally {
    let mut tally = WorkerTally::default();

    for _ in 0..budget {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match worker.process_one(kind) {
            Ok(ProcessOutcome::Processed(key)) => {
                log::debug!("✅ Processed {}", key);
                tally.processed += 1;
            }
            Ok(ProcessOutcome::NoWork) => break,
            Ok(ProcessOutcome::Skipped) => {
                tally.skipped += 1;
                break;
            }
            Err(e) => {
                if e.is_transient() {
                    log::warn!("⚠️  Transient failure on {}: {}", kind, e);
                } else {
                    log::error!("❌ Failed to process {}: {}", kind, e);
                }
                tally.failures += 1;
            }
        }
    }

    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{AggregationKind, MarkerKey};
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use uuid::Uuid;

    const HOUR: StaleKind = StaleKind::Aggregate(AggregationKind::Hour);

    /// Shared queue standing in for the marker table
    struct QueueFactory {
        queue: Arc<Mutex<VecDeque<MarkerKey>>>,
        claimed: Arc<Mutex<Vec<MarkerKey>>>,
        fail_open: bool,
        step_delay: Duration,
        failing: Option<MarkerKey>,
    }

    struct QueueWorker {
        queue: Arc<Mutex<VecDeque<MarkerKey>>>,
        claimed: Arc<Mutex<Vec<MarkerKey>>>,
        step_delay: Duration,
        failing: Option<MarkerKey>,
    }

    impl StaleProcessor for QueueWorker {
        fn process_one(&mut self, _kind: StaleKind) -> Result<ProcessOutcome, StaleError> {
            std::thread::sleep(self.step_delay);
            let next = self.queue.lock().unwrap().pop_front();
            match next {
                Some(key) if Some(key) == self.failing => {
                    Err(StaleError::Transient(format!("{} is locked by a long transaction", key)))
                }
                Some(key) => {
                    self.claimed.lock().unwrap().push(key);
                    Ok(ProcessOutcome::Processed(key))
                }
                None => Ok(ProcessOutcome::NoWork),
            }
        }
    }

    impl WorkerFactory for QueueFactory {
        type Worker = QueueWorker;

        fn open_worker(&self, _worker_id: usize) -> Result<QueueWorker, StaleError> {
            if self.fail_open {
                return Err(StaleError::Transient("connection refused".to_string()));
            }
            Ok(QueueWorker {
                queue: Arc::clone(&self.queue),
                claimed: Arc::clone(&self.claimed),
                step_delay: self.step_delay,
                failing: self.failing,
            })
        }
    }

    fn factory(markers: usize, fail_open: bool, step_delay: Duration) -> Arc<QueueFactory> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let queue = (0..markers)
            .map(|i| MarkerKey::new(Uuid::new_v4(), base + chrono::Duration::hours(i as i64), HOUR))
            .collect();
        Arc::new(QueueFactory {
            queue: Arc::new(Mutex::new(queue)),
            claimed: Arc::new(Mutex::new(Vec::new())),
            fail_open,
            step_delay,
            failing: None,
        })
    }

    fn options(parallelism: usize, budget: usize) -> RunOptions {
        RunOptions {
            max_iterations_per_worker: budget,
            parallelism,
            wall_clock_timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_workers_never_claim_twice() {
        let factory = factory(50, false, Duration::ZERO);
        let coordinator = TaskCoordinator::new(Arc::clone(&factory));

        let report = coordinator.run(HOUR, options(4, 100)).await.unwrap();
        assert!(report.all_completed);
        assert_eq!(report.tally.processed, 50);

        let claimed = factory.claimed.lock().unwrap();
        let unique: std::collections::HashSet<_> = claimed.iter().collect();
        assert_eq!(unique.len(), claimed.len());
    }

    #[tokio::test]
    async fn test_failing_marker_does_not_stop_the_run() {
        let mut queue = factory(10, false, Duration::ZERO);
        let failing_key = queue.queue.lock().unwrap()[3];
        Arc::get_mut(&mut queue).unwrap().failing = Some(failing_key);
        let coordinator = TaskCoordinator::new(Arc::clone(&queue));

        let report = coordinator.run(HOUR, options(2, 100)).await.unwrap();
        assert!(report.all_completed);
        assert_eq!(report.tally.processed, 9);
        assert_eq!(report.tally.failures, 1);
        assert!(!queue.claimed.lock().unwrap().contains(&failing_key));
        assert!(queue.queue.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_budget_caps_each_worker() {
        let factory = factory(50, false, Duration::ZERO);
        let coordinator = TaskCoordinator::new(Arc::clone(&factory));

        let report = coordinator.run(HOUR, options(2, 5)).await.unwrap();
        assert_eq!(report.tally.processed, 10);
        assert_eq!(factory.queue.lock().unwrap().len(), 40);
    }

    #[tokio::test]
    async fn test_failed_pool_start_reports_incomplete() {
        let coordinator = TaskCoordinator::new(factory(3, true, Duration::ZERO));
        let report = coordinator.run(HOUR, options(2, 10)).await.unwrap();
        assert!(!report.all_completed);
        assert_eq!(report.tally.processed, 0);
    }

    #[tokio::test]
    async fn test_timeout_abandons_workers() {
        let coordinator = TaskCoordinator::new(factory(1_000, false, Duration::from_millis(20)));
        let report = coordinator
            .run(
                HOUR,
                RunOptions {
                    max_iterations_per_worker: 1_000,
                    parallelism: 1,
                    wall_clock_timeout: Duration::from_millis(100),
                },
            )
            .await
            .unwrap();
        assert!(report.timed_out);
        assert!(!report.all_completed);
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_before_work() {
        let factory = factory(5, false, Duration::ZERO);
        let coordinator = TaskCoordinator::new(Arc::clone(&factory));
        assert!(coordinator.run(HOUR, options(0, 10)).await.is_err());
        assert!(coordinator
            .run(
                HOUR,
                RunOptions {
                    wall_clock_timeout: Duration::ZERO,
                    ..options(1, 10)
                }
            )
            .await
            .is_err());
        assert_eq!(factory.queue.lock().unwrap().len(), 5);
    }
}
