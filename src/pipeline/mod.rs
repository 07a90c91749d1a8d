//! # Stale-Marker Rollup Pipeline
//!
//! Keeps hourly, daily and monthly aggregates and usage-audit counters of
//! time-series streams current as raw datum arrives, is corrected or deleted.
//!
//! ## Architecture
//!
//! ```text
//! raw write (DatumWriter)
//!     ↓  same transaction
//! Hour stale marker
//!     ↓  scheduler cycle, level order
//! TaskCoordinator::run(kind) ── N × StaleWorker::process_one
//!     ↓  claim → recompute → upsert → delete marker → cascade
//! Day / Month markers, then Audit Raw / Hour / Day / Month / RunningTotal
//!     ↓  after commit
//! SolarFlux publisher (best effort)
//! ```
//!
//! **Key Principle:** a bucket only becomes fresh through a recompute of its
//! claimed marker, and a marker is consumed in the same transaction as the row
//! it refreshes.
//!
//! ## Module Organization
//!
//! - `types` - Streams, datum, aggregate/audit rows, marker keys
//! - `windows` - Calendar bucket windows in the stream's time zone
//! - `rollup` - Aggregate statistics calculator (pure)
//! - `audit` - Audit counter calculator and column ownership (pure)
//! - `cascade` - Marker fan-out rules (pure)
//! - `db` - SQLite schema, row reads and upserts, marker tables
//! - `locks` - Non-blocking marker row locks
//! - `ingestion` - Stream directory and mark-dirty writes
//! - `engine` - Claim/process worker
//! - `coordinator` - Parallel worker pool with budget and timeout
//! - `scheduler` - Level-ordered cycles on an interval
//! - `flux` - SolarFlux publication seam
//! - `usage` - Query and publication usage tally
//! - `config` / `error` - Environment configuration and error types

pub mod audit;
pub mod cascade;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod flux;
pub mod ingestion;
pub mod locks;
pub mod rollup;
pub mod scheduler;
pub mod types;
pub mod usage;
pub mod windows;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use coordinator::{RunOptions, RunReport, StaleProcessor, TaskCoordinator, WorkerFactory};
pub use db::StaleStore;
pub use engine::{StaleEngine, StaleWorker};
pub use error::StaleError;
pub use flux::{FluxPublisher, FluxSender, FluxUpdate, LogFluxPublisher};
pub use ingestion::{DatumSamples, DatumWriter};
pub use types::{
    AggregateDatum, AggregationKind, AuditDatum, AuditKind, AuditTierCounts, MarkerKey,
    ObjectKind, ProcessOutcome, StaleKind, StreamId, StreamMeta,
};
pub use usage::UsageTally;
