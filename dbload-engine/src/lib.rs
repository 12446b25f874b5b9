//! A closed-loop load generator for databases fronted by an optional cache.
//!
//! A [`Workload`] describes how many concurrent workers issue which mix of operations for how
//! long. Operations are chosen by a two-level weighted [`OperationSelector`] and target keys drawn
//! from a Zipfian or uniform [`KeyDistribution`]. Each worker owns a [`BackendClient`] and issues
//! its next operation only after the previous one completed.
//!
//! Every operation yields an [`OperationRecord`]. Records are collected by a single task and
//! aggregated into one-second buckets with latency percentiles, error rate and cache hit rate.
//! Records issued during the warmup phase are reported per second but excluded from the overall
//! summary. A [`RecordObserver`] passed to [`run_observed`] additionally sees every record live.
//!
//! Use [`run`] to execute a workload against a [`Backend`]:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use dbload_engine::backend::{Backend, InMemoryStore};
//! use dbload_engine::{Workload, run};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), dbload_engine::RunError> {
//! let workload = Workload::builder("baseline")
//!     .concurrency(8)
//!     .warmup(Duration::from_secs(10))
//!     .duration(Duration::from_secs(60))
//!     .build()?;
//! let backend = Backend::new(InMemoryStore::new(1_000_000));
//!
//! let report = run(&workload, &backend, CancellationToken::new()).await?;
//! println!("{:.1} qps", report.summary.overall.throughput_qps);
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod aggregate;
pub mod backend;
pub mod client;
mod error;
pub mod keys;
pub mod operation;
mod pool;
pub mod record;
pub mod recorder;
pub mod reservoir;
mod runner;
pub mod selector;
pub mod workload;

pub use crate::backend::Backend;
pub use crate::client::BackendClient;
pub use crate::error::{ConfigError, RunError};
pub use crate::keys::KeyDistribution;
pub use crate::operation::{Operation, OperationKind};
pub use crate::pool::WorkerReport;
pub use crate::record::OperationRecord;
pub use crate::recorder::RecordObserver;
pub use crate::runner::{RunReport, run, run_observed};
pub use crate::selector::OperationSelector;
pub use crate::workload::Workload;
