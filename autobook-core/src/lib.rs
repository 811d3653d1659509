//! # Autobook Core
//!
//! Core library for the Autobook monitor: the work item model, distributed
//! locks, persistence, the booking action executor, failure reporting, and
//! the lock-guarded reconciliation worker that ties them together.
//!
//! ## Overview
//!
//! A run of [`worker::ReconciliationWorker`] goes through these steps:
//!
//! - takes the global monitor lock (a single atomic set-if-absent with TTL)
//!   and gives up immediately if another run holds it;
//! - returns stale claims to the queue and fetches eligible work items;
//! - takes a per-item lock, claims the item, calls the action executor
//!   under a timeout and records success or a retry disposition;
//! - releases every lock it took and reports failures without failing the
//!   run.
//!
//! ## Feature Flags
//!
//! - `database`: Postgres repository (sqlx), Redis lock manager, migrations
//!
//! ## Architecture
//!
//! - [`item`]: work items and their lifecycle states
//! - [`lock`]: the lock store contract plus Redis and in-memory stores
//! - [`repository`]: work item persistence
//! - [`executor`]: the per-item side effect
//! - [`reporter`]: failure sinks
//! - [`worker`]: run orchestration, configuration and outcomes
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use autobook_core::{
//!     executor::{HttpActionExecutor, HttpExecutorConfig},
//!     lock::InMemoryLockManager,
//!     reporter::TracingErrorReporter,
//!     repository::InMemoryWorkItemRepository,
//!     worker::{ReconciliationWorker, RunOptions, WorkerConfig},
//! };
//!
//! async fn run_once() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = HttpActionExecutor::new(HttpExecutorConfig::new(
//!         "http://localhost:8080/trigger-booking".parse()?,
//!     ))?;
//!     let worker = ReconciliationWorker::new(
//!         Arc::new(InMemoryLockManager::new()),
//!         Arc::new(InMemoryWorkItemRepository::new()),
//!         Arc::new(executor),
//!         Arc::new(TracingErrorReporter),
//!         WorkerConfig::default(),
//!     );
//!
//!     let outcome = worker.run(RunOptions::default()).await;
//!     println!("processed {} items", outcome.processed());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Error types for locks, persistence, actions and runs
pub mod error;

/// Executors performing the external action per item
pub mod executor;

/// Work item model
pub mod item;

/// Distributed locks
pub mod lock;

/// Failure reporting sinks
pub mod reporter;

/// Work item persistence
pub mod repository;

/// The reconciliation run
pub mod worker;

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use error::{ActionError, LockError, RepositoryError, Result, WorkerError};
pub use item::{FailureDisposition, WorkItem, WorkItemId, WorkItemStatus};
pub use worker::{
    ReconciliationWorker, RunId, RunOptions, RunOutcome, RunStatus,
    WorkerConfig,
};
