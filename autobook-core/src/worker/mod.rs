//! The lock-guarded reconciliation run.
//!
//! A run takes the global monitor lock, returns stale claims to the queue,
//! fetches eligible items and, for each one, takes an item lock, claims the
//! item, executes the action and records the result. Every lock taken is
//! released before the run returns, and no item failure escapes the run.
//! Failures go to the [`ErrorReporter`] with the run and item they belong to.

mod config;
mod outcome;

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use futures::stream::{self, StreamExt};
use tracing::{Span, debug, field, info, instrument, warn};

use crate::error::ActionError;
use crate::executor::ActionExecutor;
use crate::item::{FailureDisposition, WorkItem};
use crate::lock::{LockKeys, LockLease, LockManager, acquire_with_retry};
use crate::reporter::{ErrorReporter, FailureReport, FailureStage};
use crate::repository::{StaleClaimSweep, WorkItemRepository};

pub use config::{RetryPolicy, WorkerConfig};
pub use outcome::{
    FailedItem, RunId, RunOutcome, RunStatus, SkipReason, SkippedItem,
};

/// Per-invocation overrides.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Log the intended action per item without executing or writing.
    pub dry_run: bool,
    /// Overrides `max_items_per_run` for this run.
    pub max_items: Option<usize>,
}

enum ItemResult {
    Planned(crate::item::WorkItemId),
    Skipped(SkippedItem),
    Succeeded(crate::item::WorkItemId),
    Failed { failure: FailedItem, attempted: bool },
}

impl RunOutcome {
    fn record(&mut self, result: ItemResult) {
        match result {
            ItemResult::Planned(id) => self.planned.push(id),
            ItemResult::Skipped(skipped) => self.skipped.push(skipped),
            ItemResult::Succeeded(id) => {
                self.attempted.push(id.clone());
                self.succeeded.push(id);
            }
            ItemResult::Failed { failure, attempted } => {
                if attempted {
                    self.attempted.push(failure.id.clone());
                }
                self.failed.push(failure);
            }
        }
    }
}

pub struct ReconciliationWorker {
    locks: Arc<dyn LockManager>,
    repository: Arc<dyn WorkItemRepository>,
    executor: Arc<dyn ActionExecutor>,
    reporter: Arc<dyn ErrorReporter>,
    config: WorkerConfig,
    keys: LockKeys,
}

impl fmt::Debug for ReconciliationWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationWorker")
            .field("config", &self.config)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl ReconciliationWorker {
    pub fn new(
        locks: Arc<dyn LockManager>,
        repository: Arc<dyn WorkItemRepository>,
        executor: Arc<dyn ActionExecutor>,
        reporter: Arc<dyn ErrorReporter>,
        config: WorkerConfig,
    ) -> Self {
        let keys = config.lock_keys();
        Self {
            locks,
            repository,
            executor,
            reporter,
            config,
            keys,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn keys(&self) -> &LockKeys {
        &self.keys
    }

    /// Execute one run. Never fails: every problem is reported and reflected
    /// in the returned [`RunOutcome`].
    ///
    /// Dropping this future part-way skips lock release and can leave a
    /// claimed item `LOCKED`; await it to completion or use
    /// [`ReconciliationWorker::spawn_run`].
    #[instrument(
        name = "reconcile.run",
        skip(self, options),
        fields(run_id = field::Empty, dry_run = options.dry_run)
    )]
    pub async fn run(&self, options: RunOptions) -> RunOutcome {
        let run_id = RunId::new();
        Span::current().record("run_id", field::display(run_id));

        let mut outcome = RunOutcome::begin(run_id, options.dry_run);
        let global_key = self.keys.global();

        let lease = match self
            .locks
            .try_acquire(&global_key, self.config.global_lock_ttl())
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(lock.key = %global_key, "another run is in progress");
                return outcome.finish(RunStatus::LockBusy);
            }
            Err(err) => {
                self.report(
                    FailureReport::new(
                        run_id,
                        FailureStage::GlobalLock,
                        format!("could not acquire monitor lock: {err}"),
                    )
                    .retryable(true),
                )
                .await;
                return outcome.finish(RunStatus::LockUnavailable);
            }
        };

        let status = tokio::select! {
            status = self.process_batch(run_id, options, &mut outcome) => status,
            never = self.keep_alive(run_id, &lease) => match never {},
        };

        if let Err(err) = self.locks.release(&lease).await {
            self.report(
                FailureReport::new(
                    run_id,
                    FailureStage::Release,
                    format!("failed to release monitor lock: {err}"),
                )
                .retryable(true),
            )
            .await;
        }

        let outcome = outcome.finish(status);
        info!(
            status = ?outcome.status,
            processed = outcome.processed(),
            succeeded = outcome.succeeded.len(),
            skipped = outcome.skipped_count(),
            errors = outcome.errors(),
            requeued = outcome.requeued,
            stale_failed = outcome.stale_failed,
            duration_ms = outcome.duration_ms,
            "monitor run finished"
        );
        outcome
    }

    /// Run on a separate task. Dropping the returned handle does not stop
    /// the run, so the locks it takes are still released and a claimed item
    /// is still resolved. Triggers whose future may be dropped (an HTTP
    /// request whose client went away) go through here.
    pub fn spawn_run(
        self: &Arc<Self>,
        options: RunOptions,
    ) -> JoinHandle<RunOutcome> {
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.run(options).await })
    }

    /// Round-trip the lock store and the repository without touching any
    /// item. Used by health checks.
    pub async fn check_dependencies(&self) -> crate::Result<()> {
        let probe_key = format!("{}:health", self.keys.global());
        if let Some(lease) = self
            .locks
            .try_acquire(&probe_key, std::time::Duration::from_secs(5))
            .await?
        {
            self.locks.release(&lease).await?;
        }
        self.repository.find_eligible(Utc::now(), 1).await?;
        Ok(())
    }

    async fn process_batch(
        &self,
        run_id: RunId,
        options: RunOptions,
        outcome: &mut RunOutcome,
    ) -> RunStatus {
        if !options.dry_run {
            let sweep = self.sweep_stale_claims(run_id).await;
            outcome.requeued = sweep.requeued;
            outcome.stale_failed = sweep.failed;
        }

        let limit = options.max_items.unwrap_or(self.config.max_items_per_run);
        let items = match self.repository.find_eligible(Utc::now(), limit).await
        {
            Ok(items) => items,
            Err(err) => {
                self.report(
                    FailureReport::new(
                        run_id,
                        FailureStage::Fetch,
                        format!("failed to fetch eligible items: {err}"),
                    )
                    .retryable(true),
                )
                .await;
                return RunStatus::Aborted;
            }
        };

        info!(count = items.len(), limit, "found eligible work items");

        let concurrency = self.config.concurrency.max(1);
        let results: Vec<ItemResult> = stream::iter(items)
            .map(|item| self.process_item(run_id, options.dry_run, item))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for result in results {
            outcome.record(result);
        }
        RunStatus::Completed
    }

    async fn sweep_stale_claims(&self, run_id: RunId) -> StaleClaimSweep {
        let window = chrono::Duration::from_std(self.config.stale_claim_after())
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        match self
            .repository
            .requeue_stale(cutoff, self.config.retry.max_attempts)
            .await
        {
            Ok(sweep) => {
                if sweep.total() > 0 {
                    info!(
                        requeued = sweep.requeued,
                        failed = sweep.failed,
                        "resolved stale claims"
                    );
                }
                sweep
            }
            Err(err) => {
                self.report(
                    FailureReport::new(
                        run_id,
                        FailureStage::Housekeeping,
                        format!("stale claim requeue failed: {err}"),
                    )
                    .retryable(true),
                )
                .await;
                StaleClaimSweep::default()
            }
        }
    }

    #[instrument(
        name = "reconcile.item",
        skip_all,
        fields(item_id = %item.id, attempts = item.attempts)
    )]
    async fn process_item(
        &self,
        run_id: RunId,
        dry_run: bool,
        item: WorkItem,
    ) -> ItemResult {
        let key = self.keys.item(&item.id);
        let lease = match acquire_with_retry(
            self.locks.as_ref(),
            &key,
            self.config.item_lock_ttl(),
            self.config.item_lock_retry,
        )
        .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!("item lock held elsewhere, skipping");
                return ItemResult::Skipped(SkippedItem {
                    id: item.id,
                    reason: SkipReason::LockContended,
                });
            }
            Err(err) => {
                self.report(
                    FailureReport::new(
                        run_id,
                        FailureStage::ItemLock,
                        format!("could not acquire item lock: {err}"),
                    )
                    .for_item(&item.id)
                    .retryable(true),
                )
                .await;
                return ItemResult::Skipped(SkippedItem {
                    id: item.id,
                    reason: SkipReason::LockUnavailable,
                });
            }
        };

        let result = if dry_run {
            info!(payload = %item.payload, "dry run: would trigger action");
            ItemResult::Planned(item.id.clone())
        } else {
            self.claim_and_execute(run_id, &item).await
        };

        self.release_item(run_id, &item, &lease).await;
        result
    }

    async fn claim_and_execute(&self, run_id: RunId, item: &WorkItem) -> ItemResult {
        match self.repository.claim(&item.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("item no longer pending, skipping");
                return ItemResult::Skipped(SkippedItem {
                    id: item.id.clone(),
                    reason: SkipReason::AlreadyClaimed,
                });
            }
            Err(err) => {
                let message = format!("failed to claim item: {err}");
                self.report(
                    FailureReport::new(run_id, FailureStage::Claim, &message)
                        .for_item(&item.id)
                        .retryable(true),
                )
                .await;
                return ItemResult::Failed {
                    failure: FailedItem {
                        id: item.id.clone(),
                        error: message,
                        retryable: true,
                    },
                    attempted: false,
                };
            }
        }

        let timeout = self.config.item_timeout();
        let result =
            match tokio::time::timeout(timeout, self.executor.execute(item)).await {
                Ok(result) => result,
                Err(_) => Err(ActionError::TimedOut(timeout)),
            };

        match result {
            Ok(()) => {
                if let Err(err) = self.repository.complete(&item.id).await {
                    let message = format!(
                        "action succeeded but completion was not recorded: {err}"
                    );
                    self.report(
                        FailureReport::new(run_id, FailureStage::Persist, message)
                            .for_item(&item.id),
                    )
                    .await;
                }
                info!("action succeeded");
                ItemResult::Succeeded(item.id.clone())
            }
            Err(err) => self.record_failure(run_id, item, err).await,
        }
    }

    async fn record_failure(
        &self,
        run_id: RunId,
        item: &WorkItem,
        err: ActionError,
    ) -> ItemResult {
        let message = err.to_string();
        self.report(
            FailureReport::new(run_id, FailureStage::Execute, &message)
                .for_item(&item.id)
                .retryable(err.is_retryable()),
        )
        .await;

        let disposition = self
            .config
            .retry
            .disposition(item.attempts, &err, Utc::now());
        let will_retry = matches!(disposition, FailureDisposition::Retry { .. });

        if let Err(persist_err) = self
            .repository
            .record_failure(&item.id, &message, disposition)
            .await
        {
            self.report(
                FailureReport::new(
                    run_id,
                    FailureStage::Persist,
                    format!("failed to record action failure: {persist_err}"),
                )
                .for_item(&item.id)
                .retryable(true),
            )
            .await;
        }

        ItemResult::Failed {
            failure: FailedItem {
                id: item.id.clone(),
                error: message,
                retryable: will_retry,
            },
            attempted: true,
        }
    }

    async fn release_item(&self, run_id: RunId, item: &WorkItem, lease: &LockLease) {
        if let Err(err) = self.locks.release(lease).await {
            self.report(
                FailureReport::new(
                    run_id,
                    FailureStage::Release,
                    format!("failed to release item lock: {err}"),
                )
                .for_item(&item.id)
                .retryable(true),
            )
            .await;
        }
    }

    /// Extend the global lease until the surrounding `select!` drops this
    /// future. A lost lease is reported once; per-item locks keep guarding
    /// in-flight items.
    async fn keep_alive(&self, run_id: RunId, lease: &LockLease) -> Infallible {
        let interval = self.config.renew_interval();
        loop {
            tokio::time::sleep(interval).await;
            match self.locks.extend(lease, lease.ttl()).await {
                Ok(true) => debug!(lock.key = lease.key(), "monitor lease extended"),
                Ok(false) => {
                    warn!(lock.key = lease.key(), "monitor lease lost mid-run");
                    self.report(FailureReport::new(
                        run_id,
                        FailureStage::LeaseRenewal,
                        "monitor lock expired or was taken over during the run",
                    ))
                    .await;
                    return std::future::pending().await;
                }
                Err(err) => {
                    self.report(
                        FailureReport::new(
                            run_id,
                            FailureStage::LeaseRenewal,
                            format!("failed to extend monitor lock: {err}"),
                        )
                        .retryable(true),
                    )
                    .await;
                }
            }
        }
    }

    async fn report(&self, report: FailureReport) {
        self.reporter.report(report).await;
    }
}
