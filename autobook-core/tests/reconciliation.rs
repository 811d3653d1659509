use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use autobook_core::error::{ActionError, LockError, RepositoryError};
use autobook_core::executor::ActionExecutor;
use autobook_core::item::{
    FailureDisposition, WorkItem, WorkItemId, WorkItemStatus,
};
use autobook_core::lock::{
    InMemoryLockManager, LockLease, LockManager, LockRetryPolicy,
};
use autobook_core::reporter::{FailureStage, InMemoryErrorReporter};
use autobook_core::repository::{
    InMemoryWorkItemRepository, StaleClaimSweep, WorkItemRepository,
};
use autobook_core::worker::{
    ReconciliationWorker, RunOptions, RunStatus, SkipReason, WorkerConfig,
};
use chrono::{DateTime, Utc};
use mockall::mock;
use serde_json::json;

mock! {
    pub Executor {}

    #[async_trait]
    impl ActionExecutor for Executor {
        async fn execute(&self, item: &WorkItem) -> Result<(), ActionError>;
    }
}

/// Sleeps per call and tracks how many calls overlap.
#[derive(Default)]
struct SlowExecutor {
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowExecutor {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ActionExecutor for SlowExecutor {
    async fn execute(&self, _item: &WorkItem) -> Result<(), ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Lock store whose every call fails, as if Redis were down.
struct UnreachableLocks;

#[async_trait]
impl LockManager for UnreachableLocks {
    async fn try_acquire(
        &self,
        _key: &str,
        _ttl: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        Err(LockError::Unavailable("connection refused".into()))
    }

    async fn release(&self, _lease: &LockLease) -> Result<(), LockError> {
        Err(LockError::Unavailable("connection refused".into()))
    }

    async fn extend(
        &self,
        _lease: &LockLease,
        _ttl: Duration,
    ) -> Result<bool, LockError> {
        Err(LockError::Unavailable("connection refused".into()))
    }
}

/// Repository whose eligibility query always fails.
struct BrokenFetchRepository;

#[async_trait]
impl WorkItemRepository for BrokenFetchRepository {
    async fn find_eligible(
        &self,
        _now: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<WorkItem>, RepositoryError> {
        Err(RepositoryError::Unavailable("connection reset".into()))
    }

    async fn claim(&self, id: &WorkItemId) -> Result<bool, RepositoryError> {
        Err(RepositoryError::NotFound(id.clone()))
    }

    async fn complete(&self, id: &WorkItemId) -> Result<(), RepositoryError> {
        Err(RepositoryError::NotFound(id.clone()))
    }

    async fn record_failure(
        &self,
        id: &WorkItemId,
        _error: &str,
        _disposition: FailureDisposition,
    ) -> Result<(), RepositoryError> {
        Err(RepositoryError::NotFound(id.clone()))
    }

    async fn requeue_stale(
        &self,
        _locked_before: DateTime<Utc>,
        _max_attempts: u16,
    ) -> Result<StaleClaimSweep, RepositoryError> {
        Ok(StaleClaimSweep::default())
    }
}

/// In-memory locks whose item keys are unreachable while the monitor key
/// still works, as if the store failed mid-run.
struct ItemLockOutage {
    inner: Arc<InMemoryLockManager>,
}

#[async_trait]
impl LockManager for ItemLockOutage {
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        if key.contains(":item:") {
            return Err(LockError::Unavailable("read timed out".into()));
        }
        self.inner.try_acquire(key, ttl).await
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        self.inner.release(lease).await
    }

    async fn extend(
        &self,
        lease: &LockLease,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        self.inner.extend(lease, ttl).await
    }
}

/// In-memory locks where every renewal finds the lease taken over.
struct LeaseLostLocks {
    inner: Arc<InMemoryLockManager>,
}

#[async_trait]
impl LockManager for LeaseLostLocks {
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        self.inner.try_acquire(key, ttl).await
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        self.inner.release(lease).await
    }

    async fn extend(
        &self,
        _lease: &LockLease,
        _ttl: Duration,
    ) -> Result<bool, LockError> {
        Ok(false)
    }
}

/// In-memory repository that cannot record completions.
struct CompletionLostRepository {
    inner: Arc<InMemoryWorkItemRepository>,
}

#[async_trait]
impl WorkItemRepository for CompletionLostRepository {
    async fn find_eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, RepositoryError> {
        self.inner.find_eligible(now, limit).await
    }

    async fn claim(&self, id: &WorkItemId) -> Result<bool, RepositoryError> {
        self.inner.claim(id).await
    }

    async fn complete(&self, _id: &WorkItemId) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("connection reset".into()))
    }

    async fn record_failure(
        &self,
        id: &WorkItemId,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<(), RepositoryError> {
        self.inner.record_failure(id, error, disposition).await
    }

    async fn requeue_stale(
        &self,
        locked_before: DateTime<Utc>,
        max_attempts: u16,
    ) -> Result<StaleClaimSweep, RepositoryError> {
        self.inner.requeue_stale(locked_before, max_attempts).await
    }
}

fn due(id: &str) -> WorkItem {
    WorkItem::new(
        id,
        Utc::now() - chrono::Duration::seconds(5),
        json!({ "offerId": id, "tripRequestId": format!("trip-{id}") }),
    )
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        item_lock_retry: LockRetryPolicy {
            attempts: 1,
            delay_ms: 10,
        },
        ..WorkerConfig::default()
    }
}

struct Harness {
    locks: Arc<InMemoryLockManager>,
    repo: Arc<InMemoryWorkItemRepository>,
    reporter: Arc<InMemoryErrorReporter>,
}

impl Harness {
    fn new(items: impl IntoIterator<Item = WorkItem>) -> Self {
        Self {
            locks: Arc::new(InMemoryLockManager::new()),
            repo: Arc::new(InMemoryWorkItemRepository::with_items(items)),
            reporter: Arc::new(InMemoryErrorReporter::new()),
        }
    }

    fn worker(
        &self,
        executor: Arc<dyn ActionExecutor>,
        config: WorkerConfig,
    ) -> ReconciliationWorker {
        ReconciliationWorker::new(
            self.locks.clone(),
            self.repo.clone(),
            executor,
            self.reporter.clone(),
            config,
        )
    }

    async fn status(&self, id: &str) -> WorkItemStatus {
        self.repo
            .get(&WorkItemId::from(id))
            .await
            .expect("item exists")
            .status
    }
}

#[tokio::test]
async fn happy_path_processes_every_item_and_releases_locks() {
    let h = Harness::new([due("a"), due("b"), due("c")]);
    let mut executor = MockExecutor::new();
    executor.expect_execute().times(3).returning(|_| Ok(()));
    let worker = h.worker(Arc::new(executor), fast_config());

    let outcome = worker.run(RunOptions::default()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.succeeded.len(), 3);
    assert_eq!(outcome.errors(), 0);
    for id in ["a", "b", "c"] {
        assert_eq!(h.status(id).await, WorkItemStatus::Done);
    }
    assert!(h.locks.held_keys().await.is_empty());
    assert!(h.reporter.reports().await.is_empty());
}

#[tokio::test]
async fn overlapping_runs_are_mutually_exclusive() {
    let h = Harness::new([due("a"), due("b")]);
    let executor = Arc::new(SlowExecutor::new(Duration::from_millis(150)));
    let first = h.worker(executor.clone(), fast_config());
    let second = h.worker(executor.clone(), fast_config());

    let (a, b) = tokio::join!(first.run(RunOptions::default()), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        second.run(RunOptions::default()).await
    });

    assert_eq!(a.status, RunStatus::Completed);
    assert_eq!(b.status, RunStatus::LockBusy);
    assert!(b.attempted.is_empty());
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    assert!(h.locks.held_keys().await.is_empty());
}

#[tokio::test]
async fn failing_item_does_not_affect_its_neighbours() {
    let h = Harness::new([due("a"), due("b"), due("c")]);
    let mut executor = MockExecutor::new();
    executor
        .expect_execute()
        .withf(|item| item.id.as_str() == "b")
        .times(1)
        .returning(|_| Err(ActionError::Transient("booking API 503".into())));
    executor
        .expect_execute()
        .withf(|item| item.id.as_str() != "b")
        .times(2)
        .returning(|_| Ok(()));
    let worker = h.worker(Arc::new(executor), fast_config());

    let outcome = worker.run(RunOptions::default()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.succeeded.len(), 2);
    assert!(outcome.is_failed(&"b".into()));
    assert!(outcome.failed[0].retryable);
    assert_eq!(outcome.attempted.len(), 3);

    let reports = h.reporter.reports_for(&"b".into()).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].stage, FailureStage::Execute);
    assert_eq!(reports[0].run_id, outcome.run_id);
    assert!(reports[0].message.contains("503"));

    let b = h.repo.get(&"b".into()).await.expect("item b");
    assert_eq!(b.status, WorkItemStatus::Pending);
    assert_eq!(b.attempts, 1);
    assert!(b.expires_at > Utc::now());
    assert_eq!(h.status("a").await, WorkItemStatus::Done);
    assert_eq!(h.status("c").await, WorkItemStatus::Done);
    assert!(h.locks.held_keys().await.is_empty());
}

#[tokio::test]
async fn failing_item_is_isolated_when_processed_in_parallel() {
    let h = Harness::new([due("a"), due("b"), due("c")]);
    let mut executor = MockExecutor::new();
    executor.expect_execute().times(3).returning(|item| {
        if item.id.as_str() == "b" {
            Err(ActionError::Permanent("offer no longer available".into()))
        } else {
            Ok(())
        }
    });
    let config = WorkerConfig {
        concurrency: 3,
        ..fast_config()
    };
    let worker = h.worker(Arc::new(executor), config);

    let outcome = worker.run(RunOptions::default()).await;

    assert_eq!(outcome.succeeded.len(), 2);
    assert_eq!(outcome.errors(), 1);
    assert!(!outcome.failed[0].retryable);
    assert_eq!(h.status("b").await, WorkItemStatus::Failed);
    assert!(h.locks.held_keys().await.is_empty());
}

#[tokio::test]
async fn parallel_mode_respects_concurrency_bound() {
    let items: Vec<_> = (0..6).map(|i| due(&format!("item-{i}"))).collect();
    let h = Harness::new(items);
    let executor = Arc::new(SlowExecutor::new(Duration::from_millis(40)));
    let config = WorkerConfig {
        concurrency: 2,
        ..fast_config()
    };
    let worker = h.worker(executor.clone(), config);

    let outcome = worker.run(RunOptions::default()).await;

    assert_eq!(outcome.succeeded.len(), 6);
    assert_eq!(executor.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn contended_item_is_skipped_without_report() {
    let h = Harness::new([due("a"), due("b"), due("c")]);
    let keys = WorkerConfig::default().lock_keys();
    let foreign = h
        .locks
        .try_acquire(&keys.item(&"b".into()), Duration::from_secs(60))
        .await
        .expect("lock store")
        .expect("free lock");

    let mut executor = MockExecutor::new();
    executor
        .expect_execute()
        .withf(|item| item.id.as_str() != "b")
        .times(2)
        .returning(|_| Ok(()));
    let worker = h.worker(Arc::new(executor), fast_config());

    let outcome = worker.run(RunOptions::default()).await;

    assert_eq!(outcome.succeeded.len(), 2);
    assert_eq!(outcome.skipped.len(), 1);
    assert_eq!(outcome.skipped[0].reason, SkipReason::LockContended);
    assert!(h.reporter.reports_for(&"b".into()).await.is_empty());
    assert_eq!(h.status("b").await, WorkItemStatus::Pending);

    // The foreign holder keeps its lock.
    assert_eq!(h.locks.held_keys().await, vec![foreign.key().to_string()]);
}

#[tokio::test]
async fn unreachable_lock_store_fails_closed() {
    let repo = Arc::new(InMemoryWorkItemRepository::with_items([due("a")]));
    let reporter = Arc::new(InMemoryErrorReporter::new());
    let mut executor = MockExecutor::new();
    executor.expect_execute().times(0);
    let worker = ReconciliationWorker::new(
        Arc::new(UnreachableLocks),
        repo.clone(),
        Arc::new(executor),
        reporter.clone(),
        fast_config(),
    );

    let outcome = worker.run(RunOptions::default()).await;

    assert_eq!(outcome.status, RunStatus::LockUnavailable);
    assert!(outcome.attempted.is_empty());
    let reports = reporter.reports().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].stage, FailureStage::GlobalLock);
    assert_eq!(
        repo.get(&"a".into()).await.expect("item a").status,
        WorkItemStatus::Pending
    );
}

#[tokio::test]
async fn fetch_failure_aborts_and_releases_global_lock() {
    let locks = Arc::new(InMemoryLockManager::new());
    let reporter = Arc::new(InMemoryErrorReporter::new());
    let mut executor = MockExecutor::new();
    executor.expect_execute().times(0);
    let worker = ReconciliationWorker::new(
        locks.clone(),
        Arc::new(BrokenFetchRepository),
        Arc::new(executor),
        reporter.clone(),
        fast_config(),
    );

    let outcome = worker.run(RunOptions::default()).await;

    assert_eq!(outcome.status, RunStatus::Aborted);
    assert!(!locks.is_held(&worker.keys().global()).await);
    let reports = reporter.reports().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].stage, FailureStage::Fetch);
    assert!(reports[0].retryable);
}

#[tokio::test]
async fn slow_action_times_out_and_is_retried_later() {
    let h = Harness::new([due("a")]);
    let executor = Arc::new(SlowExecutor::new(Duration::from_millis(500)));
    let config = WorkerConfig {
        item_timeout_ms: 50,
        ..fast_config()
    };
    let worker = h.worker(executor, config);

    let outcome = worker.run(RunOptions::default()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.is_failed(&"a".into()));
    assert!(outcome.failed[0].error.contains("timed out"));
    assert!(outcome.failed[0].retryable);
    assert_eq!(h.status("a").await, WorkItemStatus::Pending);
    assert!(h.locks.held_keys().await.is_empty());
}

#[tokio::test]
async fn exhausted_attempts_mark_item_failed() {
    let mut tired = due("a");
    tired.attempts = 4;
    let h = Harness::new([tired]);
    let mut executor = MockExecutor::new();
    executor
        .expect_execute()
        .times(1)
        .returning(|_| Err(ActionError::Transient("still down".into())));
    let worker = h.worker(Arc::new(executor), fast_config());

    let outcome = worker.run(RunOptions::default()).await;

    assert!(!outcome.failed[0].retryable);
    let a = h.repo.get(&"a".into()).await.expect("item a");
    assert_eq!(a.status, WorkItemStatus::Failed);
    assert_eq!(a.attempts, 5);
}

#[tokio::test]
async fn dry_run_plans_without_side_effects() {
    let h = Harness::new([due("a"), due("b")]);
    let mut executor = MockExecutor::new();
    executor.expect_execute().times(0);
    let worker = h.worker(Arc::new(executor), fast_config());

    let outcome = worker
        .run(RunOptions {
            dry_run: true,
            max_items: None,
        })
        .await;

    assert!(outcome.dry_run);
    assert_eq!(outcome.planned.len(), 2);
    assert_eq!(outcome.processed(), 2);
    assert!(outcome.attempted.is_empty());
    assert_eq!(h.status("a").await, WorkItemStatus::Pending);
    assert_eq!(h.status("b").await, WorkItemStatus::Pending);
    assert!(h.locks.held_keys().await.is_empty());
}

#[tokio::test]
async fn max_items_caps_the_batch() {
    let h = Harness::new([due("a"), due("b"), due("c")]);
    let mut executor = MockExecutor::new();
    executor.expect_execute().times(2).returning(|_| Ok(()));
    let worker = h.worker(Arc::new(executor), fast_config());

    let outcome = worker
        .run(RunOptions {
            dry_run: false,
            max_items: Some(2),
        })
        .await;

    assert_eq!(outcome.succeeded.len(), 2);
}

#[tokio::test]
async fn future_items_are_not_touched() {
    let later = WorkItem::new(
        "later",
        Utc::now() + chrono::Duration::hours(1),
        json!({}),
    );
    let h = Harness::new([later]);
    let mut executor = MockExecutor::new();
    executor.expect_execute().times(0);
    let worker = h.worker(Arc::new(executor), fast_config());

    let outcome = worker.run(RunOptions::default()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.processed(), 0);
}

#[tokio::test]
async fn stale_claims_are_requeued_and_processed() {
    let mut abandoned = due("a");
    abandoned.status = WorkItemStatus::Locked;
    abandoned.locked_at = Some(Utc::now() - chrono::Duration::hours(1));
    let h = Harness::new([abandoned]);
    let mut executor = MockExecutor::new();
    executor.expect_execute().times(1).returning(|_| Ok(()));
    let config = WorkerConfig {
        stale_claim_after_secs: 60,
        ..fast_config()
    };
    let worker = h.worker(Arc::new(executor), config);

    let outcome = worker.run(RunOptions::default()).await;

    assert_eq!(outcome.requeued, 1);
    assert_eq!(outcome.succeeded, vec![WorkItemId::from("a")]);
    assert_eq!(h.status("a").await, WorkItemStatus::Done);
    let a = h.repo.get(&"a".into()).await.expect("item a");
    assert_eq!(a.attempts, 1);
}

#[tokio::test]
async fn abandoned_claim_on_last_attempt_is_failed_not_retried() {
    let mut crashed = due("a");
    crashed.status = WorkItemStatus::Locked;
    crashed.attempts = 4;
    crashed.locked_at = Some(Utc::now() - chrono::Duration::hours(1));
    let h = Harness::new([crashed]);
    let mut executor = MockExecutor::new();
    executor.expect_execute().times(0);
    let config = WorkerConfig {
        stale_claim_after_secs: 60,
        ..fast_config()
    };
    let worker = h.worker(Arc::new(executor), config);

    let outcome = worker.run(RunOptions::default()).await;

    assert_eq!(outcome.requeued, 0);
    assert_eq!(outcome.stale_failed, 1);
    assert_eq!(outcome.processed(), 0);
    let a = h.repo.get(&"a".into()).await.expect("item a");
    assert_eq!(a.status, WorkItemStatus::Failed);
    assert_eq!(a.attempts, 5);
}

#[tokio::test]
async fn global_lease_is_extended_during_long_runs() {
    let h = Harness::new([due("a"), due("b")]);
    let executor = Arc::new(SlowExecutor::new(Duration::from_millis(700)));
    let config = WorkerConfig {
        global_lock_ttl_secs: 1,
        ..fast_config()
    };
    let worker = h.worker(executor, config);
    let global_key = worker.keys().global();

    let check_held = {
        let locks = h.locks.clone();
        let key = global_key.clone();
        async move {
            // Past the original 1s TTL, still inside the run.
            tokio::time::sleep(Duration::from_millis(1_200)).await;
            locks.is_held(&key).await
        }
    };

    let (outcome, held_past_ttl) =
        tokio::join!(worker.run(RunOptions::default()), check_held);

    assert!(held_past_ttl, "global lease should have been renewed");
    assert_eq!(outcome.succeeded.len(), 2);
    assert!(!h.locks.is_held(&global_key).await);
    assert!(
        h.reporter
            .reports()
            .await
            .iter()
            .all(|r| r.stage != FailureStage::LeaseRenewal)
    );
}

#[tokio::test]
async fn releasing_after_a_run_is_idempotent() {
    let h = Harness::new([due("a")]);
    let mut executor = MockExecutor::new();
    executor.expect_execute().returning(|_| Ok(()));
    let worker = h.worker(Arc::new(executor), fast_config());
    worker.run(RunOptions::default()).await;

    let stale = LockLease::generate(worker.keys().global(), Duration::from_secs(1));
    h.locks.release(&stale).await.expect("release is idempotent");
    h.locks.release(&stale).await.expect("release is idempotent");
}

#[tokio::test]
async fn dependency_check_reports_broken_repository() {
    let mut executor = MockExecutor::new();
    executor.expect_execute().times(0);
    let healthy = Harness::new(Vec::new());
    let worker = healthy.worker(Arc::new(MockExecutor::new()), fast_config());
    worker
        .check_dependencies()
        .await
        .expect("in-memory dependencies are healthy");

    let broken = ReconciliationWorker::new(
        Arc::new(InMemoryLockManager::new()),
        Arc::new(BrokenFetchRepository),
        Arc::new(executor),
        Arc::new(InMemoryErrorReporter::new()),
        fast_config(),
    );
    let err = broken.check_dependencies().await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn item_lock_store_error_skips_and_reports_the_item() {
    let inner = Arc::new(InMemoryLockManager::new());
    let repo = Arc::new(InMemoryWorkItemRepository::with_items([due("a")]));
    let reporter = Arc::new(InMemoryErrorReporter::new());
    let mut executor = MockExecutor::new();
    executor.expect_execute().times(0);
    let worker = ReconciliationWorker::new(
        Arc::new(ItemLockOutage {
            inner: inner.clone(),
        }),
        repo.clone(),
        Arc::new(executor),
        reporter.clone(),
        fast_config(),
    );

    let outcome = worker.run(RunOptions::default()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.attempted.is_empty());
    assert_eq!(outcome.skipped.len(), 1);
    assert_eq!(outcome.skipped[0].reason, SkipReason::LockUnavailable);

    let reports = reporter.reports_for(&"a".into()).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].stage, FailureStage::ItemLock);
    assert!(reports[0].retryable);

    assert_eq!(
        repo.get(&"a".into()).await.expect("item a").status,
        WorkItemStatus::Pending
    );
    assert!(inner.held_keys().await.is_empty());
}

#[tokio::test]
async fn lost_global_lease_is_reported_once_and_the_run_continues() {
    let inner = Arc::new(InMemoryLockManager::new());
    let repo = Arc::new(InMemoryWorkItemRepository::with_items([
        due("a"),
        due("b"),
        due("c"),
    ]));
    let reporter = Arc::new(InMemoryErrorReporter::new());
    let executor = Arc::new(SlowExecutor::new(Duration::from_millis(400)));
    let config = WorkerConfig {
        global_lock_ttl_secs: 1,
        ..fast_config()
    };
    let worker = ReconciliationWorker::new(
        Arc::new(LeaseLostLocks {
            inner: inner.clone(),
        }),
        repo.clone(),
        executor.clone(),
        reporter.clone(),
        config,
    );

    let outcome = worker.run(RunOptions::default()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.succeeded.len(), 3);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);

    let renewals: Vec<_> = reporter
        .reports()
        .await
        .into_iter()
        .filter(|r| r.stage == FailureStage::LeaseRenewal)
        .collect();
    assert_eq!(renewals.len(), 1);
    assert_eq!(renewals[0].run_id, outcome.run_id);
    assert!(renewals[0].item_id.is_none());
    assert!(inner.held_keys().await.is_empty());
}

#[tokio::test]
async fn lost_completion_write_is_reported_but_item_counts_as_succeeded() {
    let locks = Arc::new(InMemoryLockManager::new());
    let inner = Arc::new(InMemoryWorkItemRepository::with_items([due("a")]));
    let reporter = Arc::new(InMemoryErrorReporter::new());
    let mut executor = MockExecutor::new();
    executor.expect_execute().times(1).returning(|_| Ok(()));
    let worker = ReconciliationWorker::new(
        locks.clone(),
        Arc::new(CompletionLostRepository {
            inner: inner.clone(),
        }),
        Arc::new(executor),
        reporter.clone(),
        fast_config(),
    );

    let outcome = worker.run(RunOptions::default()).await;

    assert_eq!(outcome.succeeded, vec![WorkItemId::from("a")]);
    assert_eq!(outcome.errors(), 0);

    let reports = reporter.reports_for(&"a".into()).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].stage, FailureStage::Persist);
    assert!(reports[0].message.contains("completion was not recorded"));

    // The claim stays for the stale sweep; nothing marks it failed.
    let a = inner.get(&"a".into()).await.expect("item a");
    assert_eq!(a.status, WorkItemStatus::Locked);
    assert_eq!(a.attempts, 0);
    assert!(locks.held_keys().await.is_empty());
}

#[tokio::test]
async fn spawned_run_finishes_when_its_handle_is_dropped() {
    let h = Harness::new([due("a")]);
    let executor = Arc::new(SlowExecutor::new(Duration::from_millis(300)));
    let worker = Arc::new(h.worker(executor.clone(), fast_config()));

    let handle = worker.spawn_run(RunOptions::default());
    let dropped = tokio::time::timeout(Duration::from_millis(50), handle).await;
    assert!(dropped.is_err(), "run should still be in flight");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let done = h.status("a").await == WorkItemStatus::Done;
        if done && h.locks.held_keys().await.is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run did not finish after its handle was dropped"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}
