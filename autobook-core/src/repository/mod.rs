pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RepositoryError;
use crate::item::{FailureDisposition, WorkItem, WorkItemId};

pub use memory::InMemoryWorkItemRepository;
#[cfg(feature = "database")]
pub use postgres::PostgresWorkItemRepository;

/// Persistence port for work items.
#[async_trait]
pub trait WorkItemRepository: Send + Sync {
    /// `PENDING` items whose `expires_at` is at or before `now`, at most
    /// `limit` of them. No ordering is promised.
    async fn find_eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, RepositoryError>;

    /// Conditional `PENDING -> LOCKED`. Returns false when the item is no
    /// longer pending.
    async fn claim(&self, id: &WorkItemId) -> Result<bool, RepositoryError>;

    /// `LOCKED -> DONE`.
    async fn complete(&self, id: &WorkItemId) -> Result<(), RepositoryError>;

    /// Count a failed attempt and apply the retry disposition.
    async fn record_failure(
        &self,
        id: &WorkItemId,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<(), RepositoryError>;

    /// Resolve items claimed before `locked_before` that never finished.
    /// Each one counts as a failed attempt: it returns to `PENDING`, or
    /// becomes `FAILED` once `attempts` reaches `max_attempts`.
    async fn requeue_stale(
        &self,
        locked_before: DateTime<Utc>,
        max_attempts: u16,
    ) -> Result<StaleClaimSweep, RepositoryError>;
}

/// Result of one stale-claim sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StaleClaimSweep {
    pub requeued: u64,
    pub failed: u64,
}

impl StaleClaimSweep {
    pub fn total(&self) -> u64 {
        self.requeued + self.failed
    }
}

pub(crate) const STALE_CLAIM_ERROR: &str =
    "claim expired before the attempt finished";
