use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{STALE_CLAIM_ERROR, StaleClaimSweep, WorkItemRepository};
use crate::error::RepositoryError;
use crate::item::{FailureDisposition, WorkItem, WorkItemId, WorkItemStatus};

/// Map-backed repository with the same transition rules as the Postgres
/// implementation.
#[derive(Default)]
pub struct InMemoryWorkItemRepository {
    items: RwLock<HashMap<WorkItemId, WorkItem>>,
}

impl fmt::Debug for InMemoryWorkItemRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .items
            .try_read()
            .map(|items| items.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryWorkItemRepository")
            .field("items", &count)
            .finish()
    }
}

impl InMemoryWorkItemRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = WorkItem>) -> Self {
        Self {
            items: RwLock::new(
                items.into_iter().map(|item| (item.id.clone(), item)).collect(),
            ),
        }
    }

    pub async fn insert(&self, item: WorkItem) {
        self.items.write().await.insert(item.id.clone(), item);
    }

    pub async fn get(&self, id: &WorkItemId) -> Option<WorkItem> {
        self.items.read().await.get(id).cloned()
    }
}

#[async_trait]
impl WorkItemRepository for InMemoryWorkItemRepository {
    async fn find_eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, RepositoryError> {
        let items = self.items.read().await;
        let mut eligible: Vec<WorkItem> = items
            .values()
            .filter(|item| item.is_eligible(now))
            .cloned()
            .collect();
        // Stable order keeps tests deterministic; callers must not rely on it.
        eligible.sort_by(|a, b| {
            a.expires_at.cmp(&b.expires_at).then_with(|| a.id.cmp(&b.id))
        });
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn claim(&self, id: &WorkItemId) -> Result<bool, RepositoryError> {
        let mut items = self.items.write().await;
        let item = items
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
        if item.status != WorkItemStatus::Pending {
            return Ok(false);
        }
        let now = Utc::now();
        item.status = WorkItemStatus::Locked;
        item.locked_at = Some(now);
        item.updated_at = now;
        Ok(true)
    }

    async fn complete(&self, id: &WorkItemId) -> Result<(), RepositoryError> {
        let mut items = self.items.write().await;
        let item = items
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
        item.status = WorkItemStatus::Done;
        item.locked_at = None;
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn record_failure(
        &self,
        id: &WorkItemId,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<(), RepositoryError> {
        let mut items = self.items.write().await;
        let item = items
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
        item.attempts = item.attempts.saturating_add(1);
        item.last_error = Some(error.to_string());
        item.locked_at = None;
        item.updated_at = Utc::now();
        match disposition {
            FailureDisposition::Retry { next_eligible_at } => {
                item.status = WorkItemStatus::Pending;
                item.expires_at = next_eligible_at;
            }
            FailureDisposition::Fail => {
                item.status = WorkItemStatus::Failed;
            }
        }
        Ok(())
    }

    async fn requeue_stale(
        &self,
        locked_before: DateTime<Utc>,
        max_attempts: u16,
    ) -> Result<StaleClaimSweep, RepositoryError> {
        let mut items = self.items.write().await;
        let mut sweep = StaleClaimSweep::default();
        for item in items.values_mut() {
            let stale = item.status == WorkItemStatus::Locked
                && item.locked_at.is_some_and(|at| at < locked_before);
            if !stale {
                continue;
            }
            item.attempts = item.attempts.saturating_add(1);
            item.locked_at = None;
            item.last_error = Some(STALE_CLAIM_ERROR.to_string());
            item.updated_at = Utc::now();
            if item.attempts >= max_attempts {
                item.status = WorkItemStatus::Failed;
                sweep.failed += 1;
            } else {
                item.status = WorkItemStatus::Pending;
                sweep.requeued += 1;
            }
        }
        Ok(sweep)
    }
}
