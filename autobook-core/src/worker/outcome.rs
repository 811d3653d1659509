use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::item::WorkItemId;

/// Identifier of one run, time-ordered so logs sort naturally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Global lock held and the batch was processed (items may still fail).
    Completed,
    /// Another run holds the global lock.
    LockBusy,
    /// The lock store could not be reached; nothing was processed.
    LockUnavailable,
    /// Lock held but the batch could not be fetched.
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another holder has the item lock.
    LockContended,
    /// The item lock store errored.
    LockUnavailable,
    /// The item was no longer pending when claimed.
    AlreadyClaimed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub id: WorkItemId,
    pub reason: SkipReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub id: WorkItemId,
    pub error: String,
    pub retryable: bool,
}

/// Summary of one run, returned to the trigger that invoked it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Items whose lock was taken and whose action was started.
    pub attempted: Vec<WorkItemId>,
    pub succeeded: Vec<WorkItemId>,
    pub skipped: Vec<SkippedItem>,
    pub failed: Vec<FailedItem>,
    /// Items a dry run would have executed.
    pub planned: Vec<WorkItemId>,
    /// Stale claims returned to `PENDING` before fetching.
    pub requeued: u64,
    /// Stale claims that used up their last attempt and became `FAILED`.
    #[serde(default)]
    pub stale_failed: u64,
}

impl RunOutcome {
    pub(crate) fn begin(run_id: RunId, dry_run: bool) -> Self {
        Self {
            run_id,
            status: RunStatus::Completed,
            dry_run,
            started_at: Utc::now(),
            duration_ms: 0,
            attempted: Vec::new(),
            succeeded: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            planned: Vec::new(),
            requeued: 0,
            stale_failed: 0,
        }
    }

    pub(crate) fn finish(mut self, status: RunStatus) -> Self {
        self.status = status;
        self.duration_ms = (Utc::now() - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self
    }

    /// Items that reached the action (or would have, in a dry run).
    pub fn processed(&self) -> usize {
        self.attempted.len() + self.planned.len()
    }

    pub fn errors(&self) -> usize {
        self.failed.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn is_failed(&self, id: &WorkItemId) -> bool {
        self.failed.iter().any(|f| &f.id == id)
    }

    pub fn is_skipped(&self, id: &WorkItemId) -> bool {
        self.skipped.iter().any(|s| &s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_status_and_counts() {
        let mut outcome = RunOutcome::begin(RunId::new(), false);
        outcome.attempted.push("a".into());
        outcome.succeeded.push("a".into());
        outcome.skipped.push(SkippedItem {
            id: "b".into(),
            reason: SkipReason::LockContended,
        });
        let outcome = outcome.finish(RunStatus::Completed);

        assert_eq!(outcome.processed(), 1);
        assert_eq!(outcome.skipped_count(), 1);
        assert!(outcome.is_skipped(&"b".into()));

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["skipped"][0]["reason"], "lock_contended");
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }
}
