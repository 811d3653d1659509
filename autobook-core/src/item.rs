use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifier of a work item (a pending offer awaiting booking).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(pub String);

impl WorkItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WorkItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Repository-visible lifecycle states.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkItemStatus {
    Pending,
    Locked,
    Done,
    Failed,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Pending => "PENDING",
            WorkItemStatus::Locked => "LOCKED",
            WorkItemStatus::Done => "DONE",
            WorkItemStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(WorkItemStatus::Pending),
            "LOCKED" => Ok(WorkItemStatus::Locked),
            "DONE" => Ok(WorkItemStatus::Done),
            "FAILED" => Ok(WorkItemStatus::Failed),
            other => Err(format!("unknown work item status: {other}")),
        }
    }
}

/// Envelope stored in the repository for each unit of work.
///
/// `payload` belongs to the repository and the action executor; the worker
/// only reads it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub status: WorkItemStatus,
    /// Instant after which the item becomes eligible for processing.
    pub expires_at: DateTime<Utc>,
    pub attempts: u16,
    pub payload: Value,
    pub last_error: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(
        id: impl Into<WorkItemId>,
        expires_at: DateTime<Utc>,
        payload: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: WorkItemStatus::Pending,
            expires_at,
            attempts: 0,
            payload,
            last_error: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkItemStatus::Pending && self.expires_at <= now
    }
}

/// What the repository should do with an item whose execution failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FailureDisposition {
    /// Return to `PENDING`, eligible again at `next_eligible_at`.
    Retry { next_eligible_at: DateTime<Utc> },
    /// Terminal `FAILED`.
    Fail,
}
