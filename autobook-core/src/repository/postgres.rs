//! Postgres-backed work item persistence.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, info};

use super::{STALE_CLAIM_ERROR, StaleClaimSweep, WorkItemRepository};
use crate::error::RepositoryError;
use crate::item::{FailureDisposition, WorkItem, WorkItemId, WorkItemStatus};

const SELECT_COLUMNS: &str = "id, status, expires_at, attempts, payload, \
     last_error, locked_at, created_at, updated_at";

#[derive(Clone)]
pub struct PostgresWorkItemRepository {
    pool: PgPool,
}

impl fmt::Debug for PostgresWorkItemRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresWorkItemRepository")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: String,
    status: String,
    expires_at: DateTime<Utc>,
    attempts: i32,
    payload: Value,
    last_error: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = RepositoryError;

    fn try_from(row: WorkItemRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<WorkItemStatus>().map_err(|reason| {
            RepositoryError::Decode {
                id: row.id.clone(),
                reason,
            }
        })?;
        let attempts =
            u16::try_from(row.attempts).map_err(|_| RepositoryError::Decode {
                id: row.id.clone(),
                reason: format!("attempts out of range: {}", row.attempts),
            })?;

        Ok(WorkItem {
            id: WorkItemId(row.id),
            status,
            expires_at: row.expires_at,
            attempts,
            payload: row.payload,
            last_error: row.last_error,
            locked_at: row.locked_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl PostgresWorkItemRepository {
    /// Create the repository and verify DB health + schema.
    pub async fn new(pool: PgPool) -> Result<Self, RepositoryError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                RepositoryError::Unavailable(format!(
                    "work item repository failed Postgres health check: {e}"
                ))
            })?;

        let table_exists = sqlx::query_scalar::<_, Option<String>>(
            "SELECT to_regclass('work_items')::text",
        )
        .fetch_one(&pool)
        .await?
        .is_some();

        if !table_exists {
            return Err(RepositoryError::Unavailable(
                "table work_items is missing; run migrations".into(),
            ));
        }

        info!("Work item repository connected to Postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert or replace an item. Producers normally own this; the worker
    /// never calls it.
    pub async fn upsert(&self, item: &WorkItem) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO work_items
                (id, status, expires_at, attempts, payload, last_error,
                 locked_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                expires_at = EXCLUDED.expires_at,
                attempts = EXCLUDED.attempts,
                payload = EXCLUDED.payload,
                last_error = EXCLUDED.last_error,
                locked_at = EXCLUDED.locked_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(item.id.as_str())
        .bind(item.status.as_str())
        .bind(item.expires_at)
        .bind(i32::from(item.attempts))
        .bind(&item.payload)
        .bind(item.last_error.as_deref())
        .bind(item.locked_at)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(
        &self,
        id: &WorkItemId,
    ) -> Result<Option<WorkItem>, RepositoryError> {
        let query = format!("SELECT {SELECT_COLUMNS} FROM work_items WHERE id = $1");
        sqlx::query_as::<_, WorkItemRow>(&query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(WorkItem::try_from)
            .transpose()
    }
}

#[async_trait]
impl WorkItemRepository for PostgresWorkItemRepository {
    async fn find_eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, RepositoryError> {
        let query = format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM work_items
            WHERE status = 'PENDING'
              AND expires_at <= $1
            ORDER BY expires_at ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, WorkItemRow>(&query)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        debug!(count = rows.len(), "fetched eligible work items");
        rows.into_iter().map(WorkItem::try_from).collect()
    }

    async fn claim(&self, id: &WorkItemId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'LOCKED',
                locked_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, id: &WorkItemId) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'DONE',
                locked_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        id: &WorkItemId,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<(), RepositoryError> {
        let (status, next_eligible_at) = match disposition {
            FailureDisposition::Retry { next_eligible_at } => {
                (WorkItemStatus::Pending, Some(next_eligible_at))
            }
            FailureDisposition::Fail => (WorkItemStatus::Failed, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = $2,
                attempts = attempts + 1,
                last_error = $3,
                expires_at = COALESCE($4, expires_at),
                locked_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(status.as_str())
        .bind(error)
        .bind(next_eligible_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn requeue_stale(
        &self,
        locked_before: DateTime<Utc>,
        max_attempts: u16,
    ) -> Result<StaleClaimSweep, RepositoryError> {
        let statuses: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE work_items
            SET attempts = attempts + 1,
                status = CASE
                    WHEN attempts + 1 >= $2 THEN 'FAILED'
                    ELSE 'PENDING'
                END,
                locked_at = NULL,
                last_error = $3,
                updated_at = NOW()
            WHERE status = 'LOCKED'
              AND locked_at IS NOT NULL
              AND locked_at < $1
            RETURNING status
            "#,
        )
        .bind(locked_before)
        .bind(i32::from(max_attempts))
        .bind(STALE_CLAIM_ERROR)
        .fetch_all(&self.pool)
        .await?;

        let failed = statuses
            .iter()
            .filter(|status| status.as_str() == WorkItemStatus::Failed.as_str())
            .count() as u64;
        Ok(StaleClaimSweep {
            requeued: statuses.len() as u64 - failed,
            failed,
        })
    }
}
