use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use autobook_config::Config;
use autobook_core::{
    error::ActionError,
    executor::{ActionExecutor, HttpActionExecutor, HttpExecutorConfig},
    item::WorkItem,
    lock::{InMemoryLockManager, LockManager, RedisLockManager},
    reporter::{
        ErrorReporter, FanoutErrorReporter, HttpErrorReporter,
        TracingErrorReporter,
    },
    repository::{
        InMemoryWorkItemRepository, PostgresWorkItemRepository,
        WorkItemRepository,
    },
    worker::ReconciliationWorker,
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::{info, warn};

/// Everything a trigger needs to start runs.
#[derive(Debug)]
pub struct WorkerBootstrap {
    pub worker: Arc<ReconciliationWorker>,
    pub executor_configured: bool,
}

pub async fn connect_postgres(config: &Config) -> anyhow::Result<Option<PgPool>> {
    let Some(url) = config.database.url.as_deref() else {
        return Ok(None);
    };
    if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
        anyhow::bail!(
            "Invalid database URL: must start with postgres:// or postgresql://"
        );
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;
    info!("Successfully connected to PostgreSQL");
    Ok(Some(pool))
}

pub async fn build_worker(config: &Config) -> anyhow::Result<WorkerBootstrap> {
    let locks: Arc<dyn LockManager> = match &config.redis {
        Some(redis) => Arc::new(
            RedisLockManager::new(&redis.url)
                .await
                .context("failed to connect to Redis lock store")?,
        ),
        None => {
            warn!("using in-memory locks; runs are only exclusive within this process");
            Arc::new(InMemoryLockManager::new())
        }
    };

    let repository: Arc<dyn WorkItemRepository> =
        match connect_postgres(config).await? {
            Some(pool) => Arc::new(
                PostgresWorkItemRepository::new(pool)
                    .await
                    .context("work item repository unavailable")?,
            ),
            None => {
                warn!("using an in-memory work item repository");
                Arc::new(InMemoryWorkItemRepository::new())
            }
        };

    let (executor, executor_configured): (Arc<dyn ActionExecutor>, bool) =
        match &config.executor.endpoint {
            Some(endpoint) => {
                let executor = HttpActionExecutor::new(HttpExecutorConfig {
                    endpoint: endpoint.clone(),
                    auth_token: config.executor.auth_token.clone(),
                    request_timeout: config.executor.request_timeout,
                })
                .context("failed to build booking trigger client")?;
                (Arc::new(executor), true)
            }
            None => (Arc::new(UnconfiguredExecutor), false),
        };

    let mut reporter = FanoutErrorReporter::default();
    reporter.push(Arc::new(TracingErrorReporter));
    if let Some(webhook) = &config.reporter.webhook_url {
        reporter.push(Arc::new(
            HttpErrorReporter::new(webhook.clone(), config.reporter.timeout)
                .context("failed to build error webhook client")?,
        ));
    }
    let reporter: Arc<dyn ErrorReporter> = Arc::new(reporter);

    let worker = ReconciliationWorker::new(
        locks,
        repository,
        executor,
        reporter,
        config.worker.clone(),
    );
    info!(
        global_lock_ttl_secs = config.worker.global_lock_ttl_secs,
        max_items_per_run = config.worker.max_items_per_run,
        concurrency = config.worker.concurrency,
        item_timeout_ms = config.worker.item_timeout_ms,
        "monitor worker configured"
    );

    Ok(WorkerBootstrap {
        worker: Arc::new(worker),
        executor_configured,
    })
}

/// Stand-in when no booking trigger is configured. Triggers refuse
/// non-dry runs in that case.
#[derive(Debug)]
struct UnconfiguredExecutor;

#[async_trait]
impl ActionExecutor for UnconfiguredExecutor {
    async fn execute(&self, _item: &WorkItem) -> Result<(), ActionError> {
        Err(ActionError::Transient("no booking trigger configured".into()))
    }
}

/// Applies pending schema migrations.
pub async fn run_migrations(config: &Config) -> anyhow::Result<()> {
    let pool = connect_postgres(config)
        .await?
        .context("DATABASE_URL must be set to run migrations")?;
    autobook_core::MIGRATOR
        .run(&pool)
        .await
        .context("failed to apply migrations")?;
    info!("Database migrations applied");
    Ok(())
}
