use std::{fmt, sync::Arc};

use autobook_core::worker::ReconciliationWorker;
use chrono::{DateTime, Utc};

#[derive(Clone)]
pub struct AppState {
    pub worker: Arc<ReconciliationWorker>,
    /// False when no booking trigger is configured; only dry runs are
    /// accepted then.
    pub executor_configured: bool,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(worker: Arc<ReconciliationWorker>, executor_configured: bool) -> Self {
        Self {
            worker,
            executor_configured,
            started_at: Utc::now(),
        }
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("executor_configured", &self.executor_configured)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}
