//! Failure reporting sinks.
//!
//! Reporting is fire-and-forget: a reporter that cannot deliver logs the
//! problem and returns, so a broken sink never fails a run.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use url::Url;

use crate::item::WorkItemId;
use crate::worker::RunId;

/// Where in a run a failure happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    GlobalLock,
    ItemLock,
    Housekeeping,
    Fetch,
    Claim,
    Execute,
    Persist,
    Release,
    LeaseRenewal,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::GlobalLock => "global_lock",
            FailureStage::ItemLock => "item_lock",
            FailureStage::Housekeeping => "housekeeping",
            FailureStage::Fetch => "fetch",
            FailureStage::Claim => "claim",
            FailureStage::Execute => "execute",
            FailureStage::Persist => "persist",
            FailureStage::Release => "release",
            FailureStage::LeaseRenewal => "lease_renewal",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure with enough context to locate it: run, item and stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub run_id: RunId,
    pub item_id: Option<WorkItemId>,
    pub stage: FailureStage,
    pub message: String,
    pub retryable: bool,
    pub occurred_at: DateTime<Utc>,
}

impl FailureReport {
    pub fn new(
        run_id: RunId,
        stage: FailureStage,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            item_id: None,
            stage,
            message: message.into(),
            retryable: false,
            occurred_at: Utc::now(),
        }
    }

    pub fn for_item(mut self, item_id: &WorkItemId) -> Self {
        self.item_id = Some(item_id.clone());
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

#[async_trait]
pub trait ErrorReporter: Send + Sync {
    /// Deliver a report. Never fails; delivery problems are logged.
    async fn report(&self, report: FailureReport);
}

/// Emits every report as a structured tracing event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingErrorReporter;

#[async_trait]
impl ErrorReporter for TracingErrorReporter {
    async fn report(&self, report: FailureReport) {
        let item_id = report.item_id.as_ref().map(WorkItemId::as_str);
        if report.retryable {
            warn!(
                run_id = %report.run_id,
                item_id,
                stage = %report.stage,
                retryable = true,
                "{}",
                report.message
            );
        } else {
            error!(
                run_id = %report.run_id,
                item_id,
                stage = %report.stage,
                retryable = false,
                "{}",
                report.message
            );
        }
    }
}

/// Posts each report as JSON to a webhook.
#[derive(Clone)]
pub struct HttpErrorReporter {
    client: reqwest::Client,
    webhook_url: Url,
}

impl fmt::Debug for HttpErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpErrorReporter")
            .field("webhook_host", &self.webhook_url.host_str())
            .finish()
    }
}

impl HttpErrorReporter {
    pub fn new(webhook_url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            webhook_url,
        })
    }
}

#[async_trait]
impl ErrorReporter for HttpErrorReporter {
    async fn report(&self, report: FailureReport) {
        let result = self
            .client
            .post(self.webhook_url.clone())
            .json(&report)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match result {
            Ok(_) => debug!(stage = %report.stage, "failure report delivered"),
            Err(err) => warn!(
                run_id = %report.run_id,
                stage = %report.stage,
                error = %err,
                "failed to deliver failure report"
            ),
        }
    }
}

/// Forwards each report to every inner reporter in order.
#[derive(Clone, Default)]
pub struct FanoutErrorReporter {
    reporters: Vec<Arc<dyn ErrorReporter>>,
}

impl fmt::Debug for FanoutErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutErrorReporter")
            .field("reporters", &self.reporters.len())
            .finish()
    }
}

impl FanoutErrorReporter {
    pub fn new(reporters: Vec<Arc<dyn ErrorReporter>>) -> Self {
        Self { reporters }
    }

    pub fn push(&mut self, reporter: Arc<dyn ErrorReporter>) {
        self.reporters.push(reporter);
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

#[async_trait]
impl ErrorReporter for FanoutErrorReporter {
    async fn report(&self, report: FailureReport) {
        for reporter in &self.reporters {
            reporter.report(report.clone()).await;
        }
    }
}

/// Keeps reports in memory; used by tests and the dry-run tooling.
#[derive(Debug, Default)]
pub struct InMemoryErrorReporter {
    reports: Mutex<Vec<FailureReport>>,
}

impl InMemoryErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<FailureReport> {
        self.reports.lock().await.clone()
    }

    pub async fn reports_for(&self, item_id: &WorkItemId) -> Vec<FailureReport> {
        self.reports
            .lock()
            .await
            .iter()
            .filter(|r| r.item_id.as_ref() == Some(item_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ErrorReporter for InMemoryErrorReporter {
    async fn report(&self, report: FailureReport) {
        self.reports.lock().await.push(report);
    }
}
