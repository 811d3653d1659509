use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use autobook_core::worker::{RunOptions, RunOutcome};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

pub async fn health_handler(State(state): State<AppState>) -> Response {
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
    let mut health_status = json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime,
        "checks": {}
    });

    let mut is_unhealthy = false;
    match state.worker.check_dependencies().await {
        Ok(()) => {
            health_status["checks"]["dependencies"] = json!({
                "status": "healthy",
            });
        }
        Err(e) => {
            health_status["checks"]["dependencies"] = json!({
                "status": "unhealthy",
                "error": e.to_string()
            });
            is_unhealthy = true;
        }
    }

    health_status["checks"]["executor"] = json!({
        "configured": state.executor_configured,
    });

    if is_unhealthy {
        health_status["status"] = json!("unhealthy");
        (StatusCode::SERVICE_UNAVAILABLE, Json(health_status)).into_response()
    } else {
        Json(health_status).into_response()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorAction {
    #[default]
    Monitor,
    HealthCheck,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorRequest {
    pub action: MonitorAction,
    pub max_items: Option<usize>,
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub errors: usize,
    pub duration_ms: u64,
}

impl From<&RunOutcome> for RunSummary {
    fn from(outcome: &RunOutcome) -> Self {
        Self {
            processed: outcome.processed(),
            succeeded: outcome.succeeded.len(),
            skipped: outcome.skipped_count(),
            errors: outcome.errors(),
            duration_ms: outcome.duration_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MonitorResponse {
    pub success: bool,
    pub summary: RunSummary,
    pub outcome: RunOutcome,
}

/// `POST /monitor`. An empty body runs the monitor with defaults.
pub async fn monitor_handler(
    State(state): State<AppState>,
    request: Option<Json<MonitorRequest>>,
) -> AppResult<Response> {
    let request = request.map(|Json(body)| body).unwrap_or_default();

    if request.action == MonitorAction::HealthCheck {
        return Ok(health_handler(State(state)).await);
    }

    if request.max_items == Some(0) {
        return Err(AppError::bad_request("maxItems must be at least 1"));
    }
    if !request.dry_run && !state.executor_configured {
        return Err(AppError::unavailable(
            "booking trigger is not configured; only dry runs are allowed",
        ));
    }

    // The run is spawned so a dropped request cannot abandon held locks.
    let outcome = state
        .worker
        .spawn_run(RunOptions {
            dry_run: request.dry_run,
            max_items: request.max_items,
        })
        .await
        .map_err(|e| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("monitor run failed: {e}"),
            )
        })?;

    info!(
        run_id = %outcome.run_id,
        status = ?outcome.status,
        processed = outcome.processed(),
        errors = outcome.errors(),
        "monitor triggered over http"
    );

    let response = MonitorResponse {
        success: true,
        summary: RunSummary::from(&outcome),
        outcome,
    };
    Ok(Json(response).into_response())
}
