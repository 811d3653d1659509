use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use super::ActionExecutor;
use crate::error::ActionError;
use crate::item::WorkItem;

/// Connection settings for the booking trigger endpoint.
#[derive(Clone)]
pub struct HttpExecutorConfig {
    pub endpoint: Url,
    pub auth_token: Option<String>,
    pub request_timeout: Duration,
}

impl HttpExecutorConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            auth_token: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl fmt::Debug for HttpExecutorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpExecutorConfig")
            .field("endpoint", &self.endpoint.as_str())
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest<'a> {
    work_item_id: &'a str,
    payload: &'a Value,
}

#[derive(Deserialize)]
struct TriggerResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Calls the booking trigger over HTTP, one POST per item.
#[derive(Clone)]
pub struct HttpActionExecutor {
    client: reqwest::Client,
    config: HttpExecutorConfig,
}

impl fmt::Debug for HttpActionExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpActionExecutor")
            .field("config", &self.config)
            .finish()
    }
}

impl HttpActionExecutor {
    pub fn new(config: HttpExecutorConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn endpoint(&self) -> &Url {
        &self.config.endpoint
    }

    fn classify_transport(&self, err: reqwest::Error) -> ActionError {
        if err.is_timeout() {
            ActionError::TimedOut(self.config.request_timeout)
        } else if err.is_builder() {
            ActionError::Permanent(format!("invalid trigger request: {err}"))
        } else {
            ActionError::Transient(format!("trigger request failed: {err}"))
        }
    }
}

/// Map the trigger's HTTP status and body to an action result.
///
/// 5xx, 408 and 429 are transient. Any other non-2xx status, an explicit
/// `success: false`, or a 2xx body that is not the expected JSON is
/// permanent: the booking may already have happened, so it is not replayed
/// automatically. An empty 2xx body counts as success.
pub fn classify_response(
    status: StatusCode,
    body: &str,
) -> Result<(), ActionError> {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return Err(ActionError::Transient(format!(
            "trigger returned {status}: {}",
            snippet(body)
        )));
    }

    if !status.is_success() {
        return Err(ActionError::Permanent(format!(
            "trigger returned {status}: {}",
            snippet(body)
        )));
    }

    if body.trim().is_empty() {
        return Ok(());
    }

    match serde_json::from_str::<TriggerResponse>(body) {
        Ok(TriggerResponse { success: true, .. }) => Ok(()),
        Ok(TriggerResponse {
            success: false,
            message,
        }) => Err(ActionError::Permanent(
            message.unwrap_or_else(|| "booking trigger reported failure".into()),
        )),
        Err(e) => Err(ActionError::Permanent(format!(
            "unreadable trigger response: {e}"
        ))),
    }
}

fn snippet(body: &str) -> &str {
    const MAX: usize = 200;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    #[instrument(
        name = "executor.http",
        skip(self, item),
        fields(item_id = %item.id),
        err
    )]
    async fn execute(&self, item: &WorkItem) -> Result<(), ActionError> {
        let mut request = self
            .client
            .post(self.config.endpoint.clone())
            .json(&TriggerRequest {
                work_item_id: item.id.as_str(),
                payload: &item.payload,
            });
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.classify_transport(e))?;

        debug!(%status, "booking trigger responded");
        classify_response(status, &body)
    }
}
