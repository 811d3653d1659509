pub mod sources;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use autobook_core::worker::WorkerConfig;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub worker: WorkerConfig,
    pub executor: ExecutorConfig,
    pub reporter: ReporterConfig,
    pub schedule: ScheduleConfig,
    pub dev_mode: bool,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

/// Booking trigger the worker calls for each item.
#[derive(Clone)]
pub struct ExecutorConfig {
    pub endpoint: Option<Url>,
    pub auth_token: Option<String>,
    pub request_timeout: Duration,
}

impl fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("endpoint", &self.endpoint.as_ref().map(Url::as_str))
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Failure webhook. Tracing output is always on.
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub webhook_url: Option<Url>,
    pub timeout: Duration,
}

/// In-process interval trigger used by `serve`.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
