use std::path::PathBuf;

use autobook_core::worker::WorkerConfig;
use serde::{Deserialize, Serialize};

use crate::util::{parse_bool_var, parse_var, string_var};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    pub redis: Option<FileRedisConfig>,
    pub worker: Option<WorkerConfig>,
    #[serde(default)]
    pub executor: FileExecutorConfig,
    #[serde(default)]
    pub reporter: FileReporterConfig,
    #[serde(default)]
    pub schedule: FileScheduleConfig,
    pub dev_mode: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    pub url: String,
}

/// Durations are humantime strings (`"30s"`, `"2m"`).
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileExecutorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileReporterConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileScheduleConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub database_url: Option<String>,
    pub database_max_connections: Option<u32>,
    pub redis_url: Option<String>,
    pub dev_mode: Option<bool>,
    pub executor_endpoint: Option<String>,
    pub executor_auth_token: Option<String>,
    pub executor_timeout: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_timeout: Option<String>,
    pub schedule_enabled: Option<bool>,
    pub schedule_interval: Option<String>,
    pub lock_key_prefix: Option<String>,
    pub max_items_per_run: Option<usize>,
    pub concurrency: Option<usize>,
    pub item_timeout: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: string_var("AUTOBOOK_CONFIG_PATH").map(PathBuf::from),
            server_host: string_var("SERVER_HOST"),
            server_port: parse_var("SERVER_PORT"),
            database_url: string_var("DATABASE_URL"),
            database_max_connections: parse_var("DB_MAX_CONNECTIONS"),
            redis_url: string_var("REDIS_URL"),
            dev_mode: parse_bool_var("DEV_MODE"),

            executor_endpoint: string_var("BOOKING_TRIGGER_URL"),
            executor_auth_token: string_var("BOOKING_TRIGGER_TOKEN"),
            executor_timeout: string_var("BOOKING_TRIGGER_TIMEOUT"),

            webhook_url: string_var("ERROR_WEBHOOK_URL"),
            webhook_timeout: string_var("ERROR_WEBHOOK_TIMEOUT"),

            schedule_enabled: parse_bool_var("MONITOR_SCHEDULE_ENABLED"),
            schedule_interval: string_var("MONITOR_INTERVAL"),

            lock_key_prefix: string_var("LOCK_KEY_PREFIX"),
            max_items_per_run: parse_var("MONITOR_MAX_ITEMS"),
            concurrency: parse_var("MONITOR_CONCURRENCY"),
            item_timeout: string_var("MONITOR_ITEM_TIMEOUT"),
        }
    }
}
