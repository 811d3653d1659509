pub mod error;

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;
use url::Url;

use crate::models::sources::{EnvConfig, FileConfig};
use crate::models::{
    Config, ConfigMetadata, DatabaseConfig, ExecutorConfig, RedisConfig,
    ReporterConfig, ScheduleConfig, ServerConfig,
};
use crate::util::parse_duration;
use crate::validation::{self, ConfigWarnings};
use error::ConfigLoadError;

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("autobook.toml"),
        PathBuf::from("config/autobook.toml"),
    ]
});

const DEFAULT_EXECUTOR_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SCHEDULE_INTERVAL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let env_config = EnvConfig::gather();
        let (file_config, config_path) = self.load_file_config(&env_config)?;

        let (config, warnings) = compose_config(
            file_config,
            env_config,
            ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        )?;

        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        // An explicitly named file must exist; default locations are optional.
        let named = (&self.options.config_path, &env_config.config_path);
        let (path, explicit) = match named {
            (Some(path), _) | (None, Some(path)) => (path.clone(), true),
            (None, None) => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
            {
                Some(path) => (path.clone(), false),
                None => return Ok((None, None)),
            },
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents =
            fs::read_to_string(&path).map_err(|err| ConfigLoadError::Io {
                path: path.clone(),
                source: err,
            })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
                path: path.clone(),
                source: err,
            })?;

        Ok((Some(file_config), Some(path)))
    }
}

/// Merge file and environment layers over defaults, then run guard rails.
pub fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if metadata.config_path.is_none() {
        warnings.push_with_hint(
            "No autobook.toml detected; falling back to environment variables",
            "Create autobook.toml or set AUTOBOOK_CONFIG_PATH",
        );
    }

    let FileConfig {
        server: file_server,
        database: file_database,
        redis: file_redis,
        worker: file_worker,
        executor: file_executor,
        reporter: file_reporter,
        schedule: file_schedule,
        dev_mode: file_dev_mode,
    } = file_config.unwrap_or_default();

    let server = ServerConfig {
        host: env
            .server_host
            .or(file_server.host)
            .unwrap_or_else(|| "0.0.0.0".to_string()),
        port: env.server_port.or(file_server.port).unwrap_or(3000),
    };

    let database = DatabaseConfig {
        url: env.database_url.or(file_database.url),
        max_connections: env
            .database_max_connections
            .or(file_database.max_connections)
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
    };

    let redis = env
        .redis_url
        .map(|url| RedisConfig { url })
        .or_else(|| file_redis.map(|r| RedisConfig { url: r.url }));

    let mut worker = file_worker.unwrap_or_default();
    if let Some(prefix) = env.lock_key_prefix {
        worker.key_prefix = prefix;
    }
    if let Some(max_items) = env.max_items_per_run {
        worker.max_items_per_run = max_items;
    }
    if let Some(concurrency) = env.concurrency {
        worker.concurrency = concurrency;
    }
    if let Some(raw) = env.item_timeout {
        let timeout = duration_field("MONITOR_ITEM_TIMEOUT", &raw)?;
        worker.item_timeout_ms =
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    }

    let executor = ExecutorConfig {
        endpoint: url_field(
            "BOOKING_TRIGGER_URL",
            env.executor_endpoint.or(file_executor.endpoint),
        )?,
        auth_token: env.executor_auth_token.or(file_executor.auth_token),
        request_timeout: optional_duration(
            "BOOKING_TRIGGER_TIMEOUT",
            env.executor_timeout.or(file_executor.request_timeout),
        )?
        .unwrap_or(DEFAULT_EXECUTOR_TIMEOUT),
    };

    let reporter = ReporterConfig {
        webhook_url: url_field(
            "ERROR_WEBHOOK_URL",
            env.webhook_url.or(file_reporter.webhook_url),
        )?,
        timeout: optional_duration(
            "ERROR_WEBHOOK_TIMEOUT",
            env.webhook_timeout.or(file_reporter.timeout),
        )?
        .unwrap_or(DEFAULT_WEBHOOK_TIMEOUT),
    };

    let schedule = ScheduleConfig {
        enabled: env
            .schedule_enabled
            .or(file_schedule.enabled)
            .unwrap_or(false),
        interval: optional_duration(
            "MONITOR_INTERVAL",
            env.schedule_interval.or(file_schedule.interval),
        )?
        .unwrap_or(DEFAULT_SCHEDULE_INTERVAL),
    };

    let config = Config {
        server,
        database,
        redis,
        worker,
        executor,
        reporter,
        schedule,
        dev_mode: env.dev_mode.or(file_dev_mode).unwrap_or(false),
        metadata,
    };

    warnings.extend(validation::apply_guard_rails(&config)?);
    Ok((config, warnings))
}

fn url_field(
    field: &'static str,
    raw: Option<String>,
) -> Result<Option<Url>, ConfigLoadError> {
    raw.map(|value| {
        Url::parse(value.trim())
            .map_err(|source| ConfigLoadError::InvalidUrl { field, source })
    })
    .transpose()
}

fn duration_field(
    field: &'static str,
    raw: &str,
) -> Result<Duration, ConfigLoadError> {
    parse_duration(raw).map_err(|source| ConfigLoadError::InvalidDuration {
        field,
        value: raw.to_string(),
        source,
    })
}

fn optional_duration(
    field: &'static str,
    raw: Option<String>,
) -> Result<Option<Duration>, ConfigLoadError> {
    raw.map(|value| duration_field(field, &value)).transpose()
}
