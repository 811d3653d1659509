use thiserror::Error;
use url::Url;

use crate::models::Config;

/// Longest lock TTL accepted. Lock stores take millisecond expiries and
/// expiry instants are computed as `now + ttl`, so the value is bounded.
pub const MAX_LOCK_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error(
        "REDIS_URL is required outside DEV_MODE; \
         in-memory locks are process-local"
    )]
    MissingLockBackend,
    #[error("DATABASE_URL is required outside DEV_MODE")]
    MissingDatabase,
    #[error("{field} must use http or https, got '{scheme}'")]
    UnsupportedScheme { field: &'static str, scheme: String },
    #[error("worker setting {field} {reason}")]
    InvalidWorkerSetting { field: &'static str, reason: String },
    #[error(
        "item timeout ({item_timeout_ms}ms) must be shorter than \
         the monitor lock TTL ({global_ttl_ms}ms)"
    )]
    ItemTimeoutExceedsLockTtl {
        item_timeout_ms: u128,
        global_ttl_ms: u128,
    },
    #[error("{field} is {secs}s; lock TTLs are capped at {max_secs}s")]
    LockTtlTooLong {
        field: &'static str,
        secs: u64,
        max_secs: u64,
    },
    #[error("schedule interval must be greater than zero")]
    ZeroScheduleInterval,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    if config.redis.is_none() {
        if !config.dev_mode {
            return Err(ConfigGuardRailError::MissingLockBackend);
        }
        warnings.push_with_hint(
            "REDIS_URL not configured; using in-memory locks",
            "In-memory locks only exclude runs inside this process; \
             set REDIS_URL before running more than one instance",
        );
    }

    if config.database.url.is_none() {
        if !config.dev_mode {
            return Err(ConfigGuardRailError::MissingDatabase);
        }
        warnings.push(
            "DATABASE_URL not configured; \
             using an empty in-memory work item store",
        );
    }

    if let Some(endpoint) = &config.executor.endpoint {
        require_http("BOOKING_TRIGGER_URL", endpoint)?;
    } else {
        warnings.push_with_hint(
            "BOOKING_TRIGGER_URL not configured; \
             monitor runs cannot execute bookings",
            "Set BOOKING_TRIGGER_URL or [executor].endpoint; dry runs still work",
        );
    }

    match &config.reporter.webhook_url {
        Some(url) => require_http("ERROR_WEBHOOK_URL", url)?,
        None => warnings.push(
            "ERROR_WEBHOOK_URL not configured; \
             failures are only reported to the log",
        ),
    }

    validate_worker(config, &mut warnings)?;

    if config.schedule.enabled && config.schedule.interval.is_zero() {
        return Err(ConfigGuardRailError::ZeroScheduleInterval);
    }

    Ok(warnings)
}

fn require_http(
    field: &'static str,
    url: &Url,
) -> Result<(), ConfigGuardRailError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigGuardRailError::UnsupportedScheme {
            field,
            scheme: other.to_string(),
        }),
    }
}

fn validate_worker(
    config: &Config,
    warnings: &mut ConfigWarnings,
) -> Result<(), ConfigGuardRailError> {
    let worker = &config.worker;

    let non_zero = [
        ("global_lock_ttl_secs", worker.global_lock_ttl_secs),
        ("item_lock_ttl_secs", worker.item_lock_ttl_secs),
        ("item_timeout_ms", worker.item_timeout_ms),
        ("max_items_per_run", worker.max_items_per_run as u64),
        ("concurrency", worker.concurrency as u64),
    ];
    for (field, value) in non_zero {
        if value == 0 {
            return Err(ConfigGuardRailError::InvalidWorkerSetting {
                field,
                reason: "must be greater than zero".into(),
            });
        }
    }

    let lock_ttls = [
        ("global_lock_ttl_secs", worker.global_lock_ttl_secs),
        ("item_lock_ttl_secs", worker.item_lock_ttl_secs),
    ];
    for (field, secs) in lock_ttls {
        if secs > MAX_LOCK_TTL_SECS {
            return Err(ConfigGuardRailError::LockTtlTooLong {
                field,
                secs,
                max_secs: MAX_LOCK_TTL_SECS,
            });
        }
    }

    let fraction = worker.renew_at_fraction;
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(ConfigGuardRailError::InvalidWorkerSetting {
            field: "renew_at_fraction",
            reason: format!("must be between 0 and 1, got {fraction}"),
        });
    }

    if worker.retry.max_attempts == 0 {
        return Err(ConfigGuardRailError::InvalidWorkerSetting {
            field: "retry.max_attempts",
            reason: "must be at least 1".into(),
        });
    }

    let item_timeout = worker.item_timeout();
    let global_ttl = worker.global_lock_ttl();
    if item_timeout >= global_ttl {
        return Err(ConfigGuardRailError::ItemTimeoutExceedsLockTtl {
            item_timeout_ms: item_timeout.as_millis(),
            global_ttl_ms: global_ttl.as_millis(),
        });
    }

    if global_ttl < worker.item_lock_ttl() {
        warnings.push(
            "monitor lock TTL is shorter than the item lock TTL; \
             item locks may outlive the run that took them",
        );
    }

    if item_timeout >= worker.item_lock_ttl() {
        warnings.push_with_hint(
            "item timeout is not shorter than the item lock TTL",
            "A slow action can outlive its item lock and be picked up by another run",
        );
    }

    Ok(())
}
