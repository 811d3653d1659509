//! Configuration loading for the Autobook monitor.
//!
//! Values come from three layers, highest precedence first: process
//! environment (optionally seeded from a `.env` file), an `autobook.toml`
//! file, then built-in defaults. The composed [`Config`] is checked by
//! [`validation::apply_guard_rails`] before it is handed out.

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, error::ConfigLoadError};
pub use models::{
    Config, ConfigMetadata, DatabaseConfig, ExecutorConfig, RedisConfig,
    ReporterConfig, ScheduleConfig, ServerConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
