pub mod app_state;
pub mod bootstrap;
pub mod errors;
pub mod scheduler;
pub mod telemetry;
