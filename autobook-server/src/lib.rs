//! # Autobook Server
//!
//! Runs the reconciliation worker from three triggers: a one-shot CLI run,
//! an in-process interval scheduler, and an HTTP endpoint for external cron.
//!
//! ## Endpoints
//!
//! - `GET /health`: liveness plus a lock store and repository probe
//! - `POST /monitor`: run the monitor (or a health check) and return the
//!   run outcome

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
