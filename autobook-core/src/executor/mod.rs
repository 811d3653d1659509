//! The side effect performed per work item.

pub mod http;

use async_trait::async_trait;

use crate::error::ActionError;
use crate::item::WorkItem;

pub use http::{HttpActionExecutor, HttpExecutorConfig};

/// Performs the external action for one item (triggering a booking).
///
/// Implementations may be slow and network bound. The worker wraps every
/// call in its own timeout and never retries within a run.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, item: &WorkItem) -> Result<(), ActionError>;
}
