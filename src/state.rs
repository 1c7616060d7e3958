//! Shared application state.

use crate::runner::Runner;
use std::sync::Arc;
use std::time::Duration;

/// Extra time the HTTP handler allows beyond the runner's own deadline
/// before answering 504.
pub const HANDLER_GRACE: Duration = Duration::from_secs(5);

/// State shared by every HTTP handler.
#[derive(Clone, Debug)]
pub struct AppState {
    pub runner: Arc<Runner>,
}

impl AppState {
    pub fn new(runner: Runner) -> Self {
        Self {
            runner: Arc::new(runner),
        }
    }

    /// Upper bound on how long one `/execute` request may take.
    pub fn request_deadline(&self) -> Duration {
        self.runner.config().limits.timeout + HANDLER_GRACE
    }
}
