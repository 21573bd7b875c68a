use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Execution context handed to a handler for one attempt.
///
/// Cancelled when the attempt's deadline passes or the worker pool shuts
/// down. Handlers should check it between units of work and return promptly.
#[derive(Debug, Clone)]
pub struct JobContext {
    token: CancellationToken,
    deadline: DateTime<Utc>,
    worker_id: Arc<str>,
}

impl JobContext {
    pub fn new(token: CancellationToken, deadline: DateTime<Utc>, worker_id: impl Into<Arc<str>>) -> Self {
        Self {
            token,
            deadline,
            worker_id: worker_id.into(),
        }
    }

    /// Completes once the attempt is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token for tying the handler's own sub-tasks to this attempt.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}
