/// Polling utilities for waiting on long-running provider operations
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::DispatchError;

/// Configuration for polling operations
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub timeout: Duration,
    pub interval: Duration,
    pub description: String,
}

impl PollingConfig {
    pub fn new(timeout: Duration, interval: Duration, description: impl Into<String>) -> Self {
        Self {
            timeout,
            interval,
            description: description.into(),
        }
    }

    /// Poll until condition is met or timeout
    ///
    /// The condition function should return:
    /// - Ok(Some(T)) when condition is met (returns T)
    /// - Ok(None) when condition is not yet met (continues polling)
    /// - Err(e) when an error occurs (stops polling and returns error)
    pub async fn poll<F, Fut, T>(&self, condition: F) -> Result<T, DispatchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<T>, DispatchError>>,
    {
        debug!("{}...", self.description);

        let start = Instant::now();

        loop {
            if let Some(value) = condition().await? {
                debug!("✓ {}", self.description);
                return Ok(value);
            }

            if start.elapsed() >= self.timeout {
                return Err(DispatchError::Timeout {
                    operation: self.description.clone(),
                    secs: self.timeout.as_secs(),
                });
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}
