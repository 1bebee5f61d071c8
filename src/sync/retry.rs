//! Bounded exponential backoff around chain I/O.

use crate::datasource::DataSourceError;
use crate::error::SyncError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Run `call` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// Exhausted transient failures surface as [`SyncError::TransientIo`];
    /// permanent ones as [`SyncError::DataSource`].
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DataSourceError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let backoff = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build();

        let mut attempts = 0u32;
        let result = backoff::future::retry(backoff, || {
            attempts += 1;
            let attempt = attempts;
            let pending = call();
            async move {
                pending.await.map_err(|e| {
                    if e.is_transient() && attempt < max_attempts {
                        warn!(operation, attempt, error = %e, "transient failure, backing off");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await;

        result.map_err(|source| {
            if source.is_transient() {
                SyncError::TransientIo {
                    operation,
                    attempts,
                    source,
                }
            } else {
                SyncError::DataSource { operation, source }
            }
        })
    }
}
