//! Bounded exponential backoff for provider calls.

use crate::config::RetryConfig;
use crate::error::ProviderError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retries transient provider failures on a fixed backoff schedule.
///
/// The initial attempt is followed by at most `delays.len()` retries, so the
/// default three delays allow up to four attempts per call. Every attempt is
/// counted in `provider_call_counts`. Only errors with
/// [`ProviderError::is_transient`] are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.delays())
    }

    pub fn max_retries(&self) -> usize {
        self.delays.len()
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// Cancellation wins over both an in-flight attempt and a backoff sleep.
    pub async fn execute<T, F, Fut>(&self, label: &str, cancel: &CancellationToken, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                res = op() => res,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!("✅ {} succeeded on attempt {}", label, attempt);
                    } else {
                        debug!("{} succeeded", label);
                    }
                    return Ok(value);
                }
                Err(ProviderError::Cancelled) => {
                    debug!("{} cancelled on attempt {}", label, attempt);
                    return Err(ProviderError::Cancelled);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                warn!("❌ {} failed permanently on attempt {}: {}", label, attempt, err);
                return Err(err);
            }

            let Some(backoff) = self.delays.get(attempt - 1).copied() else {
                warn!("❌ {} gave up after {} attempts: {}", label, attempt, err);
                return Err(err);
            };

            let delay = match &err {
                ProviderError::RateLimited {
                    retry_after_ms: Some(ms),
                } => backoff.max(Duration::from_millis(*ms)),
                _ => backoff,
            };

            warn!(
                "⚠️ {} attempt {} failed: {} (retrying in {}ms)",
                label,
                attempt,
                err,
                delay.as_millis()
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("{} cancelled during backoff", label);
                    return Err(ProviderError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
