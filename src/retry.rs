//! Retry of transient failures with exponential backoff.
//!
//! Storage write conflicts and coordinator bridge hiccups are retried inside
//! the step that hit them. Only errors classified by
//! [`Error::is_transient`] are retried; anything else returns immediately.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::metrics::DonorMetrics;
use backon::Retryable;
use std::future::Future;
use std::time::Duration;

/// Run `op`, retrying transient errors per `config`.
///
/// If retries run out, the last transient error is turned into
/// [`Error::Fatal`].
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    metrics: &DonorMetrics,
    what: &'static str,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    op.retry(config.policy())
        .when(|e: &Error| e.is_transient())
        .notify(|e: &Error, delay: Duration| {
            metrics.record_retry();
            tracing::warn!(what, error = %e, delay = ?delay, "retrying after transient failure");
        })
        .await
        .map_err(|e| {
            if e.is_transient() {
                tracing::error!(what, error = %e, "retries exhausted");
                Error::Fatal(format!("{} failed after retries: {}", what, e))
            } else {
                e
            }
        })
}
