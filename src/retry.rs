//! Classified retry execution for targeted upstream dispatch.
//!
//! Every attempt is recorded in the metrics store. Business-class failures
//! short-circuit: no retry, no demotion, the upstream's message re-raised
//! unchanged. Connection-class failures back off exponentially
//! (2^attempt × 1000 ms) up to the retry budget; a request that exhausts
//! its budget bumps the upstream's consecutive-failure counter, and the
//! health monitor's threshold decides when that promotes to unhealthy.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::error::{ErrorClass, ErrorClassifier, Result};
use crate::health::HealthMonitor;
use crate::metrics::MetricsStore;

/// Backoff before the retry following 0-based `attempt`: 1 s, 2 s, 4 s, …
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(1000u64.saturating_mul(1 << attempt.min(16)))
}

/// Everything the executor needs besides the operation itself.
pub struct RetryContext<'a> {
    pub upstream: &'a str,
    pub metrics: &'a MetricsStore,
    pub monitor: &'a HealthMonitor,
    /// The upstream's consecutive-failure counter; reset on success.
    pub failures: &'a AtomicU32,
    pub classifier: ErrorClassifier,
    /// Additional attempts after the first.
    pub max_retries: u32,
}

/// Run `operation` under the retry policy, recording each attempt.
pub async fn dispatch_with_retry<T, F, Fut>(ctx: RetryContext<'_>, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        let start = Instant::now();
        let result = operation().await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(value) => {
                ctx.metrics
                    .record_request(ctx.upstream, elapsed_ms, true)
                    .await;
                ctx.failures.store(0, Ordering::Relaxed);
                return Ok(value);
            }
            Err(err) => {
                ctx.metrics
                    .record_request(ctx.upstream, elapsed_ms, false)
                    .await;
                let message = err.to_string();

                if (ctx.classifier)(&message) == ErrorClass::Business {
                    return Err(err);
                }

                if attempt < ctx.max_retries {
                    let delay = backoff_delay(attempt);
                    tracing::debug!(
                        server = %ctx.upstream,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "retrying after connection-class failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                let failures = ctx.failures.fetch_add(1, Ordering::Relaxed) + 1;
                if ctx.monitor.should_mark_unhealthy(ctx.upstream, failures) {
                    ctx.metrics
                        .mark_unhealthy(ctx.upstream, Some(&message))
                        .await;
                }
                return Err(err);
            }
        }
    }
}
