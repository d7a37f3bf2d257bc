//! Timeout and retry policy for calls into the router control plane

use crate::{Result, RouterError};
use ipam_api::RouterId;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

/// Bounds every remote router call
#[derive(Clone, Debug)]
pub struct RouterCallPolicy {
    /// Time allowed for a single attempt
    pub timeout: Duration,
    /// Attempts after the first one
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
}

impl Default for RouterCallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RouterCallPolicy {
    /// Calculate backoff duration for the given retry count
    pub fn backoff_duration(&self, retry_count: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as u64;
        let exponential = 2u64.saturating_pow(retry_count);
        let backoff_ms = base
            .saturating_mul(exponential)
            .min(self.max_backoff.as_millis() as u64);
        Duration::from_millis(backoff_ms)
    }

    /// Run `op` until it succeeds or attempts are used up
    ///
    /// Each attempt is bounded by `timeout`. When every attempt fails the error
    /// of the last one is returned: `RouterSyncTimeout` if it timed out,
    /// otherwise whatever the agent reported.
    pub async fn call<T, F, Fut>(&self, router: RouterId, change: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let error = match tokio_timeout(self.timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => RouterError::RouterSyncTimeout {
                    router,
                    change: change.to_string(),
                    timeout: self.timeout,
                },
            };

            if attempt >= self.max_retries || !retryable(&error) {
                warn!(
                    "Router {} {} failed after {} attempt(s): {}",
                    router,
                    change,
                    attempt + 1,
                    error
                );
                return Err(error);
            }

            let backoff = self.backoff_duration(attempt);
            debug!(
                "Router {} {} attempt {} failed ({}); retrying in {:?}",
                router,
                change,
                attempt + 1,
                error,
                backoff
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

fn retryable(error: &RouterError) -> bool {
    matches!(
        error,
        RouterError::RouterSyncTimeout { .. } | RouterError::RouterRejected { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_retries: u32) -> RouterCallPolicy {
        RouterCallPolicy {
            timeout: Duration::from_millis(50),
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_backoff_duration() {
        let policy = RouterCallPolicy::default();
        assert_eq!(policy.backoff_duration(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff_duration(10), Duration::from_secs(10));
        assert_eq!(policy.backoff_duration(80), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_call_retries_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let router = RouterId::new();
        let counter = attempts.clone();
        let result = quick(3)
            .call(router, "associate", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(RouterError::RouterRejected {
                            router,
                            reason: "busy".into(),
                        })
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let router = RouterId::new();
        let result: Result<()> = quick(1)
            .call(router, "associate", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(RouterError::RouterSyncTimeout { router: r, .. }) if r == router
        ));
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let router = RouterId::new();
        let counter = attempts.clone();
        let result: Result<()> = quick(5)
            .call(router, "rebuild", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(RouterError::UnknownRouter(router))
                }
            })
            .await;
        assert!(matches!(result, Err(RouterError::UnknownRouter(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
