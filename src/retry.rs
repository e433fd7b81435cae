//! Bounded exponential backoff with per-call timeouts.
//!
//! Every external call (embedding, LLM, read-only tool) runs through
//! [`RetryPolicy::run`]. Only errors classified as transient by
//! [`MemexError::is_transient`] are retried; a timeout counts as transient.
//! Backoff doubles from `base_delay` up to `max_delay`.

use std::future::Future;
use std::time::Duration;

use memex_core::MemexError;
use tracing::warn;

use crate::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt` (1-based). The first attempt has none.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 2).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        timeout: Duration,
        mut call: F,
    ) -> Result<T, MemexError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MemexError>>,
    {
        let mut last_err = None;

        for attempt in 1..=self.max_attempts.max(1) {
            let delay = self.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match with_timeout(operation, timeout, call()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "transient failure"
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            MemexError::transient(operation, "no attempts were made")
        }))
    }
}

/// Run a single call under a deadline, mapping expiry to `Timeout`.
pub async fn with_timeout<T, Fut>(
    operation: &str,
    timeout: Duration,
    fut: Fut,
) -> Result<T, MemexError>
where
    Fut: Future<Output = Result<T, MemexError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(MemexError::Timeout {
            operation: operation.to_string(),
            millis: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(150),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::ZERO);
        assert_eq!(p.delay_for(2), Duration::from_millis(100));
        assert_eq!(p.delay_for(3), Duration::from_millis(150));
        assert_eq!(p.delay_for(30), Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = policy()
            .run("embed", Duration::from_secs(5), move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(MemexError::transient("openai", "429"))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy()
            .run("embed", Duration::from_secs(5), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(MemexError::transient("openai", "503"))
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy()
            .run("llm", Duration::from_secs(5), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(MemexError::provider("openai", "400 bad request"))
            })
            .await;
        assert!(matches!(result, Err(MemexError::Provider { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_as_transient() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy()
            .run("llm", Duration::from_millis(50), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(MemexError::Timeout { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
