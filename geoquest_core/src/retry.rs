//! Retry policy for oracle calls.
//!
//! - Client errors (bad request, not found) are never retried
//! - Rate-limit responses back off from 20 s, tripling per attempt
//! - Everything else backs off from 10 s, doubling per attempt

use crate::oracle::{FailureClass, OracleError};
use geoquest_env::GeoQuestContext;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for oracle call retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 2, i.e. 3 attempts)
    pub max_retries: u32,

    /// Base backoff for transient errors (default: 10 000 ms)
    pub base_delay_ms: u64,

    /// Base backoff after a rate-limit response (default: 20 000 ms)
    pub rate_limit_base_delay_ms: u64,

    /// Growth factor of the rate-limit backoff (default: 3)
    pub rate_limit_multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 10_000,
            rate_limit_base_delay_ms: 20_000,
            rate_limit_multiplier: 3,
        }
    }
}

impl RetryConfig {
    /// Wait before retry number `attempt + 1`, or `None` if `error` must not be retried.
    pub fn backoff(&self, attempt: u32, error: &OracleError) -> Option<Duration> {
        let ms = match error.class() {
            FailureClass::Fatal => return None,
            FailureClass::RateLimited => self
                .rate_limit_base_delay_ms
                .saturating_mul(u64::from(self.rate_limit_multiplier).saturating_pow(attempt)),
            FailureClass::Transient => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(attempt)),
        };
        Some(Duration::from_millis(ms))
    }
}

/// Runs `op` until it succeeds, fails fatally, or retries run out.
///
/// `op` receives the zero-based attempt number. Backoff waits go through the
/// context clock. On exhaustion the last error is returned.
pub async fn with_retry<Ctx, T, F, Fut>(
    ctx: &Ctx,
    policy: &RetryConfig,
    label: &str,
    mut op: F,
) -> Result<T, OracleError>
where
    Ctx: GeoQuestContext,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, OracleError>>,
{
    let mut attempt = 0;
    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if attempt >= policy.max_retries {
            warn!(label, attempts = attempt + 1, %error, "retries exhausted");
            return Err(error);
        }
        let Some(delay) = policy.backoff(attempt, &error) else {
            warn!(label, %error, "not retryable");
            return Err(error);
        };

        warn!(
            label,
            attempt = attempt + 1,
            backoff_ms = delay.as_millis() as u64,
            %error,
            "oracle call failed, backing off"
        );
        ctx.sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualContext;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryConfig::default();
        let server = OracleError::Server("503".into());
        let limited = OracleError::RateLimited("429".into());

        assert_eq!(policy.backoff(0, &server), Some(Duration::from_secs(10)));
        assert_eq!(policy.backoff(1, &server), Some(Duration::from_secs(20)));
        assert_eq!(policy.backoff(0, &limited), Some(Duration::from_secs(20)));
        assert_eq!(policy.backoff(1, &limited), Some(Duration::from_secs(60)));
        assert_eq!(policy.backoff(0, &OracleError::BadRequest("x".into())), None);
        assert_eq!(policy.backoff(0, &OracleError::NotFound("x".into())), None);
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_succeed() {
        let ctx = ManualContext::shared();
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = with_retry(&*ctx, &RetryConfig::default(), "q", |_| async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(OracleError::Unknown("flaky".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 10 s + 20 s of backoff
        assert_eq!(ctx.now(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let ctx = ManualContext::shared();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&*ctx, &RetryConfig::default(), "q", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(OracleError::RateLimited(format!("attempt {attempt}"))) }
        })
        .await;

        assert_eq!(result, Err(OracleError::RateLimited("attempt 2".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 20 s + 60 s
        assert_eq!(ctx.now(), Duration::from_secs(80));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let ctx = ManualContext::shared();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&*ctx, &RetryConfig::default(), "q", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(OracleError::BadRequest("bad image".into())) }
        })
        .await;

        assert!(matches!(result, Err(OracleError::BadRequest(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.now(), Duration::ZERO);
    }
}
