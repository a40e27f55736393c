//! Process-wide pacing of oracle calls.
//!
//! One limiter is created per process and shared by handle with every
//! [`crate::quest_matcher::QuestMatcher`]. Callers queue on an async mutex,
//! so no two oracle calls start within `min_interval` of each other, even
//! across unrelated matching sessions.

use geoquest_env::GeoQuestContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

pub struct RateLimiter<Ctx: GeoQuestContext> {
    ctx: Arc<Ctx>,
    min_interval: Duration,

    /// Context time at which the previous call was released
    last_call: Mutex<Option<Duration>>,
}

impl<Ctx: GeoQuestContext> RateLimiter<Ctx> {
    pub fn new(ctx: Arc<Ctx>, min_interval: Duration) -> Self {
        Self {
            ctx,
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub fn shared(ctx: Arc<Ctx>, min_interval: Duration) -> Arc<Self> {
        Arc::new(Self::new(ctx, min_interval))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until a call may start, then claims the slot.
    ///
    /// The lock is held through the wait, which is what serializes callers.
    /// Returns how long this caller was held back.
    pub async fn acquire(&self) -> Duration {
        let mut last_call = self.last_call.lock().await;

        let mut waited = Duration::ZERO;
        if let Some(previous) = *last_call {
            let elapsed = self.ctx.now().saturating_sub(previous);
            if elapsed < self.min_interval {
                waited = self.min_interval - elapsed;
                debug!(wait_ms = waited.as_millis() as u64, "pacing oracle call");
                self.ctx.sleep(waited).await;
            }
        }

        *last_call = Some(self.ctx.now());
        waited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualContext;

    #[tokio::test]
    async fn test_first_call_is_immediate() {
        let ctx = ManualContext::shared();
        let limiter = RateLimiter::new(ctx.clone(), Duration::from_secs(4));

        assert_eq!(limiter.acquire().await, Duration::ZERO);
        assert_eq!(ctx.now(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_back_to_back_calls_are_spaced() {
        let ctx = ManualContext::shared();
        let limiter = RateLimiter::new(ctx.clone(), Duration::from_secs(4));

        limiter.acquire().await;
        let t1 = ctx.now();
        limiter.acquire().await;
        let t2 = ctx.now();

        assert!(t2 - t1 >= Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn test_elapsed_time_counts_toward_interval() {
        let ctx = ManualContext::shared();
        let limiter = RateLimiter::new(ctx.clone(), Duration::from_secs(4));

        limiter.acquire().await;
        ctx.advance(Duration::from_secs(3));
        assert_eq!(limiter.acquire().await, Duration::from_secs(1));

        ctx.advance(Duration::from_secs(10));
        assert_eq!(limiter.acquire().await, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_shared_across_tasks() {
        let ctx = ManualContext::shared();
        let limiter = RateLimiter::shared(ctx.clone(), Duration::from_secs(4));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = limiter.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                ctx.now()
            }));
        }

        let mut starts = Vec::new();
        for handle in handles {
            starts.push(handle.await.unwrap());
        }
        starts.sort();

        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(4));
        }
    }
}
