//! Core environment context trait for GeoQuest engines.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the tracker, the sync
/// buffer and the quest matcher can run in both production (tokio) and
/// simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
/// - **Simulation**: `SimContext` - virtual clock advanced by `sleep`
///
/// # Determinism
///
/// Rate limiting, retry backoff and cache expiry all read time through this
/// trait, so a simulation run with the same inputs observes the same
/// timestamps.
#[async_trait]
pub trait GeoQuestContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for rate limiting and cache expiry.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    ///
    /// The flush worker of every sync buffer runs on a task spawned here.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
