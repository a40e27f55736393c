//! GeoQuest Core - Exploration tracking and photo-quest verification
//!
//! This library keeps two independent flows consistent with a durable store:
//! 1. **Exploration**: location fixes fold into a per-identity record of
//!    distance, points and visited grid cells, synced in batches
//! 2. **Quests**: a photo taken near a quest is verified by an external
//!    image-comparison oracle and, on a confident match, committed once
//! 3. **Pacing**: oracle calls share a process-wide rate limiter, retry
//!    policy and encoded-image cache

pub mod config;
pub mod distance;
pub mod geo_grid;
pub mod image_cache;
pub mod oracle;
pub mod quest;
pub mod quest_matcher;
pub mod rate_limiter;
pub mod retry;
pub mod session;
pub mod sled_store;
pub mod store;
pub mod sync_buffer;
pub mod tracking;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use config::{ConfigError, GeoQuestConfig};
pub use distance::distance_meters;
pub use geo_grid::{CellId, Coordinate, GeoGrid, GridConfig};
pub use image_cache::{ImageCache, ImageCodec, JpegImageCodec};
pub use oracle::{ImageOracle, ImagePayload, OracleError};
pub use quest::{ComparisonResult, Quest};
pub use quest_matcher::{MatchError, MatchOutcome, MatcherConfig, QuestMatcher};
pub use rate_limiter::RateLimiter;
pub use retry::RetryConfig;
pub use session::{ExplorerSession, SessionSnapshot};
pub use sled_store::SledStore;
pub use store::{CommitOutcome, DurableStore, QuestRepository, StoreError, StoredState};
pub use sync_buffer::{FlushReport, FlushTrigger, SyncBuffer, SyncConfig};
pub use tracking::{MoveDelta, TrackingConfig, TrackingState, TrackingStateMachine};
