//! Durable store and quest repository interfaces.
//!
//! The engine issues exactly three operations against durable state:
//! load an identity's record, flush a buffered delta, and commit a quest
//! solve. Implementations must make `flush` a set-union on cells plus an
//! additive score increment, and `commit_solve` a guarded increment that is
//! a no-op for an already-solved quest.

use crate::geo_grid::CellId;
use crate::quest::Quest;
use async_trait::async_trait;
use geoquest_env::{EnvError, IdentityId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Env(#[from] EnvError),
}

impl StoreError {
    pub fn storage(msg: impl std::fmt::Display) -> Self {
        Self::Storage(msg.to_string())
    }
}

/// An identity's durable record, as returned by `load_state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    /// Text cell ids (`"x_y"`) as the store keeps them
    pub visited_cell_ids: Vec<String>,

    pub accumulated_score: i64,

    pub solved_quest_ids: HashSet<String>,
}

/// Result of a guarded solve commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    /// Quest recorded and score incremented
    Applied,

    /// Quest was already in the solved set; nothing changed
    AlreadySolved,
}

/// Persistent per-identity exploration state.
///
/// Implementations must be thread-safe; the flush worker and quest matcher
/// call into the same store concurrently.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn load_state(&self, identity: IdentityId) -> Result<StoredState, StoreError>;

    /// Set-union `cell_ids` into the visited set and add `points_delta` to the score.
    async fn flush(
        &self,
        identity: IdentityId,
        cell_ids: &[CellId],
        points_delta: i64,
    ) -> Result<(), StoreError>;

    /// Atomically add `quest_id` to the solved set and `score_delta` to the
    /// score, unless the quest is already solved.
    async fn commit_solve(
        &self,
        identity: IdentityId,
        quest_id: &str,
        score_delta: i64,
    ) -> Result<CommitOutcome, StoreError>;
}

/// Source of currently active quests.
#[async_trait]
pub trait QuestRepository: Send + Sync {
    async fn list_active_quests(&self) -> Result<Vec<Quest>, StoreError>;
}
