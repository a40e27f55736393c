//! Sled-based persistent store
//!
//! Uses an embedded key-value database for durability. Two trees:
//! - `explorers`: `{identity}/cell/{x_y}`, `{identity}/solved/{quest}`,
//!   `{identity}/score` (i64, big-endian)
//! - `quests`: quest id -> JSON-encoded [`Quest`]
//!
//! Flushes and solve commits each run as a single sled transaction, so the
//! score and the sets they guard can never be observed half-written.

use crate::geo_grid::CellId;
use crate::quest::Quest;
use crate::store::{CommitOutcome, DurableStore, QuestRepository, StoreError, StoredState};
use async_trait::async_trait;
use geoquest_env::IdentityId;
use sled::transaction::{ConflictableTransactionResult, TransactionError, TransactionalTree};
use sled::IVec;
use std::path::Path;
use tracing::debug;

const CELL_SEGMENT: &str = "cell/";
const SOLVED_SEGMENT: &str = "solved/";
const SCORE_SEGMENT: &str = "score";

/// Sled-backed [`DurableStore`] and [`QuestRepository`].
pub struct SledStore {
    db: sled::Db,
    explorers: sled::Tree,
    quests: sled::Tree,
}

impl SledStore {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)
            .map_err(|e| StoreError::Storage(format!("Failed to open sled DB: {}", e)))?;
        Self::from_db(db)
    }

    /// Create a temporary store, removed when dropped
    pub fn open_temp() -> Result<Self, StoreError> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| StoreError::Storage(format!("Failed to open temp DB: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let explorers = db
            .open_tree("explorers")
            .map_err(|e| StoreError::Storage(format!("Failed to open explorers tree: {}", e)))?;
        let quests = db
            .open_tree("quests")
            .map_err(|e| StoreError::Storage(format!("Failed to open quests tree: {}", e)))?;
        Ok(Self { db, explorers, quests })
    }

    /// Insert or replace an active quest
    pub fn put_quest(&self, quest: &Quest) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(quest)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.quests
            .insert(quest.id.as_bytes(), bytes)
            .map_err(|e| StoreError::Storage(format!("Insert failed: {}", e)))?;
        Ok(())
    }

    /// Remove a quest from the active set. Returns whether it existed.
    pub fn retire_quest(&self, quest_id: &str) -> Result<bool, StoreError> {
        let previous = self
            .quests
            .remove(quest_id.as_bytes())
            .map_err(|e| StoreError::Storage(format!("Remove failed: {}", e)))?;
        Ok(previous.is_some())
    }

    async fn persist(&self) -> Result<(), StoreError> {
        self.db
            .flush_async()
            .await
            .map_err(|e| StoreError::Storage(format!("Flush failed: {}", e)))?;
        Ok(())
    }
}

fn identity_prefix(identity: IdentityId) -> String {
    format!("{}/", identity)
}

fn cell_key(identity: IdentityId, cell: &CellId) -> String {
    format!("{}/{}{}", identity, CELL_SEGMENT, cell)
}

fn solved_key(identity: IdentityId, quest_id: &str) -> String {
    format!("{}/{}{}", identity, SOLVED_SEGMENT, quest_id)
}

fn score_key(identity: IdentityId) -> String {
    format!("{}/{}", identity, SCORE_SEGMENT)
}

fn decode_score(bytes: &[u8]) -> i64 {
    <[u8; 8]>::try_from(bytes).map(i64::from_be_bytes).unwrap_or(0)
}

/// Adds `delta` to the score key inside a transaction.
fn add_score<E>(tx: &TransactionalTree, key: &str, delta: i64) -> ConflictableTransactionResult<(), E> {
    let current = tx.get(key)?.map(|v: IVec| decode_score(&v)).unwrap_or(0);
    let next = current.saturating_add(delta).to_be_bytes();
    tx.insert(key, &next[..])?;
    Ok(())
}

fn transaction_error(e: TransactionError<()>) -> StoreError {
    match e {
        TransactionError::Abort(()) => StoreError::storage("transaction aborted"),
        TransactionError::Storage(err) => StoreError::Storage(format!("Transaction failed: {}", err)),
    }
}

#[async_trait]
impl DurableStore for SledStore {
    async fn load_state(&self, identity: IdentityId) -> Result<StoredState, StoreError> {
        let prefix = identity_prefix(identity);
        let mut state = StoredState::default();

        for result in self.explorers.scan_prefix(prefix.as_bytes()) {
            let (key, value) = result
                .map_err(|e| StoreError::Storage(format!("Iteration failed: {}", e)))?;
            let key = String::from_utf8_lossy(&key);
            let Some(rest) = key.strip_prefix(prefix.as_str()) else {
                continue;
            };

            if let Some(cell) = rest.strip_prefix(CELL_SEGMENT) {
                state.visited_cell_ids.push(cell.to_string());
            } else if let Some(quest) = rest.strip_prefix(SOLVED_SEGMENT) {
                state.solved_quest_ids.insert(quest.to_string());
            } else if rest == SCORE_SEGMENT {
                state.accumulated_score = decode_score(&value);
            }
        }

        Ok(state)
    }

    async fn flush(
        &self,
        identity: IdentityId,
        cell_ids: &[CellId],
        points_delta: i64,
    ) -> Result<(), StoreError> {
        let cell_keys: Vec<String> = cell_ids.iter().map(|c| cell_key(identity, c)).collect();
        let score = score_key(identity);

        self.explorers
            .transaction(|tx| -> ConflictableTransactionResult<(), ()> {
                for key in &cell_keys {
                    tx.insert(key.as_str(), &[1u8][..])?;
                }
                add_score(tx, &score, points_delta)
            })
            .map_err(transaction_error)?;
        self.persist().await?;

        debug!(%identity, cells = cell_ids.len(), points_delta, "flush persisted");
        Ok(())
    }

    async fn commit_solve(
        &self,
        identity: IdentityId,
        quest_id: &str,
        score_delta: i64,
    ) -> Result<CommitOutcome, StoreError> {
        let solved = solved_key(identity, quest_id);
        let score = score_key(identity);

        let outcome = self
            .explorers
            .transaction(|tx| -> ConflictableTransactionResult<CommitOutcome, ()> {
                if tx.get(solved.as_str())?.is_some() {
                    return Ok(CommitOutcome::AlreadySolved);
                }
                tx.insert(solved.as_str(), &[1u8][..])?;
                add_score(tx, &score, score_delta)?;
                Ok(CommitOutcome::Applied)
            })
            .map_err(transaction_error)?;

        if outcome == CommitOutcome::Applied {
            self.persist().await?;
        }
        Ok(outcome)
    }
}

#[async_trait]
impl QuestRepository for SledStore {
    async fn list_active_quests(&self) -> Result<Vec<Quest>, StoreError> {
        let mut quests = Vec::new();
        for result in self.quests.iter() {
            let (_, value) = result
                .map_err(|e| StoreError::Storage(format!("Iteration failed: {}", e)))?;
            let quest: Quest = serde_json::from_slice(&value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            quests.push(quest);
        }
        Ok(quests)
    }
}
