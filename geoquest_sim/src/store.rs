//! In-memory durable store with seeded fault injection.

use async_trait::async_trait;
use geoquest_core::{CellId, CommitOutcome, DurableStore, Quest, QuestRepository, StoreError, StoredState};
use geoquest_env::IdentityId;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Call counters, reported with each scenario result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub flush_calls: u64,
    pub flush_failures: u64,
    pub commit_calls: u64,
    pub commits_applied: u64,
}

#[derive(Default)]
struct Explorer {
    cells: BTreeSet<CellId>,
    score: i64,
    solved: BTreeSet<String>,
}

struct Inner {
    explorers: HashMap<IdentityId, Explorer>,
    quests: Vec<Quest>,
    stats: StoreStats,
    rng: ChaCha8Rng,
}

/// Set-union / guarded-increment store living in memory.
///
/// Each flush fails with probability `flush_failure_rate`, drawn from the
/// store's own RNG stream so runs are reproducible.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    flush_failure_rate: f64,
}

impl MemoryStore {
    pub fn new(rng: ChaCha8Rng) -> Self {
        Self {
            inner: Mutex::new(Inner {
                explorers: HashMap::new(),
                quests: Vec::new(),
                stats: StoreStats::default(),
                rng,
            }),
            flush_failure_rate: 0.0,
        }
    }

    pub fn with_flush_failure_rate(mut self, rate: f64) -> Self {
        self.flush_failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_quest(&self, quest: Quest) {
        self.lock().quests.push(quest);
    }

    pub fn stats(&self) -> StoreStats {
        self.lock().stats
    }

    pub fn visited_count(&self, identity: IdentityId) -> usize {
        self.lock().explorers.get(&identity).map_or(0, |e| e.cells.len())
    }

    pub fn score(&self, identity: IdentityId) -> i64 {
        self.lock().explorers.get(&identity).map_or(0, |e| e.score)
    }

    pub fn solved_count(&self, identity: IdentityId) -> usize {
        self.lock().explorers.get(&identity).map_or(0, |e| e.solved.len())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load_state(&self, identity: IdentityId) -> Result<StoredState, StoreError> {
        let inner = self.lock();
        let Some(explorer) = inner.explorers.get(&identity) else {
            return Ok(StoredState::default());
        };
        Ok(StoredState {
            visited_cell_ids: explorer.cells.iter().map(CellId::to_string).collect(),
            accumulated_score: explorer.score,
            solved_quest_ids: explorer.solved.iter().cloned().collect(),
        })
    }

    async fn flush(&self, identity: IdentityId, cell_ids: &[CellId], points_delta: i64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.stats.flush_calls += 1;

        if self.flush_failure_rate > 0.0 && inner.rng.gen_bool(self.flush_failure_rate) {
            inner.stats.flush_failures += 1;
            debug!(%identity, cells = cell_ids.len(), "injected flush failure");
            return Err(StoreError::Unavailable("injected fault".into()));
        }

        let explorer = inner.explorers.entry(identity).or_default();
        explorer.cells.extend(cell_ids.iter().copied());
        explorer.score += points_delta;
        Ok(())
    }

    async fn commit_solve(
        &self,
        identity: IdentityId,
        quest_id: &str,
        score_delta: i64,
    ) -> Result<CommitOutcome, StoreError> {
        let mut inner = self.lock();
        inner.stats.commit_calls += 1;

        let explorer = inner.explorers.entry(identity).or_default();
        if !explorer.solved.insert(quest_id.to_string()) {
            return Ok(CommitOutcome::AlreadySolved);
        }
        explorer.score += score_delta;
        inner.stats.commits_applied += 1;
        Ok(CommitOutcome::Applied)
    }
}

#[async_trait]
impl QuestRepository for MemoryStore {
    async fn list_active_quests(&self) -> Result<Vec<Quest>, StoreError> {
        Ok(self.lock().quests.clone())
    }
}
