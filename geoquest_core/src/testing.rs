//! Shared fakes for unit tests: a manual clock, an in-memory store and a
//! scripted oracle.

use crate::geo_grid::CellId;
use crate::oracle::{ImageOracle, ImagePayload, OracleError};
use crate::quest::{ComparisonResult, Quest};
use crate::store::{CommitOutcome, DurableStore, QuestRepository, StoreError, StoredState};
use async_trait::async_trait;
use geoquest_env::{GeoQuestContext, IdentityId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Clock that only moves when someone sleeps or advances it.
#[derive(Default)]
pub struct ManualContext {
    now_ns: Mutex<u64>,
}

impl ManualContext {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, by: Duration) {
        *self.now_ns.lock().unwrap() += by.as_nanos() as u64;
    }
}

#[async_trait]
impl GeoQuestContext for ManualContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(*self.now_ns.lock().unwrap())
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    fn seed(&self) -> u64 {
        0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlushCall {
    pub identity: IdentityId,
    pub cells: Vec<CellId>,
    pub points: i64,
}

/// In-memory store with a call log and injectable flush failures.
#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<IdentityId, StoredState>>,
    quests: Mutex<Vec<Quest>>,
    flushes: Mutex<Vec<FlushCall>>,
    failing_flushes: AtomicUsize,
    failing_commits: AtomicUsize,
    pub commit_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_quests(quests: Vec<Quest>) -> Arc<Self> {
        let store = Self::default();
        *store.quests.lock().unwrap() = quests;
        Arc::new(store)
    }

    pub fn seed_state(&self, identity: IdentityId, state: StoredState) {
        self.states.lock().unwrap().insert(identity, state);
    }

    pub fn state(&self, identity: IdentityId) -> StoredState {
        self.states.lock().unwrap().get(&identity).cloned().unwrap_or_default()
    }

    pub fn flushes(&self) -> Vec<FlushCall> {
        self.flushes.lock().unwrap().clone()
    }

    /// The next `n` flush calls fail.
    pub fn fail_next_flushes(&self, n: usize) {
        self.failing_flushes.store(n, Ordering::SeqCst);
    }

    /// The next `n` solve commits fail.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load_state(&self, identity: IdentityId) -> Result<StoredState, StoreError> {
        Ok(self.state(identity))
    }

    async fn flush(
        &self,
        identity: IdentityId,
        cell_ids: &[CellId],
        points_delta: i64,
    ) -> Result<(), StoreError> {
        self.flushes.lock().unwrap().push(FlushCall {
            identity,
            cells: cell_ids.to_vec(),
            points: points_delta,
        });

        let failing = self.failing_flushes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_flushes.store(failing - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected".into()));
        }

        let mut states = self.states.lock().unwrap();
        let state = states.entry(identity).or_default();
        for cell in cell_ids {
            let key = cell.to_string();
            if !state.visited_cell_ids.contains(&key) {
                state.visited_cell_ids.push(key);
            }
        }
        state.accumulated_score += points_delta;
        Ok(())
    }

    async fn commit_solve(
        &self,
        identity: IdentityId,
        quest_id: &str,
        score_delta: i64,
    ) -> Result<CommitOutcome, StoreError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        // Let a concurrent attempt reach its own commit
        tokio::task::yield_now().await;

        let failing = self.failing_commits.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_commits.store(failing - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("down".into()));
        }

        let mut states = self.states.lock().unwrap();
        let state = states.entry(identity).or_default();
        if !state.solved_quest_ids.insert(quest_id.to_string()) {
            return Ok(CommitOutcome::AlreadySolved);
        }
        state.accumulated_score += score_delta;
        Ok(CommitOutcome::Applied)
    }
}

#[async_trait]
impl QuestRepository for MemoryStore {
    async fn list_active_quests(&self) -> Result<Vec<Quest>, StoreError> {
        Ok(self.quests.lock().unwrap().clone())
    }
}

/// Oracle answering from per-reference scripts and logging call times.
pub struct ScriptedOracle {
    ctx: Arc<ManualContext>,
    scripts: Mutex<HashMap<String, VecDeque<Result<ComparisonResult, OracleError>>>>,
    calls: Mutex<Vec<(String, Duration)>>,
}

impl ScriptedOracle {
    pub fn new(ctx: Arc<ManualContext>) -> Self {
        Self {
            ctx,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue responses for a reference URL, consumed in order. The last one repeats.
    pub fn script(&self, reference_url: &str, responses: Vec<Result<ComparisonResult, OracleError>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(reference_url.to_string(), responses.into());
    }

    pub fn calls(&self) -> Vec<(String, Duration)> {
        self.calls.lock().unwrap().clone()
    }
}

pub fn verdict(is_match: bool, confidence: f64) -> ComparisonResult {
    ComparisonResult {
        is_match,
        confidence,
        reasoning: format!("match={is_match} at {confidence}"),
    }
}

#[async_trait]
impl ImageOracle for ScriptedOracle {
    async fn compare(
        &self,
        _user_image: &ImagePayload,
        reference_image: &ImagePayload,
        _description: &str,
    ) -> Result<ComparisonResult, OracleError> {
        let key = match reference_image {
            ImagePayload::Remote { url } => url.clone(),
            ImagePayload::Inline { mime_type, .. } => mime_type.clone(),
        };
        self.calls.lock().unwrap().push((key.clone(), self.ctx.now()));
        // Lets concurrent attempts interleave around the call
        tokio::task::yield_now().await;

        let mut scripts = self.scripts.lock().unwrap();
        let Some(queue) = scripts.get_mut(&key) else {
            return Err(OracleError::NotFound(key));
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        }
    }
}
