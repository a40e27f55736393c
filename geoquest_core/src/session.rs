//! Explorer Session - Wires tracking and syncing to one signed-in identity.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    ExplorerSession                       │
//! │                                                          │
//! │  location fix ──► TrackingStateMachine::advance          │
//! │                         │ (state, delta)                 │
//! │                         ▼                                │
//! │                    SyncBuffer ──► flush worker ──► store │
//! │                                                          │
//! │  on_identity_changed: flush old, reset, hydrate new      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The host drives the session explicitly: it forwards location fixes,
//! background/foreground transitions and identity changes. There are no
//! implicit watchers.
//!
//! # Usage
//!
//! ```ignore
//! use geoquest_core::{ExplorerSession, GeoQuestConfig, SledStore};
//! use geoquest_env::TokioContext;
//!
//! let store = Arc::new(SledStore::open("geoquest.db")?);
//! let mut session =
//!     ExplorerSession::start(TokioContext::shared(), store, &GeoQuestConfig::default(), Some(id)).await?;
//!
//! session.on_location(fix);
//! session.on_backgrounded();
//! ```

use crate::config::GeoQuestConfig;
use crate::geo_grid::{CellId, Coordinate, GeoGrid};
use crate::quest_matcher::MatchOutcome;
use crate::store::{DurableStore, StoreError};
use crate::sync_buffer::{FlushReport, FlushTrigger, PendingView, SyncBuffer, SyncConfig};
use crate::tracking::{MoveDelta, TrackingState, TrackingStateMachine};
use geoquest_env::{GeoQuestContext, IdentityId};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Tracking state and buffer of the signed-in identity.
struct ActiveIdentity {
    identity: IdentityId,
    state: Mutex<TrackingState>,
    buffer: SyncBuffer,
}

impl ActiveIdentity {
    fn state(&self) -> MutexGuard<'_, TrackingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Display view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub identity: IdentityId,
    pub total_distance_meters: f64,
    pub points: f64,
    pub visited_cells: usize,
    pub pending: PendingView,
}

pub struct ExplorerSession<Ctx: GeoQuestContext> {
    ctx: Arc<Ctx>,
    store: Arc<dyn DurableStore>,
    machine: TrackingStateMachine,
    sync_config: SyncConfig,
    active: Option<ActiveIdentity>,
}

impl<Ctx: GeoQuestContext> ExplorerSession<Ctx> {
    /// Creates a session, loading `identity`'s durable state if signed in.
    pub async fn start(
        ctx: Arc<Ctx>,
        store: Arc<dyn DurableStore>,
        config: &GeoQuestConfig,
        identity: Option<IdentityId>,
    ) -> Result<Self, StoreError> {
        let machine = TrackingStateMachine::new(GeoGrid::new(config.grid.clone()), config.tracking.clone());
        let mut session = Self {
            ctx,
            store,
            machine,
            sync_config: config.sync.clone(),
            active: None,
        };
        if let Some(identity) = identity {
            session.active = Some(session.activate(identity).await?);
        }
        Ok(session)
    }

    async fn activate(&self, identity: IdentityId) -> Result<ActiveIdentity, StoreError> {
        let stored = self.store.load_state(identity).await?;
        let state = TrackingState::hydrate(&stored);
        info!(
            %identity,
            visited = state.visited_cells.len(),
            score = stored.accumulated_score,
            "session hydrated"
        );

        Ok(ActiveIdentity {
            identity,
            state: Mutex::new(state),
            buffer: SyncBuffer::start(&*self.ctx, self.store.clone(), identity, self.sync_config.clone()),
        })
    }

    pub fn identity(&self) -> Option<IdentityId> {
        self.active.as_ref().map(|a| a.identity)
    }

    pub fn grid(&self) -> &GeoGrid {
        self.machine.grid()
    }

    /// Applies one location fix. Never waits on the store.
    ///
    /// Returns `None` while signed out.
    pub fn on_location(&self, fix: Coordinate) -> Option<MoveDelta> {
        let active = self.active.as_ref()?;

        let delta = {
            let mut state = active.state();
            let (next, delta) = self.machine.advance(std::mem::take(&mut *state), fix);
            *state = next;
            delta
        };

        if delta.new_cell_visited {
            debug!(identity = %active.identity, cell = %delta.last_cell_id, "new cell");
        }
        active.buffer.record(&delta);
        Some(delta)
    }

    /// The host is being suspended: hand whatever is pending to the store.
    pub fn on_backgrounded(&self) -> bool {
        self.active
            .as_ref()
            .map_or(false, |a| a.buffer.request_flush(FlushTrigger::Background))
    }

    /// Manual flush.
    pub async fn flush(&self) -> Result<FlushReport, StoreError> {
        match &self.active {
            Some(active) => active.buffer.flush().await,
            None => Ok(FlushReport::Skipped),
        }
    }

    /// Waits for queued flushes of the current identity.
    pub async fn drain(&self) -> Result<(), StoreError> {
        match &self.active {
            Some(active) => active.buffer.drain().await,
            None => Ok(()),
        }
    }

    /// Switches to `identity` (or signs out with `None`).
    ///
    /// The previous identity's pending delta is queued for its store and its
    /// worker stopped; tracking state and buffer are rebuilt from scratch.
    /// If loading the new identity fails the session is left signed out.
    pub async fn on_identity_changed(&mut self, identity: Option<IdentityId>) -> Result<(), StoreError> {
        if self.identity() == identity {
            return Ok(());
        }

        if let Some(old) = self.active.take() {
            old.buffer.request_flush(FlushTrigger::IdentityChange);
            old.buffer.shutdown();
            info!(identity = %old.identity, "identity signed out");
        }

        if let Some(identity) = identity {
            self.active = Some(self.activate(identity).await?);
        }
        Ok(())
    }

    /// Reflects a quest solve in the local score.
    ///
    /// The store already holds the committed score; this only keeps the
    /// display in step. Ignored for any other identity.
    pub fn record_solve(&self, identity: IdentityId, outcome: &MatchOutcome) {
        let Some(active) = self.active.as_ref().filter(|a| a.identity == identity) else {
            return;
        };
        let awarded = outcome.score_awarded();
        if awarded != 0 {
            active.state().points += awarded as f64;
        }
    }

    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        let active = self.active.as_ref()?;
        let state = active.state();
        Some(SessionSnapshot {
            identity: active.identity,
            total_distance_meters: state.total_distance_meters,
            points: state.points,
            visited_cells: state.visited_cells.len(),
            pending: active.buffer.pending(),
        })
    }

    /// Footprints of every visited cell, sorted by cell id.
    pub fn visited_cell_polygons(&self) -> Vec<(CellId, [Coordinate; 4])> {
        let Some(active) = self.active.as_ref() else {
            return Vec::new();
        };
        let mut cells: Vec<CellId> = active.state().visited_cells.iter().copied().collect();
        cells.sort();
        cells
            .into_iter()
            .map(|cell| (cell, self.grid().polygon_of(cell)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CommitOutcome, StoredState};
    use crate::testing::{ManualContext, MemoryStore};
    use approx::assert_relative_eq;

    fn alice() -> IdentityId {
        IdentityId::from_seed(1)
    }

    fn bob() -> IdentityId {
        IdentityId::from_seed(2)
    }

    async fn session(store: &Arc<MemoryStore>, identity: Option<IdentityId>) -> ExplorerSession<ManualContext> {
        ExplorerSession::start(ManualContext::shared(), store.clone(), &GeoQuestConfig::default(), identity)
            .await
            .unwrap()
    }

    fn center(session: &ExplorerSession<ManualContext>, x: i64) -> Coordinate {
        session.grid().center_of(CellId::new(x, 0))
    }

    async fn settle(store: &MemoryStore, flushes: usize) {
        for _ in 0..50 {
            if store.flushes().len() >= flushes {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_start_hydrates_from_store() {
        let store = MemoryStore::shared();
        store.seed_state(
            alice(),
            StoredState {
                visited_cell_ids: vec!["0_0".into(), "1_0".into()],
                accumulated_score: 120,
                ..StoredState::default()
            },
        );
        let session = session(&store, Some(alice())).await;

        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.visited_cells, 2);
        assert_eq!(snapshot.points, 120.0);

        // Revisiting a stored cell earns no bonus
        let delta = session.on_location(center(&session, 1)).unwrap();
        assert!(!delta.new_cell_visited);
        assert_eq!(delta.gained_points, 0.0);
    }

    #[tokio::test]
    async fn test_signed_out_session_ignores_fixes() {
        let store = MemoryStore::shared();
        let session = session(&store, None).await;

        assert!(session.on_location(center(&session, 0)).is_none());
        assert!(!session.on_backgrounded());
        assert_eq!(session.flush().await.unwrap(), FlushReport::Skipped);
        assert!(session.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_walk_auto_flushes_at_threshold() {
        let store = MemoryStore::shared();
        let session = session(&store, Some(alice())).await;

        for x in 0..10 {
            session.on_location(center(&session, x));
        }
        session.drain().await.unwrap();

        let flushes = store.flushes();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].cells.len(), 10);
        assert_eq!(session.snapshot().unwrap().pending.cells, 0);
        assert_eq!(session.visited_cell_polygons().len(), 10);
    }

    #[tokio::test]
    async fn test_backgrounding_flushes_partial_buffer() {
        let store = MemoryStore::shared();
        let session = session(&store, Some(alice())).await;

        session.on_location(center(&session, 0));
        session.on_location(center(&session, 1));
        assert!(session.on_backgrounded());
        session.drain().await.unwrap();

        let state = store.state(alice());
        assert_eq!(state.visited_cell_ids.len(), 2);
        let snapshot = session.snapshot().unwrap();
        assert_eq!(state.accumulated_score, snapshot.points.round() as i64);
    }

    #[tokio::test]
    async fn test_identity_change_flushes_old_and_resets() {
        let store = MemoryStore::shared();
        let mut session = session(&store, Some(alice())).await;

        session.on_location(center(&session, 0));
        session.on_location(center(&session, 1));
        session.on_identity_changed(Some(bob())).await.unwrap();
        settle(&store, 1).await;

        let flushes = store.flushes();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].identity, alice());
        assert_eq!(flushes[0].cells.len(), 2);

        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.identity, bob());
        assert_eq!(snapshot.visited_cells, 0);
        assert_eq!(snapshot.points, 0.0);
        assert_eq!(snapshot.total_distance_meters, 0.0);

        // Bob's first fix in Alice's cell is a new cell for Bob
        let delta = session.on_location(center(&session, 0)).unwrap();
        assert!(delta.new_cell_visited);
    }

    #[tokio::test]
    async fn test_sign_out_and_same_identity() {
        let store = MemoryStore::shared();
        let mut session = session(&store, Some(alice())).await;
        session.on_location(center(&session, 0));

        // Same identity is a no-op and keeps state
        session.on_identity_changed(Some(alice())).await.unwrap();
        assert_eq!(session.snapshot().unwrap().visited_cells, 1);

        session.on_identity_changed(None).await.unwrap();
        assert!(session.identity().is_none());
        assert!(session.visited_cell_polygons().is_empty());
    }

    #[tokio::test]
    async fn test_record_solve_updates_local_points() {
        let store = MemoryStore::shared();
        let session = session(&store, Some(alice())).await;
        session.on_location(center(&session, 0));

        let outcome = MatchOutcome::Matched {
            quest_id: "q".into(),
            confidence: 95.0,
            reasoning: "same fountain".into(),
            score_awarded: 200,
            commit: CommitOutcome::Applied,
        };
        session.record_solve(bob(), &outcome);
        assert_relative_eq!(session.snapshot().unwrap().points, 50.0);

        session.record_solve(alice(), &outcome);
        assert_relative_eq!(session.snapshot().unwrap().points, 250.0);
    }
}
