//! The "TRACKING" Engine - Folding location fixes into an exploration record
//!
//! A pure state machine with a single transition, [`TrackingStateMachine::advance`]:
//! 1. Jitter Filter (sub-threshold movement is GPS noise)
//! 2. Movement Reward (points proportional to distance)
//! 3. Cell Discovery (flat bonus, once per cell per identity)
//!
//! The transition owns no I/O and cannot fail; buffering and persistence of
//! the resulting deltas live in [`crate::sync_buffer`].

use crate::distance::distance_meters;
use crate::geo_grid::{CellId, Coordinate, GeoGrid};
use crate::store::StoredState;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the TrackingStateMachine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Movements at or below this distance are treated as jitter (default: 3.0 m)
    pub noise_threshold_meters: f64,

    /// Points awarded per meter moved (default: 0.1)
    pub points_per_meter: f64,

    /// Flat bonus for entering a never-visited cell (default: 50.0)
    pub new_cell_bonus: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            noise_threshold_meters: 3.0,
            points_per_meter: 0.1,
            new_cell_bonus: 50.0,
        }
    }
}

// ============================================================================
// STATE
// ============================================================================

/// Accumulated exploration record of one identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingState {
    pub last_location: Option<Coordinate>,
    pub total_distance_meters: f64,

    /// Fractional until the durable-sync boundary rounds it
    pub points: f64,

    pub visited_cells: HashSet<CellId>,
}

impl TrackingState {
    /// Rebuilds the start state from what the durable store remembers.
    ///
    /// Distance and last location are session-local and start fresh.
    pub fn hydrate(stored: &StoredState) -> Self {
        let mut visited_cells = HashSet::with_capacity(stored.visited_cell_ids.len());
        for raw in &stored.visited_cell_ids {
            match raw.parse::<CellId>() {
                Ok(cell) => {
                    visited_cells.insert(cell);
                }
                Err(e) => warn!(error = %e, "skipping unreadable visited cell"),
            }
        }

        Self {
            last_location: None,
            total_distance_meters: 0.0,
            points: stored.accumulated_score as f64,
            visited_cells,
        }
    }

    pub fn has_visited(&self, cell: &CellId) -> bool {
        self.visited_cells.contains(cell)
    }
}

/// What one fix contributed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveDelta {
    pub gained_distance: f64,
    pub gained_points: f64,
    pub new_cell_visited: bool,
    pub last_cell_id: CellId,
}

// ============================================================================
// STATE MACHINE
// ============================================================================

/// Pure transition function over [`TrackingState`].
#[derive(Debug, Clone)]
pub struct TrackingStateMachine {
    grid: GeoGrid,
    config: TrackingConfig,
}

impl TrackingStateMachine {
    pub fn new(grid: GeoGrid, config: TrackingConfig) -> Self {
        Self { grid, config }
    }

    pub fn with_defaults() -> Self {
        Self::new(GeoGrid::with_defaults(), TrackingConfig::default())
    }

    pub fn grid(&self) -> &GeoGrid {
        &self.grid
    }

    /// Folds one fix into the state.
    ///
    /// Takes the state by value so the fold does not copy the visited set.
    pub fn advance(&self, mut state: TrackingState, fix: Coordinate) -> (TrackingState, MoveDelta) {
        // Step 1 + 2: Jitter filter, then movement reward
        let gained_distance = match state.last_location {
            Some(last) => {
                let d = distance_meters(last, fix);
                if d > self.config.noise_threshold_meters {
                    d
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        let movement_points = gained_distance * self.config.points_per_meter;

        // Step 3: Cell discovery (HashSet::insert doubles as the once-only guard)
        let cell = self.grid.cell_of(fix);
        let new_cell_visited = state.visited_cells.insert(cell);
        let bonus = if new_cell_visited {
            self.config.new_cell_bonus
        } else {
            0.0
        };

        // Step 4: Commit
        let gained_points = movement_points + bonus;
        state.last_location = Some(fix);
        state.total_distance_meters += gained_distance;
        state.points += gained_points;

        let delta = MoveDelta {
            gained_distance,
            gained_points,
            new_cell_visited,
            last_cell_id: cell,
        };

        (state, delta)
    }
}

impl Default for TrackingStateMachine {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn machine() -> TrackingStateMachine {
        TrackingStateMachine::with_defaults()
    }

    fn center(x: i64, y: i64) -> Coordinate {
        GeoGrid::with_defaults().center_of(CellId::new(x, y))
    }

    #[test]
    fn test_first_fix_awards_only_cell_bonus() {
        let (state, delta) = machine().advance(TrackingState::default(), center(0, 0));

        assert_eq!(delta.gained_distance, 0.0);
        assert_eq!(delta.gained_points, 50.0);
        assert!(delta.new_cell_visited);
        assert_eq!(delta.last_cell_id, CellId::new(0, 0));
        assert_eq!(state.points, 50.0);
        assert_eq!(state.last_location, Some(center(0, 0)));
    }

    #[test]
    fn test_same_fix_twice_is_absorbed() {
        let m = machine();
        let p = center(3, 3);
        let (state, _) = m.advance(TrackingState::default(), p);
        let (state, delta) = m.advance(state, p);

        assert_eq!(delta.gained_distance, 0.0);
        assert_eq!(delta.gained_points, 0.0);
        assert!(!delta.new_cell_visited);
        assert_eq!(state.points, 50.0);
        assert_eq!(state.visited_cells.len(), 1);
    }

    #[test]
    fn test_jitter_under_threshold_earns_nothing() {
        let m = machine();
        let p = center(0, 0);
        // ~2.2 m north
        let jitter = Coordinate::new(p.lat + 0.00002, p.lng);

        let (state, _) = m.advance(TrackingState::default(), p);
        let (state, delta) = m.advance(state, jitter);

        assert!(distance_meters(p, jitter) <= 3.0);
        assert_eq!(delta.gained_distance, 0.0);
        assert_eq!(delta.gained_points, 0.0);
        assert_eq!(state.total_distance_meters, 0.0);
        // The fix still becomes the new reference point
        assert_eq!(state.last_location, Some(jitter));
    }

    #[test]
    fn test_movement_reward_is_fractional() {
        let m = machine();
        let p = center(0, 0);
        // ~11 m north, same cell
        let q = Coordinate::new(p.lat + 0.0001, p.lng);

        let (state, _) = m.advance(TrackingState::default(), p);
        let (state, delta) = m.advance(state, q);

        let d = distance_meters(p, q);
        assert!(!delta.new_cell_visited);
        assert_relative_eq!(delta.gained_distance, d);
        assert_relative_eq!(delta.gained_points, d * 0.1);
        assert_relative_eq!(state.points, 50.0 + d * 0.1);
    }

    #[test]
    fn test_two_cells_award_exactly_two_bonuses() {
        let m = machine();
        let a = center(0, 0);
        let b = center(1, 0);

        // Wander inside cell A, cross to B, wander, come back to A
        let path = [
            a,
            Coordinate::new(a.lat + 0.0001, a.lng),
            Coordinate::new(a.lat - 0.0001, a.lng + 0.0001),
            b,
            Coordinate::new(b.lat + 0.0001, b.lng - 0.0001),
            Coordinate::new(b.lat, b.lng + 0.0001),
            a,
        ];

        let mut state = TrackingState::default();
        let mut bonuses = 0;
        for fix in path {
            let (next, delta) = m.advance(state, fix);
            if delta.new_cell_visited {
                bonuses += 1;
            }
            state = next;
        }

        assert_eq!(bonuses, 2);
        assert_eq!(state.visited_cells.len(), 2);
        assert_relative_eq!(state.points, 100.0 + state.total_distance_meters * 0.1, epsilon = 1e-9);
    }

    #[test]
    fn test_revisit_after_hydration_earns_no_bonus() {
        let stored = StoredState {
            visited_cell_ids: vec!["0_0".to_string(), "garbage".to_string(), "5_-1".to_string()],
            accumulated_score: 420,
            solved_quest_ids: Default::default(),
        };
        let state = TrackingState::hydrate(&stored);

        assert_eq!(state.visited_cells.len(), 2);
        assert_eq!(state.points, 420.0);
        assert!(state.last_location.is_none());

        let (state, delta) = machine().advance(state, center(5, -1));
        assert!(!delta.new_cell_visited);
        assert_eq!(state.points, 420.0);
    }
}
