//! GeoQuest Deterministic Simulation Testing (DST) Harness
//!
//! Runs the real engines of `geoquest_core` against simulated collaborators
//! so that whole sessions (walks, quest hunts, identity swaps, failing
//! backends) replay exactly from one 64-bit seed.
//!
//! # Core Principle: Everything Non-Deterministic Is Intercepted
//!
//! - **Time**: a virtual clock; rate-limit waits and retry backoffs advance
//!   it instantly
//! - **GPS**: a seeded walker producing noisy fixes along a route
//! - **Backends**: an in-memory store and a scripted oracle, both with
//!   seeded fault injection
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      ScenarioRunner                        │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │ SimContext (virtual clock, forked ChaCha8 streams)   │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │      │                    │                     │          │
//! │ ┌────▼─────┐      ┌───────▼────────┐     ┌──────▼───────┐  │
//! │ │GpsWalker │─fix─►│ExplorerSession │     │ QuestMatcher │  │
//! │ └──────────┘      └───────┬────────┘     └──────┬───────┘  │
//! │                           │ flush               │ compare  │
//! │                    ┌──────▼──────┐       ┌──────▼───────┐  │
//! │                    │ MemoryStore │◄──────│ScriptedOracle│  │
//! │                    └─────────────┘commit └──────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use geoquest_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::QuestHunt);
//! assert!(result.passed);
//! ```

mod context;
mod oracle;
mod runner;
mod store;
mod walker;
pub mod scenarios;

pub use context::SimContext;
pub use oracle::{OracleCall, ScriptedOracle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, SimError};
pub use store::{MemoryStore, StoreStats};
pub use walker::{GpsWalker, WalkerConfig};
