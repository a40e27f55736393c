//! GeoQuest Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing GeoQuest engines
//! to run in both **Production** (tokio) and **Simulation** (virtual clock)
//! environments.
//!
//! # Core Concept: The Reactor Pattern
//!
//! For Deterministic Simulation Testing (DST), we intercept:
//! - Time (`now()`, `sleep()`)
//! - Task spawning (`spawn()`)
//!
//! The oracle rate limiter, the retry backoff and the image cache only ever
//! read time through [`GeoQuestContext`], so a simulated run can fast-forward
//! through minutes of backoff without wall-clock waits.
//!
//! # Example
//!
//! ```ignore
//! use geoquest_env::GeoQuestContext;
//!
//! async fn paced<Ctx: GeoQuestContext>(ctx: &Ctx) {
//!     loop {
//!         ctx.sleep(Duration::from_secs(4)).await;
//!         call_oracle().await;
//!     }
//! }
//! ```

mod context;
mod types;
mod error;
mod tokio_impl;

pub use context::GeoQuestContext;
pub use types::IdentityId;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
