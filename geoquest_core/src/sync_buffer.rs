//! Batched synchronization of tracking deltas with the durable store.
//!
//! # Flow
//!
//! ```text
//! on_location ──record()──► PendingBuffer ──snapshot (atomic take)──► job queue
//!                                                                        │
//!                                      flush worker (single task) ◄──────┘
//!                                                │
//!                                                └──► DurableStore::flush
//! ```
//!
//! Snapshots are taken and queued under the same lock, and one worker drains
//! the queue in order, so generation N always reaches the store before N+1.
//! Recording never waits on the store.

use crate::geo_grid::CellId;
use crate::store::{DurableStore, StoreError};
use crate::tracking::MoveDelta;
use geoquest_env::{EnvError, GeoQuestContext, IdentityId};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the SyncBuffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Pending new cells that trigger an automatic flush (default: 10)
    pub flush_threshold_cells: usize,

    /// Re-merge a snapshot into the live buffer when its flush fails
    /// (default: false - failed deltas are dropped)
    pub restore_on_failure: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_threshold_cells: 10,
            restore_on_failure: false,
        }
    }
}

// ============================================================================
// BUFFER
// ============================================================================

/// Deltas not yet handed to the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingBuffer {
    pub pending_cell_ids: Vec<CellId>,
    pub pending_points: f64,

    /// Number of snapshots taken so far
    pub generation: u64,
}

impl PendingBuffer {
    pub fn record(&mut self, delta: &MoveDelta) {
        if delta.new_cell_visited && !self.pending_cell_ids.contains(&delta.last_cell_id) {
            self.pending_cell_ids.push(delta.last_cell_id);
        }
        self.pending_points += delta.gained_points;
    }

    /// Points as they will be sent: rounded to the nearest integer.
    pub fn rounded_points(&self) -> i64 {
        self.pending_points.round() as i64
    }

    /// True when a flush would have nothing to send.
    pub fn is_empty(&self) -> bool {
        self.pending_cell_ids.is_empty() && self.rounded_points() == 0
    }

    /// Moves the contents out and starts a new generation.
    fn take(&mut self, identity: IdentityId) -> FlushSnapshot {
        self.generation += 1;
        let snapshot = FlushSnapshot {
            identity,
            generation: self.generation,
            cell_ids: std::mem::take(&mut self.pending_cell_ids),
            points_delta: self.rounded_points(),
        };
        self.pending_points = 0.0;
        snapshot
    }

    /// Puts a failed snapshot's data back.
    fn restore(&mut self, snapshot: &FlushSnapshot) {
        for cell in &snapshot.cell_ids {
            if !self.pending_cell_ids.contains(cell) {
                self.pending_cell_ids.push(*cell);
            }
        }
        self.pending_points += snapshot.points_delta as f64;
    }
}

/// One generation of buffered data on its way to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushSnapshot {
    pub identity: IdentityId,
    pub generation: u64,
    pub cell_ids: Vec<CellId>,
    pub points_delta: i64,
}

/// Why a flush was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    Threshold,
    Background,
    Manual,
    IdentityChange,
}

/// Result of a flush request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FlushReport {
    /// Nothing pending; no store call was made
    Skipped,

    Flushed {
        generation: u64,
        cells: usize,
        points_delta: i64,
    },
}

/// Current buffer contents, for display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PendingView {
    pub cells: usize,
    pub points: f64,
    pub generation: u64,
}

enum FlushJob {
    Flush {
        snapshot: FlushSnapshot,
        trigger: FlushTrigger,
        reply: Option<oneshot::Sender<Result<FlushReport, StoreError>>>,
    },
    Barrier(oneshot::Sender<()>),
}

// ============================================================================
// SYNC BUFFER
// ============================================================================

/// Per-identity pending buffer plus the worker that flushes it.
///
/// Created with [`SyncBuffer::start`], stopped with [`SyncBuffer::shutdown`].
pub struct SyncBuffer {
    identity: IdentityId,
    config: SyncConfig,
    buffer: Arc<Mutex<PendingBuffer>>,
    jobs: mpsc::UnboundedSender<FlushJob>,
}

impl SyncBuffer {
    /// Creates an empty buffer and spawns its flush worker on `ctx`.
    pub fn start<Ctx: GeoQuestContext>(
        ctx: &Ctx,
        store: Arc<dyn DurableStore>,
        identity: IdentityId,
        config: SyncConfig,
    ) -> Self {
        let buffer = Arc::new(Mutex::new(PendingBuffer::default()));
        let (jobs, queue) = mpsc::unbounded_channel();

        ctx.spawn(
            "sync-buffer-flush",
            run_flush_worker(store, queue, buffer.clone(), config.restore_on_failure),
        );
        debug!(%identity, "sync buffer started");

        Self {
            identity,
            config,
            buffer,
            jobs,
        }
    }

    pub fn identity(&self) -> IdentityId {
        self.identity
    }

    fn lock(&self) -> MutexGuard<'_, PendingBuffer> {
        lock_buffer(&self.buffer)
    }

    /// Adds one delta. Queues an automatic flush when the cell threshold is
    /// reached and returns whether it did.
    pub fn record(&self, delta: &MoveDelta) -> bool {
        let mut buffer = self.lock();
        buffer.record(delta);
        if buffer.pending_cell_ids.len() < self.config.flush_threshold_cells {
            return false;
        }
        self.enqueue(&mut buffer, FlushTrigger::Threshold, None)
    }

    /// Queues a flush without waiting for the store. Failures are logged.
    ///
    /// Returns false if there was nothing to flush.
    pub fn request_flush(&self, trigger: FlushTrigger) -> bool {
        let mut buffer = self.lock();
        if buffer.is_empty() {
            return false;
        }
        self.enqueue(&mut buffer, trigger, None)
    }

    /// Flushes now and waits for the store's answer.
    ///
    /// Earlier queued generations are delivered first.
    pub async fn flush(&self) -> Result<FlushReport, StoreError> {
        let reply = {
            let mut buffer = self.lock();
            if buffer.is_empty() {
                return Ok(FlushReport::Skipped);
            }
            let (tx, rx) = oneshot::channel();
            if !self.enqueue(&mut buffer, FlushTrigger::Manual, Some(tx)) {
                return Err(EnvError::channel_closed("flush worker stopped").into());
            }
            rx
        };

        reply
            .await
            .map_err(|_| StoreError::from(EnvError::channel_closed("flush reply dropped")))?
    }

    /// Waits until every generation queued so far has been handed to the store.
    pub async fn drain(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(FlushJob::Barrier(tx))
            .map_err(|_| EnvError::channel_closed("flush worker stopped"))?;
        rx.await
            .map_err(|_| EnvError::channel_closed("flush barrier dropped"))?;
        Ok(())
    }

    pub fn pending(&self) -> PendingView {
        let buffer = self.lock();
        PendingView {
            cells: buffer.pending_cell_ids.len(),
            points: buffer.pending_points,
            generation: buffer.generation,
        }
    }

    /// Stops accepting work. Generations already queued are still delivered;
    /// anything left in the buffer is discarded.
    pub fn shutdown(self) {
        debug!(identity = %self.identity, pending = ?self.pending(), "sync buffer stopped");
    }

    /// Snapshot and queue under the caller's lock. Returns false if the
    /// worker is gone (the snapshot is put back).
    fn enqueue(
        &self,
        buffer: &mut PendingBuffer,
        trigger: FlushTrigger,
        reply: Option<oneshot::Sender<Result<FlushReport, StoreError>>>,
    ) -> bool {
        let snapshot = buffer.take(self.identity);
        debug!(
            generation = snapshot.generation,
            cells = snapshot.cell_ids.len(),
            points = snapshot.points_delta,
            ?trigger,
            "flush queued"
        );

        match self.jobs.send(FlushJob::Flush { snapshot, trigger, reply }) {
            Ok(()) => true,
            Err(mpsc::error::SendError(job)) => {
                if let FlushJob::Flush { snapshot, .. } = job {
                    buffer.restore(&snapshot);
                }
                warn!(identity = %self.identity, "flush worker gone; delta kept in buffer");
                false
            }
        }
    }
}

fn lock_buffer(buffer: &Mutex<PendingBuffer>) -> MutexGuard<'_, PendingBuffer> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_flush_worker(
    store: Arc<dyn DurableStore>,
    mut queue: mpsc::UnboundedReceiver<FlushJob>,
    buffer: Arc<Mutex<PendingBuffer>>,
    restore_on_failure: bool,
) {
    while let Some(job) = queue.recv().await {
        let (snapshot, trigger, reply) = match job {
            FlushJob::Barrier(done) => {
                let _ = done.send(());
                continue;
            }
            FlushJob::Flush { snapshot, trigger, reply } => (snapshot, trigger, reply),
        };

        let result = store
            .flush(snapshot.identity, &snapshot.cell_ids, snapshot.points_delta)
            .await
            .map(|()| FlushReport::Flushed {
                generation: snapshot.generation,
                cells: snapshot.cell_ids.len(),
                points_delta: snapshot.points_delta,
            });

        match &result {
            Ok(_) => info!(
                identity = %snapshot.identity,
                generation = snapshot.generation,
                cells = snapshot.cell_ids.len(),
                points = snapshot.points_delta,
                ?trigger,
                "flushed"
            ),
            Err(e) if restore_on_failure => {
                warn!(generation = snapshot.generation, error = %e, "flush failed; restoring delta");
                lock_buffer(&buffer).restore(&snapshot);
            }
            Err(e) => warn!(
                generation = snapshot.generation,
                cells = snapshot.cell_ids.len(),
                points = snapshot.points_delta,
                error = %e,
                "flush failed; delta dropped"
            ),
        }

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }
    debug!("flush worker exited");
}
