//! The "MATCH" Engine - Photo verification against nearby quests
//!
//! One call to [`QuestMatcher::match_photo`] runs a whole attempt:
//! 1. Candidate selection (per-quest radius, minus the solved set)
//! 2. Oracle loop (paced by the shared [`RateLimiter`], wrapped in [`with_retry`])
//! 3. Resolution (best qualifying verdict, strictly highest confidence)
//! 4. Commit (solved set re-checked, guarded increment in the store)
//!
//! No-candidate and no-match are ordinary outcomes, not errors. The only
//! durable write is the commit in step 4.

use crate::distance::distance_meters;
use crate::geo_grid::Coordinate;
use crate::image_cache::ImageCache;
use crate::oracle::{ImageOracle, ImagePayload, OracleError};
use crate::quest::{ComparisonResult, Quest};
use crate::rate_limiter::RateLimiter;
use crate::retry::{with_retry, RetryConfig};
use crate::store::{CommitOutcome, DurableStore, QuestRepository, StoreError};
use geoquest_env::{GeoQuestContext, IdentityId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const NO_QUESTS_IN_RANGE: &str = "No quests within range of your location";
const ALL_SOLVED: &str = "All nearby quests are already completed";
const DEFAULT_NO_MATCH: &str = "The photo did not match any nearby quest";

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the QuestMatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Minimum gap between consecutive oracle calls, process-wide (default: 4000 ms)
    pub min_call_interval_ms: u64,

    /// Minimum confidence (0-100) for a match to count (default: 90)
    pub confidence_threshold: f64,

    /// Ceiling on the combined encoded size of both images (default: 18 MiB)
    pub max_payload_bytes: usize,

    /// Lifetime of an encoded image in the cache (default: 5 min)
    pub image_cache_ttl_ms: u64,

    pub retry: RetryConfig,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            min_call_interval_ms: 4_000,
            confidence_threshold: 90.0,
            max_payload_bytes: 18 * 1024 * 1024,
            image_cache_ttl_ms: 300_000,
            retry: RetryConfig::default(),
        }
    }
}

impl MatcherConfig {
    pub fn min_call_interval(&self) -> Duration {
        Duration::from_millis(self.min_call_interval_ms)
    }

    pub fn image_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.image_cache_ttl_ms)
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

/// Terminal outcome of a matching attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched {
        quest_id: String,
        confidence: f64,
        reasoning: String,

        /// Quest score if the commit applied, 0 if the quest was already solved
        score_awarded: i64,
        commit: CommitOutcome,
    },
    NoCandidates {
        reason: String,
        confidence: f64,
    },
    NoMatch {
        reasoning: String,
        best_confidence: f64,
    },
}

impl MatchOutcome {
    fn no_candidates(reason: &str) -> Self {
        Self::NoCandidates {
            reason: reason.to_string(),
            confidence: 0.0,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }

    /// Score newly credited to the identity by this attempt.
    pub fn score_awarded(&self) -> i64 {
        match self {
            Self::Matched { score_awarded, .. } => *score_awarded,
            _ => 0,
        }
    }
}

/// Failures that abort a matching attempt.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The user's photo could not be prepared for the oracle
    #[error("User image rejected: {0}")]
    UserImage(OracleError),
}

type CommitKey = (IdentityId, String);
type CommitLocks = Mutex<HashMap<CommitKey, Arc<tokio::sync::Mutex<()>>>>;

/// Handle on the per-(identity, quest) commit lock. The map entry is removed
/// when the last handle drops.
struct CommitSlot<'a> {
    locks: &'a CommitLocks,
    key: CommitKey,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> CommitSlot<'a> {
    fn claim(locks: &'a CommitLocks, key: CommitKey) -> Self {
        let lock = locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(key.clone())
            .or_default()
            .clone();
        Self { locks, key, lock }
    }
}

impl Drop for CommitSlot<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Handles are only cloned under the map lock: two means ours plus the map's
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

// ============================================================================
// MATCHER
// ============================================================================

/// Verifies photos against nearby quests.
///
/// The rate limiter and image cache are process-wide handles; several
/// matchers may share them.
pub struct QuestMatcher<Ctx: GeoQuestContext> {
    ctx: Arc<Ctx>,
    config: MatcherConfig,
    store: Arc<dyn DurableStore>,
    quests: Arc<dyn QuestRepository>,
    oracle: Arc<dyn ImageOracle>,
    limiter: Arc<RateLimiter<Ctx>>,
    images: Arc<ImageCache<Ctx>>,
    in_flight: CommitLocks,
}

impl<Ctx: GeoQuestContext> QuestMatcher<Ctx> {
    pub fn new(
        ctx: Arc<Ctx>,
        config: MatcherConfig,
        store: Arc<dyn DurableStore>,
        quests: Arc<dyn QuestRepository>,
        oracle: Arc<dyn ImageOracle>,
        limiter: Arc<RateLimiter<Ctx>>,
        images: Arc<ImageCache<Ctx>>,
    ) -> Self {
        Self {
            ctx,
            config,
            store,
            quests,
            oracle,
            limiter,
            images,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Quests within their own radius of `location` and not yet solved by
    /// `identity`, as `(in_range_count, candidates)`.
    pub async fn candidates(
        &self,
        identity: IdentityId,
        location: Coordinate,
    ) -> Result<(usize, Vec<Quest>), StoreError> {
        let solved = self.store.load_state(identity).await?.solved_quest_ids;
        let in_range: Vec<Quest> = self
            .quests
            .list_active_quests()
            .await?
            .into_iter()
            .filter(|quest| distance_meters(location, quest.location) <= quest.radius_meters)
            .collect();

        let count = in_range.len();
        let candidates = in_range
            .into_iter()
            .filter(|quest| !solved.contains(&quest.id))
            .collect();
        Ok((count, candidates))
    }

    /// Runs one matching attempt for `user_image` taken at `location`.
    pub async fn match_photo(
        &self,
        identity: IdentityId,
        user_image: &str,
        location: Coordinate,
    ) -> Result<MatchOutcome, MatchError> {
        let (in_range, candidates) = self.candidates(identity, location).await?;
        if in_range == 0 {
            info!(%identity, "no quests in range");
            return Ok(MatchOutcome::no_candidates(NO_QUESTS_IN_RANGE));
        }
        if candidates.is_empty() {
            info!(%identity, in_range, "every quest in range already solved");
            return Ok(MatchOutcome::no_candidates(ALL_SOLVED));
        }

        let user_payload = self
            .images
            .get_or_encode(user_image)
            .await
            .map_err(MatchError::UserImage)?;
        let limit = self.config.max_payload_bytes;
        if user_payload.size_bytes() > limit {
            return Err(MatchError::UserImage(OracleError::PayloadTooLarge {
                bytes: user_payload.size_bytes(),
                limit,
            }));
        }

        debug!(%identity, candidates = candidates.len(), "comparing photo");

        let mut best: Option<(&Quest, ComparisonResult)> = None;
        let mut closest: Option<ComparisonResult> = None;
        let mut last_error: Option<OracleError> = None;

        for quest in &candidates {
            let result = match self.compare(&user_payload, quest).await {
                Ok(Some(result)) => result,
                Ok(None) => continue,
                Err(e) => {
                    warn!(quest = %quest.id, error = %e, "candidate failed");
                    last_error = Some(e);
                    continue;
                }
            };
            debug!(
                quest = %quest.id,
                is_match = result.is_match,
                confidence = result.confidence,
                "oracle verdict"
            );

            if closest
                .as_ref()
                .map_or(true, |c| result.confidence > c.confidence)
            {
                closest = Some(result.clone());
            }

            let qualifies =
                result.is_match && result.confidence >= self.config.confidence_threshold;
            let beats_best = best
                .as_ref()
                .map_or(true, |(_, b)| result.confidence > b.confidence);
            if qualifies && beats_best {
                best = Some((quest, result));
            }
        }

        let Some((quest, result)) = best else {
            let (reasoning, best_confidence) = match (closest, last_error) {
                (Some(c), _) => (c.reasoning, c.confidence),
                (None, Some(e)) => (format!("Comparison failed: {}", e), 0.0),
                (None, None) => (DEFAULT_NO_MATCH.to_string(), 0.0),
            };
            info!(%identity, best_confidence, "no match");
            return Ok(MatchOutcome::NoMatch {
                reasoning,
                best_confidence,
            });
        };

        let commit = self.commit(identity, quest).await?;
        let score_awarded = match commit {
            CommitOutcome::Applied => quest.score,
            CommitOutcome::AlreadySolved => 0,
        };
        info!(
            %identity,
            quest = %quest.id,
            confidence = result.confidence,
            ?commit,
            score_awarded,
            "quest matched"
        );

        Ok(MatchOutcome::Matched {
            quest_id: quest.id.clone(),
            confidence: result.confidence,
            reasoning: result.reasoning,
            score_awarded,
            commit,
        })
    }

    /// One candidate's oracle call with pacing and retries.
    ///
    /// `Ok(None)` means the quest has no reference image and was skipped.
    async fn compare(
        &self,
        user_payload: &ImagePayload,
        quest: &Quest,
    ) -> Result<Option<ComparisonResult>, OracleError> {
        let Some(reference) = quest.reference_image.as_deref() else {
            debug!(quest = %quest.id, "no reference image, skipping");
            return Ok(None);
        };

        let reference_payload = self.images.get_or_encode(reference).await?;
        let combined = user_payload.size_bytes() + reference_payload.size_bytes();
        if combined > self.config.max_payload_bytes {
            return Err(OracleError::PayloadTooLarge {
                bytes: combined,
                limit: self.config.max_payload_bytes,
            });
        }

        let description = quest.description.as_str();
        let reference_payload = &reference_payload;
        let result = with_retry(&*self.ctx, &self.config.retry, &quest.id, |attempt| async move {
            let waited = self.limiter.acquire().await;
            debug!(quest = %quest.id, attempt, waited_ms = waited.as_millis() as u64, "oracle call");
            self.oracle
                .compare(user_payload, reference_payload, description)
                .await
        })
        .await?;

        Ok(Some(result))
    }

    /// Guarded commit: commits for one (identity, quest) run one at a time,
    /// each re-reading the solved set before writing. A later attempt sees
    /// the earlier one's result, so a failed commit is retried rather than
    /// reported as solved.
    async fn commit(&self, identity: IdentityId, quest: &Quest) -> Result<CommitOutcome, StoreError> {
        let slot = CommitSlot::claim(&self.in_flight, (identity, quest.id.clone()));
        let _turn = match slot.lock.try_lock() {
            Ok(turn) => turn,
            Err(_) => {
                debug!(%identity, quest = %quest.id, "commit in flight, waiting");
                slot.lock.lock().await
            }
        };

        let state = self.store.load_state(identity).await?;
        if state.solved_quest_ids.contains(&quest.id) {
            return Ok(CommitOutcome::AlreadySolved);
        }
        self.store.commit_solve(identity, &quest.id, quest.score).await
    }
}
