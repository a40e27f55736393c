//! Scripted image-comparison oracle for simulation.
//!
//! The oracle plays the "ground truth" role for photo verification:
//! - A photo matches a reference when both name the same subject
//!   (`.../user/<subject>.jpg` vs `.../ref/<subject>.jpg`)
//! - Per-reference scripts override that rule with fixed verdict sequences
//! - A seeded failure rate injects rate-limit and server errors
//!
//! Every call is logged with its virtual timestamp so runs can check pacing.

use crate::context::SimContext;
use async_trait::async_trait;
use geoquest_core::{ComparisonResult, ImageOracle, ImagePayload, OracleError};
use geoquest_env::GeoQuestContext;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const MATCH_CONFIDENCE: f64 = 95.0;
pub const MISMATCH_CONFIDENCE: f64 = 12.0;

/// One logged oracle call.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleCall {
    pub reference: String,
    pub at: Duration,
}

struct Inner {
    scripts: HashMap<String, VecDeque<Result<ComparisonResult, OracleError>>>,
    calls: Vec<OracleCall>,
    rng: ChaCha8Rng,
}

pub struct ScriptedOracle {
    ctx: Arc<SimContext>,
    inner: Mutex<Inner>,
    failure_rate: f64,
}

/// Subject named by an image URL: its file stem.
pub fn subject_of(url: &str) -> &str {
    let file = url.rsplit('/').next().unwrap_or(url);
    file.split('.').next().unwrap_or(file)
}

fn key_of(payload: &ImagePayload) -> String {
    match payload {
        ImagePayload::Remote { url } => url.clone(),
        ImagePayload::Inline { data, .. } => format!("inline:{}", data.len()),
    }
}

impl ScriptedOracle {
    pub fn new(ctx: Arc<SimContext>, rng: ChaCha8Rng) -> Self {
        Self {
            ctx,
            inner: Mutex::new(Inner {
                scripts: HashMap::new(),
                calls: Vec::new(),
                rng,
            }),
            failure_rate: 0.0,
        }
    }

    /// Each call fails with this probability, split evenly between
    /// rate-limit and server errors.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Responses for one reference, consumed in order; the last one repeats.
    pub fn script(&self, reference: &str, responses: Vec<Result<ComparisonResult, OracleError>>) {
        self.lock().scripts.insert(reference.to_string(), responses.into());
    }

    pub fn calls(&self) -> Vec<OracleCall> {
        self.lock().calls.clone()
    }

    /// Smallest gap between consecutive calls, if there were at least two.
    pub fn min_call_gap(&self) -> Option<Duration> {
        self.lock()
            .calls
            .windows(2)
            .map(|pair| pair[1].at.saturating_sub(pair[0].at))
            .min()
    }
}

#[async_trait]
impl ImageOracle for ScriptedOracle {
    async fn compare(
        &self,
        user_image: &ImagePayload,
        reference_image: &ImagePayload,
        description: &str,
    ) -> Result<ComparisonResult, OracleError> {
        let user = key_of(user_image);
        let reference = key_of(reference_image);

        let mut inner = self.lock();
        inner.calls.push(OracleCall {
            reference: reference.clone(),
            at: self.ctx.now(),
        });

        if let Some(queue) = inner.scripts.get_mut(&reference) {
            let next = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
            if let Some(response) = next {
                return response;
            }
        }

        if self.failure_rate > 0.0 && inner.rng.gen_bool(self.failure_rate) {
            return Err(if inner.rng.gen_bool(0.5) {
                OracleError::RateLimited("simulated 429".into())
            } else {
                OracleError::Server("simulated 503".into())
            });
        }

        let same = subject_of(&user) == subject_of(&reference);
        Ok(ComparisonResult {
            is_match: same,
            confidence: if same { MATCH_CONFIDENCE } else { MISMATCH_CONFIDENCE },
            reasoning: if same {
                format!("Photo shows {}", description)
            } else {
                format!("Photo does not show {}", description)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn oracle() -> ScriptedOracle {
        ScriptedOracle::new(SimContext::shared(1), ChaCha8Rng::seed_from_u64(1))
    }

    #[test]
    fn test_subject_of() {
        assert_eq!(subject_of("https://sim.geoquest/ref/clock-tower.jpg"), "clock-tower");
        assert_eq!(subject_of("fountain"), "fountain");
    }

    #[tokio::test]
    async fn test_same_subject_matches() {
        let oracle = oracle();
        let user = ImagePayload::remote("https://sim/user/fountain.jpg");

        let hit = oracle
            .compare(&user, &ImagePayload::remote("https://sim/ref/fountain.jpg"), "the fountain")
            .await
            .unwrap();
        let miss = oracle
            .compare(&user, &ImagePayload::remote("https://sim/ref/bridge.jpg"), "the bridge")
            .await
            .unwrap();

        assert!(hit.is_match && hit.confidence == MATCH_CONFIDENCE);
        assert!(!miss.is_match);
        assert_eq!(oracle.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_script_overrides_and_last_repeats() {
        let oracle = oracle();
        let reference = "https://sim/ref/fountain.jpg";
        oracle.script(
            reference,
            vec![Err(OracleError::Server("down".into())), Err(OracleError::NotFound("gone".into()))],
        );
        let user = ImagePayload::remote("https://sim/user/fountain.jpg");
        let reference = ImagePayload::remote(reference);

        for expected in ["down", "gone", "gone"] {
            let err = oracle.compare(&user, &reference, "").await.unwrap_err();
            assert!(err.to_string().contains(expected));
        }
    }
}
