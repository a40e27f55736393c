//! Quest records and oracle verdicts.

use crate::geo_grid::Coordinate;
use serde::{Deserialize, Serialize};

/// A photo quest: reach the place, photograph the subject.
///
/// Quests are read-mostly snapshots fetched from the quest repository.
/// Whether a quest is solved is per identity and comes from that identity's
/// solved-id list, not from this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quest {
    pub id: String,

    pub location: Coordinate,

    /// Each quest carries its own unlock radius
    pub radius_meters: f64,

    /// Fixed reward granted on completion
    pub score: i64,

    /// Source URI/URL of the reference photograph
    pub reference_image: Option<String>,

    /// Text description handed to the oracle alongside the images
    pub description: String,
}

/// Verdict returned by the image-comparison oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub is_match: bool,

    /// 0-100
    pub confidence: f64,

    pub reasoning: String,
}
