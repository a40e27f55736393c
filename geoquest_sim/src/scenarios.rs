//! Deterministic scenarios for the GeoQuest engines.

use serde::{Serialize, Serializer};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// GQ-001: Long noisy walk, buffered sync must match the session
    CityWalk,

    /// GQ-002: Standing still with GPS jitter earns nothing
    StationaryJitter,

    /// GQ-003: Walk to each quest and photograph it
    QuestHunt,

    /// GQ-004: Oracle failing with rate limits and server errors
    FlakyOracle,

    /// GQ-005: Sign-out / sign-in between two explorers mid-walk
    IdentitySwap,

    /// GQ-006: Store dropping flushes, restore-on-failure enabled
    LossyStore,
}

impl ScenarioId {
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::CityWalk,
            ScenarioId::StationaryJitter,
            ScenarioId::QuestHunt,
            ScenarioId::FlakyOracle,
            ScenarioId::IdentitySwap,
            ScenarioId::LossyStore,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::CityWalk => "city_walk",
            ScenarioId::StationaryJitter => "stationary_jitter",
            ScenarioId::QuestHunt => "quest_hunt",
            ScenarioId::FlakyOracle => "flaky_oracle",
            ScenarioId::IdentitySwap => "identity_swap",
            ScenarioId::LossyStore => "lossy_store",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::CityWalk => "Noisy walk through random waypoints, store totals must track the session",
            ScenarioId::StationaryJitter => "10 minutes standing still with clamped GPS noise",
            ScenarioId::QuestHunt => "Visit and photograph five quests, each committed exactly once",
            ScenarioId::FlakyOracle => "40% oracle failures, retries paced and no double commits",
            ScenarioId::IdentitySwap => "Two explorers share a device, state never leaks between them",
            ScenarioId::LossyStore => "30% flush failures with restore, no visited cell lost",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Serialize for ScenarioId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "city_walk" | "citywalk" | "gq-001" => Ok(ScenarioId::CityWalk),
            "stationary_jitter" | "jitter" | "gq-002" => Ok(ScenarioId::StationaryJitter),
            "quest_hunt" | "questhunt" | "gq-003" => Ok(ScenarioId::QuestHunt),
            "flaky_oracle" | "flakyoracle" | "gq-004" => Ok(ScenarioId::FlakyOracle),
            "identity_swap" | "identityswap" | "gq-005" => Ok(ScenarioId::IdentitySwap),
            "lossy_store" | "lossystore" | "gq-006" => Ok(ScenarioId::LossyStore),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>(), Ok(id));
        }
        assert_eq!("GQ-003".parse::<ScenarioId>(), Ok(ScenarioId::QuestHunt));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
