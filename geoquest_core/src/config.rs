//! Engine-wide configuration, loaded from JSON.
//!
//! Every section is optional; missing fields take the component defaults.
//!
//! ```json
//! {
//!   "grid": { "cell_size_meters": 25.0 },
//!   "sync": { "flush_threshold_cells": 5 },
//!   "matcher": { "retry": { "max_retries": 1 } }
//! }
//! ```

use crate::geo_grid::GridConfig;
use crate::quest_matcher::MatcherConfig;
use crate::sync_buffer::SyncConfig;
use crate::tracking::TrackingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoQuestConfig {
    pub grid: GridConfig,
    pub tracking: TrackingConfig,
    pub sync: SyncConfig,
    pub matcher: MatcherConfig,
}

impl GeoQuestConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Rejects values the engines cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if !(self.grid.cell_size_meters.is_finite() && self.grid.cell_size_meters > 0.0) {
            return invalid("grid.cell_size_meters must be positive");
        }
        if !(-90.0..90.0).contains(&self.grid.origin.lat) {
            return invalid("grid.origin.lat must lie strictly between the poles");
        }
        if self.tracking.noise_threshold_meters < 0.0 || self.tracking.points_per_meter < 0.0 {
            return invalid("tracking values must not be negative");
        }
        if self.sync.flush_threshold_cells == 0 {
            return invalid("sync.flush_threshold_cells must be at least 1");
        }
        if !(0.0..=100.0).contains(&self.matcher.confidence_threshold) {
            return invalid("matcher.confidence_threshold must be within 0-100");
        }
        if self.matcher.max_payload_bytes == 0 {
            return invalid("matcher.max_payload_bytes must be positive");
        }
        Ok(())
    }
}
