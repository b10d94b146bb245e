// Engine configuration
//
// Plain config structs with defaults. All constants that every node
// must agree on (friction angle, thresholds) live here so that a
// deployment can pin them once and reuse them across rounds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Torque model constants
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TorqueConfig {
    /// Friction angle φ in degrees
    pub friction_angle_deg: f64,

    /// Friction coefficient μ
    pub friction_coefficient: f64,

    /// Minimum torque a validator needs to be proposer-eligible
    pub min_proposer_torque: f64,

    /// Cumulative torque a candidate needs to commit
    pub commit_threshold: f64,
}

impl Default for TorqueConfig {
    fn default() -> Self {
        Self {
            friction_angle_deg: 8.5,
            friction_coefficient: 0.15,
            min_proposer_torque: 8.0,
            commit_threshold: 24.0,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Torque model constants
    pub torque: TorqueConfig,

    /// How long the engine waits for the selected proposer's candidate
    pub proposal_timeout: Duration,

    /// How long the engine collects votes before aborting the round
    pub vote_timeout: Duration,

    /// Capacity of the engine event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            torque: TorqueConfig::default(),
            proposal_timeout: Duration::from_secs(2),
            vote_timeout: Duration::from_secs(4),
            event_channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Parse a deployment config; absent fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
