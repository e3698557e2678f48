//! Engine configuration.
//!
//! `EngineConfig` is an immutable value constructed once and threaded through
//! the rebuild pipeline. It is serde-deserializable so callers can load it
//! from a config file; the engine itself never reads global state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Allowed scheduling horizon lengths, in days.
pub const ALLOWED_HORIZON_DAYS: [u32; 3] = [7, 14, 30];

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Length of the rebuild window in days. One of 7/14/30.
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,
    /// Slot size for placement, in minutes.
    #[serde(default = "default_granularity")]
    pub scheduling_granularity_min: u32,
    /// Default task duration when none is provided, in minutes.
    #[serde(default = "default_duration")]
    pub duration_default_min: u32,
    /// Minimum inference confidence to accept a proposed attribute.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Minimum inference confidence to auto-apply a tier change; below this
    /// the change is staged pending user confirmation.
    #[serde(default = "default_tier_change_confirm")]
    pub tier_change_confirm_threshold: f64,
    /// Impact score at or above which a task reaches the downstream-impact
    /// tier.
    #[serde(default = "default_impact_threshold")]
    pub impact_threshold: f64,
    /// Per-call deadline for inference requests, in seconds.
    #[serde(default = "default_remote_timeout_secs")]
    pub inference_timeout_secs: u64,
    /// Per-call deadline for calendar reads/writes, in seconds.
    #[serde(default = "default_remote_timeout_secs")]
    pub calendar_timeout_secs: u64,
    /// Maximum attempts for a remote call before giving up.
    #[serde(default = "default_max_attempts")]
    pub remote_max_attempts: u32,
    /// Maximum age of a cached availability snapshot usable when the live
    /// read fails, in seconds.
    #[serde(default = "default_snapshot_max_age_secs")]
    pub availability_snapshot_max_age_secs: u64,
}

fn default_horizon_days() -> u32 {
    7
}
fn default_granularity() -> u32 {
    30
}
fn default_duration() -> u32 {
    30
}
fn default_confidence_threshold() -> f64 {
    0.6
}
fn default_tier_change_confirm() -> f64 {
    0.8
}
fn default_impact_threshold() -> f64 {
    0.7
}
fn default_remote_timeout_secs() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_snapshot_max_age_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            horizon_days: default_horizon_days(),
            scheduling_granularity_min: default_granularity(),
            duration_default_min: default_duration(),
            confidence_threshold: default_confidence_threshold(),
            tier_change_confirm_threshold: default_tier_change_confirm(),
            impact_threshold: default_impact_threshold(),
            inference_timeout_secs: default_remote_timeout_secs(),
            calendar_timeout_secs: default_remote_timeout_secs(),
            remote_max_attempts: default_max_attempts(),
            availability_snapshot_max_age_secs: default_snapshot_max_age_secs(),
        }
    }
}

impl EngineConfig {
    /// Clamp `horizon_days` to the nearest allowed value.
    ///
    /// Arbitrary horizons are rejected rather than honored so that two
    /// deployments never disagree on the rebuild window for the same input.
    pub fn normalized(mut self) -> Self {
        if !ALLOWED_HORIZON_DAYS.contains(&self.horizon_days) {
            let nearest = ALLOWED_HORIZON_DAYS
                .iter()
                .min_by_key(|d| d.abs_diff(self.horizon_days))
                .copied()
                .unwrap_or(7);
            self.horizon_days = nearest;
        }
        self
    }

    /// Horizon length as a chrono duration.
    pub fn horizon(&self) -> chrono::Duration {
        chrono::Duration::days(self.horizon_days as i64)
    }

    /// Per-call deadline for inference requests.
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    /// Per-call deadline for calendar requests.
    pub fn calendar_timeout(&self) -> Duration {
        Duration::from_secs(self.calendar_timeout_secs)
    }

    /// Staleness tolerance for availability snapshots.
    pub fn availability_snapshot_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.availability_snapshot_max_age_secs as i64)
    }
}
