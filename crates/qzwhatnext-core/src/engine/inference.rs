//! Attribute inference adapter.
//!
//! Boundary 3: for non-excluded tasks missing attributes, the engine asks an
//! adapter for structured, confidence-scored proposals. The adapter must be
//! side-effect-free and never sees excluded tasks. Inference may never set
//! the governing tier, override hard constraints, or produce user-facing
//! prose; everything it returns is a typed value with a confidence.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::config::EngineConfig;
use crate::task::{
    EnergyIntensity, Task, TaskCategory, DEFAULT_DURATION_CONFIDENCE, DEFAULT_IMPACT_SCORE,
    DEFAULT_RISK_SCORE, DURATION_ROUNDING_MIN, MAX_DURATION_MIN, MIN_DURATION_MIN,
};

/// The task subset an adapter is allowed to see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceInput {
    pub task_id: String,
    pub title: String,
    pub notes: Option<String>,
    pub category: TaskCategory,
    pub estimated_duration_min: u32,
    pub duration_confidence: f64,
}

impl InferenceInput {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            notes: task.notes.clone(),
            category: task.category,
            estimated_duration_min: task.estimated_duration_min,
            duration_confidence: task.duration_confidence,
        }
    }
}

/// One proposed value with its confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal<T> {
    pub value: T,
    pub confidence: f64,
}

impl<T> Proposal<T> {
    pub fn new(value: T, confidence: f64) -> Self {
        Self { value, confidence }
    }
}

/// Per-attribute proposals for one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributeProposals {
    pub category: Option<Proposal<TaskCategory>>,
    pub title: Option<Proposal<String>>,
    pub estimated_duration_min: Option<Proposal<u32>>,
    pub energy_intensity: Option<Proposal<EnergyIntensity>>,
    pub risk_score: Option<Proposal<f64>>,
    pub impact_score: Option<Proposal<f64>>,
    pub dependencies: Option<Proposal<Vec<String>>>,
}

/// Inference errors. Always non-fatal to a rebuild.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference call timed out")]
    Timeout,
    #[error("adapter error: {0}")]
    Adapter(String),
}

/// Boundary 3: structured attribute inference.
pub trait InferenceAdapter {
    fn propose(&self, input: &InferenceInput) -> Result<AttributeProposals, InferenceError>;
}

/// Whether a task is missing inferable attributes.
///
/// "Missing" means the attribute still holds its default sentinel; user-set
/// values are never overwritten by inference.
pub fn needs_inference(task: &Task) -> bool {
    task.category == TaskCategory::Unknown
        || task.duration_confidence <= DEFAULT_DURATION_CONFIDENCE
        || task.risk_score == DEFAULT_RISK_SCORE
        || task.impact_score == DEFAULT_IMPACT_SCORE
}

/// Result of applying proposals to a task.
#[derive(Debug, Clone, Default)]
pub struct AppliedInference {
    /// Names of attributes that were applied.
    pub applied: Vec<&'static str>,
    /// Lowest confidence among applied attributes, if any were.
    pub min_confidence: Option<f64>,
    /// Exact proposals that were applied, recorded for replayability.
    pub record: serde_json::Value,
}

impl AppliedInference {
    pub fn any(&self) -> bool {
        !self.applied.is_empty()
    }

    fn note(&mut self, name: &'static str, confidence: f64, value: serde_json::Value) {
        self.applied.push(name);
        self.min_confidence = Some(match self.min_confidence {
            Some(current) => current.min(confidence),
            None => confidence,
        });
        self.record[name] = serde_json::json!({"value": value, "confidence": confidence});
    }
}

/// Apply high-confidence proposals to a task.
///
/// Accepts an attribute only when its confidence meets the configured
/// threshold AND the attribute still holds its default. Durations are
/// rounded to the nearest 15 minutes and clamped to the allowed range.
pub fn apply_proposals(
    task: &mut Task,
    proposals: &AttributeProposals,
    config: &EngineConfig,
) -> AppliedInference {
    let threshold = config.confidence_threshold;
    let mut applied = AppliedInference {
        record: serde_json::json!({}),
        ..Default::default()
    };

    if let Some(p) = &proposals.category {
        if p.confidence >= threshold && task.category == TaskCategory::Unknown {
            task.category = p.value;
            applied.note(
                "category",
                p.confidence,
                serde_json::json!(p.value.as_str()),
            );
        }
    }
    if let Some(p) = &proposals.title {
        if p.confidence >= threshold && task.title.trim().is_empty() {
            task.title = p.value.clone();
            applied.note("title", p.confidence, serde_json::json!(p.value));
        }
    }
    if let Some(p) = &proposals.estimated_duration_min {
        if p.confidence >= threshold && task.duration_confidence <= DEFAULT_DURATION_CONFIDENCE {
            let rounded = round_duration(p.value);
            task.estimated_duration_min = rounded;
            task.duration_confidence = p.confidence;
            applied.note(
                "estimated_duration_min",
                p.confidence,
                serde_json::json!(rounded),
            );
        }
    }
    if let Some(p) = &proposals.energy_intensity {
        if p.confidence >= threshold && task.energy_intensity == EnergyIntensity::Medium {
            task.energy_intensity = p.value;
            applied.note(
                "energy_intensity",
                p.confidence,
                serde_json::json!(p.value.as_str()),
            );
        }
    }
    if let Some(p) = &proposals.risk_score {
        if p.confidence >= threshold && task.risk_score == DEFAULT_RISK_SCORE {
            task.risk_score = p.value.clamp(0.0, 1.0);
            applied.note("risk_score", p.confidence, serde_json::json!(task.risk_score));
        }
    }
    if let Some(p) = &proposals.impact_score {
        if p.confidence >= threshold && task.impact_score == DEFAULT_IMPACT_SCORE {
            task.impact_score = p.value.clamp(0.0, 1.0);
            applied.note(
                "impact_score",
                p.confidence,
                serde_json::json!(task.impact_score),
            );
        }
    }
    if let Some(p) = &proposals.dependencies {
        if p.confidence >= threshold && task.dependencies.is_empty() {
            task.dependencies = p.value.clone();
            applied.note(
                "dependencies",
                p.confidence,
                serde_json::json!(p.value),
            );
        }
    }
    applied
}

/// Round to the nearest 15-minute increment, then clamp to [5, 600].
pub fn round_duration(minutes: u32) -> u32 {
    let rounded = ((minutes + DURATION_ROUNDING_MIN / 2) / DURATION_ROUNDING_MIN)
        * DURATION_ROUNDING_MIN;
    rounded.clamp(MIN_DURATION_MIN, MAX_DURATION_MIN)
}

/// Call an adapter with a bounded retry budget. Non-fatal: the caller falls
/// back to defaults on `Err`.
pub fn propose_with_retry(
    adapter: &dyn InferenceAdapter,
    input: &InferenceInput,
    max_attempts: u32,
) -> Result<AttributeProposals, InferenceError> {
    let mut delay = std::time::Duration::from_millis(500);
    let cap = std::time::Duration::from_secs(5);
    let mut last_err = InferenceError::Adapter("no attempts made".to_string());
    for attempt in 1..=max_attempts.max(1) {
        match adapter.propose(input) {
            Ok(proposals) => return Ok(proposals),
            Err(e) => {
                warn!(task_id = %input.task_id, attempt, error = %e, "inference call failed");
                last_err = e;
                if attempt < max_attempts {
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(cap);
                }
            }
        }
    }
    Err(last_err)
}

/// Deterministic in-memory adapter for tests and replay: returns fixed
/// proposals per task id and records every input it was shown.
#[derive(Default)]
pub struct FixedInferenceAdapter {
    proposals: HashMap<String, AttributeProposals>,
    fail: bool,
    seen: Mutex<Vec<String>>,
}

impl FixedInferenceAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// An adapter whose every call fails, for outage testing.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn with_proposals(mut self, task_id: impl Into<String>, p: AttributeProposals) -> Self {
        self.proposals.insert(task_id.into(), p);
        self
    }

    /// Task ids this adapter has been shown.
    pub fn seen_task_ids(&self) -> Vec<String> {
        self.seen.lock().expect("adapter mutex").clone()
    }
}

impl InferenceAdapter for FixedInferenceAdapter {
    fn propose(&self, input: &InferenceInput) -> Result<AttributeProposals, InferenceError> {
        self.seen
            .lock()
            .expect("adapter mutex")
            .push(input.task_id.clone());
        if self.fail {
            return Err(InferenceError::Adapter("synthetic failure".to_string()));
        }
        Ok(self.proposals.get(&input.task_id).cloned().unwrap_or_default())
    }
}
