//! Governing-tier assignment.
//!
//! Each task has exactly one governing priority tier from a fixed nine-level
//! hierarchy. Assignment is deterministic: the first matching trigger wins,
//! checked from tier 1 down.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::task::{Task, TaskCategory};

/// Risk score at or above which a task reaches the risk tier.
pub const RISK_THRESHOLD: f64 = 0.7;

/// The fixed priority hierarchy, 1 highest to 9 lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Tier {
    DeadlineProximity = 1,
    Risk = 2,
    Impact = 3,
    Child = 4,
    Health = 5,
    Work = 6,
    Stress = 7,
    Family = 8,
    Home = 9,
}

impl Tier {
    /// Tier position, 1–9.
    pub fn number(&self) -> u8 {
        *self as u8
    }

    pub fn from_number(n: u8) -> Option<Self> {
        Some(match n {
            1 => Tier::DeadlineProximity,
            2 => Tier::Risk,
            3 => Tier::Impact,
            4 => Tier::Child,
            5 => Tier::Health,
            6 => Tier::Work,
            7 => Tier::Stress,
            8 => Tier::Family,
            9 => Tier::Home,
            _ => return None,
        })
    }

    /// Human-readable tier name for audit details.
    pub fn name(&self) -> &'static str {
        match self {
            Tier::DeadlineProximity => "Deadline Proximity",
            Tier::Risk => "Risk of Negative Consequence",
            Tier::Impact => "Downstream Impact",
            Tier::Child => "Child-Related Needs",
            Tier::Health => "Personal Health Needs",
            Tier::Work => "Work Obligations",
            Tier::Stress => "Stress Reduction",
            Tier::Family => "Family/Social Commitments",
            Tier::Home => "Home Care",
        }
    }

    /// Structured reason token explaining why a task sits in this tier.
    pub fn reason_token(&self) -> &'static str {
        match self {
            Tier::DeadlineProximity => "deadline_within_24h",
            Tier::Risk => "high_risk",
            Tier::Impact => "high_impact",
            Tier::Child => "child_category",
            Tier::Health => "health_category",
            Tier::Work => "work_category",
            Tier::Stress => "personal_category",
            Tier::Family => "family_category",
            Tier::Home => "home_care_default",
        }
    }
}

/// Assign the governing tier for a task at instant `now`.
///
/// `unlocks_other` is true when at least one other open task depends on this
/// one; together with the configured impact threshold it triggers the
/// downstream-impact tier.
pub fn assign_tier(
    task: &Task,
    now: DateTime<Utc>,
    unlocks_other: bool,
    config: &EngineConfig,
) -> Tier {
    if has_urgent_deadline(task, now) {
        return Tier::DeadlineProximity;
    }
    if task.risk_score >= RISK_THRESHOLD {
        return Tier::Risk;
    }
    if task.impact_score >= config.impact_threshold || unlocks_other {
        return Tier::Impact;
    }
    match task.category {
        TaskCategory::Child => Tier::Child,
        TaskCategory::Health => Tier::Health,
        TaskCategory::Work => Tier::Work,
        TaskCategory::Personal => Tier::Stress,
        TaskCategory::Family => Tier::Family,
        TaskCategory::Home
        | TaskCategory::Admin
        | TaskCategory::Ideas
        | TaskCategory::Unknown => Tier::Home,
    }
}

/// Deadline within the next 24 hours and not already past.
fn has_urgent_deadline(task: &Task, now: DateTime<Utc>) -> bool {
    match task.deadline {
        Some(deadline) => {
            let until = deadline - now;
            until <= Duration::hours(24) && until > Duration::zero()
        }
        None => false,
    }
}

/// Outcome of reconciling a computed tier against the recorded one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierDecision {
    /// First assignment or unchanged: record without a change event.
    Recorded(Tier),
    /// The tier changed and the change applies now.
    Changed { from: Tier, to: Tier },
    /// The change was driven by low-confidence inference and is staged
    /// pending user confirmation; the recorded tier stays.
    Staged { current: Tier, proposed: Tier },
    /// `manual_priority_locked` froze the tier at its last value.
    Frozen(Tier),
}

/// Reconcile a freshly computed tier with the task's recorded tier.
///
/// `inference_confidence` is the lowest confidence among inference-applied
/// attributes that fed this assignment, `None` when no inference was
/// involved. AI-excluded tasks never reach here with `Some`.
pub fn reconcile_tier(
    task: &Task,
    computed: Tier,
    inference_confidence: Option<f64>,
    config: &EngineConfig,
) -> TierDecision {
    let recorded = task.tier.and_then(Tier::from_number);
    if task.manual_priority_locked {
        if let Some(current) = recorded {
            return TierDecision::Frozen(current);
        }
        // Nothing recorded yet: the first assignment still lands.
        return TierDecision::Recorded(computed);
    }
    match recorded {
        None => TierDecision::Recorded(computed),
        Some(current) if current == computed => TierDecision::Recorded(current),
        Some(current) => {
            if let Some(confidence) = inference_confidence {
                if confidence < config.tier_change_confirm_threshold {
                    return TierDecision::Staged {
                        current,
                        proposed: computed,
                    };
                }
            }
            TierDecision::Changed {
                from: current,
                to: computed,
            }
        }
    }
}
