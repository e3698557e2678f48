//! Scheduled blocks and per-task placement outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who placed a block on the calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduledBy {
    System,
    User,
}

impl ScheduledBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledBy::System => "system",
            ScheduledBy::User => "user",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "user" => ScheduledBy::User,
            _ => ScheduledBy::System,
        }
    }
}

/// A half-open `[start_time, end_time)` placement on the calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledBlock {
    pub id: String,
    pub user_id: String,
    /// Task this block schedules.
    pub entity_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub scheduled_by: ScheduledBy,
    /// Locked blocks are immune to rebuild movement.
    pub locked: bool,
    /// Set when a sync attempt failed and must be retried.
    pub sync_pending: bool,
    /// External event id, null until synced.
    pub calendar_event_id: Option<String>,
    /// Etag of the external event for optimistic concurrency.
    pub calendar_etag: Option<String>,
    /// External event's last-updated timestamp.
    pub calendar_updated: Option<DateTime<Utc>>,
}

impl ScheduledBlock {
    pub fn new(
        user_id: impl Into<String>,
        entity_id: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        scheduled_by: ScheduledBy,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            entity_id: entity_id.into(),
            start_time,
            end_time,
            scheduled_by,
            locked: false,
            sync_pending: false,
            calendar_event_id: None,
            calendar_etag: None,
            calendar_updated: None,
        }
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end_time - self.start_time).num_minutes()
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_time < end && self.end_time > start
    }
}

/// Why a task could not be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowReason {
    /// Not enough free time anywhere in the horizon.
    NoCapacity,
    /// Free time exists but not before the deadline.
    DeadlineUnreachable,
    /// The flexibility window contains no usable free time.
    FlexWindowEmpty,
    /// A dependency itself overflowed or was never placed.
    DepUnplaced,
}

impl OverflowReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowReason::NoCapacity => "no_capacity",
            OverflowReason::DeadlineUnreachable => "deadline_unreachable",
            OverflowReason::FlexWindowEmpty => "flex_window_empty",
            OverflowReason::DepUnplaced => "dep_unplaced",
        }
    }
}

/// Final outcome for one task in a rebuild. Every task ends in exactly one of
/// these; nothing is dropped silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Placement {
    /// Blocks emitted for this task, in start order.
    Scheduled { blocks: Vec<ScheduledBlock> },
    /// No feasible placement; carries a structured reason.
    Overflow { reason: OverflowReason },
    /// The task keeps its existing user-made or locked placement; the
    /// rebuild does not touch it.
    Pinned,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_block_duration_and_overlap() {
        let now = Utc::now();
        let block = ScheduledBlock::new("u1", "t1", now, now + Duration::minutes(30), ScheduledBy::System);
        assert_eq!(block.duration_minutes(), 30);
        assert!(block.overlaps(now + Duration::minutes(29), now + Duration::minutes(60)));
        // Half-open: touching at the boundary is not an overlap.
        assert!(!block.overlaps(now + Duration::minutes(30), now + Duration::minutes(60)));
    }

    #[test]
    fn test_overflow_reason_tokens() {
        assert_eq!(OverflowReason::NoCapacity.as_str(), "no_capacity");
        assert_eq!(OverflowReason::DepUnplaced.as_str(), "dep_unplaced");
    }
}
