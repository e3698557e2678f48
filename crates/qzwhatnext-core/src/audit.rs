//! Audit events.
//!
//! Every decision the engine takes produces an append-only audit record with
//! a structured `details` object. Records are flushed in the same transaction
//! as the state change they describe, so partial failures never leave
//! undocumented mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    TaskImported,
    TaskUpdated,
    AttributeInferred,
    TierChanged,
    ScheduleBuilt,
    ScheduleUpdated,
    Rescheduled,
    Completed,
    OverflowFlagged,
    CalendarEditImported,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::TaskImported => "task_imported",
            AuditEventType::TaskUpdated => "task_updated",
            AuditEventType::AttributeInferred => "attribute_inferred",
            AuditEventType::TierChanged => "tier_changed",
            AuditEventType::ScheduleBuilt => "schedule_built",
            AuditEventType::ScheduleUpdated => "schedule_updated",
            AuditEventType::Rescheduled => "rescheduled",
            AuditEventType::Completed => "completed",
            AuditEventType::OverflowFlagged => "overflow_flagged",
            AuditEventType::CalendarEditImported => "calendar_edit_imported",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "task_imported" => AuditEventType::TaskImported,
            "task_updated" => AuditEventType::TaskUpdated,
            "attribute_inferred" => AuditEventType::AttributeInferred,
            "tier_changed" => AuditEventType::TierChanged,
            "schedule_built" => AuditEventType::ScheduleBuilt,
            "schedule_updated" => AuditEventType::ScheduleUpdated,
            "rescheduled" => AuditEventType::Rescheduled,
            "completed" => AuditEventType::Completed,
            "overflow_flagged" => AuditEventType::OverflowFlagged,
            "calendar_edit_imported" => AuditEventType::CalendarEditImported,
            _ => return None,
        })
    }
}

/// A single append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    /// Entity the event is about (task, block, or series id).
    pub entity_id: String,
    /// Structured details. Engine-emitted events carry the rebuild id here.
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        user_id: impl Into<String>,
        event_type: AuditEventType,
        entity_id: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            timestamp: Utc::now(),
            event_type,
            entity_id: entity_id.into(),
            details,
        }
    }
}
