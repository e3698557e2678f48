//! RRULE export for recurring calendar masters.
//!
//! Presets are rendered to RFC 5545 RRULE strings for the external calendar.
//! Export-only: RRULE strings are never parsed back.

use super::{RecurrenceFrequency, RecurrencePreset};

/// Render a preset as an RRULE string, without the leading `RRULE:` prefix.
pub fn preset_to_rrule(preset: &RecurrencePreset) -> String {
    let freq = match preset.frequency {
        RecurrenceFrequency::Daily => "DAILY",
        RecurrenceFrequency::Weekly => "WEEKLY",
        RecurrenceFrequency::Monthly => "MONTHLY",
        RecurrenceFrequency::Yearly => "YEARLY",
    };
    let mut parts = vec![format!("FREQ={freq}")];
    if preset.interval > 1 {
        parts.push(format!("INTERVAL={}", preset.interval));
    }
    if let Some(days) = &preset.by_weekday {
        if !days.is_empty() {
            let tokens: Vec<&str> = days.iter().map(|d| d.rrule_token()).collect();
            parts.push(format!("BYDAY={}", tokens.join(",")));
        }
    }
    // UNTIL stays date-anchored; the calendar interprets it as end of day UTC.
    if let Some(until) = preset.until_date {
        parts.push(format!("UNTIL={}T235959Z", until.format("%Y%m%d")));
    }
    parts.join(";")
}
