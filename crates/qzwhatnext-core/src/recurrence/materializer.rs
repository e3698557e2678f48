//! Recurring series materialization.
//!
//! Expands each active series into concrete task occurrences for the current
//! horizon under habit (non-accumulating) semantics: at most one open
//! occurrence per series, missed occurrences never queue up, and re-running
//! within the same horizon creates nothing new.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::audit::{AuditEvent, AuditEventType};
use crate::error::{ConstraintViolation, CoreError, Result};
use crate::storage::{AuditRepository, Database, RecurringTaskSeriesRepository, TaskRepository};
use crate::task::{local_midnight, Task, TaskStatus};
use crate::user::User;

use super::{choose_n_days, RecurrenceFrequency, RecurringTaskSeries};

/// What one materializer run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    /// Open occurrences whose window had passed, flipped to missed.
    pub missed: usize,
    /// New occurrences created.
    pub created: usize,
}

/// Materializes recurring series into tasks.
pub struct Materializer<'a> {
    db: &'a Database,
}

impl<'a> Materializer<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Materialize occurrences for `user` within `[window_start, window_end)`.
    ///
    /// Idempotent: the dedupe key `(user, series, occurrence_start)` makes a
    /// second invocation within the same horizon a no-op.
    pub fn run(
        &self,
        user: &User,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<MaterializeReport> {
        let tz = user.tz();
        let task_repo = TaskRepository::new(self.db);
        let series_repo = RecurringTaskSeriesRepository::new(self.db);
        let audit_repo = AuditRepository::new(self.db);
        let mut report = MaterializeReport::default();

        // Habit roll-forward: open occurrences whose window has passed are
        // missed, not queued.
        for task in
            task_repo.open_recurrence_tasks_with_window_before(&user.id, window_start)?
        {
            let mut missed = task.clone();
            missed.status = TaskStatus::Missed;
            task_repo.update(&missed)?;
            audit_repo.append(&AuditEvent::new(
                &user.id,
                AuditEventType::ScheduleUpdated,
                &task.id,
                json!({"reason": "occurrence_window_passed", "series_id": task.recurrence_series_id}),
            ))?;
            report.missed += 1;
        }

        let start_day = window_start.with_timezone(&tz).date_naive();
        let end_day = window_end.with_timezone(&tz).date_naive();

        for series in series_repo.list_active(&user.id)? {
            // At most one open occurrence per series.
            if !task_repo.open_tasks_for_series(&user.id, &series.id)?.is_empty() {
                debug!(series_id = %series.id, "open occurrence exists, skipping");
                continue;
            }
            let Some(day) = next_occurrence_day(&series, start_day, end_day) else {
                continue;
            };
            let occurrence_start = local_midnight(day, tz);
            let mut task = Task::new(&user.id, "recurrence", &series.title_template)
                .with_duration(series.estimated_duration_min_default)
                .with_category(series.category_default)
                .with_ai_excluded(series.ai_excluded);
            task.notes = series.notes_template.clone();
            task.recurrence_series_id = Some(series.id.clone());
            task.recurrence_occurrence_start = Some(occurrence_start);
            if let Some(window) = series.recurrence_preset.time_of_day_window {
                let (start, end) = window.window_for_day(day, tz);
                task.flexibility_window = Some((start, end));
            }
            match task_repo.create(&task) {
                Ok(_) => {
                    info!(series_id = %series.id, day = %day, "occurrence materialized");
                    report.created += 1;
                }
                // Already materialized for this occurrence: idempotent no-op.
                Err(CoreError::ConstraintViolation(ConstraintViolation::Duplicate { .. })) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }
}

/// First day in `[start_day, end_day)` on which the series fires.
///
/// For "N times per week" presets the days of the first active ISO week are
/// chosen with a deterministic spread and the earliest in-window pick wins.
fn next_occurrence_day(
    series: &RecurringTaskSeries,
    start_day: NaiveDate,
    end_day: NaiveDate,
) -> Option<NaiveDate> {
    let p = &series.recurrence_preset;
    if p.frequency == RecurrenceFrequency::Weekly {
        if let Some(count) = p.count_per_period {
            let mut weeks: Vec<((i32, u32), Vec<NaiveDate>)> = Vec::new();
            let mut day = start_day;
            while day < end_day {
                if in_weekly_bounds(series, day) {
                    let week = day.iso_week();
                    let key = (week.year(), week.week());
                    match weeks.last_mut() {
                        Some((last_key, days)) if *last_key == key => days.push(day),
                        _ => weeks.push((key, vec![day])),
                    }
                }
                day += Duration::days(1);
            }
            for (_, days) in weeks {
                if let Some(pick) = choose_n_days(&days, count as usize).into_iter().next() {
                    return Some(pick);
                }
            }
            return None;
        }
    }
    let mut day = start_day;
    while day < end_day {
        if p.occurs_on(day) {
            return Some(day);
        }
        day += Duration::days(1);
    }
    None
}

/// Weekly-interval and range check for count-per-period presets, which pick
/// days themselves instead of using `occurs_on`.
fn in_weekly_bounds(series: &RecurringTaskSeries, day: NaiveDate) -> bool {
    let p = &series.recurrence_preset;
    if let Some(start) = p.start_date {
        if day < start {
            return false;
        }
    }
    if let Some(until) = p.until_date {
        if day > until {
            return false;
        }
    }
    let anchor = p.start_date.unwrap_or(day);
    let week_delta = (day - anchor).num_days().div_euclid(7);
    week_delta >= 0 && week_delta % (p.interval.max(1) as i64) == 0
}
