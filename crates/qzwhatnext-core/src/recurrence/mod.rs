//! Recurrence presets and series models.
//!
//! The canonical internal representation for repeating tasks and time blocks
//! is a structured preset; users never enter RRULE strings. RRULE is
//! export-only, for recurring calendar masters (see [`rrule`]).

pub mod materializer;
pub mod rrule;

pub use materializer::{MaterializeReport, Materializer};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday as ChronoWeekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{local_midnight, TaskCategory, DEFAULT_DURATION_MIN};

/// Recurrence frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrenceFrequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

/// Weekday, serialized in the two-letter form used by calendar exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Mo,
    Tu,
    We,
    Th,
    Fr,
    Sa,
    Su,
}

impl Weekday {
    pub fn from_date(date: NaiveDate) -> Self {
        match date.weekday() {
            ChronoWeekday::Mon => Weekday::Mo,
            ChronoWeekday::Tue => Weekday::Tu,
            ChronoWeekday::Wed => Weekday::We,
            ChronoWeekday::Thu => Weekday::Th,
            ChronoWeekday::Fri => Weekday::Fr,
            ChronoWeekday::Sat => Weekday::Sa,
            ChronoWeekday::Sun => Weekday::Su,
        }
    }

    /// RFC 5545 BYDAY token.
    pub fn rrule_token(&self) -> &'static str {
        match self {
            Weekday::Mo => "MO",
            Weekday::Tu => "TU",
            Weekday::We => "WE",
            Weekday::Th => "TH",
            Weekday::Fr => "FR",
            Weekday::Sa => "SA",
            Weekday::Su => "SU",
        }
    }
}

/// Named time-of-day windows, local to the user's calendar timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOfDayWindow {
    WakeUp,
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDayWindow {
    /// Local start/end times of the window. Night spans midnight.
    pub fn bounds(&self) -> (NaiveTime, NaiveTime) {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).expect("valid time");
        match self {
            TimeOfDayWindow::WakeUp => (t(5, 0), t(6, 30)),
            TimeOfDayWindow::Morning => (t(6, 30), t(11, 0)),
            TimeOfDayWindow::Afternoon => (t(11, 0), t(17, 0)),
            TimeOfDayWindow::Evening => (t(17, 0), t(21, 0)),
            TimeOfDayWindow::Night => (t(21, 0), t(2, 0)),
        }
    }

    /// Concrete flexibility window for `day`, resolved in `tz`.
    pub fn window_for_day(&self, day: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
        let (start_t, end_t) = self.bounds();
        let day_start = local_midnight(day, tz);
        let start = day_start + signed_since_midnight(start_t);
        let mut end = day_start + signed_since_midnight(end_t);
        if end_t <= start_t {
            end += Duration::days(1);
        }
        (start, end)
    }
}

fn signed_since_midnight(t: NaiveTime) -> Duration {
    t.signed_duration_since(NaiveTime::MIN)
}

/// Structured recurrence definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrencePreset {
    pub frequency: RecurrenceFrequency,
    /// Every N units (days/weeks/months/years). Minimum 1.
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// For weekly recurrence: weekdays on which it occurs.
    #[serde(default)]
    pub by_weekday: Option<Vec<Weekday>>,
    /// For patterns like "3 times per week".
    #[serde(default)]
    pub count_per_period: Option<u32>,
    /// Time block start, local time. May span midnight if `time_end` is
    /// earlier.
    #[serde(default)]
    pub time_start: Option<NaiveTime>,
    #[serde(default)]
    pub time_end: Option<NaiveTime>,
    /// Task-series windowing: translated into a flexibility window for the
    /// occurrence day.
    #[serde(default)]
    pub time_of_day_window: Option<TimeOfDayWindow>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub until_date: Option<NaiveDate>,
}

fn default_interval() -> u32 {
    1
}

impl RecurrencePreset {
    /// A daily preset with interval 1.
    pub fn daily() -> Self {
        Self {
            frequency: RecurrenceFrequency::Daily,
            interval: 1,
            by_weekday: None,
            count_per_period: None,
            time_start: None,
            time_end: None,
            time_of_day_window: None,
            start_date: None,
            until_date: None,
        }
    }

    /// A weekly preset on the given weekdays.
    pub fn weekly(by_weekday: Vec<Weekday>) -> Self {
        Self {
            frequency: RecurrenceFrequency::Weekly,
            by_weekday: if by_weekday.is_empty() {
                None
            } else {
                Some(by_weekday)
            },
            ..Self::daily()
        }
    }

    /// Whether the preset fires on `day`. Interval anchoring uses
    /// `start_date` when present, otherwise the queried day itself.
    pub fn occurs_on(&self, day: NaiveDate) -> bool {
        if let Some(start) = self.start_date {
            if day < start {
                return false;
            }
        }
        if let Some(until) = self.until_date {
            if day > until {
                return false;
            }
        }
        let interval = self.interval.max(1) as i64;
        match self.frequency {
            RecurrenceFrequency::Daily => {
                let anchor = self.start_date.unwrap_or(day);
                let delta = (day - anchor).num_days();
                delta >= 0 && delta % interval == 0
            }
            RecurrenceFrequency::Weekly => {
                let anchor = self.start_date.unwrap_or(day);
                let week_delta = (day - anchor).num_days().div_euclid(7);
                if week_delta < 0 || week_delta % interval != 0 {
                    return false;
                }
                match &self.by_weekday {
                    Some(days) => days.contains(&Weekday::from_date(day)),
                    None => true,
                }
            }
            RecurrenceFrequency::Monthly => {
                let anchor = self.start_date.unwrap_or(day);
                if day.day() != anchor.day() {
                    return false;
                }
                let months = (day.year() - anchor.year()) as i64 * 12
                    + (day.month() as i64 - anchor.month() as i64);
                months >= 0 && months % interval == 0
            }
            RecurrenceFrequency::Yearly => {
                let anchor = self.start_date.unwrap_or(day);
                if (day.month(), day.day()) != (anchor.month(), anchor.day()) {
                    return false;
                }
                let years = (day.year() - anchor.year()) as i64;
                years >= 0 && years % interval == 0
            }
        }
    }
}

/// Pick `n` days from a sorted list, spread deterministically.
///
/// Used for "N times per week" presets: evenly spaced indices, collisions
/// resolved by scanning for the nearest unused day.
pub fn choose_n_days(days: &[NaiveDate], n: usize) -> Vec<NaiveDate> {
    if n == 0 || days.is_empty() {
        return Vec::new();
    }
    if days.len() <= n {
        return days.to_vec();
    }
    let step = if n > 1 {
        (days.len() - 1) as f64 / (n - 1) as f64
    } else {
        0.0
    };
    let mut picks: Vec<NaiveDate> = Vec::with_capacity(n);
    let mut used = vec![false; days.len()];
    for i in 0..n {
        let mut idx = ((i as f64 * step).round() as usize).min(days.len() - 1);
        if used[idx] {
            let forward = (idx..days.len()).find(|&j| !used[j]);
            idx = match forward {
                Some(j) => j,
                None => match (0..idx).rev().find(|&j| !used[j]) {
                    Some(j) => j,
                    None => continue,
                },
            };
        }
        used[idx] = true;
        picks.push(days[idx]);
    }
    picks.sort();
    picks
}

/// A recurring task series: template for habit occurrences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringTaskSeries {
    pub id: String,
    pub user_id: String,
    pub title_template: String,
    pub notes_template: Option<String>,
    pub estimated_duration_min_default: u32,
    pub category_default: TaskCategory,
    pub recurrence_preset: RecurrencePreset,
    /// Inherited by every materialized occurrence.
    pub ai_excluded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl RecurringTaskSeries {
    pub fn new(
        user_id: impl Into<String>,
        title_template: impl Into<String>,
        preset: RecurrencePreset,
    ) -> Self {
        let title_template = title_template.into();
        let ai_excluded = crate::task::title_excludes_ai(&title_template);
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            title_template,
            notes_template: None,
            estimated_duration_min_default: DEFAULT_DURATION_MIN,
            category_default: TaskCategory::Unknown,
            recurrence_preset: preset,
            ai_excluded,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_category(mut self, category: TaskCategory) -> Self {
        self.category_default = category;
        self
    }

    pub fn with_duration(mut self, minutes: u32) -> Self {
        self.estimated_duration_min_default = minutes;
        self
    }

    pub fn with_ai_excluded(mut self, excluded: bool) -> Self {
        self.ai_excluded = excluded;
        self
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// A recurring reserved time block. Never a schedulable task; the
/// availability builder subtracts its occurrences from free time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringTimeBlock {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub recurrence_preset: RecurrencePreset,
    /// External event id of the recurring master, once exported.
    pub calendar_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl RecurringTimeBlock {
    pub fn new(
        user_id: impl Into<String>,
        title: impl Into<String>,
        preset: RecurrencePreset,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            title: title.into(),
            recurrence_preset: preset,
            calendar_event_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Concrete reserved intervals within `[window_start, window_end)`,
    /// resolved in the user's timezone.
    pub fn reserved_intervals(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        tz: Tz,
    ) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let p = &self.recurrence_preset;
        let (Some(time_start), Some(time_end)) = (p.time_start, p.time_end) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        // Pad a day on both sides so timezone offsets cannot drop an
        // occurrence straddling the window edge; the clip below trims them.
        let mut day = window_start.date_naive() - Duration::days(1);
        let end_day = window_end.date_naive() + Duration::days(1);
        while day < end_day {
            if p.occurs_on(day) {
                let midnight = local_midnight(day, tz);
                let start = midnight + signed_since_midnight(time_start);
                let mut end = midnight + signed_since_midnight(time_end);
                if time_end <= time_start {
                    end += Duration::days(1);
                }
                if start < window_end && end > window_start {
                    out.push((start.max(window_start), end.min(window_end)));
                }
            }
            day += Duration::days(1);
        }
        out
    }
}
