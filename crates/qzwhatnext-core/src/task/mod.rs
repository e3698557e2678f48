//! Canonical task model.
//!
//! A task is the unit the engine schedules. Fields form a closed, enumerated
//! set; "unknown" is a sentinel category, never an absent key. Write-time
//! validation enforces the hard constraints that are cheaper to reject at the
//! repository boundary than to discover during scheduling.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConstraintViolation;

/// Default task duration in minutes.
pub const DEFAULT_DURATION_MIN: u32 = 30;
/// Default confidence in a duration estimate.
pub const DEFAULT_DURATION_CONFIDENCE: f64 = 0.5;
/// Default risk score.
pub const DEFAULT_RISK_SCORE: f64 = 0.3;
/// Default impact score.
pub const DEFAULT_IMPACT_SCORE: f64 = 0.3;
/// Minimum allowed task duration in minutes.
pub const MIN_DURATION_MIN: u32 = 5;
/// Maximum allowed task duration in minutes (10 hours).
pub const MAX_DURATION_MIN: u32 = 600;
/// Inferred durations are rounded to this increment.
pub const DURATION_ROUNDING_MIN: u32 = 15;

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Open and schedulable.
    Open,
    /// Completed by the user.
    Completed,
    /// A recurrence occurrence whose window passed without completion.
    Missed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Completed => "completed",
            TaskStatus::Missed => "missed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => TaskStatus::Completed,
            "missed" => TaskStatus::Missed,
            _ => TaskStatus::Open,
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Open
    }
}

/// Task category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    Work,
    Child,
    Family,
    Health,
    Personal,
    Ideas,
    Home,
    Admin,
    Unknown,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Work => "work",
            TaskCategory::Child => "child",
            TaskCategory::Family => "family",
            TaskCategory::Health => "health",
            TaskCategory::Personal => "personal",
            TaskCategory::Ideas => "ideas",
            TaskCategory::Home => "home",
            TaskCategory::Admin => "admin",
            TaskCategory::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "work" => TaskCategory::Work,
            "child" => TaskCategory::Child,
            "family" => TaskCategory::Family,
            "health" => TaskCategory::Health,
            "personal" => TaskCategory::Personal,
            "ideas" => TaskCategory::Ideas,
            "home" => TaskCategory::Home,
            "admin" => TaskCategory::Admin,
            _ => TaskCategory::Unknown,
        }
    }
}

impl Default for TaskCategory {
    fn default() -> Self {
        TaskCategory::Unknown
    }
}

/// Energy intensity. Reserved for future placement heuristics; the placer
/// does not consult it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyIntensity {
    Low,
    Medium,
    High,
}

impl EnergyIntensity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnergyIntensity::Low => "low",
            EnergyIntensity::Medium => "medium",
            EnergyIntensity::High => "high",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "low" => EnergyIntensity::Low,
            "high" => EnergyIntensity::High,
            _ => EnergyIntensity::Medium,
        }
    }
}

impl Default for EnergyIntensity {
    fn default() -> Self {
        EnergyIntensity::Medium
    }
}

/// Canonical task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier (UUID v4).
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Source system type (`api`, `import`, `recurrence`).
    pub source_type: String,
    /// External id in the source system, if any.
    pub source_id: Option<String>,
    /// Task title.
    pub title: String,
    /// Free-form notes.
    pub notes: Option<String>,
    pub status: TaskStatus,
    /// Immutable creation timestamp.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker; `None` means active.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Hard due instant. The scheduler must not place the task past it.
    pub deadline: Option<DateTime<Utc>>,
    /// Do not schedule before this local date (user's calendar timezone).
    pub start_after: Option<NaiveDate>,
    /// Soft due date affecting intra-tier urgency (user's calendar timezone).
    pub due_by: Option<NaiveDate>,
    /// Estimated duration in minutes.
    pub estimated_duration_min: u32,
    /// Confidence in the duration estimate, 0.0–1.0.
    pub duration_confidence: f64,
    pub category: TaskCategory,
    pub energy_intensity: EnergyIntensity,
    /// Risk of negative consequence, 0.0–1.0.
    pub risk_score: f64,
    /// Downstream impact, 0.0–1.0.
    pub impact_score: f64,
    /// Ids of tasks this task depends on. The per-user graph is acyclic.
    pub dependencies: Vec<String>,
    /// Optional `[earliest_start, latest_end)`; placements must be fully
    /// contained.
    pub flexibility_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Never visible to the inference adapter when true.
    pub ai_excluded: bool,
    /// Freezes the recorded tier at its last value.
    pub manual_priority_locked: bool,
    pub user_locked: bool,
    /// The system never moves manually scheduled tasks.
    pub manually_scheduled: bool,
    /// Last applied governing tier (1–9), if one was ever recorded.
    pub tier: Option<u8>,
    /// Staged tier change awaiting user confirmation.
    pub pending_tier: Option<u8>,
    /// Generating series, for recurrence occurrences.
    pub recurrence_series_id: Option<String>,
    /// Canonical occurrence start for recurrence occurrences.
    pub recurrence_occurrence_start: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a task with defaults applied.
    ///
    /// AI exclusion is auto-derived from the title prefix unless overridden
    /// later via [`Task::with_ai_excluded`].
    pub fn new(
        user_id: impl Into<String>,
        source_type: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let title = title.into();
        let ai_excluded = title_excludes_ai(&title);
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            source_type: source_type.into(),
            source_id: None,
            title,
            notes: None,
            status: TaskStatus::Open,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deadline: None,
            start_after: None,
            due_by: None,
            estimated_duration_min: DEFAULT_DURATION_MIN,
            duration_confidence: DEFAULT_DURATION_CONFIDENCE,
            category: TaskCategory::Unknown,
            energy_intensity: EnergyIntensity::Medium,
            risk_score: DEFAULT_RISK_SCORE,
            impact_score: DEFAULT_IMPACT_SCORE,
            dependencies: Vec::new(),
            flexibility_window: None,
            ai_excluded,
            manual_priority_locked: false,
            user_locked: false,
            manually_scheduled: false,
            tier: None,
            pending_tier: None,
            recurrence_series_id: None,
            recurrence_occurrence_start: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_start_after(mut self, date: NaiveDate) -> Self {
        self.start_after = Some(date);
        self
    }

    pub fn with_due_by(mut self, date: NaiveDate) -> Self {
        self.due_by = Some(date);
        self
    }

    pub fn with_duration(mut self, minutes: u32) -> Self {
        self.estimated_duration_min = minutes;
        self
    }

    pub fn with_category(mut self, category: TaskCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_risk_score(mut self, risk: f64) -> Self {
        self.risk_score = risk;
        self
    }

    pub fn with_impact_score(mut self, impact: f64) -> Self {
        self.impact_score = impact;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_flexibility_window(
        mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        self.flexibility_window = Some((start, end));
        self
    }

    pub fn with_ai_excluded(mut self, excluded: bool) -> Self {
        self.ai_excluded = excluded;
        self
    }

    /// Whether the task is active (not soft-deleted).
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Earliest permissible start derived from `start_after`: local midnight
    /// of that date in the user's timezone.
    pub fn start_after_instant(&self, tz: Tz) -> Option<DateTime<Utc>> {
        self.start_after.map(|d| local_midnight(d, tz))
    }

    /// Soft due date resolved to end of day (23:59:59) in the user's
    /// timezone, for urgency ranking.
    pub fn due_by_instant(&self, tz: Tz) -> Option<DateTime<Utc>> {
        self.due_by.map(|d| local_end_of_day(d, tz))
    }

    /// Validate write-time hard constraints.
    ///
    /// Dependency cycles are checked separately by the repository, which has
    /// the rest of the user's graph.
    pub fn validate(&self, tz: Tz) -> Result<(), ConstraintViolation> {
        if self.estimated_duration_min < MIN_DURATION_MIN
            || self.estimated_duration_min > MAX_DURATION_MIN
        {
            return Err(ConstraintViolation::InvalidDuration {
                minutes: self.estimated_duration_min,
                min: MIN_DURATION_MIN,
                max: MAX_DURATION_MIN,
            });
        }
        if self.title.trim().is_empty() {
            return Err(ConstraintViolation::InvalidValue {
                field: "title",
                message: "must not be empty".to_string(),
            });
        }
        for (field, value) in [
            ("risk_score", self.risk_score),
            ("impact_score", self.impact_score),
            ("duration_confidence", self.duration_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                return Err(ConstraintViolation::InvalidValue {
                    field,
                    message: format!("{value} outside [0, 1]"),
                });
            }
        }
        if let (Some(start_after), Some(deadline)) = (self.start_after, self.deadline) {
            if local_midnight(start_after, tz) > deadline {
                return Err(ConstraintViolation::StartAfterBeyondDeadline {
                    start_after,
                    deadline,
                });
            }
        }
        if let Some((start, end)) = self.flexibility_window {
            if end <= start {
                return Err(ConstraintViolation::EmptyFlexibilityWindow { start, end });
            }
            if let Some(sa) = self.start_after_instant(tz) {
                if sa < start {
                    return Err(ConstraintViolation::FlexibilityWindowTooNarrow);
                }
            }
            if let Some(deadline) = self.deadline {
                if deadline > end {
                    return Err(ConstraintViolation::FlexibilityWindowTooNarrow);
                }
            }
        }
        Ok(())
    }
}

/// A title opting its task out of AI processing by prefix.
pub fn title_excludes_ai(title: &str) -> bool {
    title.trim_start().starts_with('.')
}

/// Local midnight of `date` in `tz` as a UTC instant.
///
/// DST gaps (a midnight that does not exist locally) resolve to the earliest
/// valid instant of that day.
pub fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.with_timezone(&Utc)
        }
        chrono::LocalResult::None => {
            // Skip forward past the DST gap in one-hour steps.
            let mut probe = naive + Duration::hours(1);
            loop {
                if let chrono::LocalResult::Single(dt) = tz.from_local_datetime(&probe) {
                    return dt.with_timezone(&Utc);
                }
                probe += Duration::hours(1);
            }
        }
    }
}

/// End of day (23:59:59) of `date` in `tz` as a UTC instant.
pub fn local_end_of_day(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::from_hms_opt(23, 59, 59).expect("valid time"));
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.with_timezone(&Utc)
        }
        chrono::LocalResult::None => local_midnight(date + Duration::days(1), tz),
    }
}
