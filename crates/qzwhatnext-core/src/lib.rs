//! # qzWhatNext Core
//!
//! Deterministic scheduling engine for the qzWhatNext productivity service.
//! The engine answers "what should I do right now, and next?" by turning a
//! user's open tasks, calendar, and preferences into an explainable schedule:
//! identical inputs always produce identical outputs, and every decision
//! leaves a structured audit record.
//!
//! ## Architecture
//!
//! - **Engine**: a per-user, ten-stage rebuild pipeline (materialize,
//!   load, exclude, infer, validate, tier, rank, availability, place, audit)
//! - **Storage**: SQLite-backed user-scoped repositories with soft delete
//! - **Sync**: idempotent bidirectional reconciliation of engine-managed
//!   calendar events, with marker-and-linkage ownership proof
//! - **Recurrence**: habit-style series materialization and RRULE export
//!
//! ## Key Components
//!
//! - [`Engine`]: rebuild orchestration with per-user serialization
//! - [`Database`]: persistent state and the append-only audit log
//! - [`CalendarSynchronizer`]: managed-calendar writer
//! - [`Materializer`]: recurring-series expansion

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod recurrence;
pub mod schedule;
pub mod storage;
pub mod sync;
pub mod task;
pub mod user;

pub use audit::{AuditEvent, AuditEventType};
pub use config::{EngineConfig, ALLOWED_HORIZON_DAYS};
pub use engine::availability::{
    AvailabilityError, AvailabilityProvider, AvailabilitySnapshot, BusyInterval, Interval,
};
pub use engine::exclusion::is_ai_excluded;
pub use engine::inference::{
    AttributeProposals, FixedInferenceAdapter, InferenceAdapter, InferenceError, InferenceInput,
    Proposal,
};
pub use engine::placer::TaskPlacement;
pub use engine::ranking::RankedTask;
pub use engine::tiering::{Tier, TierDecision};
pub use engine::{Engine, RebuildOutcome, RebuildReport};
pub use error::{ConstraintViolation, CoreError, Result};
pub use recurrence::{
    MaterializeReport, Materializer, RecurrenceFrequency, RecurrencePreset, RecurringTaskSeries,
    RecurringTimeBlock, TimeOfDayWindow, Weekday,
};
pub use schedule::{OverflowReason, Placement, ScheduledBlock, ScheduledBy};
pub use storage::{
    AuditRepository, AutomationToken, AutomationTokenRepository, Database,
    RecurringTaskSeriesRepository, RecurringTimeBlockRepository, ScheduledBlockRepository,
    TaskRepository, UserRepository,
};
pub use sync::google::{AccessTokenProvider, GoogleCalendarClient};
pub use sync::{
    CalendarSynchronizer, CalendarWriter, EventVersion, ManagedEventPayload, ManagedEventState,
    RemoteEvent, SyncError, SyncReport,
};
pub use task::{EnergyIntensity, Task, TaskCategory, TaskStatus};
pub use user::User;
