//! The per-user rebuild pipeline.
//!
//! A rebuild executes ten stages strictly in order: materialize recurring
//! series, load active tasks, gate AI exclusions, infer missing attributes,
//! validate constraints, assign tiers, rank within tiers, build free time,
//! place tasks, and emit audits. Identical inputs always produce identical
//! outputs; the only nondeterminism (live inference, live calendar) sits
//! behind trait boundaries that tests replace with fixed implementations.

pub mod availability;
pub mod exclusion;
pub mod inference;
pub mod placer;
pub mod ranking;
pub mod tiering;

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditEventType};
use crate::config::EngineConfig;
use crate::error::{CoreError, Result};
use crate::recurrence::{MaterializeReport, Materializer};
use crate::schedule::{OverflowReason, Placement, ScheduledBlock};
use crate::storage::{Database, ScheduledBlockRepository, TaskRepository, UserRepository};
use crate::task::Task;
use crate::user::User;

use availability::{
    build_free_intervals, fetch_with_retry, AvailabilityError, AvailabilityProvider,
    AvailabilitySnapshot, Interval,
};
use inference::{
    apply_proposals, needs_inference, propose_with_retry, InferenceAdapter, InferenceInput,
};
use placer::{place_tasks, PlaceContext, TaskPlacement};
use ranking::{stack_rank, RankedTask};
use tiering::{assign_tier, reconcile_tier, TierDecision};

/// Outcome of a rebuild request.
#[derive(Debug)]
pub enum RebuildOutcome {
    /// The rebuild ran; here is what it produced.
    Completed(Box<RebuildReport>),
    /// Another rebuild for this user is in flight; one follow-up run was
    /// queued regardless of how many triggers arrive.
    Coalesced,
}

/// What one rebuild produced.
#[derive(Debug, Clone)]
pub struct RebuildReport {
    pub rebuild_id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub materialized: MaterializeReport,
    /// Per-task outcomes in rank order.
    pub placements: Vec<TaskPlacement>,
    /// New system blocks written by this rebuild, in start order.
    pub scheduled_blocks: Vec<ScheduledBlock>,
    /// Tasks flagged for constraint violations discovered mid-pipeline.
    pub flagged: Vec<String>,
}

impl RebuildReport {
    /// Tasks that ended in overflow with their reasons.
    pub fn overflowed(&self) -> Vec<(&str, OverflowReason)> {
        self.placements
            .iter()
            .filter_map(|p| match p.placement {
                Placement::Overflow { reason } => Some((p.task_id.as_str(), reason)),
                _ => None,
            })
            .collect()
    }
}

#[derive(Default)]
struct UserRebuildState {
    in_flight: bool,
    pending: bool,
}

/// The scheduling engine.
///
/// Owns the database and the two remote collaborators. At most one rebuild
/// per user proceeds at a time; additional triggers coalesce into a single
/// follow-up run.
pub struct Engine {
    db: Database,
    config: EngineConfig,
    availability: Box<dyn AvailabilityProvider>,
    inference: Box<dyn InferenceAdapter>,
    locks: Mutex<HashMap<String, UserRebuildState>>,
    snapshots: Mutex<HashMap<String, AvailabilitySnapshot>>,
    cancel: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        db: Database,
        config: EngineConfig,
        availability: Box<dyn AvailabilityProvider>,
        inference: Box<dyn InferenceAdapter>,
    ) -> Self {
        Self {
            db,
            config: config.normalized(),
            availability,
            inference,
            locks: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Request cooperative cancellation of in-flight rebuilds. Honored at
    /// suspension points (inference and calendar calls).
    pub fn shutdown(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Trigger a rebuild for a user.
    ///
    /// If one is already in flight the trigger coalesces: exactly one
    /// follow-up rebuild runs after the current one, no matter how many
    /// triggers arrived meanwhile.
    pub fn request_rebuild(&self, user_id: &str) -> Result<RebuildOutcome> {
        if !self.acquire(user_id) {
            debug!(user_id, "rebuild coalesced behind in-flight run");
            return Ok(RebuildOutcome::Coalesced);
        }
        let mut report = self.run_guarded(user_id);
        while self.release_and_check_pending(user_id) {
            if report.is_err() {
                break;
            }
            if !self.acquire(user_id) {
                break;
            }
            report = self.run_guarded(user_id);
        }
        report.map(|r| RebuildOutcome::Completed(Box::new(r)))
    }

    fn acquire(&self, user_id: &str) -> bool {
        let mut locks = self.locks.lock().expect("lock map");
        let state = locks.entry(user_id.to_string()).or_default();
        if state.in_flight {
            state.pending = true;
            false
        } else {
            state.in_flight = true;
            true
        }
    }

    fn release_and_check_pending(&self, user_id: &str) -> bool {
        let mut locks = self.locks.lock().expect("lock map");
        let state = locks.entry(user_id.to_string()).or_default();
        state.in_flight = false;
        std::mem::take(&mut state.pending)
    }

    fn run_guarded(&self, user_id: &str) -> Result<RebuildReport> {
        let result = self.run_pipeline(user_id);
        if result.is_err() {
            // Failure still releases the advisory lock in the caller; the
            // last good schedule stays in place.
            let mut locks = self.locks.lock().expect("lock map");
            if let Some(state) = locks.get_mut(user_id) {
                state.in_flight = false;
                state.pending = false;
            }
        }
        result
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(CoreError::Cancelled);
        }
        Ok(())
    }

    /// Execute the ten pipeline stages for one user.
    fn run_pipeline(&self, user_id: &str) -> Result<RebuildReport> {
        let rebuild_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let horizon_end = now + self.config.horizon();
        info!(user_id, rebuild_id = %rebuild_id, "rebuild started");

        let user = UserRepository::new(&self.db)
            .get(user_id)?
            .ok_or_else(|| CoreError::NotFound {
                kind: "user",
                id: user_id.to_string(),
            })?;
        let tz = user.tz();

        // Stage 1: materialize recurring series.
        let materialized = Materializer::new(&self.db).run(&user, now, horizon_end)?;

        // Stage 2: load active open tasks.
        let task_repo = TaskRepository::new(&self.db);
        let tasks = task_repo.list_open(user_id)?;

        // Stage 3: exclusion gate, before any inference.
        let (allowed, excluded) = exclusion::partition_excluded(tasks);

        // Stage 4: attribute inference for non-excluded tasks missing
        // attributes. Failures fall back to defaults and are audited.
        self.check_cancelled()?;
        let (enriched, confidences) =
            self.infer_attributes(allowed, &rebuild_id, &task_repo)?;

        // Stage 5: constraint validation. Violations flag the task out of
        // this rebuild instead of aborting it.
        let mut flagged = Vec::new();
        let mut valid: Vec<Task> = Vec::with_capacity(enriched.len() + excluded.len());
        for task in enriched.into_iter().chain(excluded.into_iter()) {
            match task.validate(tz) {
                Ok(()) => valid.push(task),
                Err(violation) => {
                    warn!(task_id = %task.id, %violation, "task flagged by validator");
                    crate::storage::AuditRepository::new(&self.db).append(&AuditEvent::new(
                        user_id,
                        AuditEventType::OverflowFlagged,
                        &task.id,
                        json!({
                            "rebuild_id": rebuild_id,
                            "reason": "constraint_violation",
                            "violation": violation.to_string(),
                        }),
                    ))?;
                    flagged.push(task.id);
                }
            }
        }

        // Stage 6: tier assignment.
        let ranked_input = self.assign_tiers(valid, now, &confidences, &rebuild_id, &task_repo)?;

        // Stage 7: intra-tier ranking.
        let ranked = stack_rank(ranked_input, tz);

        // Stage 8: availability.
        self.check_cancelled()?;
        let horizon = Interval::new(now, horizon_end);
        let block_repo = ScheduledBlockRepository::new(&self.db);
        let (free, pinned) = self.build_availability(&user, horizon, &block_repo)?;

        // Stage 9: placement.
        let ctx = PlaceContext {
            now,
            horizon_end,
            tz,
            granularity_min: self.config.scheduling_granularity_min,
            pinned,
        };
        let placements = place_tasks(&ranked, free, &ctx);

        // Stage 10: persist schedule and audits transactionally.
        let mut new_blocks: Vec<ScheduledBlock> = Vec::new();
        let mut audits: Vec<AuditEvent> = Vec::new();
        for placement in &placements {
            match &placement.placement {
                Placement::Scheduled { blocks } => {
                    new_blocks.extend(blocks.iter().cloned());
                    audits.push(AuditEvent::new(
                        user_id,
                        AuditEventType::ScheduleBuilt,
                        &placement.task_id,
                        json!({
                            "rebuild_id": rebuild_id,
                            "reasons": placement.reason_tokens,
                            "blocks": blocks.len(),
                        }),
                    ));
                }
                Placement::Overflow { reason } => {
                    audits.push(AuditEvent::new(
                        user_id,
                        AuditEventType::OverflowFlagged,
                        &placement.task_id,
                        json!({
                            "rebuild_id": rebuild_id,
                            "reason": reason.as_str(),
                            "reasons": placement.reason_tokens,
                        }),
                    ));
                }
                Placement::Pinned => {}
            }
        }
        new_blocks.sort_by(|a, b| (a.start_time, a.id.clone()).cmp(&(b.start_time, b.id.clone())));
        block_repo.replace_system_schedule(user_id, &new_blocks, &audits)?;

        info!(
            user_id,
            rebuild_id = %rebuild_id,
            scheduled = new_blocks.len(),
            overflowed = placements
                .iter()
                .filter(|p| matches!(p.placement, Placement::Overflow { .. }))
                .count(),
            "rebuild finished"
        );
        Ok(RebuildReport {
            rebuild_id,
            user_id: user_id.to_string(),
            started_at: now,
            materialized,
            placements,
            scheduled_blocks: new_blocks,
            flagged,
        })
    }

    /// Stage 4 helper: run inference over tasks that need it, apply
    /// high-confidence proposals, persist, audit. Returns the (possibly
    /// updated) tasks and the minimum applied confidence per task.
    fn infer_attributes(
        &self,
        tasks: Vec<Task>,
        rebuild_id: &str,
        task_repo: &TaskRepository<'_>,
    ) -> Result<(Vec<Task>, HashMap<String, f64>)> {
        let audit_repo = crate::storage::AuditRepository::new(&self.db);
        let mut confidences = HashMap::new();
        let mut out = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            if !needs_inference(&task) {
                out.push(task);
                continue;
            }
            let input = InferenceInput::from_task(&task);
            match propose_with_retry(&*self.inference, &input, self.config.remote_max_attempts) {
                Ok(proposals) => {
                    let applied = apply_proposals(&mut task, &proposals, &self.config);
                    if applied.any() {
                        let task_updated = task_repo.update(&task)?;
                        audit_repo.append(&AuditEvent::new(
                            &task.user_id,
                            AuditEventType::AttributeInferred,
                            &task.id,
                            json!({
                                "rebuild_id": rebuild_id,
                                "applied": applied.applied,
                                "proposals": applied.record,
                            }),
                        ))?;
                        if let Some(confidence) = applied.min_confidence {
                            confidences.insert(task.id.clone(), confidence);
                        }
                        task = task_updated;
                    }
                }
                Err(e) => {
                    // Non-fatal: the task proceeds on defaults.
                    audit_repo.append(&AuditEvent::new(
                        &task.user_id,
                        AuditEventType::AttributeInferred,
                        &task.id,
                        json!({
                            "rebuild_id": rebuild_id,
                            "fallback": true,
                            "reason": e.to_string(),
                        }),
                    ))?;
                }
            }
            out.push(task);
        }
        Ok((out, confidences))
    }

    /// Stage 6 helper: deterministic tier assignment with change staging.
    fn assign_tiers(
        &self,
        tasks: Vec<Task>,
        now: DateTime<Utc>,
        confidences: &HashMap<String, f64>,
        rebuild_id: &str,
        task_repo: &TaskRepository<'_>,
    ) -> Result<Vec<RankedTask>> {
        let audit_repo = crate::storage::AuditRepository::new(&self.db);
        // A task "unlocks" another when some open task depends on it.
        let mut unlockers: HashSet<String> = HashSet::new();
        for task in &tasks {
            for dep in &task.dependencies {
                unlockers.insert(dep.clone());
            }
        }

        let mut ranked = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            let unlocks_other = unlockers.contains(&task.id);
            let computed = assign_tier(&task, now, unlocks_other, &self.config);
            let inference_confidence = confidences.get(&task.id).copied();
            let decision = reconcile_tier(&task, computed, inference_confidence, &self.config);
            let effective = match decision {
                TierDecision::Recorded(tier) => {
                    if task.tier != Some(tier.number()) || task.pending_tier.is_some() {
                        task.tier = Some(tier.number());
                        task.pending_tier = None;
                        task = task_repo.update(&task)?;
                    }
                    tier
                }
                TierDecision::Changed { from, to } => {
                    task.tier = Some(to.number());
                    task.pending_tier = None;
                    task = task_repo.update(&task)?;
                    audit_repo.append(&AuditEvent::new(
                        &task.user_id,
                        AuditEventType::TierChanged,
                        &task.id,
                        json!({
                            "rebuild_id": rebuild_id,
                            "from": from.number(),
                            "to": to.number(),
                            "to_name": to.name(),
                            "driver": if inference_confidence.is_some() { "inference" } else { "deterministic" },
                        }),
                    ))?;
                    to
                }
                TierDecision::Staged { current, proposed } => {
                    if task.pending_tier != Some(proposed.number()) {
                        task.pending_tier = Some(proposed.number());
                        task = task_repo.update(&task)?;
                        audit_repo.append(&AuditEvent::new(
                            &task.user_id,
                            AuditEventType::TierChanged,
                            &task.id,
                            json!({
                                "rebuild_id": rebuild_id,
                                "from": current.number(),
                                "proposed": proposed.number(),
                                "staged": true,
                                "driver": "inference",
                            }),
                        ))?;
                    }
                    current
                }
                TierDecision::Frozen(tier) => tier,
            };
            ranked.push(RankedTask {
                task,
                tier: effective,
            });
        }
        Ok(ranked)
    }

    /// Stage 8 helper: subtract reservations from the horizon.
    ///
    /// Reserved time is: pinned blocks, recurring time blocks, and external
    /// events that are NOT engine-managed (managed detection: provider
    /// marker OR presence in our stored event-id set).
    fn build_availability(
        &self,
        user: &User,
        horizon: Interval,
        block_repo: &ScheduledBlockRepository<'_>,
    ) -> Result<(Vec<Interval>, HashMap<String, Vec<Interval>>)> {
        let busy = match fetch_with_retry(
            &*self.availability,
            &user.id,
            horizon,
            self.config.remote_max_attempts,
        ) {
            Ok(busy) => {
                self.snapshots.lock().expect("snapshot map").insert(
                    user.id.clone(),
                    AvailabilitySnapshot {
                        fetched_at: Utc::now(),
                        busy: busy.clone(),
                    },
                );
                busy
            }
            Err(AvailabilityError::Unauthorized) => return Err(CoreError::Unauthorized),
            Err(e) => {
                let snapshots = self.snapshots.lock().expect("snapshot map");
                match snapshots.get(&user.id) {
                    Some(snapshot)
                        if snapshot.is_fresh(
                            Utc::now(),
                            self.config.availability_snapshot_max_age(),
                        ) =>
                    {
                        warn!(user_id = %user.id, error = %e, "using availability snapshot");
                        snapshot.busy.clone()
                    }
                    _ => {
                        return Err(CoreError::AvailabilityUnavailable(e.to_string()));
                    }
                }
            }
        };

        let our_event_ids: HashSet<String> =
            block_repo.calendar_event_ids(&user.id)?.into_iter().collect();
        let mut reserved: Vec<Interval> = busy
            .iter()
            .filter(|b| {
                let managed = b.engine_managed
                    || b.event_id
                        .as_ref()
                        .is_some_and(|id| our_event_ids.contains(id));
                !managed
            })
            .map(|b| Interval::new(b.start, b.end))
            .collect();

        // Recurring time blocks reserve their occurrences directly, whether
        // or not they were exported to the external calendar yet.
        let time_blocks =
            crate::storage::RecurringTimeBlockRepository::new(&self.db).list_active(&user.id)?;
        for tb in &time_blocks {
            for (start, end) in tb.reserved_intervals(horizon.start, horizon.end, user.tz()) {
                reserved.push(Interval::new(start, end));
            }
        }

        // Pinned blocks stay where they are and shadow their time.
        let mut pinned: HashMap<String, Vec<Interval>> = HashMap::new();
        for block in block_repo.list_pinned(&user.id)? {
            let iv = Interval::new(block.start_time, block.end_time);
            reserved.push(iv);
            pinned.entry(block.entity_id.clone()).or_default().push(iv);
        }

        Ok((build_free_intervals(horizon, &reserved), pinned))
    }
}
