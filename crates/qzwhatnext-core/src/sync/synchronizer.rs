//! Managed-calendar reconciliation.
//!
//! Runs after the engine emits a new schedule. Unsynced blocks get external
//! events; externally edited events are imported back (title/notes into the
//! task, time moves into a locked block); blocks removed by the rebuild have
//! their external events deleted. Calendar edits never trigger a rebuild;
//! they are imported only here, which breaks feedback loops.

use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditEventType};
use crate::error::{CoreError, Result};
use crate::recurrence::rrule::preset_to_rrule;
use crate::storage::{
    AuditRepository, Database, RecurringTimeBlockRepository, ScheduledBlockRepository,
    TaskRepository,
};
use crate::schedule::ScheduledBlock;
use crate::user::User;

use super::{CalendarWriter, ManagedEventPayload, ManagedEventState, SyncError};

/// Counters for one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// External events created (including recreations of vanished events).
    pub created: usize,
    /// Title/notes edits imported into tasks.
    pub imported_edits: usize,
    /// Time moves imported into locked blocks.
    pub imported_moves: usize,
    /// Etag refreshes with no content change.
    pub refreshed: usize,
    /// External events deleted for removed blocks.
    pub deleted: usize,
    /// Blocks flagged `sync_pending` and skipped this pass.
    pub conflicts: usize,
    /// Recurring time-block masters exported.
    pub masters_exported: usize,
}

impl SyncReport {
    /// Whether the pass performed any external write.
    pub fn wrote_anything(&self) -> bool {
        self.created + self.imported_edits + self.imported_moves + self.deleted
            + self.masters_exported
            > 0
    }
}

/// Bidirectional synchronizer for engine-managed events.
pub struct CalendarSynchronizer<'a> {
    db: &'a Database,
    writer: &'a dyn CalendarWriter,
}

impl<'a> CalendarSynchronizer<'a> {
    pub fn new(db: &'a Database, writer: &'a dyn CalendarWriter) -> Self {
        Self { db, writer }
    }

    /// Reconcile one user's schedule with the external calendar.
    ///
    /// Idempotent: a second pass with no external edits performs zero
    /// external writes.
    pub fn sync_user(&self, user: &User) -> Result<SyncReport> {
        let block_repo = ScheduledBlockRepository::new(self.db);
        let task_repo = TaskRepository::new(self.db);
        let audit_repo = AuditRepository::new(self.db);
        let mut report = SyncReport::default();

        // Blocks removed by the last rebuild: delete their events by the
        // recorded id linkage (we created them with the managed marker).
        for orphan in block_repo.orphaned_events(&user.id)? {
            match self.writer.delete_event(&user.id, &orphan.event_id) {
                Ok(()) => {
                    block_repo.clear_orphaned_event(&user.id, &orphan.event_id)?;
                    report.deleted += 1;
                }
                Err(SyncError::Unauthorized) => return Err(CoreError::Unauthorized),
                Err(e) => {
                    // Kept for the next pass.
                    warn!(event_id = %orphan.event_id, error = %e, "orphan delete failed");
                    report.conflicts += 1;
                }
            }
        }

        for block in block_repo.list_for_user(&user.id)? {
            let title = task_repo
                .get(&user.id, &block.entity_id, true)?
                .map(|t| t.title)
                .unwrap_or_else(|| "Scheduled task".to_string());
            match self.sync_block(user, &block, &title, &block_repo, &task_repo, &audit_repo) {
                Ok(outcome) => outcome.tally(&mut report),
                Err(e @ CoreError::SyncConflict { .. }) => {
                    warn!(block_id = %block.id, error = %e, "block sync conflict, flagged");
                    block_repo.set_sync_pending(&user.id, &block.id, true)?;
                    report.conflicts += 1;
                }
                Err(other) => return Err(other),
            }
        }

        report.masters_exported = self.export_time_block_masters(user)?;
        info!(user_id = %user.id, ?report, "sync pass finished");
        Ok(report)
    }

    fn sync_block(
        &self,
        user: &User,
        block: &ScheduledBlock,
        title: &str,
        block_repo: &ScheduledBlockRepository<'_>,
        task_repo: &TaskRepository<'_>,
        audit_repo: &AuditRepository<'_>,
    ) -> Result<BlockOutcome> {
        let payload = ManagedEventPayload {
            block_id: block.id.clone(),
            title: title.to_string(),
            notes: None,
            start: block.start_time,
            end: block.end_time,
            rrule: None,
        };

        let Some(event_id) = block.calendar_event_id.clone() else {
            let version = self
                .writer
                .create_event(&user.id, &payload)
                .map_err(map_sync_err)?;
            block_repo.set_calendar_linkage(
                &user.id,
                &block.id,
                &version.event_id,
                &version.etag,
                version.updated,
            )?;
            return Ok(BlockOutcome::Created);
        };

        let remote = self
            .writer
            .get_event(&user.id, &event_id)
            .map_err(map_sync_err)?;
        let Some(remote) = remote else {
            // The event vanished externally; recreate it.
            let version = self
                .writer
                .create_event(&user.id, &payload)
                .map_err(map_sync_err)?;
            block_repo.set_calendar_linkage(
                &user.id,
                &block.id,
                &version.event_id,
                &version.etag,
                version.updated,
            )?;
            return Ok(BlockOutcome::Created);
        };

        if !remote.proves_managed(&block.id) {
            // Not provably ours: never modify, flag and skip.
            return Err(CoreError::SyncConflict {
                event_id: event_id.clone(),
                message: "managed proof failed (marker or linkage missing)".to_string(),
            });
        }

        match ManagedEventState::observe(block, Some(&remote)) {
            ManagedEventState::Synced | ManagedEventState::LockedSynced => {
                Ok(BlockOutcome::InSync)
            }
            ManagedEventState::UserMovedInTime => {
                block_repo.import_moved_interval(
                    &user.id,
                    &block.id,
                    remote.start,
                    remote.end,
                    &remote.etag,
                    remote.updated,
                )?;
                audit_repo.append(&AuditEvent::new(
                    &user.id,
                    AuditEventType::CalendarEditImported,
                    &block.id,
                    json!({
                        "kind": "moved",
                        "from": [block.start_time, block.end_time],
                        "to": [remote.start, remote.end],
                    }),
                ))?;
                Ok(BlockOutcome::MoveImported)
            }
            ManagedEventState::UserEditedTitle => {
                let changed = self.import_text_edit(user, block, &remote, task_repo)?;
                block_repo.set_calendar_linkage(
                    &user.id,
                    &block.id,
                    &remote.event_id,
                    &remote.etag,
                    remote.updated,
                )?;
                if changed {
                    audit_repo.append(&AuditEvent::new(
                        &user.id,
                        AuditEventType::CalendarEditImported,
                        &block.entity_id,
                        json!({"kind": "text", "block_id": block.id}),
                    ))?;
                    Ok(BlockOutcome::EditImported)
                } else {
                    Ok(BlockOutcome::Refreshed)
                }
            }
            // An id without a stored etag means a half-finished earlier
            // sync; re-adopt the remote version.
            ManagedEventState::Unsynced => {
                block_repo.set_calendar_linkage(
                    &user.id,
                    &block.id,
                    &remote.event_id,
                    &remote.etag,
                    remote.updated,
                )?;
                Ok(BlockOutcome::Refreshed)
            }
        }
    }

    /// Copy an external title/notes edit back into the task. Returns false
    /// when the text already matches and only the etag moved.
    fn import_text_edit(
        &self,
        user: &User,
        block: &ScheduledBlock,
        remote: &super::RemoteEvent,
        task_repo: &TaskRepository<'_>,
    ) -> Result<bool> {
        let Some(mut task) = task_repo.get(&user.id, &block.entity_id, false)? else {
            return Ok(false);
        };
        let mut changed = false;
        if !remote.title.trim().is_empty() && remote.title != task.title {
            task.title = remote.title.clone();
            changed = true;
        }
        if remote.notes.is_some() && remote.notes != task.notes {
            task.notes = remote.notes.clone();
            changed = true;
        }
        if changed {
            task_repo.update(&task)?;
        }
        Ok(changed)
    }

    /// Export recurring time blocks without a master event as recurring
    /// external events.
    fn export_time_block_masters(&self, user: &User) -> Result<usize> {
        let repo = RecurringTimeBlockRepository::new(self.db);
        let mut exported = 0;
        for tb in repo.list_active(&user.id)? {
            if tb.calendar_event_id.is_some() {
                continue;
            }
            let preset = &tb.recurrence_preset;
            let (Some(time_start), Some(time_end)) = (preset.time_start, preset.time_end) else {
                continue;
            };
            let anchor_day = preset
                .start_date
                .unwrap_or_else(|| chrono::Utc::now().date_naive());
            let midnight = crate::task::local_midnight(anchor_day, user.tz());
            let start = midnight + time_start.signed_duration_since(chrono::NaiveTime::MIN);
            let mut end = midnight + time_end.signed_duration_since(chrono::NaiveTime::MIN);
            if time_end <= time_start {
                end += chrono::Duration::days(1);
            }
            let payload = ManagedEventPayload {
                block_id: tb.id.clone(),
                title: tb.title.clone(),
                notes: None,
                start,
                end,
                rrule: Some(preset_to_rrule(preset)),
            };
            match self.writer.create_event(&user.id, &payload) {
                Ok(version) => {
                    repo.set_calendar_event_id(&user.id, &tb.id, &version.event_id)?;
                    exported += 1;
                }
                Err(SyncError::Unauthorized) => return Err(CoreError::Unauthorized),
                Err(e) => warn!(time_block_id = %tb.id, error = %e, "master export failed"),
            }
        }
        Ok(exported)
    }
}

enum BlockOutcome {
    Created,
    InSync,
    MoveImported,
    EditImported,
    Refreshed,
}

impl BlockOutcome {
    fn tally(self, report: &mut SyncReport) {
        match self {
            BlockOutcome::Created => report.created += 1,
            BlockOutcome::InSync => {}
            BlockOutcome::MoveImported => report.imported_moves += 1,
            BlockOutcome::EditImported => report.imported_edits += 1,
            BlockOutcome::Refreshed => report.refreshed += 1,
        }
    }
}

fn map_sync_err(e: SyncError) -> CoreError {
    match e {
        SyncError::Unauthorized => CoreError::Unauthorized,
        SyncError::EtagConflict { event_id } => CoreError::SyncConflict {
            event_id,
            message: "etag mismatch outside import rules".to_string(),
        },
        other => CoreError::SyncConflict {
            event_id: String::new(),
            message: other.to_string(),
        },
    }
}
