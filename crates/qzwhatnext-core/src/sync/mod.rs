//! Managed-calendar synchronization types.
//!
//! The synchronizer reconciles engine-emitted scheduled blocks with the
//! user's external calendar. It only ever touches events it can prove are
//! engine-managed: the managed marker property AND the stored id linkage
//! must both hold. Either alone is not proof, since users copy events across
//! calendars.

pub mod google;
pub mod synchronizer;

pub use synchronizer::{CalendarSynchronizer, SyncReport};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schedule::ScheduledBlock;

/// Private extended property carrying the owning block id.
pub const BLOCK_ID_PROPERTY: &str = "qzwhatnext_block_id";
/// Private extended property marking an event as engine-managed.
pub const MANAGED_PROPERTY: &str = "qzwhatnext_managed";

/// Sync errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("access revoked")]
    Unauthorized,

    #[error("calendar API error: {0}")]
    Api(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("rate limited")]
    RateLimited,

    #[error("etag conflict on event {event_id}")]
    EtagConflict { event_id: String },
}

/// Fields written to a managed external event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedEventPayload {
    pub block_id: String,
    pub title: String,
    pub notes: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// RRULE string for recurring masters, absent for plain blocks.
    pub rrule: Option<String>,
}

/// Versioning handle returned by the external calendar on every write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventVersion {
    pub event_id: String,
    pub etag: String,
    pub updated: DateTime<Utc>,
}

/// An external event as read back from the calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub event_id: String,
    pub etag: String,
    pub updated: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: String,
    pub notes: Option<String>,
    /// The managed marker property is present.
    pub managed_marker: bool,
    /// The block-id property, when present.
    pub block_id_property: Option<String>,
}

impl RemoteEvent {
    /// Managed proof: marker present AND linkage to this exact block.
    pub fn proves_managed(&self, block_id: &str) -> bool {
        self.managed_marker && self.block_id_property.as_deref() == Some(block_id)
    }
}

/// Boundary 2: create/update/delete of managed events.
pub trait CalendarWriter {
    fn create_event(
        &self,
        user_id: &str,
        payload: &ManagedEventPayload,
    ) -> Result<EventVersion, SyncError>;

    fn get_event(&self, user_id: &str, event_id: &str) -> Result<Option<RemoteEvent>, SyncError>;

    fn update_event(
        &self,
        user_id: &str,
        event_id: &str,
        payload: &ManagedEventPayload,
        etag: &str,
    ) -> Result<EventVersion, SyncError>;

    fn delete_event(&self, user_id: &str, event_id: &str) -> Result<(), SyncError>;
}

/// Per-event sync state, derived from a block and its remote counterpart.
///
/// Transitions: `Unsynced → Synced → UserEditedTitle → Synced` and
/// `Synced → UserMovedInTime → LockedSynced → Synced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagedEventState {
    /// No external event yet.
    Unsynced,
    /// In step with the external calendar.
    Synced,
    /// The user edited title/notes externally; pending import.
    UserEditedTitle,
    /// The user moved the event in time externally; pending import.
    UserMovedInTime,
    /// A user move was imported; the block is locked against rebuilds.
    LockedSynced,
}

impl ManagedEventState {
    /// Observe the current state from a block and its fetched remote event.
    pub fn observe(block: &ScheduledBlock, remote: Option<&RemoteEvent>) -> Self {
        let Some(stored_etag) = block.calendar_etag.as_deref() else {
            return ManagedEventState::Unsynced;
        };
        let Some(remote) = remote else {
            return ManagedEventState::Unsynced;
        };
        if remote.etag == stored_etag {
            return if block.locked {
                ManagedEventState::LockedSynced
            } else {
                ManagedEventState::Synced
            };
        }
        if remote.start != block.start_time || remote.end != block.end_time {
            ManagedEventState::UserMovedInTime
        } else {
            ManagedEventState::UserEditedTitle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduledBy;
    use chrono::Duration;

    fn block_with_etag(etag: &str) -> ScheduledBlock {
        let now = Utc::now();
        let mut block =
            ScheduledBlock::new("u1", "t1", now, now + Duration::hours(1), ScheduledBy::System);
        block.calendar_event_id = Some("ev-1".into());
        block.calendar_etag = Some(etag.into());
        block
    }

    fn remote_for(block: &ScheduledBlock, etag: &str) -> RemoteEvent {
        RemoteEvent {
            event_id: "ev-1".into(),
            etag: etag.into(),
            updated: Utc::now(),
            start: block.start_time,
            end: block.end_time,
            title: "Task".into(),
            notes: None,
            managed_marker: true,
            block_id_property: Some(block.id.clone()),
        }
    }

    #[test]
    fn test_proof_requires_marker_and_linkage() {
        let block = block_with_etag("e1");
        let mut remote = remote_for(&block, "e1");
        assert!(remote.proves_managed(&block.id));
        remote.managed_marker = false;
        assert!(!remote.proves_managed(&block.id));
        remote.managed_marker = true;
        remote.block_id_property = Some("someone-else".into());
        assert!(!remote.proves_managed(&block.id));
    }

    #[test]
    fn test_observe_states() {
        let block = block_with_etag("e1");
        let remote = remote_for(&block, "e1");
        assert_eq!(
            ManagedEventState::observe(&block, Some(&remote)),
            ManagedEventState::Synced
        );

        let mut locked = block.clone();
        locked.locked = true;
        assert_eq!(
            ManagedEventState::observe(&locked, Some(&remote)),
            ManagedEventState::LockedSynced
        );

        let mut moved = remote_for(&block, "e2");
        moved.start = block.start_time + Duration::hours(4);
        moved.end = block.end_time + Duration::hours(4);
        assert_eq!(
            ManagedEventState::observe(&block, Some(&moved)),
            ManagedEventState::UserMovedInTime
        );

        let retitled = remote_for(&block, "e2");
        assert_eq!(
            ManagedEventState::observe(&block, Some(&retitled)),
            ManagedEventState::UserEditedTitle
        );

        let unsynced = ScheduledBlock::new(
            "u1",
            "t1",
            block.start_time,
            block.end_time,
            ScheduledBy::System,
        );
        assert_eq!(
            ManagedEventState::observe(&unsynced, None),
            ManagedEventState::Unsynced
        );
    }
}
