//! Scheduled block storage.
//!
//! Rebuilds replace the movable part of a user's schedule atomically. Blocks
//! that were already exported to the external calendar leave an orphan record
//! behind when removed, so the next sync can delete the remote event.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::database::{fmt_dt, parse_dt, Database};
use crate::error::Result;
use crate::schedule::{ScheduledBlock, ScheduledBy};

const BLOCK_COLUMNS: &str = "id, user_id, entity_id, start_time, end_time, scheduled_by, \
     locked, sync_pending, calendar_event_id, calendar_etag, calendar_updated";

/// A managed external event whose block was removed; the synchronizer deletes
/// the remote event and then drops the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanedCalendarEvent {
    pub event_id: String,
    pub user_id: String,
    pub block_id: String,
    pub removed_at: DateTime<Utc>,
}

/// Repository for scheduled blocks.
pub struct ScheduledBlockRepository<'a> {
    db: &'a Database,
}

impl<'a> ScheduledBlockRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn create(&self, block: &ScheduledBlock) -> Result<()> {
        insert_block(self.db.conn(), block)
    }

    pub fn get(&self, user_id: &str, block_id: &str) -> Result<Option<ScheduledBlock>> {
        let sql =
            format!("SELECT {BLOCK_COLUMNS} FROM scheduled_blocks WHERE user_id = ?1 AND id = ?2");
        let mut stmt = self.db.conn().prepare(&sql)?;
        let result = stmt.query_row(params![user_id, block_id], row_to_block);
        match result {
            Ok(block) => Ok(Some(block)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All blocks for a user ordered by start time.
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<ScheduledBlock>> {
        let sql = format!(
            "SELECT {BLOCK_COLUMNS} FROM scheduled_blocks
             WHERE user_id = ?1 ORDER BY start_time, id"
        );
        let mut stmt = self.db.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], row_to_block)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Blocks overlapping `[start, end)`, using the window index.
    pub fn list_in_window(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScheduledBlock>> {
        let sql = format!(
            "SELECT {BLOCK_COLUMNS} FROM scheduled_blocks
             WHERE user_id = ?1 AND start_time < ?3 AND end_time > ?2
             ORDER BY start_time, id"
        );
        let mut stmt = self.db.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, fmt_dt(start), fmt_dt(end)], row_to_block)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Blocks the rebuild must not move: locked or user-scheduled.
    pub fn list_pinned(&self, user_id: &str) -> Result<Vec<ScheduledBlock>> {
        Ok(self
            .list_for_user(user_id)?
            .into_iter()
            .filter(|b| b.locked || b.scheduled_by == ScheduledBy::User)
            .collect())
    }

    /// Atomically replace the movable (system, unlocked) part of a user's
    /// schedule with `new_blocks`, flushing `audits` in the same transaction
    /// so the schedule change and its records land together. Removed blocks
    /// that were synced leave an orphan record for the next sync to delete
    /// remotely.
    pub fn replace_system_schedule(
        &self,
        user_id: &str,
        new_blocks: &[ScheduledBlock],
        audits: &[crate::audit::AuditEvent],
    ) -> Result<()> {
        let now = Utc::now();
        let conn = self.db.conn();
        let tx = conn.unchecked_transaction()?;
        {
            let sql = format!(
                "SELECT {BLOCK_COLUMNS} FROM scheduled_blocks
                 WHERE user_id = ?1 AND scheduled_by = 'system' AND locked = 0"
            );
            let mut stmt = tx.prepare(&sql)?;
            let removed: Vec<ScheduledBlock> = stmt
                .query_map(params![user_id], row_to_block)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for block in &removed {
                if let Some(event_id) = &block.calendar_event_id {
                    record_orphan(&tx, user_id, event_id, &block.id, now)?;
                }
            }
        }
        tx.execute(
            "DELETE FROM scheduled_blocks
             WHERE user_id = ?1 AND scheduled_by = 'system' AND locked = 0",
            params![user_id],
        )?;
        for block in new_blocks {
            insert_block(&tx, block)?;
        }
        for event in audits {
            tx.execute(
                "INSERT INTO audit_events (id, user_id, timestamp, event_type, entity_id, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.id,
                    event.user_id,
                    fmt_dt(event.timestamp),
                    event.event_type.as_str(),
                    event.entity_id,
                    event.details.to_string(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Store the external linkage after a create or etag refresh.
    pub fn set_calendar_linkage(
        &self,
        user_id: &str,
        block_id: &str,
        event_id: &str,
        etag: &str,
        updated: DateTime<Utc>,
    ) -> Result<()> {
        self.db.conn().execute(
            "UPDATE scheduled_blocks
             SET calendar_event_id = ?3, calendar_etag = ?4, calendar_updated = ?5,
                 sync_pending = 0
             WHERE user_id = ?1 AND id = ?2",
            params![user_id, block_id, event_id, etag, fmt_dt(updated)],
        )?;
        Ok(())
    }

    /// Import a user's manual move from the calendar: new interval, locked.
    pub fn import_moved_interval(
        &self,
        user_id: &str,
        block_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        etag: &str,
        updated: DateTime<Utc>,
    ) -> Result<()> {
        self.db.conn().execute(
            "UPDATE scheduled_blocks
             SET start_time = ?3, end_time = ?4, locked = 1,
                 calendar_etag = ?5, calendar_updated = ?6, sync_pending = 0
             WHERE user_id = ?1 AND id = ?2",
            params![
                user_id,
                block_id,
                fmt_dt(start),
                fmt_dt(end),
                etag,
                fmt_dt(updated)
            ],
        )?;
        Ok(())
    }

    /// User-initiated reschedule through the app: move the block and lock
    /// it so rebuilds leave it alone. Audited in the same transaction.
    pub fn reschedule(
        &self,
        user_id: &str,
        block_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        if end <= start {
            return Err(crate::error::ConstraintViolation::InvalidValue {
                field: "end_time",
                message: format!("{end} not after {start}"),
            }
            .into());
        }
        let conn = self.db.conn();
        let tx = conn.unchecked_transaction()?;
        let updated = tx.execute(
            "UPDATE scheduled_blocks
             SET start_time = ?3, end_time = ?4, scheduled_by = 'user', locked = 1
             WHERE user_id = ?1 AND id = ?2",
            params![user_id, block_id, fmt_dt(start), fmt_dt(end)],
        )?;
        if updated == 0 {
            return Err(crate::error::CoreError::NotFound {
                kind: "scheduled_block",
                id: block_id.to_string(),
            });
        }
        let event = crate::audit::AuditEvent::new(
            user_id,
            crate::audit::AuditEventType::Rescheduled,
            block_id,
            serde_json::json!({"to": [fmt_dt(start), fmt_dt(end)]}),
        );
        tx.execute(
            "INSERT INTO audit_events (id, user_id, timestamp, event_type, entity_id, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                event.user_id,
                fmt_dt(event.timestamp),
                event.event_type.as_str(),
                event.entity_id,
                event.details.to_string(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_sync_pending(&self, user_id: &str, block_id: &str, pending: bool) -> Result<()> {
        self.db.conn().execute(
            "UPDATE scheduled_blocks SET sync_pending = ?3 WHERE user_id = ?1 AND id = ?2",
            params![user_id, block_id, pending],
        )?;
        Ok(())
    }

    pub fn set_locked(&self, user_id: &str, block_id: &str, locked: bool) -> Result<()> {
        self.db.conn().execute(
            "UPDATE scheduled_blocks SET locked = ?3 WHERE user_id = ?1 AND id = ?2",
            params![user_id, block_id, locked],
        )?;
        Ok(())
    }

    /// Event ids of all synced blocks for a user. Used by the availability
    /// builder as the second leg of managed-event detection.
    pub fn calendar_event_ids(&self, user_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT calendar_event_id FROM scheduled_blocks
             WHERE user_id = ?1 AND calendar_event_id IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Orphaned external events awaiting remote deletion.
    pub fn orphaned_events(&self, user_id: &str) -> Result<Vec<OrphanedCalendarEvent>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT event_id, user_id, block_id, removed_at
             FROM orphaned_calendar_events WHERE user_id = ?1 ORDER BY removed_at, event_id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(OrphanedCalendarEvent {
                event_id: row.get(0)?,
                user_id: row.get(1)?,
                block_id: row.get(2)?,
                removed_at: parse_dt(&row.get::<_, String>(3)?)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Drop an orphan record once the remote event is gone.
    pub fn clear_orphaned_event(&self, user_id: &str, event_id: &str) -> Result<()> {
        self.db.conn().execute(
            "DELETE FROM orphaned_calendar_events WHERE user_id = ?1 AND event_id = ?2",
            params![user_id, event_id],
        )?;
        Ok(())
    }
}

fn insert_block(conn: &Connection, block: &ScheduledBlock) -> Result<()> {
    conn.execute(
        "INSERT INTO scheduled_blocks (id, user_id, entity_id, start_time, end_time,
            scheduled_by, locked, sync_pending, calendar_event_id, calendar_etag,
            calendar_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            block.id,
            block.user_id,
            block.entity_id,
            fmt_dt(block.start_time),
            fmt_dt(block.end_time),
            block.scheduled_by.as_str(),
            block.locked,
            block.sync_pending,
            block.calendar_event_id,
            block.calendar_etag,
            block.calendar_updated.map(fmt_dt),
        ],
    )?;
    Ok(())
}

fn record_orphan(
    conn: &Connection,
    user_id: &str,
    event_id: &str,
    block_id: &str,
    removed_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO orphaned_calendar_events (event_id, user_id, block_id, removed_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![event_id, user_id, block_id, fmt_dt(removed_at)],
    )?;
    Ok(())
}

/// Cascade helper for task deletion: removes the task's blocks, leaving
/// orphan records for synced ones.
pub(crate) fn remove_blocks_for_entity(
    conn: &Connection,
    user_id: &str,
    entity_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT id, calendar_event_id FROM scheduled_blocks
         WHERE user_id = ?1 AND entity_id = ?2",
    )?;
    let rows: Vec<(String, Option<String>)> = stmt
        .query_map(params![user_id, entity_id], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (block_id, event_id) in &rows {
        if let Some(event_id) = event_id {
            record_orphan(conn, user_id, event_id, block_id, now)?;
        }
    }
    conn.execute(
        "DELETE FROM scheduled_blocks WHERE user_id = ?1 AND entity_id = ?2",
        params![user_id, entity_id],
    )?;
    Ok(())
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledBlock> {
    let scheduled_by: String = row.get(5)?;
    Ok(ScheduledBlock {
        id: row.get(0)?,
        user_id: row.get(1)?,
        entity_id: row.get(2)?,
        start_time: parse_dt(&row.get::<_, String>(3)?)?,
        end_time: parse_dt(&row.get::<_, String>(4)?)?,
        scheduled_by: ScheduledBy::parse(&scheduled_by),
        locked: row.get(6)?,
        sync_pending: row.get(7)?,
        calendar_event_id: row.get(8)?,
        calendar_etag: row.get(9)?,
        calendar_updated: row
            .get::<_, Option<String>>(10)?
            .map(|s| parse_dt(&s))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn block(user: &str, entity: &str, offset_min: i64, len_min: i64) -> ScheduledBlock {
        let start = Utc::now() + Duration::minutes(offset_min);
        ScheduledBlock::new(
            user,
            entity,
            start,
            start + Duration::minutes(len_min),
            ScheduledBy::System,
        )
    }

    #[test]
    fn test_create_and_window_query() {
        let db = Database::open_memory().unwrap();
        let repo = ScheduledBlockRepository::new(&db);
        repo.create(&block("u1", "t1", 0, 30)).unwrap();
        repo.create(&block("u1", "t2", 120, 30)).unwrap();

        let now = Utc::now();
        let hits = repo
            .list_in_window("u1", now - Duration::minutes(5), now + Duration::minutes(60))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity_id, "t1");
    }

    #[test]
    fn test_replace_system_schedule_keeps_pinned() {
        let db = Database::open_memory().unwrap();
        let repo = ScheduledBlockRepository::new(&db);
        let mut locked = block("u1", "t1", 0, 30);
        locked.locked = true;
        let mut user_made = block("u1", "t2", 60, 30);
        user_made.scheduled_by = ScheduledBy::User;
        let movable = block("u1", "t3", 120, 30);
        repo.create(&locked).unwrap();
        repo.create(&user_made).unwrap();
        repo.create(&movable).unwrap();

        repo.replace_system_schedule("u1", &[block("u1", "t4", 180, 30)], &[])
            .unwrap();
        let remaining = repo.list_for_user("u1").unwrap();
        let entities: Vec<&str> = remaining.iter().map(|b| b.entity_id.as_str()).collect();
        assert!(entities.contains(&"t1"));
        assert!(entities.contains(&"t2"));
        assert!(entities.contains(&"t4"));
        assert!(!entities.contains(&"t3"));
    }

    #[test]
    fn test_replace_records_orphans_for_synced_blocks() {
        let db = Database::open_memory().unwrap();
        let repo = ScheduledBlockRepository::new(&db);
        let mut synced = block("u1", "t1", 0, 30);
        synced.calendar_event_id = Some("ev-1".into());
        repo.create(&synced).unwrap();

        repo.replace_system_schedule("u1", &[], &[]).unwrap();
        let orphans = repo.orphaned_events("u1").unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].event_id, "ev-1");

        repo.clear_orphaned_event("u1", "ev-1").unwrap();
        assert!(repo.orphaned_events("u1").unwrap().is_empty());
    }

    #[test]
    fn test_import_moved_interval_locks_block() {
        let db = Database::open_memory().unwrap();
        let repo = ScheduledBlockRepository::new(&db);
        let b = block("u1", "t1", 0, 60);
        repo.create(&b).unwrap();

        let new_start = Utc::now() + Duration::hours(4);
        let new_end = new_start + Duration::hours(1);
        repo.import_moved_interval("u1", &b.id, new_start, new_end, "etag-2", Utc::now())
            .unwrap();

        let loaded = repo.get("u1", &b.id).unwrap().unwrap();
        assert!(loaded.locked);
        assert_eq!(loaded.start_time, new_start);
        assert_eq!(loaded.calendar_etag.as_deref(), Some("etag-2"));
    }

    #[test]
    fn test_user_isolation() {
        let db = Database::open_memory().unwrap();
        let repo = ScheduledBlockRepository::new(&db);
        repo.create(&block("u1", "t1", 0, 30)).unwrap();
        assert!(repo.list_for_user("u2").unwrap().is_empty());
    }

    #[test]
    fn test_reschedule_locks_and_audits() {
        let db = Database::open_memory().unwrap();
        let repo = ScheduledBlockRepository::new(&db);
        let b = block("u1", "t1", 0, 30);
        repo.create(&b).unwrap();

        let start = Utc::now() + Duration::hours(6);
        let end = start + Duration::minutes(30);
        repo.reschedule("u1", &b.id, start, end).unwrap();

        let moved = repo.get("u1", &b.id).unwrap().unwrap();
        assert!(moved.locked);
        assert_eq!(moved.scheduled_by, ScheduledBy::User);
        assert_eq!(moved.start_time, start);

        let events = crate::storage::AuditRepository::new(&db)
            .list_for_entity("u1", &b.id, Some(crate::audit::AuditEventType::Rescheduled))
            .unwrap();
        assert_eq!(events.len(), 1);

        // Rejects an inverted interval.
        assert!(repo.reschedule("u1", &b.id, end, start).is_err());
    }
}
