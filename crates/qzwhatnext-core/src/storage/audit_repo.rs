//! Append-only audit storage.
//!
//! Audit rows are inserted inside the same connection-level transaction as
//! the state change they document and are never updated or deleted.

use rusqlite::params;

use super::database::{fmt_dt, parse_dt, Database};
use crate::audit::{AuditEvent, AuditEventType};
use crate::error::Result;

/// Repository for the audit log.
pub struct AuditRepository<'a> {
    db: &'a Database,
}

impl<'a> AuditRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Append one event.
    pub fn append(&self, event: &AuditEvent) -> Result<()> {
        self.db.conn().execute(
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
        Ok(())
    }

    /// All events for a user ordered by emit time.
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<AuditEvent>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT id, user_id, timestamp, event_type, entity_id, details
             FROM audit_events WHERE user_id = ?1 ORDER BY timestamp, id",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Events of one type referencing one entity, ordered by emit time.
    pub fn list_for_entity(
        &self,
        user_id: &str,
        entity_id: &str,
        event_type: Option<AuditEventType>,
    ) -> Result<Vec<AuditEvent>> {
        let events = self.list_for_user(user_id)?;
        Ok(events
            .into_iter()
            .filter(|e| e.entity_id == entity_id)
            .filter(|e| event_type.map_or(true, |ty| e.event_type == ty))
            .collect())
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEvent> {
    let type_str: String = row.get(3)?;
    let details_str: String = row.get(5)?;
    Ok(AuditEvent {
        id: row.get(0)?,
        user_id: row.get(1)?,
        timestamp: parse_dt(&row.get::<_, String>(2)?)?,
        event_type: AuditEventType::parse(&type_str).unwrap_or(AuditEventType::TaskUpdated),
        entity_id: row.get(4)?,
        details: serde_json::from_str(&details_str).unwrap_or(serde_json::Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_and_list_scoped_by_user() {
        let db = Database::open_memory().unwrap();
        let repo = AuditRepository::new(&db);
        repo.append(&AuditEvent::new(
            "u1",
            AuditEventType::ScheduleBuilt,
            "t1",
            json!({"reasons": ["earliest_fit"]}),
        ))
        .unwrap();
        repo.append(&AuditEvent::new(
            "u2",
            AuditEventType::OverflowFlagged,
            "t2",
            json!({"reason": "no_capacity"}),
        ))
        .unwrap();

        let u1 = repo.list_for_user("u1").unwrap();
        assert_eq!(u1.len(), 1);
        assert_eq!(u1[0].event_type, AuditEventType::ScheduleBuilt);
        assert!(repo
            .list_for_user("u2")
            .unwrap()
            .iter()
            .all(|e| e.user_id == "u2"));
    }

    #[test]
    fn test_list_for_entity_filters_by_type() {
        let db = Database::open_memory().unwrap();
        let repo = AuditRepository::new(&db);
        repo.append(&AuditEvent::new("u1", AuditEventType::TierChanged, "t1", json!({})))
            .unwrap();
        repo.append(&AuditEvent::new("u1", AuditEventType::TaskUpdated, "t1", json!({})))
            .unwrap();

        let tier_events = repo
            .list_for_entity("u1", "t1", Some(AuditEventType::TierChanged))
            .unwrap();
        assert_eq!(tier_events.len(), 1);
        let all = repo.list_for_entity("u1", "t1", None).unwrap();
        assert_eq!(all.len(), 2);
    }
}
