//! SQLite connection and schema migration.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use std::path::Path;

use super::data_dir;
use crate::error::Result;

/// SQLite database for qzWhatNext state.
///
/// All tables are user-scoped except the append-only audit log, which is
/// user-scoped too but never updated in place.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open the database at `~/.qzwhatnext/qzwhatnext.db`, creating tables
    /// if they don't exist.
    pub fn open_default() -> Result<Self> {
        Self::open(data_dir().join("qzwhatnext.db"))
    }

    /// Open the database at an explicit path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                timezone   TEXT NOT NULL DEFAULT 'UTC',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id                          TEXT PRIMARY KEY,
                user_id                     TEXT NOT NULL,
                source_type                 TEXT NOT NULL,
                source_id                   TEXT,
                dedupe_key                  TEXT,
                title                       TEXT NOT NULL,
                notes                       TEXT,
                status                      TEXT NOT NULL DEFAULT 'open',
                created_at                  TEXT NOT NULL,
                updated_at                  TEXT NOT NULL,
                deleted_at                  TEXT,
                deadline                    TEXT,
                start_after                 TEXT,
                due_by                      TEXT,
                estimated_duration_min      INTEGER NOT NULL DEFAULT 30,
                duration_confidence         REAL NOT NULL DEFAULT 0.5,
                category                    TEXT NOT NULL DEFAULT 'unknown',
                energy_intensity            TEXT NOT NULL DEFAULT 'medium',
                risk_score                  REAL NOT NULL DEFAULT 0.3,
                impact_score                REAL NOT NULL DEFAULT 0.3,
                dependencies                TEXT NOT NULL DEFAULT '[]',
                flexibility_window          TEXT,
                ai_excluded                 INTEGER NOT NULL DEFAULT 0,
                manual_priority_locked      INTEGER NOT NULL DEFAULT 0,
                user_locked                 INTEGER NOT NULL DEFAULT 0,
                manually_scheduled          INTEGER NOT NULL DEFAULT 0,
                tier                        INTEGER,
                pending_tier                INTEGER,
                recurrence_series_id        TEXT,
                recurrence_occurrence_start TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks (user_id, id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_dedupe
                ON tasks (user_id, dedupe_key) WHERE dedupe_key IS NOT NULL;

            CREATE TABLE IF NOT EXISTS recurring_task_series (
                id                             TEXT PRIMARY KEY,
                user_id                        TEXT NOT NULL,
                title_template                 TEXT NOT NULL,
                notes_template                 TEXT,
                estimated_duration_min_default INTEGER NOT NULL DEFAULT 30,
                category_default               TEXT NOT NULL DEFAULT 'unknown',
                recurrence_preset              TEXT NOT NULL,
                ai_excluded                    INTEGER NOT NULL DEFAULT 0,
                created_at                     TEXT NOT NULL,
                updated_at                     TEXT NOT NULL,
                deleted_at                     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_series_user ON recurring_task_series (user_id, id);

            CREATE TABLE IF NOT EXISTS recurring_time_blocks (
                id                TEXT PRIMARY KEY,
                user_id           TEXT NOT NULL,
                title             TEXT NOT NULL,
                recurrence_preset TEXT NOT NULL,
                calendar_event_id TEXT,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL,
                deleted_at        TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_time_blocks_user ON recurring_time_blocks (user_id, id);

            CREATE TABLE IF NOT EXISTS scheduled_blocks (
                id                TEXT PRIMARY KEY,
                user_id           TEXT NOT NULL,
                entity_id         TEXT NOT NULL,
                start_time        TEXT NOT NULL,
                end_time          TEXT NOT NULL,
                scheduled_by      TEXT NOT NULL DEFAULT 'system',
                locked            INTEGER NOT NULL DEFAULT 0,
                sync_pending      INTEGER NOT NULL DEFAULT 0,
                calendar_event_id TEXT,
                calendar_etag     TEXT,
                calendar_updated  TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_blocks_user ON scheduled_blocks (user_id, id);
            CREATE INDEX IF NOT EXISTS idx_blocks_window ON scheduled_blocks (user_id, start_time, end_time);

            CREATE TABLE IF NOT EXISTS orphaned_calendar_events (
                event_id   TEXT PRIMARY KEY,
                user_id    TEXT NOT NULL,
                block_id   TEXT NOT NULL,
                removed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_events (
                id         TEXT PRIMARY KEY,
                user_id    TEXT NOT NULL,
                timestamp  TEXT NOT NULL,
                event_type TEXT NOT NULL,
                entity_id  TEXT NOT NULL,
                details    TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_events (user_id, timestamp);

            CREATE TABLE IF NOT EXISTS automation_tokens (
                id           TEXT PRIMARY KEY,
                user_id      TEXT NOT NULL,
                token_hash   TEXT NOT NULL UNIQUE,
                token_prefix TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                revoked_at   TEXT,
                last_used_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tokens_user ON automation_tokens (user_id, id);",
        )?;
        Ok(())
    }
}

/// Format an instant for storage.
pub(crate) fn fmt_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse a stored instant, tolerating nothing: storage is under our control,
/// so a malformed timestamp is a bug worth surfacing in the row mapper.
pub(crate) fn parse_dt(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

pub(crate) fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date(s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory_migrates() {
        let db = Database::open_memory().unwrap();
        // Re-running migration is harmless.
        db.migrate().unwrap();
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_dt_round_trip() {
        let now = Utc::now();
        assert_eq!(parse_dt(&fmt_dt(now)).unwrap(), now);
    }

    #[test]
    fn test_date_round_trip() {
        let d = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        assert_eq!(parse_date(&fmt_date(d)).unwrap(), d);
    }
}
