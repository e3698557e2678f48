//! Recurring series and time block storage.

use rusqlite::params;

use super::database::{fmt_dt, parse_dt, Database};
use crate::error::{CoreError, Result};
use crate::recurrence::{RecurrencePreset, RecurringTaskSeries, RecurringTimeBlock};
use crate::task::TaskCategory;

/// Repository for recurring task series.
pub struct RecurringTaskSeriesRepository<'a> {
    db: &'a Database,
}

impl<'a> RecurringTaskSeriesRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn create(&self, series: &RecurringTaskSeries) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO recurring_task_series (id, user_id, title_template, notes_template,
                estimated_duration_min_default, category_default, recurrence_preset,
                ai_excluded, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL)",
            params![
                series.id,
                series.user_id,
                series.title_template,
                series.notes_template,
                series.estimated_duration_min_default,
                series.category_default.as_str(),
                serde_json::to_string(&series.recurrence_preset)?,
                series.ai_excluded,
                fmt_dt(series.created_at),
                fmt_dt(series.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, user_id: &str, series_id: &str) -> Result<Option<RecurringTaskSeries>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT id, user_id, title_template, notes_template, estimated_duration_min_default,
                    category_default, recurrence_preset, ai_excluded, created_at, updated_at,
                    deleted_at
             FROM recurring_task_series WHERE user_id = ?1 AND id = ?2",
        )?;
        let result = stmt.query_row(params![user_id, series_id], row_to_series);
        match result {
            Ok(series) => Ok(Some(series)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Active (non-deleted) series for a user.
    pub fn list_active(&self, user_id: &str) -> Result<Vec<RecurringTaskSeries>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT id, user_id, title_template, notes_template, estimated_duration_min_default,
                    category_default, recurrence_preset, ai_excluded, created_at, updated_at,
                    deleted_at
             FROM recurring_task_series
             WHERE user_id = ?1 AND deleted_at IS NULL ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_series)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn soft_delete(&self, user_id: &str, series_id: &str) -> Result<()> {
        let updated = self.db.conn().execute(
            "UPDATE recurring_task_series SET deleted_at = ?3, updated_at = ?3
             WHERE user_id = ?1 AND id = ?2 AND deleted_at IS NULL",
            params![user_id, series_id, fmt_dt(chrono::Utc::now())],
        )?;
        if updated == 0 {
            return Err(CoreError::NotFound {
                kind: "recurring_task_series",
                id: series_id.to_string(),
            });
        }
        Ok(())
    }
}

fn row_to_series(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecurringTaskSeries> {
    let category: String = row.get(5)?;
    let preset_json: String = row.get(6)?;
    let preset: RecurrencePreset = serde_json::from_str(&preset_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(RecurringTaskSeries {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title_template: row.get(2)?,
        notes_template: row.get(3)?,
        estimated_duration_min_default: row.get(4)?,
        category_default: TaskCategory::parse(&category),
        recurrence_preset: preset,
        ai_excluded: row.get(7)?,
        created_at: parse_dt(&row.get::<_, String>(8)?)?,
        updated_at: parse_dt(&row.get::<_, String>(9)?)?,
        deleted_at: row
            .get::<_, Option<String>>(10)?
            .map(|s| parse_dt(&s))
            .transpose()?,
    })
}

/// Repository for recurring time blocks (reserved time, never tasks).
pub struct RecurringTimeBlockRepository<'a> {
    db: &'a Database,
}

impl<'a> RecurringTimeBlockRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn create(&self, block: &RecurringTimeBlock) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO recurring_time_blocks (id, user_id, title, recurrence_preset,
                calendar_event_id, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
            params![
                block.id,
                block.user_id,
                block.title,
                serde_json::to_string(&block.recurrence_preset)?,
                block.calendar_event_id,
                fmt_dt(block.created_at),
                fmt_dt(block.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_active(&self, user_id: &str) -> Result<Vec<RecurringTimeBlock>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT id, user_id, title, recurrence_preset, calendar_event_id, created_at,
                    updated_at, deleted_at
             FROM recurring_time_blocks
             WHERE user_id = ?1 AND deleted_at IS NULL ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_time_block)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Store the external recurring-master id after export.
    pub fn set_calendar_event_id(
        &self,
        user_id: &str,
        block_id: &str,
        event_id: &str,
    ) -> Result<()> {
        self.db.conn().execute(
            "UPDATE recurring_time_blocks SET calendar_event_id = ?3, updated_at = ?4
             WHERE user_id = ?1 AND id = ?2",
            params![user_id, block_id, event_id, fmt_dt(chrono::Utc::now())],
        )?;
        Ok(())
    }

    pub fn soft_delete(&self, user_id: &str, block_id: &str) -> Result<()> {
        let updated = self.db.conn().execute(
            "UPDATE recurring_time_blocks SET deleted_at = ?3, updated_at = ?3
             WHERE user_id = ?1 AND id = ?2 AND deleted_at IS NULL",
            params![user_id, block_id, fmt_dt(chrono::Utc::now())],
        )?;
        if updated == 0 {
            return Err(CoreError::NotFound {
                kind: "recurring_time_block",
                id: block_id.to_string(),
            });
        }
        Ok(())
    }
}

fn row_to_time_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecurringTimeBlock> {
    let preset_json: String = row.get(3)?;
    let preset: RecurrencePreset = serde_json::from_str(&preset_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(RecurringTimeBlock {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        recurrence_preset: preset,
        calendar_event_id: row.get(4)?,
        created_at: parse_dt(&row.get::<_, String>(5)?)?,
        updated_at: parse_dt(&row.get::<_, String>(6)?)?,
        deleted_at: row
            .get::<_, Option<String>>(7)?
            .map(|s| parse_dt(&s))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recurrence::Weekday;

    #[test]
    fn test_series_round_trip() {
        let db = Database::open_memory().unwrap();
        let repo = RecurringTaskSeriesRepository::new(&db);
        let series = RecurringTaskSeries::new(
            "u1",
            "Morning run",
            RecurrencePreset::weekly(vec![Weekday::Mo, Weekday::We]),
        )
        .with_category(TaskCategory::Health)
        .with_duration(45);
        repo.create(&series).unwrap();

        let loaded = repo.get("u1", &series.id).unwrap().unwrap();
        assert_eq!(loaded.title_template, "Morning run");
        assert_eq!(loaded.category_default, TaskCategory::Health);
        assert_eq!(loaded.estimated_duration_min_default, 45);
        assert_eq!(
            loaded.recurrence_preset.by_weekday,
            Some(vec![Weekday::Mo, Weekday::We])
        );
    }

    #[test]
    fn test_soft_deleted_series_excluded_from_active() {
        let db = Database::open_memory().unwrap();
        let repo = RecurringTaskSeriesRepository::new(&db);
        let series = RecurringTaskSeries::new("u1", "Habit", RecurrencePreset::daily());
        repo.create(&series).unwrap();
        assert_eq!(repo.list_active("u1").unwrap().len(), 1);

        repo.soft_delete("u1", &series.id).unwrap();
        assert!(repo.list_active("u1").unwrap().is_empty());
        // Row still readable by id.
        assert!(repo.get("u1", &series.id).unwrap().is_some());
    }

    #[test]
    fn test_time_block_round_trip() {
        let db = Database::open_memory().unwrap();
        let repo = RecurringTimeBlockRepository::new(&db);
        let block = RecurringTimeBlock::new("u1", "Gym", RecurrencePreset::daily());
        repo.create(&block).unwrap();

        repo.set_calendar_event_id("u1", &block.id, "master-1").unwrap();
        let loaded = repo.list_active("u1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].calendar_event_id.as_deref(), Some("master-1"));
    }
}
