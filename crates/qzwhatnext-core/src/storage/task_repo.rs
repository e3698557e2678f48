//! User-scoped task storage with soft delete.
//!
//! Writes validate hard constraints (duration bounds, window consistency,
//! dependency acyclicity) before touching the database and emit audit rows in
//! the same transaction as the task row, so no mutation goes undocumented.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rusqlite::params;
use serde_json::json;
use std::collections::{HashMap, HashSet};

use super::block_repo;
use super::database::{fmt_date, fmt_dt, parse_date, parse_dt, Database};
use crate::audit::{AuditEvent, AuditEventType};
use crate::error::{ConstraintViolation, CoreError, Result};
use crate::task::{EnergyIntensity, Task, TaskCategory, TaskStatus};

const TASK_COLUMNS: &str = "id, user_id, source_type, source_id, title, notes, status, \
     created_at, updated_at, deleted_at, deadline, start_after, due_by, \
     estimated_duration_min, duration_confidence, category, energy_intensity, \
     risk_score, impact_score, dependencies, flexibility_window, ai_excluded, \
     manual_priority_locked, user_locked, manually_scheduled, tier, pending_tier, \
     recurrence_series_id, recurrence_occurrence_start";

/// Repository for Task rows. Every operation is scoped to an owner.
pub struct TaskRepository<'a> {
    db: &'a Database,
}

impl<'a> TaskRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    fn owner_tz(&self, user_id: &str) -> Result<Tz> {
        let tz: Option<String> = self
            .db
            .conn()
            .query_row(
                "SELECT timezone FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        match tz {
            Some(name) => Ok(name.parse().unwrap_or(chrono_tz::UTC)),
            None => Err(CoreError::NotFound {
                kind: "user",
                id: user_id.to_string(),
            }),
        }
    }

    /// Create a task, or fail atomically on the dedupe key
    /// `(user, source_type, source_id, series, occurrence_start)`.
    pub fn create(&self, task: &Task) -> Result<Task> {
        let tz = self.owner_tz(&task.user_id)?;
        task.validate(tz)?;
        self.check_acyclic(task)?;

        let conn = self.db.conn();
        let tx = conn.unchecked_transaction()?;
        let result = tx.execute(
            "INSERT INTO tasks (id, user_id, source_type, source_id, dedupe_key, title, notes,
                status, created_at, updated_at, deleted_at, deadline, start_after, due_by,
                estimated_duration_min, duration_confidence, category, energy_intensity,
                risk_score, impact_score, dependencies, flexibility_window, ai_excluded,
                manual_priority_locked, user_locked, manually_scheduled, tier, pending_tier,
                recurrence_series_id, recurrence_occurrence_start)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)",
            params![
                task.id,
                task.user_id,
                task.source_type,
                task.source_id,
                dedupe_key(task),
                task.title,
                task.notes,
                task.status.as_str(),
                fmt_dt(task.created_at),
                fmt_dt(task.updated_at),
                task.deleted_at.map(fmt_dt),
                task.deadline.map(fmt_dt),
                task.start_after.map(fmt_date),
                task.due_by.map(fmt_date),
                task.estimated_duration_min,
                task.duration_confidence,
                task.category.as_str(),
                task.energy_intensity.as_str(),
                task.risk_score,
                task.impact_score,
                serde_json::to_string(&task.dependencies)?,
                encode_window(task.flexibility_window)?,
                task.ai_excluded,
                task.manual_priority_locked,
                task.user_locked,
                task.manually_scheduled,
                task.tier,
                task.pending_tier,
                task.recurrence_series_id,
                task.recurrence_occurrence_start.map(fmt_dt),
            ],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(ConstraintViolation::Duplicate {
                    key: dedupe_key(task).unwrap_or_else(|| task.id.clone()),
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        }
        append_audit(
            &tx,
            &AuditEvent::new(
                &task.user_id,
                AuditEventType::TaskImported,
                &task.id,
                json!({"source_type": task.source_type, "title": task.title}),
            ),
        )?;
        tx.commit()?;
        Ok(task.clone())
    }

    /// Get a task by id. Soft-deleted rows are hidden unless
    /// `include_deleted`.
    pub fn get(&self, user_id: &str, task_id: &str, include_deleted: bool) -> Result<Option<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ?1 AND id = ?2"
        );
        let mut stmt = self.db.conn().prepare(&sql)?;
        let result = stmt.query_row(params![user_id, task_id], row_to_task);
        match result {
            Ok(task) if task.is_active() || include_deleted => Ok(Some(task)),
            Ok(_) => Ok(None),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List tasks for a user, active rows only unless `include_deleted`.
    pub fn list(&self, user_id: &str, include_deleted: bool) -> Result<Vec<Task>> {
        let sql = if include_deleted {
            format!("SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ?1 ORDER BY created_at, id")
        } else {
            format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE user_id = ?1 AND deleted_at IS NULL ORDER BY created_at, id"
            )
        };
        let mut stmt = self.db.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], row_to_task)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Active open tasks for a user.
    pub fn list_open(&self, user_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .list(user_id, false)?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Open)
            .collect())
    }

    /// Update a task. Emits `task_updated` when schedule-relevant attributes
    /// changed.
    pub fn update(&self, task: &Task) -> Result<Task> {
        let tz = self.owner_tz(&task.user_id)?;
        task.validate(tz)?;
        self.check_acyclic(task)?;
        let before = self
            .get(&task.user_id, &task.id, true)?
            .ok_or_else(|| CoreError::NotFound {
                kind: "task",
                id: task.id.clone(),
            })?;

        let mut task = task.clone();
        task.updated_at = Utc::now();

        let conn = self.db.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE tasks SET source_type = ?3, source_id = ?4, title = ?5, notes = ?6,
                status = ?7, updated_at = ?8, deleted_at = ?9, deadline = ?10,
                start_after = ?11, due_by = ?12, estimated_duration_min = ?13,
                duration_confidence = ?14, category = ?15, energy_intensity = ?16,
                risk_score = ?17, impact_score = ?18, dependencies = ?19,
                flexibility_window = ?20, ai_excluded = ?21, manual_priority_locked = ?22,
                user_locked = ?23, manually_scheduled = ?24, tier = ?25, pending_tier = ?26
             WHERE user_id = ?1 AND id = ?2",
            params![
                task.user_id,
                task.id,
                task.source_type,
                task.source_id,
                task.title,
                task.notes,
                task.status.as_str(),
                fmt_dt(task.updated_at),
                task.deleted_at.map(fmt_dt),
                task.deadline.map(fmt_dt),
                task.start_after.map(fmt_date),
                task.due_by.map(fmt_date),
                task.estimated_duration_min,
                task.duration_confidence,
                task.category.as_str(),
                task.energy_intensity.as_str(),
                task.risk_score,
                task.impact_score,
                serde_json::to_string(&task.dependencies)?,
                encode_window(task.flexibility_window)?,
                task.ai_excluded,
                task.manual_priority_locked,
                task.user_locked,
                task.manually_scheduled,
                task.tier,
                task.pending_tier,
            ],
        )?;
        let changed = schedule_relevant_changes(&before, &task);
        if !changed.is_empty() {
            append_audit(
                &tx,
                &AuditEvent::new(
                    &task.user_id,
                    AuditEventType::TaskUpdated,
                    &task.id,
                    json!({"changed": changed}),
                ),
            )?;
        }
        tx.commit()?;
        Ok(task)
    }

    /// Soft-delete: reversible, cascades to scheduled blocks.
    pub fn soft_delete(&self, user_id: &str, task_id: &str) -> Result<()> {
        let now = Utc::now();
        let conn = self.db.conn();
        let tx = conn.unchecked_transaction()?;
        let updated = tx.execute(
            "UPDATE tasks SET deleted_at = ?3, updated_at = ?3
             WHERE user_id = ?1 AND id = ?2 AND deleted_at IS NULL",
            params![user_id, task_id, fmt_dt(now)],
        )?;
        if updated == 0 {
            return Err(CoreError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            });
        }
        block_repo::remove_blocks_for_entity(&tx, user_id, task_id, now)?;
        append_audit(
            &tx,
            &AuditEvent::new(
                user_id,
                AuditEventType::TaskUpdated,
                task_id,
                json!({"changed": ["deleted_at"]}),
            ),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Restore a soft-deleted task.
    pub fn restore(&self, user_id: &str, task_id: &str) -> Result<()> {
        let updated = self.db.conn().execute(
            "UPDATE tasks SET deleted_at = NULL, updated_at = ?3
             WHERE user_id = ?1 AND id = ?2 AND deleted_at IS NOT NULL",
            params![user_id, task_id, fmt_dt(Utc::now())],
        )?;
        if updated == 0 {
            return Err(CoreError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            });
        }
        Ok(())
    }

    /// Irreversibly remove a task and its scheduled blocks.
    pub fn purge(&self, user_id: &str, task_id: &str) -> Result<()> {
        let now = Utc::now();
        let conn = self.db.conn();
        let tx = conn.unchecked_transaction()?;
        block_repo::remove_blocks_for_entity(&tx, user_id, task_id, now)?;
        let removed = tx.execute(
            "DELETE FROM tasks WHERE user_id = ?1 AND id = ?2",
            params![user_id, task_id],
        )?;
        if removed == 0 {
            return Err(CoreError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            });
        }
        tx.commit()?;
        Ok(())
    }

    /// Mark a task completed.
    pub fn complete(&self, user_id: &str, task_id: &str) -> Result<()> {
        let now = Utc::now();
        let conn = self.db.conn();
        let tx = conn.unchecked_transaction()?;
        let updated = tx.execute(
            "UPDATE tasks SET status = 'completed', updated_at = ?3
             WHERE user_id = ?1 AND id = ?2 AND deleted_at IS NULL",
            params![user_id, task_id, fmt_dt(now)],
        )?;
        if updated == 0 {
            return Err(CoreError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            });
        }
        append_audit(
            &tx,
            &AuditEvent::new(user_id, AuditEventType::Completed, task_id, json!({})),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Open occurrences of a recurring series.
    pub fn open_tasks_for_series(&self, user_id: &str, series_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .list_open(user_id)?
            .into_iter()
            .filter(|t| t.recurrence_series_id.as_deref() == Some(series_id))
            .collect())
    }

    /// Open recurrence occurrences whose window has fully passed.
    ///
    /// The occurrence window is the flexibility window when present,
    /// otherwise the occurrence day itself.
    pub fn open_recurrence_tasks_with_window_before(
        &self,
        user_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        Ok(self
            .list_open(user_id)?
            .into_iter()
            .filter(|t| t.recurrence_series_id.is_some())
            .filter(|t| {
                let window_end = t
                    .flexibility_window
                    .map(|(_, end)| end)
                    .or_else(|| {
                        t.recurrence_occurrence_start
                            .map(|start| start + chrono::Duration::days(1))
                    });
                window_end.is_some_and(|end| end <= before)
            })
            .collect())
    }

    /// Potential duplicates by `(source_type, source_id, title)`.
    pub fn find_duplicates(
        &self,
        user_id: &str,
        source_type: &str,
        source_id: Option<&str>,
        title: &str,
    ) -> Result<Vec<Task>> {
        Ok(self
            .list(user_id, false)?
            .into_iter()
            .filter(|t| t.source_type == source_type && t.title == title)
            .filter(|t| source_id.is_none() || t.source_id.as_deref() == source_id)
            .collect())
    }

    /// Reject writes that would close a dependency cycle.
    ///
    /// The stored graph is acyclic, so any new cycle must pass through the
    /// written task; a DFS from it over the merged graph suffices.
    fn check_acyclic(&self, incoming: &Task) -> Result<()> {
        if incoming.dependencies.is_empty() {
            return Ok(());
        }
        let mut graph: HashMap<String, Vec<String>> = HashMap::new();
        let mut stmt = self
            .db
            .conn()
            .prepare("SELECT id, dependencies FROM tasks WHERE user_id = ?1 AND deleted_at IS NULL")?;
        let rows = stmt.query_map(params![incoming.user_id], |row| {
            let id: String = row.get(0)?;
            let deps_json: String = row.get(1)?;
            Ok((id, deps_json))
        })?;
        for row in rows {
            let (id, deps_json) = row?;
            let deps: Vec<String> = serde_json::from_str(&deps_json).unwrap_or_default();
            graph.insert(id, deps);
        }
        graph.insert(incoming.id.clone(), incoming.dependencies.clone());

        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = incoming
            .dependencies
            .iter()
            .map(String::as_str)
            .collect();
        while let Some(node) = stack.pop() {
            if node == incoming.id {
                return Err(ConstraintViolation::DependencyCycle {
                    task_id: incoming.id.clone(),
                }
                .into());
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(deps) = graph.get(node) {
                stack.extend(deps.iter().map(String::as_str));
            }
        }
        Ok(())
    }
}

/// Dedupe key, set only for tasks with an external or recurrence identity.
fn dedupe_key(task: &Task) -> Option<String> {
    if task.source_id.is_none() && task.recurrence_series_id.is_none() {
        return None;
    }
    Some(format!(
        "{}|{}|{}|{}",
        task.source_type,
        task.source_id.as_deref().unwrap_or(""),
        task.recurrence_series_id.as_deref().unwrap_or(""),
        task.recurrence_occurrence_start
            .map(fmt_dt)
            .unwrap_or_default(),
    ))
}

fn encode_window(
    window: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> Result<Option<String>> {
    window
        .map(|(start, end)| {
            serde_json::to_string(&[fmt_dt(start), fmt_dt(end)]).map_err(Into::into)
        })
        .transpose()
}

fn append_audit(tx: &rusqlite::Transaction<'_>, event: &AuditEvent) -> Result<()> {
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
    Ok(())
}

/// Fields whose change affects scheduling, for `task_updated` audits.
fn schedule_relevant_changes(before: &Task, after: &Task) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if before.status != after.status {
        changed.push("status");
    }
    if before.deadline != after.deadline {
        changed.push("deadline");
    }
    if before.start_after != after.start_after {
        changed.push("start_after");
    }
    if before.due_by != after.due_by {
        changed.push("due_by");
    }
    if before.estimated_duration_min != after.estimated_duration_min {
        changed.push("estimated_duration_min");
    }
    if before.category != after.category {
        changed.push("category");
    }
    if before.risk_score != after.risk_score {
        changed.push("risk_score");
    }
    if before.impact_score != after.impact_score {
        changed.push("impact_score");
    }
    if before.dependencies != after.dependencies {
        changed.push("dependencies");
    }
    if before.flexibility_window != after.flexibility_window {
        changed.push("flexibility_window");
    }
    if before.ai_excluded != after.ai_excluded {
        changed.push("ai_excluded");
    }
    if before.manually_scheduled != after.manually_scheduled {
        changed.push("manually_scheduled");
    }
    if before.manual_priority_locked != after.manual_priority_locked {
        changed.push("manual_priority_locked");
    }
    if before.user_locked != after.user_locked {
        changed.push("user_locked");
    }
    changed
}

pub(crate) fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(6)?;
    let category: String = row.get(15)?;
    let energy: String = row.get(16)?;
    let deps_json: String = row.get(19)?;
    let window_json: Option<String> = row.get(20)?;
    let window = match window_json {
        Some(json) => {
            let pair: [String; 2] = serde_json::from_str(&json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    20,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            Some((parse_dt(&pair[0])?, parse_dt(&pair[1])?))
        }
        None => None,
    };
    Ok(Task {
        id: row.get(0)?,
        user_id: row.get(1)?,
        source_type: row.get(2)?,
        source_id: row.get(3)?,
        title: row.get(4)?,
        notes: row.get(5)?,
        status: TaskStatus::parse(&status),
        created_at: parse_dt(&row.get::<_, String>(7)?)?,
        updated_at: parse_dt(&row.get::<_, String>(8)?)?,
        deleted_at: row
            .get::<_, Option<String>>(9)?
            .map(|s| parse_dt(&s))
            .transpose()?,
        deadline: row
            .get::<_, Option<String>>(10)?
            .map(|s| parse_dt(&s))
            .transpose()?,
        start_after: row
            .get::<_, Option<String>>(11)?
            .map(|s| parse_date(&s))
            .transpose()?,
        due_by: row
            .get::<_, Option<String>>(12)?
            .map(|s| parse_date(&s))
            .transpose()?,
        estimated_duration_min: row.get(13)?,
        duration_confidence: row.get(14)?,
        category: TaskCategory::parse(&category),
        energy_intensity: EnergyIntensity::parse(&energy),
        risk_score: row.get(17)?,
        impact_score: row.get(18)?,
        dependencies: serde_json::from_str(&deps_json).unwrap_or_default(),
        flexibility_window: window,
        ai_excluded: row.get(21)?,
        manual_priority_locked: row.get(22)?,
        user_locked: row.get(23)?,
        manually_scheduled: row.get(24)?,
        tier: row.get(25)?,
        pending_tier: row.get(26)?,
        recurrence_series_id: row.get(27)?,
        recurrence_occurrence_start: row
            .get::<_, Option<String>>(28)?
            .map(|s| parse_dt(&s))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::UserRepository;
    use crate::user::User;

    fn setup() -> (Database, User) {
        let db = Database::open_memory().unwrap();
        let user = User::new("alice", "UTC");
        UserRepository::new(&db).create(&user).unwrap();
        (db, user)
    }

    #[test]
    fn test_create_get_round_trip() {
        let (db, user) = setup();
        let repo = TaskRepository::new(&db);
        let task = Task::new(&user.id, "api", "Write report")
            .with_notes("quarterly numbers")
            .with_category(TaskCategory::Work)
            .with_duration(45);
        repo.create(&task).unwrap();

        let loaded = repo.get(&user.id, &task.id, false).unwrap().unwrap();
        assert_eq!(loaded.title, "Write report");
        assert_eq!(loaded.category, TaskCategory::Work);
        assert_eq!(loaded.estimated_duration_min, 45);
        assert_eq!(loaded.dependencies, Vec::<String>::new());
    }

    #[test]
    fn test_create_emits_task_imported() {
        let (db, user) = setup();
        let repo = TaskRepository::new(&db);
        let task = Task::new(&user.id, "import", "From sheets");
        repo.create(&task).unwrap();

        let events = crate::storage::AuditRepository::new(&db)
            .list_for_entity(&user.id, &task.id, Some(AuditEventType::TaskImported))
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_user_isolation() {
        let (db, user) = setup();
        let other = User::new("mallory", "UTC");
        UserRepository::new(&db).create(&other).unwrap();
        let repo = TaskRepository::new(&db);
        let task = Task::new(&user.id, "api", "secret");
        repo.create(&task).unwrap();

        assert!(repo.get(&other.id, &task.id, true).unwrap().is_none());
        assert!(repo.list(&other.id, true).unwrap().is_empty());
    }

    #[test]
    fn test_soft_delete_restore_purge() {
        let (db, user) = setup();
        let repo = TaskRepository::new(&db);
        let task = Task::new(&user.id, "api", "temp");
        repo.create(&task).unwrap();

        repo.soft_delete(&user.id, &task.id).unwrap();
        assert!(repo.get(&user.id, &task.id, false).unwrap().is_none());
        assert!(repo.get(&user.id, &task.id, true).unwrap().is_some());

        repo.restore(&user.id, &task.id).unwrap();
        assert!(repo.get(&user.id, &task.id, false).unwrap().is_some());

        repo.purge(&user.id, &task.id).unwrap();
        assert!(repo.get(&user.id, &task.id, true).unwrap().is_none());
    }

    #[test]
    fn test_dedupe_key_rejects_duplicate() {
        let (db, user) = setup();
        let repo = TaskRepository::new(&db);
        let a = Task::new(&user.id, "import", "row 1").with_source_id("ext-1");
        repo.create(&a).unwrap();
        let b = Task::new(&user.id, "import", "row 1 again").with_source_id("ext-1");
        let err = repo.create(&b).unwrap_err();
        assert!(matches!(
            err,
            CoreError::ConstraintViolation(ConstraintViolation::Duplicate { .. })
        ));
    }

    #[test]
    fn test_api_tasks_without_source_never_dedupe() {
        let (db, user) = setup();
        let repo = TaskRepository::new(&db);
        repo.create(&Task::new(&user.id, "api", "same title")).unwrap();
        repo.create(&Task::new(&user.id, "api", "same title")).unwrap();
        assert_eq!(repo.list(&user.id, false).unwrap().len(), 2);
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let (db, user) = setup();
        let repo = TaskRepository::new(&db);
        let a = Task::new(&user.id, "api", "a");
        let b = Task::new(&user.id, "api", "b").with_dependencies(vec![a.id.clone()]);
        repo.create(&a).unwrap();
        repo.create(&b).unwrap();

        let mut a_cyclic = repo.get(&user.id, &a.id, false).unwrap().unwrap();
        a_cyclic.dependencies = vec![b.id.clone()];
        let err = repo.update(&a_cyclic).unwrap_err();
        assert!(matches!(
            err,
            CoreError::ConstraintViolation(ConstraintViolation::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let (db, user) = setup();
        let repo = TaskRepository::new(&db);
        let mut task = Task::new(&user.id, "api", "selfish");
        task.dependencies = vec![task.id.clone()];
        assert!(repo.create(&task).is_err());
    }

    #[test]
    fn test_update_emits_audit_only_for_relevant_changes() {
        let (db, user) = setup();
        let repo = TaskRepository::new(&db);
        let task = Task::new(&user.id, "api", "t");
        repo.create(&task).unwrap();

        // Notes are not schedule-relevant.
        let mut edited = task.clone();
        edited.notes = Some("context".into());
        repo.update(&edited).unwrap();
        let audit = crate::storage::AuditRepository::new(&db);
        assert!(audit
            .list_for_entity(&user.id, &task.id, Some(AuditEventType::TaskUpdated))
            .unwrap()
            .is_empty());

        let mut edited = edited.clone();
        edited.estimated_duration_min = 60;
        repo.update(&edited).unwrap();
        let events = audit
            .list_for_entity(&user.id, &task.id, Some(AuditEventType::TaskUpdated))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].details["changed"][0], "estimated_duration_min");
    }

    #[test]
    fn test_complete_sets_status_and_audits() {
        let (db, user) = setup();
        let repo = TaskRepository::new(&db);
        let task = Task::new(&user.id, "api", "done soon");
        repo.create(&task).unwrap();
        repo.complete(&user.id, &task.id).unwrap();

        let loaded = repo.get(&user.id, &task.id, false).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        let events = crate::storage::AuditRepository::new(&db)
            .list_for_entity(&user.id, &task.id, Some(AuditEventType::Completed))
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_find_duplicates() {
        let (db, user) = setup();
        let repo = TaskRepository::new(&db);
        repo.create(&Task::new(&user.id, "import", "pay bill").with_source_id("r1"))
            .unwrap();
        repo.create(&Task::new(&user.id, "api", "pay bill")).unwrap();

        let dupes = repo
            .find_duplicates(&user.id, "import", Some("r1"), "pay bill")
            .unwrap();
        assert_eq!(dupes.len(), 1);
        assert_eq!(
            repo.find_duplicates(&user.id, "api", None, "pay bill")
                .unwrap()
                .len(),
            1
        );
    }
}
