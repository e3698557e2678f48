//! User storage.

use rusqlite::params;

use super::database::{fmt_dt, parse_dt, Database};
use crate::error::Result;
use crate::user::User;

/// Repository for user rows.
pub struct UserRepository<'a> {
    db: &'a Database,
}

impl<'a> UserRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn create(&self, user: &User) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO users (id, name, timezone, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id,
                user.name,
                user.timezone,
                fmt_dt(user.created_at),
                fmt_dt(user.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, user_id: &str) -> Result<Option<User>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT id, name, timezone, created_at, updated_at FROM users WHERE id = ?1",
        )?;
        let result = stmt.query_row(params![user_id], |row| {
            Ok(User {
                id: row.get(0)?,
                name: row.get(1)?,
                timezone: row.get(2)?,
                created_at: parse_dt(&row.get::<_, String>(3)?)?,
                updated_at: parse_dt(&row.get::<_, String>(4)?)?,
            })
        });
        match result {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_timezone(&self, user_id: &str, timezone: &str) -> Result<()> {
        self.db.conn().execute(
            "UPDATE users SET timezone = ?2, updated_at = ?3 WHERE id = ?1",
            params![user_id, timezone, fmt_dt(chrono::Utc::now())],
        )?;
        Ok(())
    }
}
