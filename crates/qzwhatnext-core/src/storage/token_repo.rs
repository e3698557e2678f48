//! Automation token storage.
//!
//! Tokens authenticate shortcut/automation callers. Only a SHA-256 hash and
//! a non-sensitive prefix are stored; the plaintext exists once, in the
//! return value of [`AutomationTokenRepository::issue`].

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::database::{fmt_dt, parse_dt, Database};
use crate::error::Result;

/// Length of the stored display prefix.
const PREFIX_LEN: usize = 8;

/// A stored automation token (hash + prefix only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationToken {
    pub id: String,
    pub user_id: String,
    pub token_hash: String,
    /// First characters of the plaintext, safe to display.
    pub token_prefix: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl AutomationToken {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Hash a plaintext token.
pub fn hash_token(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Repository for automation tokens.
pub struct AutomationTokenRepository<'a> {
    db: &'a Database,
}

impl<'a> AutomationTokenRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Issue a new token for a user. Returns the stored record and the
    /// plaintext, which is not persisted anywhere.
    pub fn issue(&self, user_id: &str) -> Result<(AutomationToken, String)> {
        let plaintext = format!("qzw_{}", Uuid::new_v4().simple());
        let token = AutomationToken {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            token_hash: hash_token(&plaintext),
            token_prefix: plaintext[..PREFIX_LEN].to_string(),
            created_at: Utc::now(),
            revoked_at: None,
            last_used_at: None,
        };
        self.db.conn().execute(
            "INSERT INTO automation_tokens
                (id, user_id, token_hash, token_prefix, created_at, revoked_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL)",
            params![
                token.id,
                token.user_id,
                token.token_hash,
                token.token_prefix,
                fmt_dt(token.created_at),
            ],
        )?;
        Ok((token, plaintext))
    }

    /// Look up a non-revoked token by plaintext and stamp its last use.
    pub fn verify(&self, plaintext: &str) -> Result<Option<AutomationToken>> {
        let hash = hash_token(plaintext);
        let mut stmt = self.db.conn().prepare(
            "SELECT id, user_id, token_hash, token_prefix, created_at, revoked_at, last_used_at
             FROM automation_tokens WHERE token_hash = ?1 AND revoked_at IS NULL",
        )?;
        let result = stmt.query_row(params![hash], row_to_token);
        match result {
            Ok(token) => {
                self.db.conn().execute(
                    "UPDATE automation_tokens SET last_used_at = ?2 WHERE id = ?1",
                    params![token.id, fmt_dt(Utc::now())],
                )?;
                Ok(Some(token))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Revoke a token. Idempotent.
    pub fn revoke(&self, user_id: &str, token_id: &str) -> Result<()> {
        self.db.conn().execute(
            "UPDATE automation_tokens SET revoked_at = ?3
             WHERE user_id = ?1 AND id = ?2 AND revoked_at IS NULL",
            params![user_id, token_id, fmt_dt(Utc::now())],
        )?;
        Ok(())
    }

    /// All tokens for a user, prefix and metadata only.
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<AutomationToken>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT id, user_id, token_hash, token_prefix, created_at, revoked_at, last_used_at
             FROM automation_tokens WHERE user_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_token)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<AutomationToken> {
    Ok(AutomationToken {
        id: row.get(0)?,
        user_id: row.get(1)?,
        token_hash: row.get(2)?,
        token_prefix: row.get(3)?,
        created_at: parse_dt(&row.get::<_, String>(4)?)?,
        revoked_at: row
            .get::<_, Option<String>>(5)?
            .map(|s| parse_dt(&s))
            .transpose()?,
        last_used_at: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_dt(&s))
            .transpose()?,
    })
}
