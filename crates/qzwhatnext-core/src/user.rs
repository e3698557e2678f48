//! User model.
//!
//! A user is the ownership boundary for every other entity; all repository
//! reads and writes are scoped by user id.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier.
    pub id: String,
    /// Display name or email.
    pub name: String,
    /// IANA timezone name (e.g. `America/New_York`). Local dates such as
    /// `start_after` and `due_by` are resolved to instants in this zone.
    pub timezone: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Create a new user in the given IANA timezone.
    pub fn new(name: impl Into<String>, timezone: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            timezone: timezone.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Parse the stored timezone, falling back to UTC if it is invalid.
    ///
    /// A bad zone name must not wedge the whole pipeline; scheduling in UTC
    /// is the recovery behavior.
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tz_parses_iana_name() {
        let user = User::new("u", "America/New_York");
        assert_eq!(user.tz(), chrono_tz::America::New_York);
    }

    #[test]
    fn test_tz_falls_back_to_utc() {
        let user = User::new("u", "Not/AZone");
        assert_eq!(user.tz(), chrono_tz::UTC);
    }
}
