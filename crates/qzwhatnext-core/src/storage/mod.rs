//! SQLite-backed persistence.
//!
//! One [`Database`] per process owns the connection; repositories are thin
//! user-scoped views over it. Every repository read filters by owner; there
//! are no implicit cross-user reads.

pub mod audit_repo;
pub mod block_repo;
pub mod database;
pub mod series_repo;
pub mod task_repo;
pub mod token_repo;
pub mod user_repo;

pub use audit_repo::AuditRepository;
pub use block_repo::ScheduledBlockRepository;
pub use database::Database;
pub use series_repo::{RecurringTaskSeriesRepository, RecurringTimeBlockRepository};
pub use task_repo::TaskRepository;
pub use token_repo::{AutomationToken, AutomationTokenRepository};
pub use user_repo::UserRepository;

use std::path::PathBuf;

/// Returns `~/.qzwhatnext/`, creating it if it doesn't exist.
pub fn data_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".qzwhatnext");
    std::fs::create_dir_all(&dir).ok();
    dir
}
