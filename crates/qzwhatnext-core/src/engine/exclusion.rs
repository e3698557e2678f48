//! AI exclusion enforcement.
//!
//! Trust-critical: this check runs BEFORE any inference call. Excluded tasks
//! are never sent to the adapter, never receive inferred attributes, and
//! never change tiers due to inference. They may still be scheduled.

use crate::task::{title_excludes_ai, Task};

/// Source type for tasks whose title was auto-generated from notes.
pub const SMART_ADD_SOURCE: &str = "add_smart";

/// Whether a task is excluded from AI processing.
///
/// A task is excluded when the explicit flag is set, when its stripped title
/// begins with `.`, or (for auto-titled smart-add tasks) when the notes
/// begin with `.` (the title was generated, so the user's prefix lives in
/// the notes).
pub fn is_ai_excluded(task: &Task) -> bool {
    if task.ai_excluded {
        return true;
    }
    if title_excludes_ai(&task.title) {
        return true;
    }
    if task.source_type == SMART_ADD_SOURCE {
        if let Some(notes) = &task.notes {
            if notes.trim_start().starts_with('.') {
                return true;
            }
        }
    }
    false
}

/// Partition tasks into (ai_allowed, ai_excluded).
pub fn partition_excluded(tasks: Vec<Task>) -> (Vec<Task>, Vec<Task>) {
    tasks.into_iter().partition(|t| !is_ai_excluded(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_excludes() {
        let task = Task::new("u1", "api", "normal").with_ai_excluded(true);
        assert!(is_ai_excluded(&task));
    }

    #[test]
    fn test_dot_title_excludes() {
        assert!(is_ai_excluded(&Task::new("u1", "api", ".meds")));
        assert!(is_ai_excluded(&Task::new("u1", "api", "  .private")));
        assert!(!is_ai_excluded(&Task::new("u1", "api", "pay. bills")));
    }

    #[test]
    fn test_smart_add_notes_prefix_excludes() {
        let task = Task::new("u1", SMART_ADD_SOURCE, "Generated title")
            .with_ai_excluded(false)
            .with_notes(".sensitive context");
        assert!(is_ai_excluded(&task));

        // Same notes on a normal task do not exclude.
        let task = Task::new("u1", "api", "Normal title").with_notes(".sensitive context");
        assert!(!is_ai_excluded(&task));
    }

    #[test]
    fn test_partition() {
        let tasks = vec![
            Task::new("u1", "api", ".a"),
            Task::new("u1", "api", "b"),
            Task::new("u1", "api", "c").with_ai_excluded(true),
        ];
        let (allowed, excluded) = partition_excluded(tasks);
        assert_eq!(allowed.len(), 1);
        assert_eq!(excluded.len(), 2);
        assert_eq!(allowed[0].title, "b");
    }
}
