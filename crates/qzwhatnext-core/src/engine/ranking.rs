//! Intra-tier stack ranking.
//!
//! Within a tier, tasks order ascending by: deadline, due-by (end of day in
//! the user's timezone), negated impact, negated risk, creation time, and
//! finally the task id as a stable tiebreak. The result is deterministic for
//! identical inputs.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::task::Task;

use super::tiering::Tier;

/// A task with its assigned tier, ready for ranking and placement.
#[derive(Debug, Clone)]
pub struct RankedTask {
    pub task: Task,
    pub tier: Tier,
}

/// Sort tier-assigned tasks into final placement order.
pub fn stack_rank(mut tasks: Vec<RankedTask>, tz: Tz) -> Vec<RankedTask> {
    tasks.sort_by(|a, b| {
        a.tier
            .number()
            .cmp(&b.tier.number())
            .then_with(|| cmp_rank(&rank_key(&a.task, tz), &rank_key(&b.task, tz)))
    });
    tasks
}

type RankKey = (
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    i64,
    i64,
    DateTime<Utc>,
    String,
);

fn rank_key(task: &Task, tz: Tz) -> RankKey {
    (
        // None sorts after Some through the wrapper below.
        task.deadline,
        task.due_by_instant(tz),
        // Higher impact/risk first; scores are in [0,1] so scaled integers
        // give a total order without float comparison.
        -(scaled(task.impact_score)),
        -(scaled(task.risk_score)),
        task.created_at,
        task.id.clone(),
    )
}

fn scaled(score: f64) -> i64 {
    (score * 1_000_000.0) as i64
}

/// Compare two optional instants with absent values last.
fn cmp_optional(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> std::cmp::Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

fn cmp_rank(a: &RankKey, b: &RankKey) -> std::cmp::Ordering {
    cmp_optional(a.0, b.0)
        .then(cmp_optional(a.1, b.1))
        .then(a.2.cmp(&b.2))
        .then(a.3.cmp(&b.3))
        .then(a.4.cmp(&b.4))
        .then(a.5.cmp(&b.5))
}
