//! Task placement.
//!
//! Walks tasks in final rank order and turns each into scheduled blocks or a
//! structured overflow record. Nothing is dropped: every task ends in
//! exactly one `Placement`.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::schedule::{OverflowReason, Placement, ScheduledBlock, ScheduledBy};
use crate::task::Task;

use super::availability::{subtract_placed, Interval};
use super::ranking::RankedTask;

/// Context for one placement pass.
pub struct PlaceContext {
    pub now: DateTime<Utc>,
    pub horizon_end: DateTime<Utc>,
    pub tz: Tz,
    pub granularity_min: u32,
    /// Existing pinned intervals per task id (locked or user-scheduled
    /// blocks). Pinned tasks are not re-placed; their end times still anchor
    /// dependents.
    pub pinned: HashMap<String, Vec<Interval>>,
}

/// One task's placement outcome plus the reason tokens for its audit record.
#[derive(Debug, Clone)]
pub struct TaskPlacement {
    pub task_id: String,
    pub placement: Placement,
    pub reason_tokens: Vec<String>,
}

/// Place ranked tasks into the free intervals.
///
/// `free` is consumed: placed intervals are subtracted as the walk proceeds.
pub fn place_tasks(
    ranked: &[RankedTask],
    mut free: Vec<Interval>,
    ctx: &PlaceContext,
) -> Vec<TaskPlacement> {
    let ranked_ids: HashSet<&str> = ranked.iter().map(|r| r.task.id.as_str()).collect();
    // Task id -> instant its dependents may start at.
    let mut placed_ends: HashMap<String, DateTime<Utc>> = ctx
        .pinned
        .iter()
        .filter_map(|(id, ivs)| ivs.iter().map(|iv| iv.end).max().map(|end| (id.clone(), end)))
        .collect();
    let mut unplaced: HashSet<String> = HashSet::new();
    let mut results = Vec::with_capacity(ranked.len());

    for entry in ranked {
        let task = &entry.task;
        if task.manually_scheduled || ctx.pinned.contains_key(&task.id) {
            results.push(TaskPlacement {
                task_id: task.id.clone(),
                placement: Placement::Pinned,
                reason_tokens: vec!["pinned".to_string()],
            });
            continue;
        }

        // Dependencies on tasks in this rebuild must already be placed;
        // dependencies on completed or absent tasks are satisfied.
        let mut dep_bound: Option<DateTime<Utc>> = None;
        let mut dep_blocked = false;
        for dep in &task.dependencies {
            if let Some(end) = placed_ends.get(dep) {
                dep_bound = Some(dep_bound.map_or(*end, |b| b.max(*end)));
            } else if ranked_ids.contains(dep.as_str()) || unplaced.contains(dep) {
                dep_blocked = true;
                break;
            }
        }
        if dep_blocked {
            unplaced.insert(task.id.clone());
            results.push(overflow(task, entry, OverflowReason::DepUnplaced));
            continue;
        }

        let mut earliest = ctx.now;
        if let Some(sa) = task.start_after_instant(ctx.tz) {
            earliest = earliest.max(sa);
        }
        if let Some((flex_start, _)) = task.flexibility_window {
            earliest = earliest.max(flex_start);
        }
        if let Some(bound) = dep_bound {
            earliest = earliest.max(bound);
        }

        let flex_end = task.flexibility_window.map(|(_, end)| end);
        let latest_without_deadline = flex_end.map_or(ctx.horizon_end, |e| e.min(ctx.horizon_end));
        let latest = task
            .deadline
            .map_or(latest_without_deadline, |d| d.min(latest_without_deadline));

        let duration = Duration::minutes(task.estimated_duration_min as i64);
        let chunks = fit(&free, earliest, latest, duration, ctx.granularity_min);
        match chunks {
            Some(chunks) => {
                let split = chunks.len() > 1;
                // Dependents may not share the stretch their dependency
                // occupies: they start no earlier than the end of the free
                // interval the last chunk was carved from.
                let last_chunk = *chunks.last().expect("non-empty fit");
                let anchor = free
                    .iter()
                    .find(|iv| iv.contains(&last_chunk))
                    .map(|iv| iv.end)
                    .unwrap_or(last_chunk.end);
                let mut blocks = Vec::with_capacity(chunks.len());
                for chunk in &chunks {
                    subtract_placed(&mut free, *chunk);
                    blocks.push(ScheduledBlock::new(
                        &task.user_id,
                        &task.id,
                        chunk.start,
                        chunk.end,
                        ScheduledBy::System,
                    ));
                }
                placed_ends.insert(task.id.clone(), anchor);

                let mut tokens = vec![
                    entry.tier.reason_token().to_string(),
                    "earliest_fit".to_string(),
                ];
                if split {
                    tokens.push("split_across_intervals".to_string());
                }
                debug!(task_id = %task.id, blocks = blocks.len(), "task placed");
                results.push(TaskPlacement {
                    task_id: task.id.clone(),
                    placement: Placement::Scheduled { blocks },
                    reason_tokens: tokens,
                });
            }
            None => {
                // Reason precedence: a reachable-if-not-for-the-deadline task
                // reports the deadline; a task confined to an exhausted
                // flexibility window reports the window; otherwise capacity.
                let reason = if task.deadline.is_some()
                    && latest < latest_without_deadline
                    && fit(
                        &free,
                        earliest,
                        latest_without_deadline,
                        duration,
                        ctx.granularity_min,
                    )
                    .is_some()
                {
                    OverflowReason::DeadlineUnreachable
                } else if task.flexibility_window.is_some() {
                    OverflowReason::FlexWindowEmpty
                } else {
                    OverflowReason::NoCapacity
                };
                unplaced.insert(task.id.clone());
                results.push(overflow(task, entry, reason));
            }
        }
    }
    results
}

fn overflow(task: &Task, entry: &RankedTask, reason: OverflowReason) -> TaskPlacement {
    debug!(task_id = %task.id, reason = reason.as_str(), "task overflowed");
    TaskPlacement {
        task_id: task.id.clone(),
        placement: Placement::Overflow { reason },
        reason_tokens: vec![
            entry.tier.reason_token().to_string(),
            reason.as_str().to_string(),
        ],
    }
}

/// Find chunks covering `duration` inside `[earliest, latest]`.
///
/// Preference order: the earliest single contiguous interval that fits,
/// otherwise an earliest-first split where every chunk is at least one slot
/// long. A task shorter than one slot takes just its own duration; the rest
/// of the slot stays free.
fn fit(
    free: &[Interval],
    earliest: DateTime<Utc>,
    latest: DateTime<Utc>,
    duration: Duration,
    granularity_min: u32,
) -> Option<Vec<Interval>> {
    if latest <= earliest {
        return None;
    }
    let granularity = Duration::minutes(granularity_min as i64);
    let clipped: Vec<Interval> = free
        .iter()
        .filter_map(|iv| iv.clip(earliest, latest))
        .collect();

    if duration < granularity {
        let slot = clipped.iter().find(|iv| iv.end - iv.start >= duration)?;
        return Some(vec![Interval::new(slot.start, slot.start + duration)]);
    }

    if let Some(single) = clipped.iter().find(|iv| iv.end - iv.start >= duration) {
        return Some(vec![Interval::new(single.start, single.start + duration)]);
    }

    let mut chunks = Vec::new();
    let mut remaining = duration;
    for iv in &clipped {
        if remaining.is_zero() {
            break;
        }
        let cap = iv.end - iv.start;
        if cap < granularity {
            continue;
        }
        let Some(take) = chunk_len(cap, remaining, granularity) else {
            continue;
        };
        chunks.push(Interval::new(iv.start, iv.start + take));
        remaining = remaining - take;
    }
    remaining.is_zero().then_some(chunks)
}

/// Largest chunk usable from an interval of capacity `cap` such that both
/// this chunk and whatever remains afterwards stay at least one slot long.
fn chunk_len(cap: Duration, remaining: Duration, granularity: Duration) -> Option<Duration> {
    let mut take = cap.min(remaining);
    let tail = remaining - take;
    if tail > Duration::zero() && tail < granularity {
        take = remaining - granularity;
    }
    let tail = remaining - take;
    (take >= granularity && (tail.is_zero() || tail >= granularity)).then_some(take)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::ranking::stack_rank;
    use crate::engine::tiering::assign_tier;
    use crate::task::TaskCategory;

    fn t(min: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-10T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::minutes(min)
    }

    fn iv(start: i64, end: i64) -> Interval {
        Interval::new(t(start), t(end))
    }

    fn ctx() -> PlaceContext {
        PlaceContext {
            now: t(0),
            horizon_end: t(7 * 24 * 60),
            tz: chrono_tz::UTC,
            granularity_min: 30,
            pinned: HashMap::new(),
        }
    }

    fn rank(tasks: Vec<Task>, now: DateTime<Utc>) -> Vec<RankedTask> {
        let config = EngineConfig::default();
        let entries = tasks
            .into_iter()
            .map(|task| {
                let tier = assign_tier(&task, now, false, &config);
                RankedTask { task, tier }
            })
            .collect();
        stack_rank(entries, chrono_tz::UTC)
    }

    #[test]
    fn test_single_fit_places_earliest() {
        let task = Task::new("u1", "api", "a").with_duration(60);
        let results = place_tasks(&rank(vec![task], t(0)), vec![iv(30, 300)], &ctx());
        match &results[0].placement {
            Placement::Scheduled { blocks } => {
                assert_eq!(blocks.len(), 1);
                assert_eq!(blocks[0].start_time, t(30));
                assert_eq!(blocks[0].end_time, t(90));
            }
            other => panic!("expected scheduled, got {other:?}"),
        }
        assert!(results[0]
            .reason_tokens
            .contains(&"earliest_fit".to_string()));
    }

    #[test]
    fn test_sub_slot_task_consumes_only_its_duration() {
        let short = Task::new("u1", "api", "short").with_duration(10);
        let next = Task::new("u1", "api", "next").with_duration(30);
        let results = place_tasks(&rank(vec![short, next], t(0)), vec![iv(0, 60)], &ctx());
        let starts: Vec<DateTime<Utc>> = results
            .iter()
            .filter_map(|r| match &r.placement {
                Placement::Scheduled { blocks } => Some(blocks[0].start_time),
                _ => None,
            })
            .collect();
        // Second task begins right after the 10-minute block.
        assert_eq!(starts, vec![t(0), t(10)]);
    }

    #[test]
    fn test_split_across_intervals() {
        let task = Task::new("u1", "api", "long").with_duration(90);
        let results = place_tasks(
            &rank(vec![task], t(0)),
            vec![iv(0, 60), iv(120, 180)],
            &ctx(),
        );
        match &results[0].placement {
            Placement::Scheduled { blocks } => {
                assert_eq!(blocks.len(), 2);
                assert_eq!(blocks[0].duration_minutes() + blocks[1].duration_minutes(), 90);
                assert!(blocks.iter().all(|b| b.duration_minutes() >= 30));
            }
            other => panic!("expected scheduled, got {other:?}"),
        }
        assert!(results[0]
            .reason_tokens
            .contains(&"split_across_intervals".to_string()));
    }

    #[test]
    fn test_split_never_strands_a_short_tail() {
        // 40 minutes cannot split as 30 + 10; the 30-minute interval is
        // skipped and the task lands whole in the next interval.
        let task = Task::new("u1", "api", "awkward").with_duration(40);
        let results = place_tasks(
            &rank(vec![task], t(0)),
            vec![iv(0, 30), iv(60, 120)],
            &ctx(),
        );
        match &results[0].placement {
            Placement::Scheduled { blocks } => {
                assert_eq!(blocks.len(), 1);
                assert_eq!(blocks[0].start_time, t(60));
            }
            other => panic!("expected scheduled, got {other:?}"),
        }
    }

    #[test]
    fn test_overflow_no_capacity() {
        let tasks: Vec<Task> = (0..5)
            .map(|i| Task::new("u1", "api", format!("t{i}")).with_duration(180))
            .collect();
        let results = place_tasks(&rank(tasks, t(0)), vec![iv(0, 120)], &ctx());
        assert_eq!(results.len(), 5);
        for r in &results {
            assert!(matches!(
                r.placement,
                Placement::Overflow {
                    reason: OverflowReason::NoCapacity
                }
            ));
            assert!(r.reason_tokens.contains(&"no_capacity".to_string()));
        }
    }

    #[test]
    fn test_overflow_deadline_unreachable() {
        let task = Task::new("u1", "api", "late")
            .with_duration(60)
            .with_deadline(t(30));
        let results = place_tasks(&rank(vec![task], t(0)), vec![iv(0, 300)], &ctx());
        assert!(matches!(
            results[0].placement,
            Placement::Overflow {
                reason: OverflowReason::DeadlineUnreachable
            }
        ));
    }

    #[test]
    fn test_overflow_flex_window_empty() {
        let task = Task::new("u1", "api", "boxed")
            .with_duration(60)
            .with_flexibility_window(t(0), t(30));
        let results = place_tasks(&rank(vec![task], t(0)), vec![iv(0, 300)], &ctx());
        assert!(matches!(
            results[0].placement,
            Placement::Overflow {
                reason: OverflowReason::FlexWindowEmpty
            }
        ));
    }

    #[test]
    fn test_dependency_orders_placement() {
        let p = Task::new("u1", "api", "p").with_duration(30);
        let q = Task::new("u1", "api", "q")
            .with_duration(30)
            .with_dependencies(vec![p.id.clone()]);
        let results = place_tasks(
            &rank(vec![p.clone(), q.clone()], t(0)),
            vec![iv(60, 120), iv(180, 240)],
            &ctx(),
        );
        let by_id: HashMap<&str, &TaskPlacement> =
            results.iter().map(|r| (r.task_id.as_str(), r)).collect();
        let p_blocks = match &by_id[p.id.as_str()].placement {
            Placement::Scheduled { blocks } => blocks,
            other => panic!("p not scheduled: {other:?}"),
        };
        let q_blocks = match &by_id[q.id.as_str()].placement {
            Placement::Scheduled { blocks } => blocks,
            other => panic!("q not scheduled: {other:?}"),
        };
        assert!(q_blocks[0].start_time >= p_blocks[0].end_time);
        // The dependent moves to the interval after its dependency's.
        assert_eq!(q_blocks[0].start_time, t(180));
    }

    #[test]
    fn test_dependency_on_overflowed_task_propagates() {
        let p = Task::new("u1", "api", "p").with_duration(600);
        let q = Task::new("u1", "api", "q")
            .with_duration(30)
            .with_dependencies(vec![p.id.clone()]);
        let results = place_tasks(
            &rank(vec![p, q.clone()], t(0)),
            vec![iv(0, 60)],
            &ctx(),
        );
        let q_result = results.iter().find(|r| r.task_id == q.id).unwrap();
        assert!(matches!(
            q_result.placement,
            Placement::Overflow {
                reason: OverflowReason::DepUnplaced
            }
        ));
    }

    #[test]
    fn test_dependency_on_absent_task_is_satisfied() {
        let q = Task::new("u1", "api", "q")
            .with_duration(30)
            .with_dependencies(vec!["completed-elsewhere".to_string()]);
        let results = place_tasks(&rank(vec![q], t(0)), vec![iv(0, 60)], &ctx());
        assert!(matches!(results[0].placement, Placement::Scheduled { .. }));
    }

    #[test]
    fn test_manually_scheduled_is_pinned() {
        let mut task = Task::new("u1", "api", "manual").with_duration(30);
        task.manually_scheduled = true;
        let results = place_tasks(&rank(vec![task], t(0)), vec![iv(0, 60)], &ctx());
        assert!(matches!(results[0].placement, Placement::Pinned));
    }

    #[test]
    fn test_pinned_block_anchors_dependents() {
        let p = Task::new("u1", "api", "p");
        let q = Task::new("u1", "api", "q")
            .with_duration(30)
            .with_dependencies(vec![p.id.clone()]);
        let mut context = ctx();
        context.pinned.insert(p.id.clone(), vec![iv(240, 300)]);
        let results = place_tasks(
            &rank(vec![p.clone(), q.clone()], t(0)),
            vec![iv(0, 600)],
            &context,
        );
        let q_result = results.iter().find(|r| r.task_id == q.id).unwrap();
        match &q_result.placement {
            Placement::Scheduled { blocks } => assert!(blocks[0].start_time >= t(300)),
            other => panic!("q not scheduled: {other:?}"),
        }
    }

    #[test]
    fn test_start_after_bounds_earliest() {
        let task = Task::new("u1", "api", "later")
            .with_duration(30)
            .with_start_after(t(0).date_naive() + Duration::days(1));
        let results = place_tasks(
            &rank(vec![task], t(0)),
            vec![iv(0, 7 * 24 * 60)],
            &ctx(),
        );
        match &results[0].placement {
            Placement::Scheduled { blocks } => {
                assert!(blocks[0].start_time >= t(0) + Duration::days(1) - Duration::hours(8));
            }
            other => panic!("expected scheduled, got {other:?}"),
        }
    }
}
