//! Free-time computation.
//!
//! The availability builder starts from the horizon, subtracts locked blocks
//! and external reservations, and hands the placer a normalized list of
//! half-open, ordered, non-overlapping free intervals.
//!
//! External events are read through [`AvailabilityProvider`], which exposes
//! `(start, end)` pairs and a managed-source marker only, never titles,
//! notes, or attendees.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// A half-open `[start, end)` interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn contains(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Intersection with `[lo, hi)`, if non-empty.
    pub fn clip(&self, lo: DateTime<Utc>, hi: DateTime<Utc>) -> Option<Interval> {
        let start = self.start.max(lo);
        let end = self.end.min(hi);
        (start < end).then_some(Interval::new(start, end))
    }
}

/// One busy interval reported by the availability provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusyInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// True when the interval originates from an engine-managed event.
    pub engine_managed: bool,
    /// External event id when the provider knows it; lets the engine
    /// cross-check against its own stored linkage.
    pub event_id: Option<String>,
}

/// Availability read errors.
#[derive(Debug, Error)]
pub enum AvailabilityError {
    #[error("calendar read timed out")]
    Timeout,
    #[error("access revoked")]
    Unauthorized,
    #[error("provider error: {0}")]
    Provider(String),
}

/// Boundary 1: read-only external calendar intervals.
pub trait AvailabilityProvider {
    /// Busy intervals for `user_id` inside `window`, ordered by start.
    fn busy_intervals(
        &self,
        user_id: &str,
        window: Interval,
    ) -> Result<Vec<BusyInterval>, AvailabilityError>;
}

/// The last successful availability read for a user, kept as a fallback
/// against transient provider outages.
#[derive(Debug, Clone)]
pub struct AvailabilitySnapshot {
    pub fetched_at: DateTime<Utc>,
    pub busy: Vec<BusyInterval>,
}

impl AvailabilitySnapshot {
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.fetched_at <= max_age
    }
}

/// Fetch busy intervals with a bounded retry budget.
///
/// Exponential backoff doubles the delay per attempt, capped at 5 seconds.
/// `Unauthorized` is not retried: the token will not get better.
pub fn fetch_with_retry(
    provider: &dyn AvailabilityProvider,
    user_id: &str,
    window: Interval,
    max_attempts: u32,
) -> Result<Vec<BusyInterval>, AvailabilityError> {
    let mut delay = std::time::Duration::from_millis(500);
    let cap = std::time::Duration::from_secs(5);
    let mut last_err = AvailabilityError::Provider("no attempts made".to_string());
    for attempt in 1..=max_attempts.max(1) {
        match provider.busy_intervals(user_id, window) {
            Ok(busy) => return Ok(busy),
            Err(AvailabilityError::Unauthorized) => return Err(AvailabilityError::Unauthorized),
            Err(e) => {
                warn!(user_id, attempt, error = %e, "availability read failed");
                last_err = e;
                if attempt < max_attempts {
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(cap);
                }
            }
        }
    }
    Err(last_err)
}

/// Normalize intervals: drop empties, sort, merge overlapping and adjacent.
pub fn normalize(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.retain(|iv| !iv.is_empty());
    intervals.sort_by_key(|iv| (iv.start, iv.end));
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for iv in intervals {
        match merged.last_mut() {
            Some(last) if iv.start <= last.end => {
                last.end = last.end.max(iv.end);
            }
            _ => merged.push(iv),
        }
    }
    merged
}

/// Subtract `reserved` from `horizon`, producing the free list.
pub fn build_free_intervals(horizon: Interval, reserved: &[Interval]) -> Vec<Interval> {
    let reserved = normalize(reserved.to_vec());
    let mut free = Vec::new();
    let mut cursor = horizon.start;
    for r in &reserved {
        let Some(clipped) = r.clip(horizon.start, horizon.end) else {
            continue;
        };
        if clipped.start > cursor {
            free.push(Interval::new(cursor, clipped.start));
        }
        cursor = cursor.max(clipped.end);
    }
    if cursor < horizon.end {
        free.push(Interval::new(cursor, horizon.end));
    }
    free
}

/// Subtract one placed interval from the free list, splitting as needed.
pub fn subtract_placed(free: &mut Vec<Interval>, placed: Interval) {
    let mut out = Vec::with_capacity(free.len() + 1);
    for iv in free.iter() {
        if !iv.overlaps(&placed) {
            out.push(*iv);
            continue;
        }
        if iv.start < placed.start {
            out.push(Interval::new(iv.start, placed.start));
        }
        if placed.end < iv.end {
            out.push(Interval::new(placed.end, iv.end));
        }
    }
    *free = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn t(min: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-10T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::minutes(min)
    }

    fn iv(start: i64, end: i64) -> Interval {
        Interval::new(t(start), t(end))
    }

    #[test]
    fn test_normalize_merges_overlaps_and_adjacency() {
        let merged = normalize(vec![iv(60, 90), iv(0, 30), iv(30, 45), iv(80, 100)]);
        assert_eq!(merged, vec![iv(0, 45), iv(60, 100)]);
    }

    #[test]
    fn test_build_free_intervals() {
        let free = build_free_intervals(iv(0, 480), &[iv(60, 120), iv(300, 360)]);
        assert_eq!(free, vec![iv(0, 60), iv(120, 300), iv(360, 480)]);
    }

    #[test]
    fn test_build_free_with_reservation_spanning_edge() {
        let free = build_free_intervals(iv(0, 120), &[iv(-30, 30), iv(100, 200)]);
        assert_eq!(free, vec![iv(30, 100)]);
    }

    #[test]
    fn test_fully_reserved_horizon_has_no_free_time() {
        let free = build_free_intervals(iv(0, 60), &[iv(0, 60)]);
        assert!(free.is_empty());
    }

    #[test]
    fn test_subtract_placed_splits() {
        let mut free = vec![iv(0, 120)];
        subtract_placed(&mut free, iv(30, 60));
        assert_eq!(free, vec![iv(0, 30), iv(60, 120)]);
    }

    #[test]
    fn test_snapshot_freshness() {
        let now = Utc::now();
        let snapshot = AvailabilitySnapshot {
            fetched_at: now - Duration::minutes(3),
            busy: Vec::new(),
        };
        assert!(snapshot.is_fresh(now, Duration::minutes(5)));
        assert!(!snapshot.is_fresh(now, Duration::minutes(2)));
    }

    struct FlakyProvider {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl AvailabilityProvider for FlakyProvider {
        fn busy_intervals(
            &self,
            _user_id: &str,
            _window: Interval,
        ) -> Result<Vec<BusyInterval>, AvailabilityError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(AvailabilityError::Timeout)
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[test]
    fn test_retry_recovers_from_transient_failures() {
        let provider = FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: 2,
        };
        let result = fetch_with_retry(&provider, "u1", iv(0, 60), 3);
        assert!(result.is_ok());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_gives_up_after_budget() {
        let provider = FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: 10,
        };
        let result = fetch_with_retry(&provider, "u1", iv(0, 60), 3);
        assert!(result.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unauthorized_not_retried() {
        struct Revoked;
        impl AvailabilityProvider for Revoked {
            fn busy_intervals(
                &self,
                _user_id: &str,
                _window: Interval,
            ) -> Result<Vec<BusyInterval>, AvailabilityError> {
                Err(AvailabilityError::Unauthorized)
            }
        }
        let result = fetch_with_retry(&Revoked, "u1", iv(0, 60), 3);
        assert!(matches!(result, Err(AvailabilityError::Unauthorized)));
    }
}
