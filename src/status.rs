//! Per-check Status tracking and the Host Status Aggregator.
//!
//! A [`Status`] is mutated only by the worker thread that owns its
//! (host, check-type) pair and read concurrently by HTTP handlers via
//! deep-copy [`Snapshot`]s, so no reader ever observes a torn metric map.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::check::CheckResult;

/// How fresh a last storage update must be to count as "fresh", in seconds.
pub const FRESHNESS_WINDOW_SECS: i64 = 5 * 60;

/// A deep-copied, point-in-time read of a [`Status`].
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// The most recent [`Check::run`](crate::check::Check::run) result, if any has
    /// ever been recorded.
    pub last_result: Option<CheckResult>,
    /// UNIX seconds of the last *successful storage update*, or `0` if
    /// the check has never produced one.
    pub last_update: i64,
}

impl Snapshot {
    /// Whether this check has ever produced a result at all.
    pub fn never_run(&self) -> bool {
        self.last_update == 0
    }

    /// Whether the last result (if any) reported success.
    pub fn alive(&self) -> bool {
        self.last_result.as_ref().map(|r| r.success).unwrap_or(false)
    }

    /// Whether `last_update` falls strictly after `now - FRESHNESS_WINDOW_SECS`.
    pub fn fresh(&self, now: DateTime<Utc>) -> bool {
        self.last_update > now.timestamp() - FRESHNESS_WINDOW_SECS
    }
}

/// Thread-safe per (host, check-type) runtime record.
///
/// `set_result` and `set_last_update` are independent: the worker calls
/// `set_result` after every `Check::run`, but only advances `last_update`
/// once the RRD adapter confirms the update was actually persisted.
#[derive(Default)]
pub struct Status {
    inner: RwLock<Inner>,
}

#[derive(Default, Clone)]
struct Inner {
    last_result: Option<CheckResult>,
    last_update: i64,
}

impl Status {
    /// A fresh, never-updated status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of the latest probe.
    pub fn set_result(&self, result: CheckResult) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        inner.last_result = Some(result);
    }

    /// Record that a storage update for timestamp `ts` (UNIX seconds)
    /// succeeded.
    pub fn set_last_update(&self, ts: i64) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        inner.last_update = ts;
    }

    /// Take a deep-copy snapshot, safe to hand to a concurrent reader.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read().expect("status lock poisoned");
        Snapshot {
            last_result: inner.last_result.clone(),
            last_update: inner.last_update,
        }
    }
}

/// Host-level aggregate status, a pure reduction over a host's per-check
/// [`Snapshot`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    /// The host has no checks configured at all.
    Unconfigured,
    /// Checks are configured but none has ever produced a result.
    Pending,
    /// Every check is fresh and alive.
    Up,
    /// A mix of fresh-up with fresh-down, stale, or never-run checks.
    Degraded,
    /// Every check has a fresh result and every result is a failure.
    Down,
    /// No check is fresh (at least one has history, or some are stale and
    /// the rest down).
    Stale,
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HostStatus::Unconfigured => "unconfigured",
            HostStatus::Pending => "pending",
            HostStatus::Up => "up",
            HostStatus::Degraded => "degraded",
            HostStatus::Down => "down",
            HostStatus::Stale => "stale",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct Buckets {
    never_run: usize,
    fresh_up: usize,
    fresh_down: usize,
    stale: usize,
}

/// Classify and reduce a host's per-check-type snapshots into a single
/// [`HostStatus`].
pub fn aggregate_host_status<'a>(
    snapshots: impl IntoIterator<Item = &'a Snapshot>,
    now: DateTime<Utc>,
) -> HostStatus {
    let mut buckets = Buckets::default();
    let mut any = false;
    for snap in snapshots {
        any = true;
        if snap.never_run() {
            buckets.never_run += 1;
        } else if snap.fresh(now) {
            if snap.alive() {
                buckets.fresh_up += 1;
            } else {
                buckets.fresh_down += 1;
            }
        } else {
            buckets.stale += 1;
        }
    }

    if !any {
        return HostStatus::Unconfigured;
    }
    if buckets.fresh_up == 0 && buckets.fresh_down == 0 && buckets.stale == 0 {
        return HostStatus::Pending;
    }
    if buckets.fresh_up >= 1 && buckets.fresh_down == 0 && buckets.stale == 0 && buckets.never_run == 0 {
        return HostStatus::Up;
    }
    if buckets.fresh_up >= 1 {
        return HostStatus::Degraded;
    }
    if buckets.fresh_down >= 1 && buckets.stale == 0 && buckets.never_run == 0 {
        return HostStatus::Down;
    }
    HostStatus::Stale
}

/// Per-host map from check-type name to its [`Status`].
pub type HostStatusMap = HashMap<String, std::sync::Arc<Status>>;

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn snap(last_update: i64, alive: bool) -> Snapshot {
        let mut result = CheckResult::started(Utc::now());
        result.success = alive;
        Snapshot {
            last_result: if last_update == 0 { None } else { Some(result) },
            last_update,
        }
    }

    #[test]
    fn no_checks_is_unconfigured() {
        let snaps: Vec<Snapshot> = vec![];
        assert_eq!(aggregate_host_status(&snaps, Utc::now()), HostStatus::Unconfigured);
    }

    #[test]
    fn checks_never_run_is_pending() {
        let snaps = vec![snap(0, false), snap(0, false)];
        assert_eq!(aggregate_host_status(&snaps, Utc::now()), HostStatus::Pending);
    }

    #[test]
    fn all_fresh_up_is_up() {
        let now = Utc::now();
        let snaps = vec![snap(now.timestamp(), true), snap(now.timestamp(), true)];
        assert_eq!(aggregate_host_status(&snaps, now), HostStatus::Up);
    }

    #[test]
    fn fresh_up_mixed_with_stale_is_degraded() {
        let now = Utc::now();
        let stale_ts = (now - ChronoDuration::minutes(10)).timestamp();
        let snaps = vec![snap(now.timestamp(), true), snap(stale_ts, true)];
        assert_eq!(aggregate_host_status(&snaps, now), HostStatus::Degraded);
    }

    #[test]
    fn all_fresh_down_is_down() {
        let now = Utc::now();
        let snaps = vec![snap(now.timestamp(), false), snap(now.timestamp(), false)];
        assert_eq!(aggregate_host_status(&snaps, now), HostStatus::Down);
    }

    #[test]
    fn stale_down_mix_is_stale() {
        let now = Utc::now();
        let stale_ts = (now - ChronoDuration::minutes(10)).timestamp();
        let snaps = vec![snap(now.timestamp(), false), snap(stale_ts, true)];
        assert_eq!(aggregate_host_status(&snaps, now), HostStatus::Stale);
    }

    #[test]
    fn snapshot_is_independent_of_later_mutation() {
        let status = Status::new();
        let mut result = CheckResult::started(Utc::now());
        result.success = true;
        result.record("a", 1);
        status.set_result(result);
        status.set_last_update(42);

        let snap = status.snapshot();

        let mut later = CheckResult::started(Utc::now());
        later.success = false;
        status.set_result(later);
        status.set_last_update(100);

        assert_eq!(snap.last_update, 42);
        assert!(snap.last_result.unwrap().success);
    }
}
