//! Background maintenance sweep: idle-process eviction (§4.3) and
//! out-of-band-work triggering (§1.2 supplement).
//!
//! Ported in shape from the teacher's `CleanupConfig`/periodic-sweep
//! pattern, but the "release the lock between phases" half of that pattern
//! has no counterpart here: the pool actor already owns every Group
//! exclusively between messages, so there is no lock to release. What
//! survives is the two-phase split itself -- compute a plan against a
//! read-only view, then let the caller execute it -- which keeps this
//! module pure and testable without a running actor.

use crate::pool::group::Group;
use crate::types::{GroupKey, ProcessId};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// A process a sweep decided to evict for being idle past `max_idle_time`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub group_key: GroupKey,
    pub process_id: ProcessId,
}

/// A process a sweep decided is eligible to receive `oob_work` -- subject
/// to the per-process cooldown enforced by `Process::trigger_oob_work`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OobCandidate {
    pub group_key: GroupKey,
    pub process_id: ProcessId,
}

#[derive(Debug, Default)]
pub struct GcPlan {
    pub evictions: Vec<EvictionCandidate>,
    pub oob_candidates: Vec<OobCandidate>,
}

/// Phase 1 + phase 2 of a sweep, computed against every Group in one pass.
/// `now` is threaded in rather than read internally so tests can pin it.
pub fn plan_sweep<'a>(
    groups: impl Iterator<Item = (&'a GroupKey, &'a Group)>,
    max_idle_time: Duration,
    now: DateTime<Utc>,
) -> GcPlan {
    let cutoff = now - chrono::Duration::from_std(max_idle_time).unwrap_or(chrono::Duration::zero());
    let mut plan = GcPlan::default();
    for (group_key, group) in groups {
        for process_id in group.idle_processes_beyond_min(cutoff) {
            plan.evictions.push(EvictionCandidate {
                group_key: group_key.clone(),
                process_id,
            });
        }
        for process_id in group.idle_process_ids() {
            plan.oob_candidates.push(OobCandidate {
                group_key: group_key.clone(),
                process_id,
            });
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::pool::process::Process;
    use crate::pool::socket::{Protocol, Socket};
    use crate::types::GupId;
    use crate::types::SocketName;
    use std::collections::HashMap;

    fn opts() -> Options {
        serde_json::from_value(serde_json::json!({"app_root": "/srv/app", "app_type": "rack"}))
            .unwrap()
    }

    fn idle_process(group_key: &GroupKey, last_used: DateTime<Utc>) -> Process {
        let socket = Socket::new(
            SocketName::from_string("main"),
            "unix:/tmp/x.sock".to_string(),
            Protocol::Http,
            1,
        );
        let mut p = Process::new(group_key.clone(), 1, GupId::new(), vec![socket], None, now(), 0);
        p.last_used = last_used;
        p
    }

    fn now() -> DateTime<Utc> {
        // Fixed reference instant; `Utc::now()` is avoided per this crate's
        // no-wall-clock-in-library-code convention for anything test-observed.
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn idle_process_past_cutoff_is_evicted_when_above_min() {
        let key = GroupKey::from_string("g1");
        let mut group = Group::new(key.clone(), opts(), 0, 3, 10, 3, Duration::from_millis(1));
        let old = idle_process(&key, now() - chrono::Duration::hours(1));
        group.get(None);
        group.begin_spawn();
        group.spawn_succeeded(old);

        let mut groups = HashMap::new();
        groups.insert(key.clone(), group);
        let plan = plan_sweep(groups.iter(), Duration::from_secs(60), now());
        assert_eq!(plan.evictions.len(), 1);
        assert_eq!(plan.evictions[0].group_key, key);
    }

    #[test]
    fn min_processes_floor_is_never_crossed() {
        let key = GroupKey::from_string("g1");
        let mut group = Group::new(key.clone(), opts(), 1, 3, 10, 3, Duration::from_millis(1));
        let old = idle_process(&key, now() - chrono::Duration::hours(1));
        group.get(None);
        group.begin_spawn();
        group.spawn_succeeded(old);

        let mut groups = HashMap::new();
        groups.insert(key.clone(), group);
        let plan = plan_sweep(groups.iter(), Duration::from_secs(60), now());
        assert!(plan.evictions.is_empty());
    }

    #[test]
    fn recently_used_process_is_not_evicted() {
        let key = GroupKey::from_string("g1");
        let mut group = Group::new(key.clone(), opts(), 0, 3, 10, 3, Duration::from_millis(1));
        let fresh = idle_process(&key, now());
        group.get(None);
        group.begin_spawn();
        group.spawn_succeeded(fresh);

        let mut groups = HashMap::new();
        groups.insert(key.clone(), group);
        let plan = plan_sweep(groups.iter(), Duration::from_secs(60), now());
        assert!(plan.evictions.is_empty());
        assert_eq!(plan.oob_candidates.len(), 1);
    }
}
