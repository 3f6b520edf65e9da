//! Read-only state dump for the process-facing control surface (§4.3,
//! §6.1). Intentionally just JSON -- there is no admin API surface to keep
//! backward compatible, only an `inspect` command a human or a supervisor
//! script can run.

use crate::pool::group::Group;
use crate::pool::process::Process;
use crate::types::GroupKey;
use serde_json::{json, Value};

fn process_snapshot(process: &Process) -> Value {
    json!({
        "id": process.id.as_str(),
        "gupid": process.gupid.as_str(),
        "os_pid": process.os_pid,
        "enabled": format!("{:?}", process.enabled),
        "life_status": format!("{:?}", process.life_status),
        "busyness": process.busyness(),
        "sessions": process.sessions,
        "processed_requests": process.processed_requests,
        "sticky_session_id": process.sticky_session_id,
        "last_used": process.last_used.to_rfc3339(),
        "sockets": process.sockets.iter().map(|s| json!({
            "name": s.name.as_str(),
            "address": s.address,
            "protocol": format!("{:?}", s.protocol),
            "sessions": s.sessions,
            "concurrency": s.concurrency,
        })).collect::<Vec<_>>(),
    })
}

fn group_snapshot(group_key: &GroupKey, group: &Group) -> Value {
    json!({
        "key": group_key.as_str(),
        "life_status": format!("{:?}", group.life_status),
        "restarting": group.restarting,
        "min_processes": group.min_processes,
        "max_processes": group.max_processes,
        "enabled_count": group.enabled_count(),
        "disabling_count": group.disabling_count(),
        "disabled_count": group.disabled_count(),
        "detached_count": group.detached_count(),
        "get_waitlist_len": group.get_waitlist_len(),
        "spawning": group.is_spawning(),
        "processes": group.enabled_processes().iter().map(process_snapshot).collect::<Vec<_>>(),
    })
}

/// Dumps every Group's state. Pure and synchronous: the actor calls this
/// directly against its own owned state, no locking required.
pub fn snapshot<'a>(groups: impl Iterator<Item = (&'a GroupKey, &'a Group)>) -> Value {
    let groups: Vec<Value> = groups.map(|(k, g)| group_snapshot(k, g)).collect();
    json!({ "groups": groups })
}
