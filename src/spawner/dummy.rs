//! Dummy spawner: produces in-memory processes with no real OS child,
//! for tests and for exercising the Pool/Group state machine without a
//! real application root (§4.4, grounded on
//! `original_source/.../DummySpawner.h`, which exists in the original for
//! exactly this purpose).

use crate::options::Options;
use crate::pool::process::Process;
use crate::pool::socket::{Protocol, Socket};
use crate::types::{GroupKey, GupId, SocketName, SpawnError, SpawnErrorCategory};
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_PID: AtomicU32 = AtomicU32::new(10_000);

#[derive(Debug, Clone)]
pub struct DummyConfig {
    pub spawn_delay: Duration,
    pub should_fail: bool,
    pub concurrency: u32,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            spawn_delay: Duration::from_millis(0),
            should_fail: false,
            concurrency: 1,
        }
    }
}

/// Shared so tests can flip `should_fail` after the spawner has already
/// been handed to a Group (exercising S5's retry-then-fail-all path).
pub type SharedDummyConfig = Arc<std::sync::Mutex<DummyConfig>>;

pub async fn spawn(
    group_key: &GroupKey,
    _options: &Options,
    config: SharedDummyConfig,
) -> Result<Process, SpawnError> {
    let config = config.lock().expect("dummy spawner config lock poisoned").clone();
    if config.spawn_delay > Duration::ZERO {
        tokio::time::sleep(config.spawn_delay).await;
    }
    if config.should_fail {
        return Err(SpawnError::new(
            SpawnErrorCategory::AppCrash,
            "dummy spawner configured to fail",
        ));
    }

    let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
    let socket = Socket::new(
        SocketName::from_string("main"),
        format!("unix:/tmp/dummy-{pid}.sock"),
        Protocol::Http,
        config.concurrency,
    );
    Ok(Process::new(
        group_key.clone(),
        pid,
        GupId::new(),
        vec![socket],
        None,
        Utc::now(),
        0,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn opts() -> Options {
        serde_json::from_value(serde_json::json!({"app_root": "/tmp", "app_type": "rack"})).unwrap()
    }

    #[tokio::test]
    async fn spawns_a_process_with_one_socket() {
        let config = Arc::new(Mutex::new(DummyConfig::default()));
        let process = spawn(&GroupKey::from_string("g1"), &opts(), config).await.unwrap();
        assert_eq!(process.sockets.len(), 1);
    }

    #[tokio::test]
    async fn configured_failure_returns_spawn_error() {
        let config = Arc::new(Mutex::new(DummyConfig {
            should_fail: true,
            ..Default::default()
        }));
        let result = spawn(&GroupKey::from_string("g1"), &opts(), config).await;
        assert!(result.is_err());
    }
}
