//! Typed configuration, loaded from defaults and overridable by the caller.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub spawn: SpawnConfig,
    pub observability: ObservabilityConfig,
    pub control: ControlConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            spawn: SpawnConfig::default(),
            observability: ObservabilityConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

/// Pool-wide tunables (§3 Pool, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Global cap on processes across all groups.
    pub max: usize,
    /// How long an idle, over-minimum process may sit before GC detaches it.
    #[serde(with = "humantime_serde")]
    pub max_idle_time: Duration,
    /// GC sweep interval. The spec suggests `max_idle_time / 2`, minimum 1s;
    /// exposed here as an explicit knob rather than derived, so operators can
    /// tune sweep cost independently of idle timeout.
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,
    /// Cooldown between out-of-band-work triggers on the same process.
    #[serde(with = "humantime_serde")]
    pub oob_work_cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: 6,
            max_idle_time: Duration::from_secs(5 * 60),
            gc_interval: Duration::from_secs(60),
            oob_work_cooldown: Duration::from_secs(60),
        }
    }
}

/// Defaults applied to a Group's [`crate::options::Options`] when not
/// explicitly overridden per-request (§3 Options, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    pub min_processes: usize,
    pub max_processes: usize,
    pub max_request_queue_size: usize,
    #[serde(with = "humantime_serde")]
    pub start_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub max_preloader_idle_time: Duration,
    pub max_requests_per_process: u64,
    pub max_consecutive_spawn_failures: u32,
    #[serde(with = "humantime_serde")]
    pub spawn_retry_backoff_base: Duration,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            min_processes: 0,
            max_processes: 6,
            max_request_queue_size: 100,
            start_timeout: Duration::from_secs(5),
            max_preloader_idle_time: Duration::from_secs(5 * 60),
            max_requests_per_process: 0,
            max_consecutive_spawn_failures: 3,
            spawn_retry_backoff_base: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// The process-facing control surface (§6.1), not the excluded admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub listen_addr: String,
    pub max_connections: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8077".to_string(),
            max_connections: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pool.max, cfg.pool.max);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"pool": {"max": 20}}"#).unwrap();
        assert_eq!(cfg.pool.max, 20);
        assert_eq!(cfg.spawn.max_processes, SpawnConfig::default().max_processes);
    }
}
