//! Request fingerprint: identifies which Group a `get()` call belongs to
//! and how to spawn its processes if none exist yet (§3 Options).

use crate::types::GroupKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// How a new process for this group should be started (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMethod {
    Direct,
    Smart,
    Dummy,
}

impl Default for SpawnMethod {
    fn default() -> Self {
        SpawnMethod::Smart
    }
}

/// Concurrency model advertised by a process's sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyModel {
    Process,
    Thread,
}

impl Default for ConcurrencyModel {
    fn default() -> Self {
        ConcurrencyModel::Process
    }
}

/// The fields that determine which Group a request lands in, plus the
/// knobs used to start that Group's processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    pub app_root: String,
    pub app_type: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default)]
    pub spawn_method: SpawnMethod,
    #[serde(default)]
    pub min_processes: Option<usize>,
    #[serde(default)]
    pub max_processes: Option<usize>,
    #[serde(default)]
    pub max_requests: Option<u64>,
    #[serde(default)]
    pub start_timeout_msec: Option<u64>,
    #[serde(default)]
    pub max_idle_time_secs: Option<u64>,
    #[serde(default)]
    pub max_preloader_idle_time_secs: Option<u64>,
    #[serde(default)]
    pub concurrency_model: ConcurrencyModel,
    #[serde(default)]
    pub process_concurrency: Option<u32>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub sticky_session_cookie: Option<String>,
    #[serde(default)]
    pub environment_variables: HashMap<String, String>,
    #[serde(default)]
    pub group_name_override: Option<String>,

    // Per-request fields. Never persisted into a Group's stored options;
    // cleared by `into_group_options` (§3 "Options may carry per-request
    // fields ... that must be cleared before persisting into a Group").
    #[serde(default)]
    pub sticky_session_id: Option<u32>,
}

fn default_environment() -> String {
    "production".to_string()
}

impl Options {
    /// Deterministic group key built only from the fields that materially
    /// affect which processes may be shared (§6 "Process selection identity").
    pub fn group_key(&self) -> GroupKey {
        if let Some(name) = &self.group_name_override {
            return GroupKey::from_string(name.clone());
        }
        let key = format!(
            "{}:{}:{}:{}:{}:{}:{:?}",
            self.app_root,
            self.app_type,
            self.environment,
            self.interpreter.as_deref().unwrap_or(""),
            self.user.as_deref().unwrap_or(""),
            self.group.as_deref().unwrap_or(""),
            self.spawn_method,
        );
        GroupKey::from_string(key)
    }

    /// Strip per-request-only fields before this struct is stored as a
    /// Group's persisted options.
    pub fn into_group_options(mut self) -> Self {
        self.sticky_session_id = None;
        self
    }

    pub fn start_timeout(&self) -> Option<Duration> {
        self.start_timeout_msec.map(Duration::from_millis)
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        self.max_idle_time_secs.map(Duration::from_secs)
    }

    pub fn max_preloader_idle_time(&self) -> Option<Duration> {
        self.max_preloader_idle_time_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_options() -> Options {
        Options {
            app_root: "/srv/app".to_string(),
            app_type: "rack".to_string(),
            environment: "production".to_string(),
            interpreter: None,
            spawn_method: SpawnMethod::Smart,
            min_processes: None,
            max_processes: None,
            max_requests: None,
            start_timeout_msec: None,
            max_idle_time_secs: None,
            max_preloader_idle_time_secs: None,
            concurrency_model: ConcurrencyModel::Process,
            process_concurrency: None,
            user: None,
            group: None,
            sticky_session_cookie: None,
            environment_variables: HashMap::new(),
            group_name_override: None,
            sticky_session_id: None,
        }
    }

    #[test]
    fn identical_identity_fields_produce_identical_group_key() {
        let a = base_options();
        let b = base_options();
        assert_eq!(a.group_key(), b.group_key());
    }

    #[test]
    fn different_environment_produces_different_group_key() {
        let a = base_options();
        let mut b = base_options();
        b.environment = "staging".to_string();
        assert_ne!(a.group_key(), b.group_key());
    }

    #[test]
    fn group_name_override_wins_outright() {
        let mut a = base_options();
        a.group_name_override = Some("pinned".to_string());
        let mut b = base_options();
        b.app_root = "/srv/other".to_string();
        b.group_name_override = Some("pinned".to_string());
        assert_eq!(a.group_key(), b.group_key());
    }

    #[test]
    fn per_request_fields_are_cleared_before_persisting() {
        let mut opts = base_options();
        opts.sticky_session_id = Some(42);
        let persisted = opts.into_group_options();
        assert!(persisted.sticky_session_id.is_none());
    }
}
