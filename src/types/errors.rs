//! Error types for the pool core.
//!
//! `PoolError` is what callers of [`crate::pool::PoolHandle::async_get`] see.
//! `SpawnError` is the richer, spawn-specific failure detail that gets
//! wrapped into `PoolError::Spawn` once a Group gives up retrying.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PoolError>;

/// HTTP status a controller should map an error onto. Kept separate from
/// the error type itself so the mapping lives in one place (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    ServiceUnavailable,
    GatewayTimeout,
    BadGateway,
    InternalServerError,
}

impl HttpStatus {
    pub fn code(self) -> u16 {
        match self {
            HttpStatus::ServiceUnavailable => 503,
            HttpStatus::GatewayTimeout => 504,
            HttpStatus::BadGateway => 502,
            HttpStatus::InternalServerError => 500,
        }
    }
}

/// Why a spawn attempt failed. Carries enough detail for the debug error
/// page the upstream controller is allowed to render (§1.2 supplement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnErrorCategory {
    Preparation,
    Fork,
    Exec,
    HandshakeTimeout,
    HandshakeParse,
    AppCrash,
}

impl std::fmt::Display for SpawnErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SpawnErrorCategory::Preparation => "preparation",
            SpawnErrorCategory::Fork => "fork",
            SpawnErrorCategory::Exec => "exec",
            SpawnErrorCategory::HandshakeTimeout => "handshake_timeout",
            SpawnErrorCategory::HandshakeParse => "handshake_parse",
            SpawnErrorCategory::AppCrash => "app_crash",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Error)]
#[error("spawn failed ({category}): {message}")]
pub struct SpawnError {
    pub category: SpawnErrorCategory,
    pub message: String,
    pub stderr: Option<String>,
    pub last_step: Option<String>,
}

impl SpawnError {
    pub fn new(category: SpawnErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            stderr: None,
            last_step: None,
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    pub fn with_last_step(mut self, step: impl Into<String>) -> Self {
        self.last_step = Some(step.into());
        self
    }
}

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("request queue full (group {group})")]
    RequestQueueFull { group: String },

    #[error("timed out waiting for a process (group {group}, waited {waited_ms}ms)")]
    GetTimeout { group: String, waited_ms: u64 },

    #[error("group {group} is shutting down")]
    GroupShuttingDown { group: String },

    #[error("pool is shutting down")]
    PoolShuttingDown,

    #[error("process died before the session could be initiated")]
    ProcessDied,

    #[error("caller disconnected before a process became available")]
    Disconnected,

    #[error("internal invariant violation: {0}")]
    Internal(String),

    #[error("invalid options: {0}")]
    Validation(String),

    #[error("group {0} not found")]
    NotFound(String),
}

impl PoolError {
    pub fn internal(msg: impl Into<String>) -> Self {
        PoolError::Internal(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        PoolError::Validation(msg.into())
    }

    pub fn not_found(group: impl Into<String>) -> Self {
        PoolError::NotFound(group.into())
    }

    /// The HTTP status a controller should surface for this error (§7).
    pub fn http_status(&self) -> HttpStatus {
        match self {
            PoolError::Spawn(_) => HttpStatus::InternalServerError,
            PoolError::RequestQueueFull { .. } => HttpStatus::ServiceUnavailable,
            PoolError::GetTimeout { .. } => HttpStatus::GatewayTimeout,
            PoolError::GroupShuttingDown { .. } => HttpStatus::ServiceUnavailable,
            PoolError::PoolShuttingDown => HttpStatus::ServiceUnavailable,
            PoolError::ProcessDied => HttpStatus::BadGateway,
            PoolError::Disconnected => HttpStatus::ServiceUnavailable,
            PoolError::Internal(_) => HttpStatus::InternalServerError,
            PoolError::Validation(_) => HttpStatus::InternalServerError,
            PoolError::NotFound(_) => HttpStatus::InternalServerError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_queue_full_maps_to_503() {
        let err = PoolError::RequestQueueFull {
            group: "g1".into(),
        };
        assert_eq!(err.http_status().code(), 503);
    }

    #[test]
    fn get_timeout_maps_to_504() {
        let err = PoolError::GetTimeout {
            group: "g1".into(),
            waited_ms: 5000,
        };
        assert_eq!(err.http_status().code(), 504);
    }

    #[test]
    fn process_died_maps_to_502() {
        assert_eq!(PoolError::ProcessDied.http_status().code(), 502);
    }

    #[test]
    fn spawn_error_wraps_into_pool_error() {
        let spawn_err = SpawnError::new(SpawnErrorCategory::HandshakeTimeout, "no response")
            .with_last_step("waiting for handshake");
        let pool_err: PoolError = spawn_err.into();
        assert!(matches!(pool_err, PoolError::Spawn(_)));
        assert_eq!(pool_err.http_status().code(), 500);
    }
}
