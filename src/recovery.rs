//! Panic recovery for pool-actor operations.
//!
//! A bookkeeping bug in one Group must never take the whole actor loop down
//! with it. These wrap a single command's handling in `catch_unwind` and
//! convert a panic into an `Internal` error instead of letting it unwind
//! past the actor.

use crate::types::{PoolError, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};

pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(&panic_payload);
            tracing::error!(
                operation = operation_name,
                panic = %panic_msg,
                "panic recovered"
            );
            Err(PoolError::internal(format!(
                "panic in {operation_name}: {panic_msg}"
            )))
        }
    }
}

pub async fn with_recovery_async<F, Fut, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let future = operation();
    match catch_unwind(AssertUnwindSafe(|| future)) {
        Ok(fut) => fut.await,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(&panic_payload);
            tracing::error!(
                operation = operation_name,
                panic = %panic_msg,
                "async panic recovered"
            );
            Err(PoolError::internal(format!(
                "async panic in {operation_name}: {panic_msg}"
            )))
        }
    }
}

fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic (no message)".to_string()
    }
}
