//! Fail-open utilities for graceful degradation
//!
//! Checkpoint writes, execution-log appends and decision lookups are
//! infrastructure: a failure there is logged and the session carries on.
//!
//! DO NOT use fail-open for:
//! - The tool-use loop itself
//! - Status transitions of an execution
//! - Rate-limiter admission

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open (infrastructure, not business logic)
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// ```no_run
/// use forge_core::fail_open::fail_open;
/// use forge_core::Result;
///
/// async fn write_checkpoint() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let written = fail_open("checkpoint", || write_checkpoint()).await;
///     assert!(written.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Like [`fail_open`] but substitutes a default value on failure
pub async fn fail_open_or<F, Fut, T>(operation_name: &str, default: T, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    fail_open(operation_name, f).await.unwrap_or(default)
}
