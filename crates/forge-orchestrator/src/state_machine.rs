//! Pure state machine for execution lifecycle
//!
//! No I/O and no async: `transition(status, event)` either returns the next
//! status or an `InvalidTransition` error. Callers persist the result.
//!
//! ```text
//! pending --start--> running --complete--> completed
//!                    running --fail------> failed
//!                    running --pause-----> paused --resume--> running
//! {pending, running, paused} --cancel--> failed
//! ```

use forge_core::{ExecutionStatus, ForgeError, Result};

/// Events that drive an execution's status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionEvent {
    Start,
    Pause,
    Resume,
    Complete,
    Fail,
    Cancel,
    /// Admission was refused; the execution goes back to waiting
    Requeue,
}

/// Next status for `event`, or an error if the event is not valid from `status`
pub fn transition(status: ExecutionStatus, event: ExecutionEvent) -> Result<ExecutionStatus> {
    use ExecutionEvent as E;
    use ExecutionStatus as S;

    match (status, event) {
        (S::Pending, E::Start) => Ok(S::Running),
        (S::Running, E::Pause) => Ok(S::Paused),
        (S::Paused, E::Resume) => Ok(S::Running),
        (S::Running, E::Complete) => Ok(S::Completed),
        (S::Running, E::Fail) => Ok(S::Failed),
        (S::Running, E::Requeue) => Ok(S::Pending),
        (S::Pending | S::Running | S::Paused, E::Cancel) => Ok(S::Failed),
        (status, event) => Err(ForgeError::InvalidTransition(format!(
            "cannot {:?} an execution that is {}",
            event, status
        ))),
    }
}
