use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the coordinator's public API.
///
/// Hook and run-routine failures never appear here; they are logged and the
/// transition pipeline keeps going.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// `start` was called while a lifecycle is already active.
    #[error("coordinator is already started")]
    AlreadyStarted,

    /// A wait deadline elapsed before the predicate was satisfied.
    #[error("wait timed out after {waited:?}")]
    WaitTimeout { waited: Duration },
}

impl CoordinatorError {
    /// Whether this is the distinct timeout failure from a wait helper.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::WaitTimeout { .. })
    }
}
