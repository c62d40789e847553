use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    /// The lock could not be acquired within the allowed wait. The guarded
    /// operation was never started.
    #[error("timed out after {waited:?} waiting for lock {key}")]
    LockTimeout { key: String, waited: Duration },

    /// The caller executing shared work went away before producing a result.
    #[error("in-flight task {key} was abandoned before completing")]
    Abandoned { key: String },
}
