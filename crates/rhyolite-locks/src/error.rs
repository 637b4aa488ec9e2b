//! Lock table error types.

use thiserror::Error;

use crate::locker::{LockerId, RecordId};

/// Result type for lock table operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur while acquiring or manipulating locks.
#[derive(Debug, Error)]
pub enum LockError {
    /// Blocking acquisition gave up after the timeout.
    #[error("timed out waiting for lock on record {record} (locker {locker})")]
    Timeout { record: RecordId, locker: LockerId },

    /// The waiting locker was preempted by replay while it waited.
    #[error("locker {locker} was preempted while waiting")]
    Preempted { locker: LockerId },

    /// Two replay lockers conflicted on one record. The replicated stream
    /// is supposed to be serialized by the master, so this indicates a
    /// corrupted stream and invalidates the environment.
    #[error("log integrity violation: {0}")]
    LogIntegrity(String),

    /// The table is shutting down; all waits are tripped.
    #[error("lock table is shutting down")]
    ShuttingDown,

    /// The locker was never registered or has been removed.
    #[error("unknown locker {0}")]
    UnknownLocker(LockerId),
}
