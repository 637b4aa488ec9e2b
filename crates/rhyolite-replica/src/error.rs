//! Replica error taxonomy.
//!
//! Errors are classified by the behavior the supervisor owes them, not by
//! where they came from: a connection reset and a "service unavailable"
//! rejection are different variants because they carry different retry
//! budgets, even though both are transport-level failures.

use std::time::Duration;

use thiserror::Error;

use rhyolite_locks::LockError;
use rhyolite_types::{NodeId, Vlsn};
use rhyolite_wire::{HandshakeRejection, WireError};

/// Result type for replica operations.
pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// Errors that can occur in the replica replay engine.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// Transport failed: peer unreachable, reset, or read timeout.
    /// Retried within the network budget.
    #[error("channel i/o: {0}")]
    Io(#[from] std::io::Error),

    /// The channel was closed by local shutdown; exits silently.
    #[error("channel closed")]
    ChannelClosed,

    /// A frame failed to encode or decode.
    #[error("wire: {0}")]
    Wire(#[from] WireError),

    /// The master refused the handshake.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(HandshakeRejection),

    /// The election layer no longer agrees this stream's master is
    /// current. The loop unwinds so the supervisor can reconnect.
    #[error("master obsolete: now {new_master:?}")]
    MasterObsolete { new_master: Option<NodeId> },

    /// Sync-up found that reaching the master's log would discard
    /// locally durable commits; an election must confirm the master
    /// before that is allowed.
    #[error("hard recovery to {matchpoint} requires election confirmation")]
    HardRecoveryRequired { matchpoint: Vlsn },

    /// Sync-up refused to roll back automatically; operator action is
    /// needed.
    #[error("insufficient log: {reason}")]
    InsufficientLog { reason: String },

    /// The storage engine hit its disk limit. The loop exits cleanly and
    /// the node waits for space; this never counts against retries.
    #[error("disk limit violated: {0}")]
    DiskLimit(String),

    /// Master-initiated group shutdown, surfaced after the shutdown
    /// protocol has run.
    #[error("group shutdown requested at {shutdown_time_ms}ms")]
    GroupShutdown { shutdown_time_ms: u64 },

    /// Protocol or invariant violation. Fatal: invalidates the node's
    /// environment.
    #[error("environment failure: {0}")]
    EnvironmentFailure(String),

    /// A consistency wait did not complete.
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    /// The transaction's locks were stolen by replay; it must abort.
    #[error("transaction preempted by replay")]
    Preempted,

    /// Write attempted on a replica (e.g. commit of a frozen master
    /// transaction after a role transition).
    #[error("node is a replica; writes are not accepted")]
    ReplicaWrite,

    /// The node has no known master.
    #[error("master unknown")]
    UnknownMaster,

    /// Storage engine failure below us.
    #[error("store: {0}")]
    Store(String),
}

impl ReplicaError {
    /// Maps lock table failures onto the replica taxonomy.
    pub fn from_lock(err: LockError) -> Self {
        match err {
            LockError::LogIntegrity(msg) => Self::EnvironmentFailure(msg),
            LockError::Preempted { .. } => Self::Preempted,
            LockError::ShuttingDown => Self::ChannelClosed,
            other => Self::Store(other.to_string()),
        }
    }

    /// True for failures the supervisor may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::HandshakeRejected(HandshakeRejection::ServiceUnavailable)
                | Self::HandshakeRejected(HandshakeRejection::DuplicateNode)
        )
    }
}

/// Why a consistency wait failed, and under which policy.
#[derive(Debug, Error)]
#[error("consistency not reached under {policy:?} (node inactive: {node_inactive}): {kind}")]
pub struct ConsistencyError {
    /// The policy the waiter used.
    pub policy: ConsistencyPolicy,
    /// True when the node was not serving the stream at failure time.
    pub node_inactive: bool,
    /// What went wrong.
    pub kind: ConsistencyFailure,
}

/// Declared read-consistency requirement for a waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyPolicy {
    /// Read whatever is local; never blocks.
    None,
    /// Block until the replica has replayed at least `target`.
    VlsnBound { target: Vlsn, timeout: Duration },
    /// Block until replica lag is at most `permissible_lag`.
    TimeLag {
        permissible_lag: Duration,
        timeout: Duration,
    },
}

/// Terminal state of a failed consistency wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyFailure {
    /// The policy's timeout elapsed first.
    Timeout,
    /// The node shut down while the waiter was blocked.
    Shutdown,
    /// The node changed role while the waiter was blocked.
    MasterState,
}

impl std::fmt::Display for ConsistencyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out"),
            Self::Shutdown => write!(f, "node shut down"),
            Self::MasterState => write!(f, "node changed role"),
        }
    }
}
