//! The supervisor retry loop (C7).
//!
//! Wraps the replica loop body and decides, per failure class, whether to
//! re-enter, escalate, or exit. Control flow is data: the body returns a
//! [`ReplicaError`] and the supervisor pattern-matches on it, with no
//! unwinding involved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use rhyolite_wire::HandshakeRejection;

use crate::error::{ReplicaError, ReplicaResult};

/// Connection-level failures are retried this many times.
pub const NETWORK_RETRIES: u32 = 2;

/// "Service not yet ready" rejections are retried this many times.
pub const SERVICE_UNAVAILABLE_RETRIES: u32 = 10;

/// Duplicate-node rejections get exactly one retry: the usual cause is a
/// stale channel the master has not noticed dying yet.
pub const DUPLICATE_NODE_RETRIES: u32 = 1;

/// Sleep between connection retries.
pub const CONNECT_RETRY_SLEEP: Duration = Duration::from_millis(200);

/// What one pass of the supervised loop is entered with.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopEntry {
    /// Set after an election confirmed the current master, authorizing a
    /// hard rollback during sync-up.
    pub election_confirmed: bool,
}

/// How the supervised loop finally ended.
#[derive(Debug)]
pub enum SupervisorExit {
    /// Local shutdown, or the loop body finished cleanly.
    Shutdown,
    /// Storage ran out of disk budget. The node stays alive and waits
    /// for space; this never consumes retries.
    DiskLimit(String),
    /// Master-initiated group shutdown completed its protocol.
    GroupShutdown { shutdown_time_ms: u64 },
    /// Retries exhausted or a fatal failure surfaced.
    Failed(ReplicaError),
}

/// Runs `body` until it finishes cleanly, shutdown is requested, or a
/// failure class exhausts its budget.
///
/// `hold_election` is invoked when sync-up demands a hard rollback; a
/// successful election re-enters the loop with
/// [`LoopEntry::election_confirmed`] set.
pub fn run_supervised<B, E>(
    mut body: B,
    shutdown: &AtomicBool,
    mut hold_election: E,
) -> SupervisorExit
where
    B: FnMut(LoopEntry) -> ReplicaResult<()>,
    E: FnMut() -> ReplicaResult<()>,
{
    let mut network_retries = 0u32;
    let mut service_retries = 0u32;
    let mut duplicate_retries = 0u32;
    let mut entry = LoopEntry::default();

    loop {
        if shutdown.load(Ordering::Acquire) {
            return SupervisorExit::Shutdown;
        }

        let error = match body(entry) {
            Ok(()) => return SupervisorExit::Shutdown,
            Err(error) => error,
        };
        if shutdown.load(Ordering::Acquire) {
            return SupervisorExit::Shutdown;
        }

        match error {
            ReplicaError::Io(_) | ReplicaError::ChannelClosed => {
                network_retries += 1;
                if network_retries > NETWORK_RETRIES {
                    return SupervisorExit::Failed(error);
                }
                warn!(%error, attempt = network_retries, "transport failure; retrying");
                thread::sleep(CONNECT_RETRY_SLEEP);
            }
            ReplicaError::HandshakeRejected(HandshakeRejection::ServiceUnavailable) => {
                service_retries += 1;
                if service_retries > SERVICE_UNAVAILABLE_RETRIES {
                    return SupervisorExit::Failed(error);
                }
                info!(attempt = service_retries, "feeder not ready; retrying");
                thread::sleep(CONNECT_RETRY_SLEEP);
            }
            ReplicaError::HandshakeRejected(HandshakeRejection::DuplicateNode) => {
                duplicate_retries += 1;
                if duplicate_retries > DUPLICATE_NODE_RETRIES {
                    // A second rejection means it is not a stale channel:
                    // someone else really has our identity.
                    return SupervisorExit::Failed(ReplicaError::EnvironmentFailure(
                        "duplicate node rejection persisted across retry".into(),
                    ));
                }
                warn!("duplicate node rejection; retrying once");
                thread::sleep(CONNECT_RETRY_SLEEP);
            }
            ReplicaError::HandshakeRejected(_) => return SupervisorExit::Failed(error),
            ReplicaError::MasterObsolete { new_master } => {
                info!(?new_master, "master changed; reconnecting");
                // A live stream existed, so the transport classes get a
                // fresh budget against the new master.
                network_retries = 0;
                service_retries = 0;
                entry.election_confirmed = false;
            }
            ReplicaError::HardRecoveryRequired { matchpoint } => {
                info!(%matchpoint, "hard recovery needs an election");
                match hold_election() {
                    Ok(()) => entry.election_confirmed = true,
                    Err(err) => return SupervisorExit::Failed(err),
                }
            }
            ReplicaError::DiskLimit(reason) => return SupervisorExit::DiskLimit(reason),
            ReplicaError::GroupShutdown { shutdown_time_ms } => {
                return SupervisorExit::GroupShutdown { shutdown_time_ms };
            }
            fatal => return SupervisorExit::Failed(fatal),
        }
    }
}
