//! Handshake and log sync-up (C5).
//!
//! Runs once per loop entry, before the steady-state stream starts:
//!
//! 1. Service handshake and protocol version negotiation.
//! 2. Backward scan of the local log, proposing transaction ends to the
//!    master until both sides agree on a **match-point**.
//! 3. Rollback decision: refuse automatic rollback when the scan crossed
//!    a checkpoint end, a cleaner-skipped gap, or the first-active LSN,
//!    or when a group-durable commit would be discarded.
//! 4. Bracket the truncation with `RollbackStart`/`RollbackEnd` markers.

use tracing::{debug, info, warn};

use rhyolite_types::{Lsn, NodeId, TxnId, Vlsn, realtime_millis};
use rhyolite_wire::{HandshakeOutcome, Message, SyncupVerdict, negotiate_version};

use crate::channel::NamedChannel;
use crate::error::{ReplicaError, ReplicaResult};
use crate::rollback::{RollbackEnd, RollbackStart};
use crate::store::{LogScanner, ReplayStore, ScannedEntry};

/// How many recently passed transactions the scan keeps for diagnostics.
pub const PASSED_TXN_LIMIT: usize = 10;

/// Most locally durable commits a hard (election-confirmed) rollback may
/// discard before the node refuses and asks for operator intervention.
pub const HARD_ROLLBACK_TXN_LIMIT: usize = 10;

/// One transaction the backward scan stepped over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassedTxn {
    pub txn_id: u64,
    pub vlsn: Vlsn,
    /// Locally synced to disk.
    pub durable: bool,
}

/// Everything the backward scan learned, driving the rollback decision.
#[derive(Debug, Clone)]
pub struct MatchpointSearchResults {
    /// Stream position both sides agree on.
    pub matchpoint_vlsn: Vlsn,
    /// Local log position of that entry.
    pub matchpoint_lsn: Lsn,
    /// Local log position of the entry immediately after the match-point;
    /// everything from here on is rolled back. Null when the match-point
    /// is the log tail and nothing needs truncating.
    pub truncate_lsn: Lsn,
    /// Highest first-active LSN any checkpoint in the scan referenced.
    pub first_active_lsn: Lsn,
    /// The scan stepped over a checkpoint end.
    pub passed_checkpoint_end: bool,
    /// The scan stepped over a cleaner-skipped gap.
    pub passed_skipped_gap: bool,
    /// Group-durable high-water mark at the log tail.
    pub dtvlsn: Vlsn,
    /// Commits the rollback would discard.
    pub passed_commits: usize,
    /// How many of those were locally durable.
    pub passed_durable: usize,
    /// Lowest VLSN among the passed commits.
    pub min_passed_commit_vlsn: Vlsn,
    /// The most recent passed transactions, newest first, durable and
    /// non-durable alike.
    pub passed_txns: Vec<PassedTxn>,
    /// Transactions with writes after the match-point and no
    /// transaction end: active at the match-point.
    pub active_txn_ids: Vec<TxnId>,
}

impl Default for MatchpointSearchResults {
    fn default() -> Self {
        Self {
            matchpoint_vlsn: Vlsn::NULL,
            matchpoint_lsn: Lsn::NULL,
            truncate_lsn: Lsn::NULL,
            first_active_lsn: Lsn::NULL,
            passed_checkpoint_end: false,
            passed_skipped_gap: false,
            dtvlsn: Vlsn::UNINITIALIZED,
            passed_commits: 0,
            passed_durable: 0,
            min_passed_commit_vlsn: Vlsn::UNINITIALIZED,
            passed_txns: Vec::new(),
            active_txn_ids: Vec::new(),
        }
    }
}

/// What a completed sync-up hands to the steady-state loop.
#[derive(Debug)]
pub struct SyncupOutcome {
    pub results: MatchpointSearchResults,
    /// First VLSN the feeder will stream.
    pub start_vlsn: Vlsn,
    pub protocol_version: u16,
}

/// Identity presented during the handshake.
#[derive(Debug, Clone)]
pub struct HandshakeIdentity {
    pub node_name: String,
    pub node_id: NodeId,
    pub group_name: String,
}

/// Performs the service handshake and version negotiation. Returns the
/// protocol version both sides will speak.
pub fn handshake(channel: &NamedChannel, identity: &HandshakeIdentity) -> ReplicaResult<u16> {
    channel.write_message(&Message::Handshake {
        node_name: identity.node_name.clone(),
        node_id: identity.node_id,
        group_name: identity.group_name.clone(),
    })?;
    match channel.read_message()? {
        Message::HandshakeResult(HandshakeOutcome::Accepted) => {}
        Message::HandshakeResult(HandshakeOutcome::Rejected(rejection)) => {
            warn!(channel = %channel.name(), %rejection, "handshake rejected");
            return Err(ReplicaError::HandshakeRejected(rejection));
        }
        other => return Err(unexpected("handshake result", &other)),
    }

    // The master advertises the versions it speaks; we pick the highest
    // mutually supported one.
    match channel.read_message()? {
        Message::Version { min, max } => {
            let selected = negotiate_version(min, max)?;
            channel.write_message(&Message::VersionAck { selected })?;
            debug!(channel = %channel.name(), version = selected, "protocol negotiated");
            Ok(selected)
        }
        other => Err(unexpected("version range", &other)),
    }
}

/// Scans the local log backward, proposing transaction ends until the
/// master confirms one.
pub fn search_matchpoint(
    channel: &NamedChannel,
    scanner: &dyn LogScanner,
) -> ReplicaResult<MatchpointSearchResults> {
    let mut results = MatchpointSearchResults::default();
    // Txns whose end the scan has seen; writers without one are active at
    // the match-point.
    let mut ended: std::collections::HashSet<u64> = std::collections::HashSet::new();
    let mut writers: Vec<u64> = Vec::new();
    // Entry scanned just before the current one: in log order, the entry
    // immediately *after* it.
    let mut prev: Option<ScannedEntry> = None;
    // Scan hint from the master: no point proposing above it.
    let mut proposal_ceiling = Vlsn::UNINITIALIZED;
    let mut dtvlsn_floor = Vlsn::UNINITIALIZED;

    for entry in scanner.scan_backward() {
        results.passed_checkpoint_end |= entry.is_checkpoint_end;
        results.passed_skipped_gap |= entry.is_skipped_gap;
        if let Some(first_active) = entry.first_active_lsn {
            results.first_active_lsn = results.first_active_lsn.max(first_active);
        }
        if entry.dtvlsn.is_real() {
            // DTVLSN is non-decreasing in log order, so it must never
            // grow as the scan walks backward. Transitions out of
            // uninitialized are the upgrade path and are allowed.
            if dtvlsn_floor.is_real() && entry.dtvlsn > dtvlsn_floor {
                return Err(ReplicaError::EnvironmentFailure(format!(
                    "dtvlsn regressed in log: {} after {}",
                    entry.dtvlsn, dtvlsn_floor
                )));
            }
            dtvlsn_floor = entry.dtvlsn;
            if !results.dtvlsn.is_real() {
                results.dtvlsn = entry.dtvlsn;
            }
        }

        if entry.is_txn_end {
            let can_propose =
                !proposal_ceiling.is_real() || entry.vlsn <= proposal_ceiling;
            if can_propose {
                channel.write_message(&Message::SyncupProposal {
                    txn_end_vlsn: entry.vlsn,
                })?;
                match channel.read_message()? {
                    Message::SyncupResult(SyncupVerdict::Match) => {
                        results.matchpoint_vlsn = entry.vlsn;
                        results.matchpoint_lsn = entry.lsn;
                        results.truncate_lsn = truncate_point(&entry, prev.as_ref())?;
                        results.active_txn_ids = writers
                            .iter()
                            .filter(|id| !ended.contains(id))
                            .map(|id| TxnId::new(*id))
                            .collect();
                        info!(
                            matchpoint = %entry.vlsn,
                            lsn = %entry.lsn,
                            passed = results.passed_commits,
                            "match-point found"
                        );
                        return Ok(results);
                    }
                    Message::SyncupResult(SyncupVerdict::Diverged { master_txn_end_vlsn }) => {
                        proposal_ceiling = master_txn_end_vlsn;
                    }
                    other => return Err(unexpected("syncup result", &other)),
                }
            }
            ended.insert(entry.txn_id);
            if entry.is_commit {
                results.passed_commits += 1;
                if entry.durable {
                    results.passed_durable += 1;
                }
                results.min_passed_commit_vlsn = if results.min_passed_commit_vlsn.is_real() {
                    results.min_passed_commit_vlsn.min(entry.vlsn)
                } else {
                    entry.vlsn
                };
                if results.passed_txns.len() < PASSED_TXN_LIMIT {
                    results.passed_txns.push(PassedTxn {
                        txn_id: entry.txn_id,
                        vlsn: entry.vlsn,
                        durable: entry.durable,
                    });
                }
            }
        } else {
            writers.push(entry.txn_id);
        }
        prev = Some(entry);
    }

    // Log exhausted: propose the null VLSN, asking to stream from the
    // beginning. A fresh replica lands here.
    channel.write_message(&Message::SyncupProposal {
        txn_end_vlsn: Vlsn::NULL,
    })?;
    match channel.read_message()? {
        Message::SyncupResult(SyncupVerdict::Match) => {
            results.matchpoint_vlsn = Vlsn::NULL;
            results.matchpoint_lsn = Lsn::NULL;
            results.truncate_lsn = prev.map_or(Lsn::NULL, |entry| entry.lsn);
            results.active_txn_ids = writers
                .iter()
                .filter(|id| !ended.contains(id))
                .map(|id| TxnId::new(*id))
                .collect();
            Ok(results)
        }
        Message::SyncupResult(SyncupVerdict::Diverged { .. }) => {
            Err(ReplicaError::InsufficientLog {
                reason: "no common transaction end with the master".into(),
            })
        }
        other => Err(unexpected("syncup result", &other)),
    }
}

/// The entry immediately after the match-point, where truncation starts.
fn truncate_point(
    matchpoint: &ScannedEntry,
    after: Option<&ScannedEntry>,
) -> ReplicaResult<Lsn> {
    let Some(after) = after else {
        // Match-point is the log tail; nothing to truncate.
        return Ok(Lsn::NULL);
    };
    if after.lsn <= matchpoint.lsn {
        return Err(ReplicaError::EnvironmentFailure(format!(
            "log order violation: entry after match-point at {} not past {}",
            after.lsn, matchpoint.lsn
        )));
    }
    Ok(after.lsn)
}

/// Decides whether the computed rollback may proceed.
///
/// `election_confirmed` is set when the supervisor re-enters after an
/// election confirmed the same master, which authorizes discarding
/// locally durable commits (up to [`HARD_ROLLBACK_TXN_LIMIT`]).
pub fn decide_rollback(
    results: &MatchpointSearchResults,
    election_confirmed: bool,
) -> ReplicaResult<()> {
    if results.passed_checkpoint_end {
        return Err(ReplicaError::InsufficientLog {
            reason: "rollback would cross a checkpoint end".into(),
        });
    }
    if results.passed_skipped_gap {
        return Err(ReplicaError::InsufficientLog {
            reason: "rollback would cross a cleaner-skipped gap".into(),
        });
    }
    if !results.first_active_lsn.is_null() && results.matchpoint_lsn < results.first_active_lsn {
        return Err(ReplicaError::InsufficientLog {
            reason: format!(
                "match-point {} is before the first active LSN {}",
                results.matchpoint_lsn, results.first_active_lsn
            ),
        });
    }
    if results.dtvlsn.is_real()
        && results.min_passed_commit_vlsn.is_real()
        && results.min_passed_commit_vlsn <= results.dtvlsn
    {
        // The group promised durability for these commits; a master that
        // lacks them cannot be followed automatically.
        return Err(ReplicaError::InsufficientLog {
            reason: format!(
                "rollback would discard group-durable commits at or below dtvlsn {}",
                results.dtvlsn
            ),
        });
    }
    if results.passed_durable > 0 {
        if results.passed_durable > HARD_ROLLBACK_TXN_LIMIT {
            return Err(ReplicaError::InsufficientLog {
                reason: format!(
                    "rollback would discard {} locally durable commits (limit {})",
                    results.passed_durable, HARD_ROLLBACK_TXN_LIMIT
                ),
            });
        }
        if !election_confirmed {
            return Err(ReplicaError::HardRecoveryRequired {
                matchpoint: results.matchpoint_vlsn,
            });
        }
    }
    Ok(())
}

/// Brackets the truncation with rollback markers. Returns the marker pair
/// written, or `None` when nothing needed truncating.
pub fn perform_rollback(
    scanner: &dyn LogScanner,
    store: &dyn ReplayStore,
    results: &MatchpointSearchResults,
) -> ReplicaResult<Option<(RollbackStart, RollbackEnd)>> {
    if results.truncate_lsn.is_null() {
        return Ok(None);
    }

    let start = RollbackStart {
        matchpoint_vlsn: results.matchpoint_vlsn,
        matchpoint_lsn: results.matchpoint_lsn,
        timestamp_ms: realtime_millis(),
        active_txn_ids: results.active_txn_ids.clone(),
    };
    let start_lsn = scanner
        .append_marker(&start.encode())
        .map_err(|e| ReplicaError::Store(e.to_string()))?;

    store
        .truncate(results.truncate_lsn)
        .map_err(|e| ReplicaError::Store(e.to_string()))?;

    let end = RollbackEnd {
        matchpoint_lsn: results.matchpoint_lsn,
        rollback_start_lsn: start_lsn,
        timestamp_ms: realtime_millis(),
    };
    scanner
        .append_marker(&end.encode())
        .map_err(|e| ReplicaError::Store(e.to_string()))?;

    info!(
        matchpoint = %results.matchpoint_vlsn,
        truncate = %results.truncate_lsn,
        "rollback complete"
    );
    Ok(Some((start, end)))
}

/// Runs the whole sync-up sequence on a fresh channel.
pub fn run_syncup(
    channel: &NamedChannel,
    scanner: &dyn LogScanner,
    store: &dyn ReplayStore,
    identity: &HandshakeIdentity,
    election_confirmed: bool,
) -> ReplicaResult<SyncupOutcome> {
    let protocol_version = handshake(channel, identity)?;
    let results = search_matchpoint(channel, scanner)?;
    decide_rollback(&results, election_confirmed)?;
    perform_rollback(scanner, store, &results)?;
    channel.write_message(&Message::SyncupDone)?;

    let start_vlsn = if results.matchpoint_vlsn.is_real() {
        results.matchpoint_vlsn.next()
    } else {
        Vlsn::FIRST
    };
    Ok(SyncupOutcome {
        results,
        start_vlsn,
        protocol_version,
    })
}

fn unexpected(expected: &str, got: &Message) -> ReplicaError {
    ReplicaError::EnvironmentFailure(format!(
        "expected {expected}, got {} frame",
        got.kind_name()
    ))
}
