//! Typed messages on the master→replica stream.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use rhyolite_types::{EntryKind, MasterTerm, NodeId, TxnId, Vlsn};

/// Periodic control frame from the master.
///
/// Carries the master's wall clock and its transaction-end high-water mark,
/// which together drive the replica's lag computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Master wall-clock time when the heartbeat was generated (ms epoch).
    pub master_now_ms: u64,
    /// Highest transaction-end VLSN the master has logged.
    pub master_txn_end_vlsn: Vlsn,
    /// Correlation id, echoed back in heartbeat responses.
    pub heartbeat_id: u64,
}

/// A replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Stream position of this entry.
    pub vlsn: Vlsn,
    /// Transaction the entry belongs to.
    pub txn_id: TxnId,
    /// Database (namespace) the record lives in. Zero for
    /// transaction-end entries.
    pub db_id: u64,
    /// What the entry does.
    pub kind: EntryKind,
    /// Highest VLSN known durable group-wide when the master sent this.
    pub dtvlsn: Vlsn,
    /// Term of the master that produced the entry.
    pub master_term: MasterTerm,
    /// Master wall-clock time when the operation was logged (ms epoch).
    /// For commit entries this is the master commit time.
    pub timestamp_ms: u64,
    /// Record key. Empty for transaction-end entries.
    pub key: Bytes,
    /// Record value. Empty for deletes and transaction-end entries.
    pub value: Bytes,
    /// True on commit entries whose durability policy requires a group
    /// acknowledgment before the master counts them durable.
    pub needs_group_ack: bool,
}

impl Entry {
    /// True for `Commit` and `Abort` entries.
    pub fn is_txn_end(&self) -> bool {
        self.kind.is_txn_end()
    }

    /// True for entries carrying a record write.
    pub fn is_write(&self) -> bool {
        self.kind.is_write()
    }
}

/// Why the master refused a replica handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeRejection {
    /// A node with the same name is already connected. Usually a stale
    /// channel the master has not noticed dying yet, so one retry is
    /// worthwhile.
    DuplicateNode,
    /// The feeder service exists but is not ready to serve yet.
    ServiceUnavailable,
    /// The replica is not a member of this replication group.
    UnknownNode,
    /// The group names do not match.
    WrongGroup { expected: String },
}

impl std::fmt::Display for HandshakeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateNode => write!(f, "duplicate node"),
            Self::ServiceUnavailable => write!(f, "service unavailable"),
            Self::UnknownNode => write!(f, "unknown node"),
            Self::WrongGroup { expected } => write!(f, "wrong group (expected {expected})"),
        }
    }
}

/// Master's verdict on a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeOutcome {
    /// Proceed to version negotiation.
    Accepted,
    /// Refused; the reason decides the supervisor's retry policy.
    Rejected(HandshakeRejection),
}

/// Master's verdict on a proposed match-point during sync-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncupVerdict {
    /// The master's log contains the proposed transaction end; replay can
    /// start at the entry after it.
    Match,
    /// The master's log diverges at or before the proposal; the replica
    /// must scan further back and propose again.
    Diverged {
        /// Highest txn-end VLSN the master still has, as a scan hint.
        master_txn_end_vlsn: Vlsn,
    },
}

/// A frame on the replica↔feeder channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // --- Handshake ---
    /// Replica introduces itself.
    Handshake {
        node_name: String,
        node_id: NodeId,
        group_name: String,
    },
    /// Master accepts or rejects the introduction.
    HandshakeResult(HandshakeOutcome),
    /// Protocol version range supported by the sender.
    Version { min: u16, max: u16 },
    /// Version both sides will speak.
    VersionAck { selected: u16 },

    // --- Sync-up ---
    /// Replica proposes a transaction-end VLSN as the match-point.
    SyncupProposal { txn_end_vlsn: Vlsn },
    /// Master's verdict on the proposal.
    SyncupResult(SyncupVerdict),
    /// Replica is done syncing and ready for the steady-state stream.
    SyncupDone,

    // --- Steady state ---
    /// Periodic control frame.
    Heartbeat(Heartbeat),
    /// Replica's answer to a heartbeat (or a spontaneous keep-alive).
    HeartbeatResponse {
        /// Highest txn-end VLSN the replica has replayed.
        txn_end_vlsn: Vlsn,
        /// Id of the most recent master heartbeat seen, for correlation.
        heartbeat_id: u64,
    },
    /// A replicated log entry.
    Entry(Entry),
    /// Replica acknowledges a committed transaction.
    Ack { txn_id: TxnId },
    /// Replica acknowledges a commit that required group durability.
    GroupAck { txn_id: TxnId },

    // --- Control ---
    /// Master tells the group to shut down.
    ShutdownRequest {
        /// Master wall-clock time of the shutdown decision (ms epoch).
        shutdown_time_ms: u64,
    },
    /// Replica confirms it is executing the shutdown protocol.
    ShutdownResponse,
    /// Either side reports an unrecoverable protocol violation.
    ProtocolError { text: String },
}

impl Message {
    /// Short tag for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::HandshakeResult(_) => "handshake_result",
            Self::Version { .. } => "version",
            Self::VersionAck { .. } => "version_ack",
            Self::SyncupProposal { .. } => "syncup_proposal",
            Self::SyncupResult(_) => "syncup_result",
            Self::SyncupDone => "syncup_done",
            Self::Heartbeat(_) => "heartbeat",
            Self::HeartbeatResponse { .. } => "heartbeat_response",
            Self::Entry(_) => "entry",
            Self::Ack { .. } => "ack",
            Self::GroupAck { .. } => "group_ack",
            Self::ShutdownRequest { .. } => "shutdown_request",
            Self::ShutdownResponse => "shutdown_response",
            Self::ProtocolError { .. } => "protocol_error",
        }
    }
}
