//! # rhyolite-replica: Replica replay engine for `Rhyolite`
//!
//! The replica-side subsystem of a replicated key-value storage node:
//! it connects to the group's master, syncs its local log up to an agreed
//! match-point, and then replays the master's ordered operation stream
//! through a three-stage pipeline.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────── supervisor (C7) ───────────────────────────┐
//! │  connect → handshake + sync-up (C5) → first heartbeat → pipeline (C4) │
//! │                                                                       │
//! │             ┌────────┐ replay_q ┌──────────┐ output_q ┌────────┐      │
//! │  channel ──►│ reader │─────────►│ replayer │─────────►│ writer │──►   │
//! │    (C1)     └────────┘          └──────────┘          └────────┘      │
//! │                                   │      │                            │
//! │                            lock table   consistency                   │
//! │                               (C2)      tracker (C3)                  │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Role transitions (C6) convert transactions across master↔replica
//! changes without a full recovery.
//!
//! The storage engine and the election layer are collaborators behind the
//! narrow traits in [`store`]; in-memory doubles live in [`testkit`].

pub mod channel;
pub mod error;
pub mod replay;
pub mod rollback;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod syncup;
pub mod testkit;
pub mod tracker;
pub mod transition;
pub mod txn;

mod replica;

pub use error::{
    ConsistencyError, ConsistencyFailure, ConsistencyPolicy, ReplicaError, ReplicaResult,
};
pub use replica::Replica;
pub use supervisor::SupervisorExit;
