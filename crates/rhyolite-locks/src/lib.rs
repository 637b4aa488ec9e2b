//! # rhyolite-locks: Record-granular lock table
//!
//! Arbitrates concurrent access to records between the replay stream and
//! local transactions. Each record has at most one [`Lock`] holding a set of
//! owners and an ordered list of waiters; the table stripes records across
//! independently synchronized buckets so unrelated records never contend.
//!
//! # Granting
//!
//! A request is granted immediately when it does not conflict with the
//! current owners and no earlier waiter would be bypassed. An owner asking
//! for a stronger mode is *promoted*; when the promotion conflicts with
//! another owner the requester waits at the **head** of the line, shrinking
//! the window in which a second promoter could deadlock against it.
//!
//! # Stealing
//!
//! Replay lockers are *importunate*: rather than wait behind a local
//! transaction, they preempt it. The victim keeps running until its next
//! commit or abort, where it observes the `preempted` flag and must abort.
//! Two importunate lockers conflicting on one record means the master
//! stream itself is inconsistent, which is unrecoverable.
//!
//! # Identity
//!
//! The table owns every lock record; callers hold only [`RecordId`] and
//! [`LockerId`] values. Converting a transaction from master to replay
//! identity is therefore a rewrite of owner ids inside the table, not a
//! traversal of object graphs.

mod accountant;
mod error;
mod lock;
mod locker;
mod table;

pub use accountant::{CountingAccountant, MemoryAccountant, NullAccountant};
pub use error::{LockError, LockResult};
pub use lock::{LockGrant, LockMode};
pub use locker::{LockerFlags, LockerId, RecordId};
pub use table::LockTable;
