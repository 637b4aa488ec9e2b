//! In-memory doubles for the engine's collaborators.
//!
//! Used by this crate's tests and by embedders writing their own. None of
//! these touch the network or disk.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;

use rhyolite_types::{ChannelName, EntryKind, Lsn, MasterTerm, NodeId, TxnId, Vlsn};
use rhyolite_wire::Entry;

use crate::channel::{ByteSink, ByteSource, ChannelCtl, NamedChannel};
use crate::store::{
    DbHandle, ElectionView, LogScanner, ReplayStore, ScannedEntry, StoreError, StoreResult,
};

// ----------------------------------------------------------------------
// In-memory channel
// ----------------------------------------------------------------------

struct MemSource {
    rx: Receiver<Vec<u8>>,
    timeout: Option<Duration>,
}

impl ByteSource for MemSource {
    fn recv(&mut self) -> io::Result<Vec<u8>> {
        match self.timeout {
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(chunk) => Ok(chunk),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Ok(Vec::new()),
            },
            None => Ok(self.rx.recv().unwrap_or_default()),
        }
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }
}

struct MemSink {
    tx: Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl ByteSink for MemSink {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel closed"));
        }
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
    }
}

struct MemCtl {
    closed: Arc<AtomicBool>,
    /// Wakes our own blocked reader with an EOF chunk.
    self_wake: Sender<Vec<u8>>,
    /// Tells the peer's reader we are gone.
    peer_wake: Sender<Vec<u8>>,
}

impl ChannelCtl for MemCtl {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.self_wake.send(Vec::new());
            let _ = self.peer_wake.send(Vec::new());
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

/// Creates two connected in-memory channels: what one writes, the other
/// reads. Each side's name tag names its *peer*, matching how sockets are
/// labeled after the remote node.
pub fn memory_channel_pair(
    peer_of_a: impl Into<String>,
    peer_of_b: impl Into<String>,
) -> (NamedChannel, NamedChannel) {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

    let (tx_ab, rx_ab) = channel::<Vec<u8>>();
    let (tx_ba, rx_ba) = channel::<Vec<u8>>();

    let a_closed = Arc::new(AtomicBool::new(false));
    let b_closed = Arc::new(AtomicBool::new(false));

    let a = NamedChannel::new(
        ChannelName::new(peer_of_a, id),
        Box::new(MemSource { rx: rx_ba, timeout: None }),
        Box::new(MemSink {
            tx: tx_ab.clone(),
            closed: Arc::clone(&a_closed),
        }),
        Arc::new(MemCtl {
            closed: a_closed,
            self_wake: tx_ba.clone(),
            peer_wake: tx_ab.clone(),
        }),
    );
    let b = NamedChannel::new(
        ChannelName::new(peer_of_b, id),
        Box::new(MemSource { rx: rx_ab, timeout: None }),
        Box::new(MemSink {
            tx: tx_ba.clone(),
            closed: Arc::clone(&b_closed),
        }),
        Arc::new(MemCtl {
            closed: b_closed,
            self_wake: tx_ab,
            peer_wake: tx_ba,
        }),
    );
    (a, b)
}

// ----------------------------------------------------------------------
// In-memory storage engine
// ----------------------------------------------------------------------

#[derive(Default)]
struct MemStoreInner {
    /// Committed state, keyed by (db, key).
    data: HashMap<(u64, Bytes), Bytes>,
    /// Writes staged per open transaction.
    staged: HashMap<TxnId, Vec<(u64, Bytes, Option<Bytes>)>>,
    /// VLSNs in apply order, for ordering assertions.
    applied: Vec<Vlsn>,
    truncated_at: Option<Lsn>,
    checkpoints: u64,
    open_dbs: u64,
}

/// In-memory [`ReplayStore`] with switches for back-pressure and
/// disk-limit scenarios.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
    blocked: Mutex<bool>,
    unblock: Condvar,
    disk_full: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks or unblocks `apply`. While blocked, the replayer stalls and
    /// the pipeline's queues fill up.
    pub fn set_blocked(&self, blocked: bool) {
        *self.blocked.lock().expect("block flag poisoned") = blocked;
        self.unblock.notify_all();
    }

    /// Makes `disk_ok` fail until cleared.
    pub fn set_disk_full(&self, full: bool) {
        self.disk_full.store(full, Ordering::Release);
    }

    /// Committed value for `key` in `db_id`.
    pub fn get(&self, db_id: u64, key: &[u8]) -> Option<Bytes> {
        let inner = self.inner.lock().expect("store poisoned");
        inner.data.get(&(db_id, Bytes::copy_from_slice(key))).cloned()
    }

    /// VLSNs in the order `apply` saw them.
    pub fn applied_vlsns(&self) -> Vec<Vlsn> {
        self.inner.lock().expect("store poisoned").applied.clone()
    }

    pub fn checkpoint_count(&self) -> u64 {
        self.inner.lock().expect("store poisoned").checkpoints
    }

    pub fn truncated_at(&self) -> Option<Lsn> {
        self.inner.lock().expect("store poisoned").truncated_at
    }

    pub fn open_db_count(&self) -> u64 {
        self.inner.lock().expect("store poisoned").open_dbs
    }

    fn wait_unblocked(&self) {
        let mut blocked = self.blocked.lock().expect("block flag poisoned");
        while *blocked {
            blocked = self.unblock.wait(blocked).expect("block flag poisoned");
        }
    }
}

impl ReplayStore for MemStore {
    fn open_db(&self, db_id: u64) -> StoreResult<DbHandle> {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.open_dbs += 1;
        Ok(DbHandle { db_id })
    }

    fn apply(&self, db: &DbHandle, entry: &Entry) -> StoreResult<()> {
        self.wait_unblocked();
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.applied.push(entry.vlsn);
        match entry.kind {
            EntryKind::Put => {
                inner.staged.entry(entry.txn_id).or_default().push((
                    db.db_id,
                    entry.key.clone(),
                    Some(entry.value.clone()),
                ));
            }
            EntryKind::Delete => {
                inner
                    .staged
                    .entry(entry.txn_id)
                    .or_default()
                    .push((db.db_id, entry.key.clone(), None));
            }
            EntryKind::Commit => {
                let writes = inner.staged.remove(&entry.txn_id).unwrap_or_default();
                for (db_id, key, value) in writes {
                    match value {
                        Some(value) => {
                            inner.data.insert((db_id, key), value);
                        }
                        None => {
                            inner.data.remove(&(db_id, key));
                        }
                    }
                }
            }
            EntryKind::Abort => {
                inner.staged.remove(&entry.txn_id);
            }
        }
        Ok(())
    }

    fn checkpoint(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.checkpoints += 1;
        Ok(())
    }

    fn truncate(&self, lsn: Lsn) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.truncated_at = Some(lsn);
        Ok(())
    }

    fn disk_ok(&self) -> StoreResult<()> {
        if self.disk_full.load(Ordering::Acquire) {
            return Err(StoreError::DiskLimit("test disk budget exhausted".into()));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// In-memory local log (sync-up scans)
// ----------------------------------------------------------------------

/// In-memory [`LogScanner`] seeded with scan entries tail-first.
#[derive(Default)]
pub struct MemLog {
    entries: Mutex<Vec<ScannedEntry>>,
    markers: Mutex<Vec<(Lsn, Vec<u8>)>>,
    next_marker_offset: AtomicU64,
}

impl MemLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry in log order (oldest first).
    pub fn push(&self, entry: ScannedEntry) {
        self.entries.lock().expect("log poisoned").push(entry);
    }

    /// Convenience: a committed transaction end.
    pub fn push_commit(&self, lsn: Lsn, vlsn: Vlsn, txn_id: u64, durable: bool, dtvlsn: Vlsn) {
        self.push(ScannedEntry {
            lsn,
            vlsn,
            txn_id,
            is_txn_end: true,
            is_commit: true,
            durable,
            dtvlsn,
            is_checkpoint_end: false,
            is_skipped_gap: false,
            first_active_lsn: None,
        });
    }

    /// Convenience: a plain write entry.
    pub fn push_write(&self, lsn: Lsn, vlsn: Vlsn, txn_id: u64) {
        self.push(ScannedEntry {
            lsn,
            vlsn,
            txn_id,
            is_txn_end: false,
            is_commit: false,
            durable: false,
            dtvlsn: Vlsn::UNINITIALIZED,
            is_checkpoint_end: false,
            is_skipped_gap: false,
            first_active_lsn: None,
        });
    }

    /// Markers appended (and "fsynced") so far.
    pub fn markers(&self) -> Vec<(Lsn, Vec<u8>)> {
        self.markers.lock().expect("log poisoned").clone()
    }
}

impl LogScanner for MemLog {
    fn scan_backward(&self) -> Box<dyn Iterator<Item = ScannedEntry> + '_> {
        let mut entries = self.entries.lock().expect("log poisoned").clone();
        entries.reverse();
        Box::new(entries.into_iter())
    }

    fn append_marker(&self, marker: &[u8]) -> StoreResult<Lsn> {
        let offset = self.next_marker_offset.fetch_add(1, Ordering::Relaxed);
        let lsn = Lsn::new(u32::MAX, offset as u32);
        self.markers
            .lock()
            .expect("log poisoned")
            .push((lsn, marker.to_vec()));
        Ok(lsn)
    }
}

// ----------------------------------------------------------------------
// Election double
// ----------------------------------------------------------------------

/// Scriptable [`ElectionView`].
pub struct MemElection {
    master: Mutex<Option<(NodeId, MasterTerm)>>,
    obsolete_notices: AtomicU64,
}

impl MemElection {
    pub fn with_master(node: NodeId, term: MasterTerm) -> Self {
        Self {
            master: Mutex::new(Some((node, term))),
            obsolete_notices: AtomicU64::new(0),
        }
    }

    /// Installs a new master, invalidating streams from the old one.
    pub fn set_master(&self, node: NodeId, term: MasterTerm) {
        *self.master.lock().expect("election poisoned") = Some((node, term));
    }

    pub fn obsolete_notices(&self) -> u64 {
        self.obsolete_notices.load(Ordering::Relaxed)
    }
}

impl ElectionView for MemElection {
    fn current_master(&self) -> Option<(NodeId, MasterTerm)> {
        *self.master.lock().expect("election poisoned")
    }

    fn in_sync(&self, master: NodeId, term: MasterTerm) -> bool {
        self.current_master() == Some((master, term))
    }

    fn notify_master_obsolete(&self) {
        self.obsolete_notices.fetch_add(1, Ordering::Relaxed);
    }
}
