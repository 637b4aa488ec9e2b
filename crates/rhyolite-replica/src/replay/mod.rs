//! The three-stage replay pipeline (C4).
//!
//! ```text
//!            ┌────────┐  replay_q   ┌──────────┐  output_q   ┌────────┐
//!  channel ─►│ reader │────────────►│ replayer │────────────►│ writer │─► channel
//!            └────────┘  (bounded)  └──────────┘  (bounded)  └────────┘
//! ```
//!
//! The reader runs on the replica loop's own thread; the replayer and the
//! ack writer are spawned per loop entry. All hand-offs go through
//! bounded queues, so a stalled storage engine back-pressures the reader
//! and, through the unread socket, the feeder itself.
//!
//! Shutdown is cooperative: a single exit cell escalates from `Soft`
//! (drain the queue, then stop) to `Immediate` (abandon it), and closing
//! the channel unblocks whichever thread is parked in I/O. The first
//! fatal error wins the failure slot and decides the loop outcome.

mod preprocess;
mod queue;
mod replayer;
mod writer;

pub use preprocess::{PreprocessPool, record_id_for};
pub use queue::{BoundedQueue, PushResult};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use rhyolite_config::RhyoliteConfig;
use rhyolite_types::{MasterTerm, NodeId, TxnId, Vlsn};
use rhyolite_wire::Message;

use crate::channel::NamedChannel;
use crate::error::{ReplicaError, ReplicaResult};
use crate::stats::ReplicaStats;
use crate::store::{ElectionView, ReplayStore};
use crate::tracker::ConsistencyTracker;
use crate::txn::TxnManager;

/// Longest the reader sleeps between offer retries on a full queue.
const OFFER_RETRY_SLEEP: Duration = Duration::from_millis(10);

/// Poll slice used by the replayer and writer on their queues.
const POP_SLICE: Duration = Duration::from_millis(20);

/// Pending acks are flushed at least this often.
pub const ACK_FLUSH_INTERVAL: Duration = Duration::from_millis(1_000);

/// The writer sends a spontaneous heartbeat response after this much
/// silence, so the feeder does not take an idle replica for a dead one.
pub const HEARTBEAT_RESPONSE_INTERVAL: Duration = Duration::from_millis(1_000);

/// The DB handle cache is cleared every this many replayed operations.
pub const DB_CACHE_CLEAR_OPS: u64 = 5_000;

/// How the pipeline is asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitRequest {
    /// Drain the replay queue, then stop.
    Soft,
    /// Abandon queued work and stop now.
    Immediate,
}

/// Single exit-request cell shared by the three stages. Requests only
/// ever escalate.
#[derive(Debug, Default)]
pub struct ExitCell(AtomicU8);

impl ExitCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn escalate(&self, request: ExitRequest) {
        let level = match request {
            ExitRequest::Soft => 1,
            ExitRequest::Immediate => 2,
        };
        self.0.fetch_max(level, Ordering::AcqRel);
    }

    pub fn get(&self) -> Option<ExitRequest> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            1 => Some(ExitRequest::Soft),
            _ => Some(ExitRequest::Immediate),
        }
    }
}

/// Items on the output queue, one per acknowledged message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckItem {
    Ack(TxnId),
    GroupAck(TxnId),
    HeartbeatResponse { txn_end_vlsn: Vlsn, heartbeat_id: u64 },
    ShutdownResponse,
}

impl AckItem {
    fn into_message(self) -> Message {
        match self {
            Self::Ack(txn_id) => Message::Ack { txn_id },
            Self::GroupAck(txn_id) => Message::GroupAck { txn_id },
            Self::HeartbeatResponse {
                txn_end_vlsn,
                heartbeat_id,
            } => Message::HeartbeatResponse {
                txn_end_vlsn,
                heartbeat_id,
            },
            Self::ShutdownResponse => Message::ShutdownResponse,
        }
    }
}

/// Everything the pipeline stages share.
pub struct ReplayContext {
    pub channel: Arc<NamedChannel>,
    pub store: Arc<dyn ReplayStore>,
    pub election: Arc<dyn ElectionView>,
    pub tracker: Arc<ConsistencyTracker>,
    pub txns: Arc<TxnManager>,
    pub stats: Arc<ReplicaStats>,
    pub config: RhyoliteConfig,
    /// The master this stream was negotiated with.
    pub master: (NodeId, MasterTerm),
    /// Partition simulation: the reader drains the socket but drops
    /// every message. Test builds only.
    #[cfg(feature = "sim")]
    pub dont_process_stream: Arc<AtomicBool>,
}

/// Shared pipeline control state.
struct PipelineShared {
    exit: ExitCell,
    failure: Mutex<Option<ReplicaError>>,
    replayer_done: AtomicBool,
    writer_done: AtomicBool,
}

impl PipelineShared {
    fn new() -> Self {
        Self {
            exit: ExitCell::new(),
            failure: Mutex::new(None),
            replayer_done: AtomicBool::new(false),
            writer_done: AtomicBool::new(false),
        }
    }

    /// Stores `error` if the slot is empty. The first failure decides the
    /// loop outcome.
    fn record_failure(&self, error: ReplicaError) {
        let mut slot = self.failure.lock().expect("failure slot poisoned");
        if slot.is_none() {
            warn!(%error, "pipeline failure recorded");
            *slot = Some(error);
        }
    }

    fn take_failure(&self) -> Option<ReplicaError> {
        self.failure.lock().expect("failure slot poisoned").take()
    }
}

/// Runs the pipeline to completion: spawns the replayer and writer, runs
/// the reader on the calling thread, and joins everything.
///
/// `start_vlsn` is the first VLSN the feeder will stream, from sync-up.
pub fn run_pipeline(ctx: &ReplayContext, start_vlsn: Vlsn) -> ReplicaResult<()> {
    let capacity = ctx.config.replica.message_queue_size;
    let replay_q: Arc<BoundedQueue<Message>> = Arc::new(BoundedQueue::new(capacity));
    let output_q: Arc<BoundedQueue<AckItem>> = Arc::new(BoundedQueue::new(capacity));
    let shared = Arc::new(PipelineShared::new());

    let pool = if ctx.config.replay.preprocessor {
        Some(Arc::new(PreprocessPool::new(
            ctx.config.replay.preprocessor_threads,
            capacity,
            Arc::clone(&ctx.stats),
        )))
    } else {
        None
    };

    info!(
        channel = %ctx.channel.name(),
        start = %start_vlsn,
        queue = capacity,
        preprocessor = pool.is_some(),
        "replay pipeline starting"
    );

    let replayer_handle = {
        let mut replayer = replayer::Replayer::new(ctx, &shared, &replay_q, &output_q, pool.clone(), start_vlsn);
        let shared = Arc::clone(&shared);
        let channel = Arc::clone(&ctx.channel);
        thread::Builder::new()
            .name("replica-replay".into())
            .spawn(move || {
                if let Err(error) = replayer.run() {
                    shared.record_failure(error);
                    // Closing the channel unblocks the reader and writer.
                    channel.close();
                }
                shared.replayer_done.store(true, Ordering::Release);
            })
            .expect("failed to spawn replayer thread")
    };

    let writer_handle = {
        let writer = writer::AckWriter {
            channel: Arc::clone(&ctx.channel),
            output_q: Arc::clone(&output_q),
            tracker: Arc::clone(&ctx.tracker),
            stats: Arc::clone(&ctx.stats),
            shared: Arc::clone(&shared),
        };
        thread::Builder::new()
            .name("replica-ack-writer".into())
            .spawn(move || writer.run())
            .expect("failed to spawn writer thread")
    };

    run_reader(ctx, &shared, &replay_q, pool.as_deref());

    // Reader is done; whatever is queued still drains under Soft.
    shared.exit.escalate(ExitRequest::Soft);
    let _ = replayer_handle.join();
    let _ = writer_handle.join();
    if let Some(pool) = &pool {
        pool.request_stop();
    }
    drop(pool);

    match shared.take_failure() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// The reader stage: reads framed messages and feeds the replay queue,
/// back-pressured by its bounded capacity.
fn run_reader(
    ctx: &ReplayContext,
    shared: &PipelineShared,
    replay_q: &BoundedQueue<Message>,
    pool: Option<&PreprocessPool>,
) {
    let mut heartbeat_seen = false;
    let _ = ctx.channel.set_read_timeout(Some(Duration::from_millis(
        ctx.config.replica.pre_heartbeat_timeout_ms,
    )));

    loop {
        if shared.exit.get().is_some() || shared.replayer_done.load(Ordering::Acquire) {
            break;
        }

        let message = match ctx.channel.read_message() {
            Ok(message) => message,
            Err(ReplicaError::ChannelClosed) => {
                debug!(channel = %ctx.channel.name(), "reader: channel closed locally");
                shared.exit.escalate(ExitRequest::Soft);
                break;
            }
            Err(error) => {
                shared.record_failure(error);
                shared.exit.escalate(ExitRequest::Soft);
                ctx.channel.close();
                break;
            }
        };

        if let Err(err) = ctx.store.disk_ok() {
            shared.record_failure(ReplicaError::DiskLimit(err.to_string()));
            shared.exit.escalate(ExitRequest::Soft);
            ctx.channel.close();
            break;
        }

        #[cfg(feature = "sim")]
        if ctx.dont_process_stream.load(Ordering::Acquire) {
            continue;
        }

        if let Message::Heartbeat(_) = &message {
            if !heartbeat_seen {
                heartbeat_seen = true;
                let _ = ctx.channel.set_read_timeout(Some(Duration::from_millis(
                    ctx.config.replica.feeder_channel_timeout_ms,
                )));
            }
        }

        if let (Some(pool), Message::Entry(entry)) = (pool, &message) {
            if entry.is_write() {
                pool.submit(entry);
            }
        }

        let stop_after = matches!(message, Message::ShutdownRequest { .. });
        if !offer(ctx, shared, replay_q, message) {
            break;
        }
        if stop_after {
            // The feeder sends nothing after a shutdown request.
            debug!(channel = %ctx.channel.name(), "reader: shutdown request queued");
            break;
        }
    }
}

/// Blocking offer with overflow accounting. Returns false when the
/// pipeline is going down and the message was dropped.
fn offer(
    ctx: &ReplayContext,
    shared: &PipelineShared,
    replay_q: &BoundedQueue<Message>,
    message: Message,
) -> bool {
    let mut message = message;
    loop {
        match replay_q.try_push(message) {
            PushResult::Ok => {
                ctx.stats.inc_messages_queued();
                return true;
            }
            PushResult::Backpressure(returned) => {
                ctx.stats.inc_queue_overflows();
                if shared.replayer_done.load(Ordering::Acquire)
                    || shared.exit.get() == Some(ExitRequest::Immediate)
                {
                    return false;
                }
                message = returned;
                thread::sleep(OFFER_RETRY_SLEEP);
            }
        }
    }
}
