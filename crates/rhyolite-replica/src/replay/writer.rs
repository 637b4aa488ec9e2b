//! The writer stage: drains acks and keeps the feeder convinced we are
//! alive.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::debug;

use rhyolite_wire::Message;

use crate::channel::NamedChannel;
use crate::error::ReplicaError;
use crate::stats::ReplicaStats;
use crate::tracker::ConsistencyTracker;

use super::{
    AckItem, BoundedQueue, ExitRequest, HEARTBEAT_RESPONSE_INTERVAL, POP_SLICE, PipelineShared,
};

pub(super) struct AckWriter {
    pub(super) channel: Arc<NamedChannel>,
    pub(super) output_q: Arc<BoundedQueue<AckItem>>,
    pub(super) tracker: Arc<ConsistencyTracker>,
    pub(super) stats: Arc<ReplicaStats>,
    pub(super) shared: Arc<PipelineShared>,
}

impl AckWriter {
    pub(super) fn run(self) {
        let mut last_traffic = Instant::now();
        loop {
            match self.shared.exit.get() {
                Some(ExitRequest::Immediate) => break,
                Some(ExitRequest::Soft)
                    if self.shared.replayer_done.load(Ordering::Acquire)
                        && self.output_q.is_empty() =>
                {
                    break;
                }
                _ => {}
            }

            match self.output_q.pop_wait(POP_SLICE) {
                Some(item) => {
                    match &item {
                        AckItem::Ack(_) => self.stats.inc_acks_sent(),
                        AckItem::GroupAck(_) => self.stats.inc_group_acks_sent(),
                        AckItem::HeartbeatResponse { .. } | AckItem::ShutdownResponse => {
                            self.stats.inc_acks_sent();
                        }
                    }
                    if !self.send(item.into_message()) {
                        break;
                    }
                    last_traffic = Instant::now();
                }
                None => {
                    // No traffic: volunteer a heartbeat response so the
                    // feeder's liveness timer does not fire.
                    if last_traffic.elapsed() >= HEARTBEAT_RESPONSE_INTERVAL {
                        let message = Message::HeartbeatResponse {
                            txn_end_vlsn: self.tracker.last_replayed_txn_end_vlsn(),
                            heartbeat_id: self.tracker.master_heartbeat_id(),
                        };
                        if !self.send(message) {
                            break;
                        }
                        last_traffic = Instant::now();
                    }
                }
            }
        }
        self.shared.writer_done.store(true, Ordering::Release);
        debug!(channel = %self.channel.name(), "ack writer stopped");
    }

    /// Sends one message. False means the writer must stop.
    fn send(&self, message: Message) -> bool {
        match self.channel.write_message(&message) {
            Ok(()) => true,
            Err(ReplicaError::ChannelClosed) => false,
            Err(error) => {
                self.shared.record_failure(error);
                self.channel.close();
                false
            }
        }
    }
}
