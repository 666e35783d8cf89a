use crate::store::config::CQ_UNIT_SIZE;
use crate::store::record::CommitLogRecord;
use crate::store::runtime::consume_queue::ConsumeQueue;
use crate::store::runtime::engine::StoreEngine;
use crate::store::runtime::transaction::REDO_LOG_TOPIC;
use crate::store::hooks::PreparedTransaction;
use crate::store::record::TransactionState;
use crate::store::segment::SelectedRegion;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMessageStatus {
    Found,
    NoMessageInQueue,
    OffsetTooSmall,
    OffsetOverflowOne,
    OffsetOverflowBadly,
    OffsetFoundNull,
    MessageWasRemoving,
    NoMatchedLogicQueue,
}

/// A batch of records pulled from one queue. Each region pins its segment
/// until dropped.
#[derive(Debug)]
pub struct GetMessageResult {
    pub status: GetMessageStatus,
    pub next_begin_offset: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub messages: Vec<SelectedRegion>,
    pub buffer_total_size: usize,
    /// The consumer lags so far behind that its data is likely off-memory.
    pub suggest_pull_from_slave: bool,
}

impl GetMessageResult {
    fn empty(status: GetMessageStatus, next_begin_offset: u64) -> Self {
        Self {
            status,
            next_begin_offset,
            min_offset: 0,
            max_offset: 0,
            messages: Vec::new(),
            buffer_total_size: 0,
            suggest_pull_from_slave: false,
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

impl StoreEngine {
    fn memory_budget(&self) -> u64 {
        self.total_physical_memory / 100 * u64::from(self.config.access_message_in_memory_max_ratio)
    }

    fn is_in_disk(&self, offset: u64, max_offset: u64) -> bool {
        max_offset.saturating_sub(offset) > self.memory_budget()
    }

    fn is_batch_full(&self, size: usize, max_count: usize, total_bytes: usize, count: usize, in_disk: bool) -> bool {
        if total_bytes == 0 || count == 0 {
            return false;
        }
        if count >= max_count {
            return true;
        }
        let cfg = &self.config;
        let (max_bytes, max_msgs) = if in_disk {
            (cfg.max_transfer_bytes_on_message_in_disk, cfg.max_transfer_count_on_message_in_disk)
        } else {
            (cfg.max_transfer_bytes_on_message_in_memory, cfg.max_transfer_count_on_message_in_memory)
        };
        total_bytes + size > max_bytes || count + 1 > max_msgs
    }

    /// A slave keeps the consumer where it is instead of correcting it.
    fn next_offset_correction(&self, old: u64, new: u64) -> u64 {
        if self.config.is_slave() {
            old
        } else {
            new
        }
    }

    fn accepts_reads(&self) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            warn!("read rejected: store is shut down");
            return false;
        }
        if !self.flags.is_readable() {
            warn!(flags = self.flags.bits(), "read rejected: store is not readable");
            return false;
        }
        true
    }

    /// Raw commit log bytes at `offset`.
    pub fn read(&self, offset: u64, size: usize) -> Option<SelectedRegion> {
        if !self.accepts_reads() {
            return None;
        }
        self.commit_log.read(offset, size)
    }

    /// Pull up to `max_count` records from `topic`/`queue_id` starting at
    /// logical `offset`. `None` when the store refuses reads.
    pub fn get_message(&self, topic: &str, queue_id: i32, offset: u64, max_count: usize) -> Option<GetMessageResult> {
        if !self.accepts_reads() {
            return None;
        }
        let max_physic = self.commit_log.max_offset();
        let Some(queue) = self.queues.get(topic, queue_id) else {
            return Some(GetMessageResult::empty(
                GetMessageStatus::NoMatchedLogicQueue,
                self.next_offset_correction(offset, 0),
            ));
        };

        let min = queue.min_offset();
        let max = queue.max_offset();
        let mut result = if max == 0 {
            GetMessageResult::empty(GetMessageStatus::NoMessageInQueue, self.next_offset_correction(offset, 0))
        } else if offset < min {
            GetMessageResult::empty(GetMessageStatus::OffsetTooSmall, self.next_offset_correction(offset, min))
        } else if offset == max {
            GetMessageResult::empty(GetMessageStatus::OffsetOverflowOne, offset)
        } else if offset > max {
            let next = if min == 0 { min } else { max };
            GetMessageResult::empty(GetMessageStatus::OffsetOverflowBadly, self.next_offset_correction(offset, next))
        } else {
            self.collect(&queue, offset, max_count, max_physic)
        };
        result.min_offset = min;
        result.max_offset = max;
        debug!(
            topic,
            queue_id,
            offset,
            status = ?result.status,
            count = result.messages.len(),
            next = result.next_begin_offset,
            "get message"
        );
        Some(result)
    }

    fn collect(&self, queue: &ConsumeQueue, offset: u64, max_count: usize, max_physic: u64) -> GetMessageResult {
        let Some(batch) = queue.read_index(offset) else {
            let units_per_segment = (queue.chain().segment_size() / CQ_UNIT_SIZE) as u64;
            let next_segment = (offset / units_per_segment + 1) * units_per_segment;
            return GetMessageResult::empty(
                GetMessageStatus::OffsetFoundNull,
                self.next_offset_correction(offset, next_segment),
            );
        };

        let mut result = GetMessageResult::empty(GetMessageStatus::OffsetFoundNull, offset);
        let mut consumed = 0u64;
        let mut max_pulled = 0u64;
        let mut skip_below: Option<u64> = None;
        for (_, unit) in batch.iter() {
            if unit.is_blank() {
                consumed += 1;
                continue;
            }
            let size = unit.size.max(0) as usize;
            max_pulled = unit.commit_log_offset;
            if skip_below.is_some_and(|next| unit.commit_log_offset < next) {
                consumed += 1;
                continue;
            }
            let in_disk = self.is_in_disk(unit.commit_log_offset, max_physic);
            if self.is_batch_full(size, max_count, result.buffer_total_size, result.messages.len(), in_disk) {
                break;
            }
            match self.commit_log.read(unit.commit_log_offset, size) {
                Some(region) => {
                    result.buffer_total_size += region.len();
                    result.messages.push(region);
                    result.status = GetMessageStatus::Found;
                    skip_below = None;
                }
                None => {
                    if result.buffer_total_size == 0 {
                        result.status = GetMessageStatus::MessageWasRemoving;
                    }
                    skip_below = Some(self.commit_log.roll_next_file(unit.commit_log_offset));
                }
            }
            consumed += 1;
        }
        result.next_begin_offset = offset + consumed;
        result.suggest_pull_from_slave = max_physic.saturating_sub(max_pulled) > self.memory_budget();
        result
    }

    pub fn look_message_by_offset(&self, commit_log_offset: u64) -> Option<CommitLogRecord> {
        self.commit_log.look_message(commit_log_offset)
    }

    pub fn get_min_offset_in_queue(&self, topic: &str, queue_id: i32) -> u64 {
        self.queues.get(topic, queue_id).map_or(0, |q| q.min_offset())
    }

    pub fn get_max_offset_in_queue(&self, topic: &str, queue_id: i32) -> u64 {
        self.queues.get(topic, queue_id).map_or(0, |q| q.max_offset())
    }

    /// Commit log offset of the record at logical `offset`, 0 when unknown.
    pub fn get_commit_log_offset_in_queue(&self, topic: &str, queue_id: i32, offset: u64) -> u64 {
        self.queues
            .get(topic, queue_id)
            .and_then(|q| q.get_unit(offset))
            .map_or(0, |u| u.commit_log_offset)
    }

    pub fn get_message_store_timestamp(&self, topic: &str, queue_id: i32, offset: u64) -> Option<u64> {
        let unit = self.queues.get(topic, queue_id)?.get_unit(offset)?;
        self.commit_log
            .pickup_store_timestamp(unit.commit_log_offset, unit.size.max(0) as usize)
    }

    /// First logical offset whose record was stored at or after `timestamp`;
    /// the queue's max offset when every record is older.
    pub fn get_offset_by_timestamp(&self, topic: &str, queue_id: i32, timestamp: u64) -> u64 {
        let Some(queue) = self.queues.get(topic, queue_id) else {
            return 0;
        };
        let (mut low, mut high) = (queue.min_offset(), queue.max_offset());
        while low < high {
            let mid = low + (high - low) / 2;
            let stored = queue.get_unit(mid).and_then(|u| {
                self.commit_log
                    .pickup_store_timestamp(u.commit_log_offset, u.size.max(0) as usize)
            });
            match stored {
                Some(ts) if ts >= timestamp => high = mid,
                // unreadable records sit below the commit log head, so they count as older
                _ => low = mid + 1,
            }
        }
        low
    }

    /// Destroy queues whose every unit points below the commit log head.
    pub fn clean_expired_queues(&self) -> usize {
        let min = self.commit_log.min_offset();
        let mut removed = 0;
        for queue in self.queues.all() {
            if queue.topic() == REDO_LOG_TOPIC {
                continue;
            }
            if queue.max_physic_offset() == 0 {
                debug!(topic = queue.topic(), queue_id = queue.queue_id(), "queue has no units yet");
                continue;
            }
            if queue.last_offset() < min {
                info!(
                    topic = queue.topic(),
                    queue_id = queue.queue_id(),
                    last = queue.last_offset(),
                    min,
                    "destroying expired queue"
                );
                self.queues.remove_queue(queue.topic(), queue.queue_id());
                self.commit_log
                    .remove_queue_from_topic_queue_table(queue.topic(), queue.queue_id());
                removed += 1;
            }
        }
        removed
    }

    /// Drop every topic not in `in_use`. Returns the number of topics removed.
    pub fn clean_unused_topic(&self, in_use: &HashSet<String>) -> usize {
        let mut removed = 0;
        for topic in self.queues.topics() {
            if topic == REDO_LOG_TOPIC || in_use.contains(&topic) {
                continue;
            }
            for queue in self.queues.remove_topic(&topic) {
                self.commit_log
                    .remove_queue_from_topic_queue_table(&topic, queue.queue_id());
            }
            info!(topic = %topic, "unused topic removed");
            removed += 1;
        }
        removed
    }

    pub fn execute_delete_files_manually(&self) {
        self.cleaner.execute_delete_files_manually();
    }

    /// Commit log bytes written but not yet dispatched.
    pub fn dispatch_behind_bytes(&self) -> u64 {
        self.dispatcher.behind()
    }

    pub fn reput_from_offset(&self) -> u64 {
        self.dispatcher.reput_from_offset()
    }

    pub fn min_phy_offset(&self) -> u64 {
        self.commit_log.min_offset()
    }

    pub fn max_phy_offset(&self) -> u64 {
        self.commit_log.max_offset()
    }

    pub fn transaction_state(&self, state_table_offset: i64) -> Option<TransactionState> {
        self.transactions.as_ref()?.state_of(state_table_offset)
    }

    /// Prepared transactions still waiting for a commit or rollback.
    pub fn pending_transactions(&self) -> Vec<PreparedTransaction> {
        self.transactions
            .as_ref()
            .map(|tx| tx.pending())
            .unwrap_or_default()
    }
}
