//! The commit log: every topic's records appended to one segment chain under
//! a single ordering lock.

use crate::store::allocator::SegmentAllocator;
use crate::store::chain::{ExpirePolicy, SegmentChain};
use crate::store::checkpoint::StoreCheckpoint;
use crate::store::config::{now_millis, FlushDiskType, BrokerRole, StoreConfig};
use crate::store::error::{StoreError, StoreResult};
use crate::store::hooks::ReplicationService;
use crate::store::record::{
    decode_dispatch, decode_record, encode_into, encode_properties, encoded_len, read_store_timestamp,
    write_blank, CommitLogRecord, DecodeOutcome, Message, Placement, TransactionState,
    END_OF_SEGMENT_MIN_BLANK, MAX_PROPERTIES_LEN, MAX_TOPIC_LEN, MESSAGE_MAGIC, STORE_TIMESTAMP_POS,
};
use crate::store::runtime::flush::CommitLogFlusher;
use crate::store::segment::{AppendOutcome, AppendStatus, Segment, SelectedRegion};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of a put as seen by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    Ok,
    /// Stored, but the group commit did not confirm in time.
    FlushDiskTimeout,
    /// Stored, but the replica did not ack in time.
    FlushSlaveTimeout,
    /// Stored, but no replica is caught up enough to ack.
    SlaveNotAvailable,
    MessageIllegal,
    PropertiesSizeExceeded,
    ServiceNotAvailable,
    UnknownError,
}

impl PutStatus {
    /// The record is in the commit log.
    pub fn is_stored(self) -> bool {
        matches!(
            self,
            Self::Ok | Self::FlushDiskTimeout | Self::FlushSlaveTimeout | Self::SlaveNotAvailable
        )
    }
}

/// Where an appended record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub wrote_offset: u64,
    pub wrote_bytes: usize,
    pub queue_offset: i64,
    pub store_timestamp: u64,
}

impl AppendResult {
    pub fn next_offset(&self) -> u64 {
        self.wrote_offset + self.wrote_bytes as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutMessageResult {
    pub status: PutStatus,
    pub append: Option<AppendResult>,
}

impl PutMessageResult {
    pub(crate) fn rejected(status: PutStatus) -> Self {
        Self {
            status,
            append: None,
        }
    }
}

/// State guarded by the write lock.
struct PutState {
    /// `"topic-queueId"` to the next logical offset.
    topic_queue_table: HashMap<String, i64>,
    last_store_timestamp: u64,
}

/// Where a recovery scan started and stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecoveryOutcome {
    pub scan_start: u64,
    pub process_offset: u64,
}

pub struct CommitLog {
    config: Arc<StoreConfig>,
    chain: SegmentChain,
    allocator: Option<SegmentAllocator>,
    put_lock: Mutex<PutState>,
    begin_time_in_lock: AtomicU64,
    transaction_offset: Arc<AtomicI64>,
    replication: Option<Arc<dyn ReplicationService>>,
    flusher: OnceLock<CommitLogFlusher>,
}

pub(crate) fn queue_key(topic: &str, queue_id: i32) -> String {
    format!("{}-{}", topic, queue_id)
}

impl CommitLog {
    pub(crate) fn new(
        config: Arc<StoreConfig>,
        dir: PathBuf,
        transaction_offset: Arc<AtomicI64>,
        replication: Option<Arc<dyn ReplicationService>>,
    ) -> Self {
        let allocator = config
            .preallocate_segments
            .then(|| SegmentAllocator::new(config.warm_mapped_segments, config.lock_mapped_segments));
        Self {
            chain: SegmentChain::new(dir, config.commit_log_segment_size, allocator.clone()),
            allocator,
            put_lock: Mutex::new(PutState {
                topic_queue_table: HashMap::new(),
                last_store_timestamp: 0,
            }),
            begin_time_in_lock: AtomicU64::new(0),
            transaction_offset,
            replication,
            flusher: OnceLock::new(),
            config,
        }
    }

    pub(crate) fn chain(&self) -> &SegmentChain {
        &self.chain
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, PutState>> {
        self.put_lock
            .lock()
            .map_err(|_| StoreError::Poisoned("commit log put lock"))
    }

    pub fn load(&self) -> StoreResult<()> {
        self.chain.load()?;
        info!(segments = self.chain.len(), "commit log loaded");
        Ok(())
    }

    pub(crate) fn start_flusher(self: &Arc<Self>, checkpoint: Arc<StoreCheckpoint>) -> StoreResult<()> {
        let flusher = CommitLogFlusher::start(Arc::clone(self), checkpoint)?;
        if self.flusher.set(flusher).is_err() {
            warn!("commit log flusher already running");
        }
        Ok(())
    }

    pub(crate) fn shutdown(&self) {
        if let Some(flusher) = self.flusher.get() {
            flusher.shutdown();
        }
        if let Some(alloc) = &self.allocator {
            alloc.shutdown();
        }
    }

    /// The write lock has been held longer than the configured budget.
    pub fn is_page_cache_busy(&self) -> bool {
        let begin = self.begin_time_in_lock.load(Ordering::Acquire);
        begin > 0 && now_millis().saturating_sub(begin) > self.config.os_page_cache_busy_timeout_ms
    }

    /// Run `f` under the put lock, stamped like an append in progress.
    #[cfg(test)]
    pub(crate) fn with_put_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _state = self.lock().expect("put lock");
        self.begin_time_in_lock.store(now_millis().max(1), Ordering::Release);
        let r = f();
        self.begin_time_in_lock.store(0, Ordering::Release);
        r
    }

    pub fn min_offset(&self) -> u64 {
        match self.chain.first() {
            Some(first) if first.is_available() => first.start_offset(),
            Some(first) => self.roll_next_file(first.start_offset()),
            None => self.chain.min_offset(),
        }
    }

    pub fn max_offset(&self) -> u64 {
        self.chain.max_offset()
    }

    pub fn flushed_where(&self) -> u64 {
        self.chain.flushed_where()
    }

    pub fn remain_how_many_data_to_flush(&self) -> u64 {
        self.chain.remain_how_many_data_to_flush()
    }

    /// Start of the segment after the one holding `offset`.
    pub fn roll_next_file(&self, offset: u64) -> u64 {
        let size = self.config.commit_log_segment_size as u64;
        offset + size - offset % size
    }

    pub fn read(&self, offset: u64, size: usize) -> Option<SelectedRegion> {
        let segment = self.chain.find_by_offset(offset)?;
        segment.select_region((offset - segment.start_offset()) as usize, size)
    }

    /// Readable remainder of the segment holding `offset`.
    pub fn read_from(&self, offset: u64) -> Option<SelectedRegion> {
        let segment = self.chain.find_by_offset(offset)?;
        segment.select_region_from((offset - segment.start_offset()) as usize)
    }

    pub fn pickup_store_timestamp(&self, offset: u64, size: usize) -> Option<u64> {
        let region = self.read(offset, size)?;
        read_store_timestamp(&region)
    }

    /// Decode the complete record starting at `offset`.
    pub fn look_message(&self, offset: u64) -> Option<CommitLogRecord> {
        let head = self.read(offset, 4)?;
        let size = i32::from_be_bytes([head[0], head[1], head[2], head[3]]);
        drop(head);
        if size <= 0 {
            return None;
        }
        let region = self.read(offset, size as usize)?;
        match decode_record(&region, true, true) {
            DecodeOutcome::Record(rec) => Some(rec),
            _ => None,
        }
    }

    pub fn topic_queue_offset(&self, topic: &str, queue_id: i32) -> Option<i64> {
        self.lock()
            .ok()?
            .topic_queue_table
            .get(&queue_key(topic, queue_id))
            .copied()
    }

    /// Raise every entry to at least the given next logical offset.
    pub(crate) fn merge_topic_queue_table(&self, offsets: HashMap<String, i64>) -> StoreResult<()> {
        let mut state = self.lock()?;
        for (key, offset) in offsets {
            let entry = state.topic_queue_table.entry(key).or_insert(0);
            *entry = (*entry).max(offset);
        }
        Ok(())
    }

    pub(crate) fn remove_queue_from_topic_queue_table(&self, topic: &str, queue_id: i32) {
        if let Ok(mut state) = self.lock() {
            state.topic_queue_table.remove(&queue_key(topic, queue_id));
        }
    }

    /// Append one record, then wait on the flush and replication policy.
    pub fn put_message(&self, msg: &Message) -> PutMessageResult {
        let properties = encode_properties(&msg.properties);
        let len = encoded_len(msg.body.len(), msg.topic.len(), properties.len());
        let appended = match self.append_locked(msg, properties.as_bytes(), len) {
            Ok(r) => r,
            Err(status) => return PutMessageResult::rejected(status),
        };

        let mut status = self.handle_disk_flush(&appended, msg);
        if let Some(ha) = self.handle_replication(&appended, msg) {
            if status == PutStatus::Ok {
                status = ha;
            }
        }
        PutMessageResult {
            status,
            append: Some(appended),
        }
    }

    fn append_locked(&self, msg: &Message, properties: &[u8], len: usize) -> Result<AppendResult, PutStatus> {
        let tran = msg.transaction_state();
        let mut state = self.lock().map_err(|e| {
            error!(error = %e, "put lock unavailable");
            PutStatus::UnknownError
        })?;
        let started = Instant::now();
        let now = now_millis();
        self.begin_time_in_lock.store(now.max(1), Ordering::Release);

        let store_timestamp = now.max(state.last_store_timestamp);
        state.last_store_timestamp = store_timestamp;

        let key = queue_key(&msg.topic, msg.queue_id);
        let queue_offset = match tran {
            TransactionState::Prepared => self.transaction_offset.load(Ordering::Acquire),
            TransactionState::Rollback => msg.queue_offset,
            TransactionState::Normal | TransactionState::Commit => {
                *state.topic_queue_table.entry(key.clone()).or_insert(0)
            }
        };

        let result = self.append_with_roll(msg, properties, len, queue_offset, store_timestamp);

        if let Ok(appended) = &result {
            match tran {
                TransactionState::Normal | TransactionState::Commit => {
                    if let Some(next) = state.topic_queue_table.get_mut(&key) {
                        *next += 1;
                    }
                }
                TransactionState::Prepared => {
                    self.transaction_offset.fetch_add(1, Ordering::AcqRel);
                }
                TransactionState::Rollback => {}
            }
            debug!(
                topic = %msg.topic,
                queue_id = msg.queue_id,
                queue_offset,
                offset = appended.wrote_offset,
                "record appended"
            );
        }

        self.begin_time_in_lock.store(0, Ordering::Release);
        drop(state);

        let elapsed = started.elapsed();
        if elapsed.as_millis() > 500 {
            warn!(elapsed_ms = elapsed.as_millis() as u64, len, "slow commit log append");
        }
        result
    }

    fn append_with_roll(
        &self,
        msg: &Message,
        properties: &[u8],
        len: usize,
        queue_offset: i64,
        store_timestamp: u64,
    ) -> Result<AppendResult, PutStatus> {
        // a fresh segment always fits, so one roll suffices
        for _ in 0..2 {
            let segment = self.chain.tail(0).map_err(|e| {
                error!(error = %e, "cannot create commit log segment");
                PutStatus::UnknownError
            })?;
            let outcome = self.append_to(&segment, msg, properties, len, queue_offset, store_timestamp);
            match outcome.status {
                AppendStatus::Ok => {
                    segment.set_store_timestamp(store_timestamp);
                    return outcome.value.flatten().ok_or(PutStatus::UnknownError);
                }
                AppendStatus::InsufficientSpace => {
                    debug!(segment = segment.start_offset(), padded = outcome.wrote_bytes, "commit log segment full, rolling");
                    continue;
                }
                AppendStatus::MessageTooLarge => return Err(PutStatus::MessageIllegal),
                AppendStatus::PropertiesSizeExceeded => return Err(PutStatus::PropertiesSizeExceeded),
                AppendStatus::UnknownError => return Err(PutStatus::UnknownError),
            }
        }
        error!(topic = %msg.topic, "append failed after rolling to a new segment");
        Err(PutStatus::UnknownError)
    }

    fn append_to(
        &self,
        segment: &Segment,
        msg: &Message,
        properties: &[u8],
        len: usize,
        queue_offset: i64,
        store_timestamp: u64,
    ) -> AppendOutcome<Option<Option<AppendResult>>> {
        segment.append(usize::MAX, |buf, physical_offset| {
            if let Some(status) = self.unencodable(msg, properties, len) {
                return AppendOutcome {
                    status,
                    wrote_bytes: 0,
                    value: None,
                };
            }
            if len + END_OF_SEGMENT_MIN_BLANK > buf.len() {
                return AppendOutcome {
                    status: AppendStatus::InsufficientSpace,
                    wrote_bytes: write_blank(buf),
                    value: None,
                };
            }
            let placement = Placement {
                physical_offset,
                queue_offset,
                store_timestamp,
            };
            let wrote = encode_into(buf, msg, properties, placement);
            AppendOutcome {
                status: AppendStatus::Ok,
                wrote_bytes: wrote,
                value: Some(AppendResult {
                    wrote_offset: physical_offset,
                    wrote_bytes: wrote,
                    queue_offset,
                    store_timestamp,
                }),
            }
        })
    }

    /// Records the length-prefixed framing cannot hold, or no segment can fit.
    fn unencodable(&self, msg: &Message, properties: &[u8], len: usize) -> Option<AppendStatus> {
        if msg.topic.len() > MAX_TOPIC_LEN {
            warn!(topic_len = msg.topic.len(), "topic too long for the record header");
            return Some(AppendStatus::MessageTooLarge);
        }
        if len > self.config.max_message_size
            || len + END_OF_SEGMENT_MIN_BLANK > self.config.commit_log_segment_size
        {
            warn!(topic = %msg.topic, len, "record exceeds the maximum size");
            return Some(AppendStatus::MessageTooLarge);
        }
        if properties.len() > MAX_PROPERTIES_LEN {
            warn!(topic = %msg.topic, properties_len = properties.len(), "properties too long");
            return Some(AppendStatus::PropertiesSizeExceeded);
        }
        None
    }

    fn handle_disk_flush(&self, appended: &AppendResult, msg: &Message) -> PutStatus {
        match self.config.flush_disk_type {
            FlushDiskType::SyncFlush if msg.wait_store_ok() => {
                let ok = match self.flusher.get() {
                    Some(flusher) => flusher.request_flush(appended.next_offset(), self.config.sync_flush_timeout()),
                    None => {
                        self.chain.commit(0);
                        self.chain.flushed_where() >= appended.next_offset()
                    }
                };
                if ok {
                    PutStatus::Ok
                } else {
                    error!(
                        topic = %msg.topic,
                        next_offset = appended.next_offset(),
                        "group commit timed out"
                    );
                    PutStatus::FlushDiskTimeout
                }
            }
            _ => {
                if let Some(flusher) = self.flusher.get() {
                    flusher.wakeup();
                }
                PutStatus::Ok
            }
        }
    }

    fn handle_replication(&self, appended: &AppendResult, msg: &Message) -> Option<PutStatus> {
        let ha = self.replication.as_ref()?;
        ha.notify_max_offset(appended.next_offset());
        if self.config.broker_role != BrokerRole::SyncMaster || !msg.wait_store_ok() {
            return None;
        }
        if !ha.is_slave_ok(appended.next_offset()) {
            return Some(PutStatus::SlaveNotAvailable);
        }
        if ha.wait_for_ack(appended.next_offset(), self.config.slave_timeout()) {
            None
        } else {
            error!(
                topic = %msg.topic,
                next_offset = appended.next_offset(),
                "replica ack timed out"
            );
            Some(PutStatus::FlushSlaveTimeout)
        }
    }

    /// Replica path: append bytes already framed by the primary. They must
    /// continue exactly where the local log ends.
    pub fn append_data(&self, start_offset: u64, data: &[u8]) -> StoreResult<()> {
        let _state = self.lock()?;
        let expected = self.max_offset();
        if start_offset != expected {
            return Err(StoreError::ReplicaOffsetMismatch {
                given: start_offset,
                expected,
            });
        }
        let segment = self.chain.tail(start_offset)?;
        if !segment.append_bytes(data) {
            return Err(StoreError::DataTooLarge {
                len: data.len(),
                remaining: segment.capacity() - segment.write_pos(),
            });
        }
        Ok(())
    }

    pub fn delete_expired(&self, policy: ExpirePolicy) -> usize {
        self.chain.delete_expired(policy)
    }

    pub fn retry_delete_first(&self) -> bool {
        self.chain.retry_delete_first(self.config.destroy_segment_timeout())
    }

    /// Clean shutdown: scan the newest few segments.
    pub(crate) fn recover_normally(&self) -> StoreResult<RecoveryOutcome> {
        let segments = self.chain.segments();
        let start = segments
            .len()
            .saturating_sub(self.config.normal_recover_segments.max(1));
        self.recover_from(&segments, start)
    }

    /// Unclean shutdown: scan from the newest segment whose first record is
    /// older than the checkpoint, else from the very first segment.
    pub(crate) fn recover_abnormally(&self, min_timestamp: u64) -> StoreResult<RecoveryOutcome> {
        let segments = self.chain.segments();
        let start = segments
            .iter()
            .rposition(|s| self.is_segment_matched_recover(s, min_timestamp))
            .unwrap_or(0);
        self.recover_from(&segments, start)
    }

    fn is_segment_matched_recover(&self, segment: &Arc<Segment>, min_timestamp: u64) -> bool {
        let Some(head) = segment.select_region(0, STORE_TIMESTAMP_POS + 8) else {
            return false;
        };
        let magic = u32::from_be_bytes([head[4], head[5], head[6], head[7]]);
        if magic != MESSAGE_MAGIC {
            return false;
        }
        match read_store_timestamp(&head) {
            Some(ts) if ts != 0 && ts <= min_timestamp => {
                info!(segment = segment.start_offset(), store_timestamp = ts, "abnormal recovery starts here");
                true
            }
            _ => false,
        }
    }

    fn recover_from(&self, segments: &[Arc<Segment>], start: usize) -> StoreResult<RecoveryOutcome> {
        let Some(first) = segments.get(start) else {
            let base = self.chain.flushed_where();
            return Ok(RecoveryOutcome {
                scan_start: base,
                process_offset: base,
            });
        };
        let scan_start = first.start_offset();
        let check_crc = self.config.check_crc_on_recover;
        let mut state = self.lock()?;
        let mut idx = start;
        let mut pos = 0usize;
        let mut records = 0usize;
        loop {
            let segment = &segments[idx];
            let outcome = match segment.select_region_from(pos) {
                Some(region) => decode_dispatch(&region, check_crc),
                None => DecodeOutcome::EndOfSegment,
            };
            match outcome {
                DecodeOutcome::Record(req) => {
                    pos += req.size as usize;
                    records += 1;
                    segment.set_store_timestamp(req.store_timestamp);
                    state.last_store_timestamp = state.last_store_timestamp.max(req.store_timestamp);
                    match req.transaction_state() {
                        TransactionState::Normal | TransactionState::Commit => {
                            let next = state
                                .topic_queue_table
                                .entry(queue_key(&req.topic, req.queue_id))
                                .or_insert(0);
                            *next = (*next).max(req.queue_offset + 1);
                        }
                        TransactionState::Prepared => {
                            self.transaction_offset
                                .fetch_max(req.queue_offset + 1, Ordering::AcqRel);
                        }
                        TransactionState::Rollback => {}
                    }
                }
                DecodeOutcome::EndOfSegment => {
                    if idx + 1 < segments.len() {
                        idx += 1;
                        pos = 0;
                        continue;
                    }
                    // keep the padding; the next append opens a new segment
                    if segment.select_region_from(pos).is_some() {
                        pos = segment.capacity();
                    }
                    break;
                }
                DecodeOutcome::Incomplete { declared_size } | DecodeOutcome::Corrupt { declared_size } => {
                    if pos < segment.capacity() && declared_size != 0 {
                        warn!(
                            segment = segment.start_offset(),
                            pos,
                            declared_size,
                            "invalid record during recovery, truncating here"
                        );
                    }
                    break;
                }
            }
        }
        drop(state);

        let process_offset = segments[idx].start_offset() + pos as u64;
        self.chain.truncate_after(process_offset, self.config.destroy_segment_timeout());
        info!(scan_start, process_offset, records, "commit log recovered");
        Ok(RecoveryOutcome {
            scan_start,
            process_offset,
        })
    }

    pub(crate) fn destroy(&self) {
        self.shutdown();
        self.chain.destroy(self.config.destroy_segment_timeout());
    }
}
