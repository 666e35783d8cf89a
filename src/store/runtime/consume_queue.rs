//! Per-(topic, queueId) index over the commit log: fixed 20-byte units of
//! commit log offset, record size and tags code, addressed by logical offset.

use crate::store::chain::SegmentChain;
use crate::store::config::CQ_UNIT_SIZE;
use crate::store::error::{StoreError, StoreResult};
use crate::store::paths::StorePaths;
use crate::store::segment::SelectedRegion;
use crate::store::runtime::transaction::REDO_LOG_TOPIC;
use bytes::{Buf, BufMut};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Segments scanned from the tail by `recover`.
const RECOVER_SEGMENTS: usize = 3;

/// One decoded index unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqUnit {
    pub commit_log_offset: u64,
    pub size: i32,
    pub tags_code: i64,
}

impl CqUnit {
    pub(crate) const BLANK: CqUnit = CqUnit {
        commit_log_offset: 0,
        size: i32::MAX,
        tags_code: 0,
    };

    pub fn is_blank(&self) -> bool {
        *self == Self::BLANK
    }

    pub(crate) fn parse(mut raw: &[u8]) -> Option<Self> {
        if raw.len() < CQ_UNIT_SIZE {
            return None;
        }
        Some(Self {
            commit_log_offset: raw.get_u64(),
            size: raw.get_i32(),
            tags_code: raw.get_i64(),
        })
    }

    pub(crate) fn encode(&self) -> [u8; CQ_UNIT_SIZE] {
        let mut out = [0u8; CQ_UNIT_SIZE];
        let mut buf = &mut out[..];
        buf.put_u64(self.commit_log_offset);
        buf.put_i32(self.size);
        buf.put_i64(self.tags_code);
        out
    }

    /// End of the referenced record in the commit log.
    pub fn end_offset(&self) -> u64 {
        self.commit_log_offset + self.size.max(0) as u64
    }
}

/// Units starting at one logical offset, borrowed zero-copy from a segment.
pub struct UnitBatch {
    region: SelectedRegion,
    first_logical: u64,
}

impl UnitBatch {
    pub fn first_logical_offset(&self) -> u64 {
        self.first_logical
    }

    pub fn len(&self) -> usize {
        self.region.len() / CQ_UNIT_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Option<CqUnit> {
        let at = i.checked_mul(CQ_UNIT_SIZE)?;
        CqUnit::parse(self.region.get(at..at + CQ_UNIT_SIZE)?)
    }

    /// `(logical offset, unit)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, CqUnit)> + '_ {
        self.region
            .chunks_exact(CQ_UNIT_SIZE)
            .filter_map(CqUnit::parse)
            .enumerate()
            .map(move |(i, u)| (self.first_logical + i as u64, u))
    }
}

pub struct ConsumeQueue {
    topic: String,
    queue_id: i32,
    chain: SegmentChain,
    /// End of the last indexed record in the commit log.
    max_physic_offset: AtomicU64,
    /// Byte offset of the first unit visible to readers.
    min_logic_offset: AtomicU64,
    destroy_timeout: Duration,
}

impl ConsumeQueue {
    pub fn new(
        topic: impl Into<String>,
        queue_id: i32,
        dir: PathBuf,
        segment_size: usize,
        destroy_timeout: Duration,
    ) -> Self {
        Self {
            topic: topic.into(),
            queue_id,
            chain: SegmentChain::new(dir, segment_size, None),
            max_physic_offset: AtomicU64::new(0),
            min_logic_offset: AtomicU64::new(0),
            destroy_timeout,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn queue_id(&self) -> i32 {
        self.queue_id
    }

    pub(crate) fn chain(&self) -> &SegmentChain {
        &self.chain
    }

    pub fn load(&self) -> StoreResult<()> {
        self.chain.load()?;
        debug!(topic = %self.topic, queue_id = self.queue_id, segments = self.chain.len(), "consume queue loaded");
        Ok(())
    }

    /// Scan the tail segments, keep the valid prefix and restore the max
    /// physical offset.
    pub fn recover(&self) {
        let segments = self.chain.segments();
        if segments.is_empty() {
            return;
        }
        let seg_size = self.chain.segment_size();
        let mut idx = segments.len().saturating_sub(RECOVER_SEGMENTS);
        let mut pos = 0usize;
        let mut max_physic = 0u64;
        loop {
            let segment = &segments[idx];
            let mut valid = true;
            while pos + CQ_UNIT_SIZE <= seg_size {
                let unit = segment
                    .select_region(pos, CQ_UNIT_SIZE)
                    .and_then(|r| CqUnit::parse(&r));
                match unit {
                    Some(u) if u.size > 0 => {
                        if !u.is_blank() {
                            max_physic = u.end_offset();
                        }
                        pos += CQ_UNIT_SIZE;
                    }
                    _ => {
                        valid = false;
                        break;
                    }
                }
            }
            if valid && idx + 1 < segments.len() {
                idx += 1;
                pos = 0;
                continue;
            }
            break;
        }
        let process_offset = segments[idx].start_offset() + pos as u64;
        self.chain.set_flushed_where(process_offset);
        self.chain.truncate_after(process_offset, self.destroy_timeout);
        self.max_physic_offset.store(max_physic, Ordering::Release);
        info!(
            topic = %self.topic,
            queue_id = self.queue_id,
            process_offset,
            max_physic_offset = max_physic,
            "consume queue recovered"
        );
    }

    /// Append one unit. Duplicates of already indexed records are skipped.
    pub fn append_index(
        &self,
        commit_log_offset: u64,
        size: i32,
        tags_code: i64,
        expected_logical_offset: u64,
    ) -> StoreResult<()> {
        let unit = CqUnit {
            commit_log_offset,
            size,
            tags_code,
        };
        if unit.end_offset() <= self.max_physic_offset() {
            debug!(
                topic = %self.topic,
                queue_id = self.queue_id,
                commit_log_offset,
                "skipping already indexed record"
            );
            return Ok(());
        }

        let expected = expected_logical_offset * CQ_UNIT_SIZE as u64;
        let was_empty = self.chain.is_empty();
        let tail = self.chain.tail(expected)?;

        if was_empty && tail.write_pos() == 0 && expected > tail.start_offset() {
            // first unit of the queue lands mid-segment
            let blank = CqUnit::BLANK.encode();
            let pad_units = ((expected - tail.start_offset()) / CQ_UNIT_SIZE as u64) as usize;
            for _ in 0..pad_units {
                if !tail.append_bytes(&blank) {
                    break;
                }
            }
            self.min_logic_offset.store(expected, Ordering::Release);
        }

        let current = tail.start_offset() + tail.write_pos() as u64;
        if expected != current {
            warn!(
                topic = %self.topic,
                queue_id = self.queue_id,
                expected = expected_logical_offset,
                actual = current / CQ_UNIT_SIZE as u64,
                "logical offset disagrees with queue tail, appending at the tail"
            );
        }

        if !tail.append_bytes(&unit.encode()) {
            return Err(StoreError::DataTooLarge {
                len: CQ_UNIT_SIZE,
                remaining: tail.capacity() - tail.write_pos(),
            });
        }
        self.max_physic_offset.store(unit.end_offset(), Ordering::Release);
        Ok(())
    }

    /// Units from `logical_offset` to the end of its segment. Offsets below
    /// the minimum are read from the minimum; offsets at or past the maximum
    /// have nothing to read.
    pub fn read_index(&self, logical_offset: u64) -> Option<UnitBatch> {
        let logical = logical_offset.max(self.min_offset());
        let byte = logical.checked_mul(CQ_UNIT_SIZE as u64)?;
        if byte >= self.chain.max_offset() {
            return None;
        }
        let segment = self.chain.find_by_offset(byte)?;
        let region = segment.select_region_from((byte - segment.start_offset()) as usize)?;
        Some(UnitBatch {
            region,
            first_logical: logical,
        })
    }

    /// The unit at exactly `logical_offset`, blanks excluded.
    pub fn get_unit(&self, logical_offset: u64) -> Option<CqUnit> {
        if logical_offset < self.min_offset() {
            return None;
        }
        let unit = self.read_index(logical_offset)?.get(0)?;
        (!unit.is_blank()).then_some(unit)
    }

    pub fn min_offset(&self) -> u64 {
        let min_byte = self
            .min_logic_offset
            .load(Ordering::Acquire)
            .max(self.chain.min_offset());
        min_byte / CQ_UNIT_SIZE as u64
    }

    pub fn max_offset(&self) -> u64 {
        self.chain.max_offset() / CQ_UNIT_SIZE as u64
    }

    pub fn max_physic_offset(&self) -> u64 {
        self.max_physic_offset.load(Ordering::Acquire)
    }

    /// End of the last record this queue references.
    pub fn last_offset(&self) -> u64 {
        self.max_physic_offset()
    }

    /// Advance the visible minimum to the first unit that still points into
    /// the commit log.
    pub fn correct_min_offset(&self, min_commit_log_offset: u64) {
        let Some(first) = self.chain.first() else {
            return;
        };
        let Some(region) = first.select_region_from(0) else {
            return;
        };
        for (i, chunk) in region.chunks_exact(CQ_UNIT_SIZE).enumerate() {
            let Some(unit) = CqUnit::parse(chunk) else {
                break;
            };
            if unit.is_blank() {
                continue;
            }
            if unit.commit_log_offset >= min_commit_log_offset {
                let byte = first.start_offset() + (i * CQ_UNIT_SIZE) as u64;
                let previous = self.min_logic_offset.fetch_max(byte, Ordering::AcqRel);
                if byte > previous {
                    debug!(topic = %self.topic, queue_id = self.queue_id, min = byte / CQ_UNIT_SIZE as u64, "min logical offset corrected");
                }
                return;
            }
        }
    }

    /// Drop head segments that only reference reclaimed commit log data.
    pub fn delete_expired(&self, min_commit_log_offset: u64) -> usize {
        let deleted = self.chain.delete_expired_by_unit(
            min_commit_log_offset,
            CQ_UNIT_SIZE,
            self.destroy_timeout,
        );
        self.correct_min_offset(min_commit_log_offset);
        deleted
    }

    /// Trim units referencing commit log data at or past `boundary`.
    pub fn truncate_dirty(&self, boundary: u64) {
        let segments = self.chain.segments();
        let mut cut = None;
        for segment in segments.iter().rev() {
            let Some(region) = segment.select_region_from(0) else {
                continue;
            };
            let found = region
                .chunks_exact(CQ_UNIT_SIZE)
                .filter_map(CqUnit::parse)
                .position(|u| u.size <= 0 || (!u.is_blank() && u.commit_log_offset >= boundary));
            match found {
                Some(0) => cut = Some(segment.start_offset()),
                Some(i) => {
                    cut = Some(segment.start_offset() + (i * CQ_UNIT_SIZE) as u64);
                    break;
                }
                None => break,
            }
        }
        if let Some(offset) = cut {
            warn!(topic = %self.topic, queue_id = self.queue_id, boundary, offset, "truncating dirty consume queue units");
            self.chain.truncate_after(offset, self.destroy_timeout);
        }
        self.refresh_max_physic_offset();
    }

    fn refresh_max_physic_offset(&self) {
        let min = self.chain.min_offset() / CQ_UNIT_SIZE as u64;
        let mut logical = self.max_offset();
        while logical > min {
            logical -= 1;
            let Some(unit) = self.read_index(logical).and_then(|b| b.get(0)) else {
                break;
            };
            if !unit.is_blank() {
                self.max_physic_offset.store(unit.end_offset(), Ordering::Release);
                return;
            }
        }
        self.max_physic_offset.store(0, Ordering::Release);
    }

    pub fn commit(&self, least_pages: usize) -> bool {
        self.chain.commit(least_pages)
    }

    pub fn destroy(&self) {
        self.chain.destroy(self.destroy_timeout);
        self.max_physic_offset.store(0, Ordering::Release);
        self.min_logic_offset.store(0, Ordering::Release);
    }
}

type QueueMap = HashMap<String, HashMap<i32, Arc<ConsumeQueue>>>;

/// All consume queues of one store, created lazily.
pub struct ConsumeQueueTable {
    paths: StorePaths,
    segment_size: usize,
    destroy_timeout: Duration,
    queues: RwLock<QueueMap>,
}

impl ConsumeQueueTable {
    pub(crate) fn new(paths: StorePaths, segment_size: usize, destroy_timeout: Duration) -> Self {
        Self {
            paths,
            segment_size,
            destroy_timeout,
            queues: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, QueueMap> {
        match self.queues.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, QueueMap> {
        match self.queues.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn make(&self, topic: &str, queue_id: i32) -> ConsumeQueue {
        ConsumeQueue::new(
            topic,
            queue_id,
            self.paths.consume_queue_dir(topic, queue_id),
            self.segment_size,
            self.destroy_timeout,
        )
    }

    /// Load every `<topic>/<queueId>` directory under the consume queue root.
    pub fn load(&self) -> StoreResult<()> {
        let root = self.paths.consume_queue_root();
        if !root.exists() {
            return Ok(());
        }
        let mut loaded = 0usize;
        let mut queues = self.write();
        for topic_entry in fs::read_dir(&root)? {
            let topic_entry = topic_entry?;
            if !topic_entry.file_type()?.is_dir() {
                continue;
            }
            let topic = topic_entry.file_name().to_string_lossy().into_owned();
            if topic == REDO_LOG_TOPIC {
                continue;
            }
            for queue_entry in fs::read_dir(topic_entry.path())? {
                let queue_entry = queue_entry?;
                let name = queue_entry.file_name().to_string_lossy().into_owned();
                let Ok(queue_id) = name.parse::<i32>() else {
                    warn!(topic = %topic, dir = %name, "ignoring non-numeric queue directory");
                    continue;
                };
                let queue = self.make(&topic, queue_id);
                queue.load()?;
                queues
                    .entry(topic.clone())
                    .or_default()
                    .insert(queue_id, Arc::new(queue));
                loaded += 1;
            }
        }
        info!(queues = loaded, "consume queues loaded");
        Ok(())
    }

    pub fn find_or_create(&self, topic: &str, queue_id: i32) -> Arc<ConsumeQueue> {
        if let Some(q) = self.get(topic, queue_id) {
            return q;
        }
        let mut queues = self.write();
        let by_id = queues.entry(topic.to_string()).or_default();
        Arc::clone(
            by_id
                .entry(queue_id)
                .or_insert_with(|| Arc::new(self.make(topic, queue_id))),
        )
    }

    pub fn get(&self, topic: &str, queue_id: i32) -> Option<Arc<ConsumeQueue>> {
        self.read().get(topic)?.get(&queue_id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<ConsumeQueue>> {
        self.read()
            .values()
            .flat_map(|m| m.values().cloned())
            .collect()
    }

    pub fn topics(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn recover_all(&self) {
        for queue in self.all() {
            queue.recover();
        }
    }

    /// Largest commit log end offset referenced by any queue.
    pub fn max_physic_offset(&self) -> u64 {
        self.all()
            .iter()
            .map(|q| q.max_physic_offset())
            .max()
            .unwrap_or(0)
    }

    pub fn truncate_dirty_all(&self, boundary: u64) {
        for queue in self.all() {
            queue.truncate_dirty(boundary);
        }
    }

    pub fn commit_all(&self, least_pages: usize) {
        for queue in self.all() {
            queue.commit(least_pages);
        }
    }

    /// `"topic-queueId" → max logical offset` for every loaded queue.
    pub fn max_offsets(&self) -> HashMap<String, i64> {
        self.all()
            .iter()
            .map(|q| (format!("{}-{}", q.topic(), q.queue_id()), q.max_offset() as i64))
            .collect()
    }

    /// Detach and destroy one queue, dropping the topic once it has none left.
    pub fn remove_queue(&self, topic: &str, queue_id: i32) -> Option<Arc<ConsumeQueue>> {
        let removed = {
            let mut queues = self.write();
            let by_id = queues.get_mut(topic)?;
            let removed = by_id.remove(&queue_id);
            if by_id.is_empty() {
                queues.remove(topic);
            }
            removed
        };
        if let Some(queue) = &removed {
            queue.destroy();
        }
        removed
    }

    /// Detach and destroy every queue of `topic`.
    pub fn remove_topic(&self, topic: &str) -> Vec<Arc<ConsumeQueue>> {
        let removed = self.write().remove(topic);
        let removed: Vec<_> = removed.map(|m| m.into_values().collect()).unwrap_or_default();
        for queue in &removed {
            queue.destroy();
        }
        if !removed.is_empty() {
            let topic_dir = self.paths.consume_queue_root().join(topic);
            if let Err(e) = fs::remove_dir(&topic_dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(dir = ?topic_dir, error = %e, "topic directory not removed");
                }
            }
        }
        removed
    }

    pub fn destroy_all(&self) {
        let drained: Vec<_> = self.write().drain().collect();
        for (_, by_id) in drained {
            for queue in by_id.into_values() {
                queue.destroy();
            }
        }
    }
}
