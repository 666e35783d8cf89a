//! Ordered, gapless sequence of equally sized segments backing one logical
//! byte stream (the commit log, or one consume queue).

use crate::store::allocator::SegmentAllocator;
use crate::store::config::{now_millis, DELETE_FILES_BATCH_MAX};
use crate::store::error::{StoreError, StoreResult};
use crate::store::paths::{parse_segment_file_name, segment_file_name};
use crate::store::segment::Segment;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Retention rules for one `delete_expired` pass.
#[derive(Debug, Clone, Copy)]
pub struct ExpirePolicy {
    /// Segments untouched for longer than this are expired.
    pub retention: Duration,
    /// Pause between two deletions of the same pass.
    pub interval: Duration,
    /// Grace period handed to `Segment::destroy`.
    pub destroy_timeout: Duration,
    /// Delete regardless of age (disk pressure or a manual request).
    pub clean_immediately: bool,
    /// Reclaim segments that readers still reference.
    pub forced: bool,
}

pub struct SegmentChain {
    dir: PathBuf,
    segment_size: usize,
    segments: RwLock<Vec<Arc<Segment>>>,
    flushed_where: AtomicU64,
    store_timestamp: AtomicU64,
    allocator: Option<SegmentAllocator>,
}

impl SegmentChain {
    pub fn new(dir: PathBuf, segment_size: usize, allocator: Option<SegmentAllocator>) -> Self {
        Self {
            dir,
            segment_size,
            segments: RwLock::new(Vec::new()),
            flushed_where: AtomicU64::new(0),
            store_timestamp: AtomicU64::new(0),
            allocator,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Segment>>> {
        match self.segments.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Segment>>> {
        match self.segments.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Map every segment file in the directory. Loaded segments start out
    /// full; recovery moves the cursors of the tail back.
    pub fn load(&self) -> StoreResult<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            let start = parse_segment_file_name(&path).ok_or_else(|| StoreError::SegmentName(path.clone()))?;
            let len = entry.metadata()?.len();
            if len != self.segment_size as u64 {
                return Err(StoreError::SegmentSize {
                    path,
                    expected: self.segment_size as u64,
                    actual: len,
                });
            }
            files.push((start, path));
        }
        files.sort_by_key(|(start, _)| *start);

        for pair in files.windows(2) {
            let previous_end = pair[0].0 + self.segment_size as u64;
            if previous_end != pair[1].0 {
                return Err(StoreError::SegmentNotContiguous {
                    previous_end,
                    next_start: pair[1].0,
                });
            }
        }

        let mut loaded = Vec::with_capacity(files.len());
        for (start, path) in files {
            let segment = Segment::open(&path, start, self.segment_size)?;
            segment.set_write_pos(self.segment_size);
            segment.set_flush_pos(self.segment_size);
            loaded.push(segment);
        }
        if let Some(first) = loaded.first() {
            self.flushed_where.store(first.start_offset(), Ordering::Release);
        }
        debug!(dir = ?self.dir, segments = loaded.len(), "segment chain loaded");
        *self.write() = loaded;
        Ok(())
    }

    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.read().clone()
    }

    pub fn first(&self) -> Option<Arc<Segment>> {
        self.read().first().cloned()
    }

    pub fn last(&self) -> Option<Arc<Segment>> {
        self.read().last().cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// The writable tail, creating a segment when the chain is empty or the
    /// tail is full. An empty chain starts at `min_start_offset` rounded down
    /// to a segment boundary, or at its remembered base if that is further.
    pub fn tail(&self, min_start_offset: u64) -> StoreResult<Arc<Segment>> {
        if let Some(last) = self.read().last() {
            if !last.is_full() {
                return Ok(Arc::clone(last));
            }
        }

        let mut segments = self.write();
        let start = match segments.last() {
            Some(last) if !last.is_full() => return Ok(Arc::clone(last)),
            Some(last) => last.end_offset(),
            None => {
                let base = min_start_offset.max(self.flushed_where());
                base - base % self.segment_size as u64
            }
        };
        let path = self.dir.join(segment_file_name(start));
        let segment = match &self.allocator {
            Some(alloc) => alloc.obtain(&path, start, self.segment_size)?,
            None => Segment::create(&path, start, self.segment_size)?,
        };
        if segments.is_empty() {
            self.flushed_where.store(start, Ordering::Release);
        }
        segments.push(Arc::clone(&segment));
        Ok(segment)
    }

    pub fn find_by_offset(&self, offset: u64) -> Option<Arc<Segment>> {
        let segments = self.read();
        let idx = segments.partition_point(|s| s.end_offset() <= offset);
        segments
            .get(idx)
            .filter(|s| s.start_offset() <= offset)
            .cloned()
    }

    pub fn min_offset(&self) -> u64 {
        match self.read().first() {
            Some(s) => s.start_offset(),
            None => self.flushed_where(),
        }
    }

    /// End of the readable data.
    pub fn max_offset(&self) -> u64 {
        match self.read().last() {
            Some(s) => s.start_offset() + s.read_pos() as u64,
            None => self.flushed_where(),
        }
    }

    pub fn flushed_where(&self) -> u64 {
        self.flushed_where.load(Ordering::Acquire)
    }

    pub(crate) fn set_flushed_where(&self, offset: u64) {
        self.flushed_where.store(offset, Ordering::Release);
    }

    /// Store timestamp of the last record covered by a flush.
    pub fn store_timestamp(&self) -> u64 {
        self.store_timestamp.load(Ordering::Acquire)
    }

    pub fn remain_how_many_data_to_flush(&self) -> u64 {
        self.max_offset().saturating_sub(self.flushed_where())
    }

    /// Flush the segment holding `flushed_where`. Returns whether the flush
    /// position moved.
    pub fn commit(&self, least_pages: usize) -> bool {
        let before = self.flushed_where();
        let Some(segment) = self.find_by_offset(before) else {
            return false;
        };
        let timestamp = segment.store_timestamp();
        let position = segment.commit(least_pages);
        let now = segment.start_offset() + position as u64;
        if now > before {
            self.flushed_where.store(now, Ordering::Release);
            if timestamp > 0 {
                self.store_timestamp.store(timestamp, Ordering::Release);
            }
            true
        } else {
            false
        }
    }

    /// Drop everything at or past `offset`: segments starting there or later
    /// are destroyed, the segment containing it has its cursors reset.
    pub fn truncate_after(&self, offset: u64, destroy_timeout: Duration) {
        let mut segments = self.write();
        let mut kept = Vec::with_capacity(segments.len());
        for segment in segments.drain(..) {
            if segment.start_offset() >= offset {
                info!(path = ?segment.path(), offset, "destroying segment past truncation point");
                segment.destroy(destroy_timeout);
            } else {
                if segment.end_offset() > offset {
                    let pos = (offset - segment.start_offset()) as usize;
                    segment.set_write_pos(pos);
                    segment.set_flush_pos(pos);
                }
                kept.push(segment);
            }
        }
        *segments = kept;
        self.flushed_where.store(offset, Ordering::Release);
    }

    /// Delete expired head segments, never the last one. Returns how many
    /// segments were removed.
    pub fn delete_expired(&self, policy: ExpirePolicy) -> usize {
        let candidates = {
            let segments = self.read();
            let n = segments.len().saturating_sub(1);
            segments[..n].to_vec()
        };
        let retention_ms = policy.retention.as_millis() as u64;

        let mut deleted = 0;
        for (i, segment) in candidates.iter().enumerate() {
            let expired = now_millis() >= segment.last_modified().saturating_add(retention_ms);
            if !expired && !policy.clean_immediately {
                break;
            }
            if !policy.forced && segment.ref_count() > 1 {
                // hand it to retry_delete_first once the readers are gone
                segment.shutdown();
                if !segment.is_cleanup_over() {
                    debug!(path = ?segment.path(), "expired segment still referenced");
                    break;
                }
            }
            segment.destroy(policy.destroy_timeout);
            self.remove_head(segment);
            deleted += 1;
            if deleted >= DELETE_FILES_BATCH_MAX {
                break;
            }
            if i + 1 < candidates.len() && !policy.interval.is_zero() {
                std::thread::sleep(policy.interval);
            }
        }
        if deleted > 0 {
            info!(dir = ?self.dir, deleted, "expired segments deleted");
        }
        deleted
    }

    /// Consume queue head reclamation: remove head segments whose last unit
    /// points below `min_commit_log_offset`. Units begin with their commit log
    /// offset.
    pub fn delete_expired_by_unit(
        &self,
        min_commit_log_offset: u64,
        unit_size: usize,
        destroy_timeout: Duration,
    ) -> usize {
        let candidates = {
            let segments = self.read();
            let n = segments.len().saturating_sub(1);
            segments[..n].to_vec()
        };

        let mut deleted = 0;
        for segment in candidates {
            let last_unit = match segment.select_region(self.segment_size - unit_size, unit_size) {
                Some(region) => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&region[..8]);
                    u64::from_be_bytes(raw)
                }
                None => {
                    warn!(path = ?segment.path(), "cannot read last unit of head segment");
                    break;
                }
            };
            if last_unit >= min_commit_log_offset {
                break;
            }
            segment.destroy(destroy_timeout);
            self.remove_head(&segment);
            deleted += 1;
        }
        if deleted > 0 {
            info!(dir = ?self.dir, deleted, "head segments below commit log min offset deleted");
        }
        deleted
    }

    /// Destroy a head segment left unavailable by an earlier pass.
    pub fn retry_delete_first(&self, destroy_timeout: Duration) -> bool {
        let Some(first) = self.first() else {
            return false;
        };
        if first.is_available() {
            return false;
        }
        warn!(path = ?first.path(), "retrying delete of pending head segment");
        let drained = first.destroy(destroy_timeout);
        self.remove_head(&first);
        drained
    }

    fn remove_head(&self, segment: &Arc<Segment>) {
        let mut segments = self.write();
        if let Some(pos) = segments.iter().position(|s| Arc::ptr_eq(s, segment)) {
            segments.remove(pos);
        }
    }

    /// Destroy every segment and remove the directory.
    pub fn destroy(&self, destroy_timeout: Duration) {
        let mut segments = self.write();
        for segment in segments.drain(..) {
            segment.destroy(destroy_timeout);
        }
        self.flushed_where.store(0, Ordering::Release);
        if let Err(e) = fs::remove_dir(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(dir = ?self.dir, error = %e, "segment directory not removed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(dir: &Path, size: usize) -> SegmentChain {
        SegmentChain::new(dir.to_path_buf(), size, None)
    }

    #[test]
    fn tail_rolls_into_contiguous_segments() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain(dir.path(), 64);
        let first = chain.tail(0).unwrap();
        assert!(first.append_bytes(&[1u8; 64]));
        let second = chain.tail(0).unwrap();
        assert_eq!(second.start_offset(), 64);
        assert!(dir.path().join("00000000000000000064").exists());

        assert_eq!(chain.find_by_offset(63).unwrap().start_offset(), 0);
        assert_eq!(chain.find_by_offset(64).unwrap().start_offset(), 64);
        assert!(chain.find_by_offset(128).is_none());
        assert_eq!(chain.max_offset(), 64);
    }

    #[test]
    fn empty_chain_starts_at_rounded_offset() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain(dir.path(), 100);
        let seg = chain.tail(250).unwrap();
        assert_eq!(seg.start_offset(), 200);
        assert_eq!(chain.min_offset(), 200);
    }

    #[test]
    fn load_rejects_wrong_sizes_and_gaps() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(segment_file_name(0)), vec![0u8; 32]).unwrap();
        let err = chain(dir.path(), 64).load().unwrap_err();
        assert!(matches!(err, StoreError::SegmentSize { actual: 32, .. }));

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(segment_file_name(0)), vec![0u8; 64]).unwrap();
        fs::write(dir.path().join(segment_file_name(128)), vec![0u8; 64]).unwrap();
        let err = chain(dir.path(), 64).load().unwrap_err();
        assert!(matches!(err, StoreError::SegmentNotContiguous { previous_end: 64, next_start: 128 }));

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("junk"), b"x").unwrap();
        assert!(matches!(chain(dir.path(), 64).load(), Err(StoreError::SegmentName(_))));
    }

    #[test]
    fn truncate_resets_containing_segment_and_drops_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain(dir.path(), 64);
        for _ in 0..3 {
            chain.tail(0).unwrap().append_bytes(&[7u8; 64]);
        }
        chain.truncate_after(70, Duration::from_millis(10));
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.max_offset(), 70);
        assert_eq!(chain.flushed_where(), 70);
        assert!(!dir.path().join(segment_file_name(128)).exists());

        chain.truncate_after(64, Duration::from_millis(10));
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.max_offset(), 64);
        assert_eq!(chain.tail(0).unwrap().start_offset(), 64);
    }

    #[test]
    fn emptied_chain_remembers_its_base() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain(dir.path(), 64);
        chain.tail(128).unwrap();
        chain.truncate_after(128, Duration::from_millis(10));
        assert!(chain.is_empty());
        assert_eq!(chain.max_offset(), 128);
        assert_eq!(chain.tail(0).unwrap().start_offset(), 128);
    }

    #[test]
    fn delete_expired_keeps_the_tail_and_respects_readers() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain(dir.path(), 64);
        for _ in 0..4 {
            chain.tail(0).unwrap().append_bytes(&[1u8; 64]);
        }
        let pinned = chain.first().unwrap().select_region(0, 8).unwrap();
        let policy = ExpirePolicy {
            retention: Duration::from_secs(3600),
            interval: Duration::ZERO,
            destroy_timeout: Duration::from_millis(10),
            clean_immediately: true,
            forced: false,
        };
        assert_eq!(chain.delete_expired(policy), 0, "head is referenced");
        assert!(!chain.first().unwrap().is_available());

        drop(pinned);
        assert!(chain.retry_delete_first(Duration::from_millis(10)));
        assert_eq!(chain.min_offset(), 64);

        assert_eq!(chain.delete_expired(policy), 2);
        assert_eq!(chain.len(), 1, "the last segment survives");
        assert_eq!(chain.min_offset(), 192);
    }

    #[test]
    fn retention_by_age_stops_at_fresh_segments() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain(dir.path(), 64);
        for _ in 0..3 {
            chain.tail(0).unwrap().append_bytes(&[1u8; 64]);
        }
        let policy = ExpirePolicy {
            retention: Duration::from_secs(3600),
            interval: Duration::ZERO,
            destroy_timeout: Duration::from_millis(10),
            clean_immediately: false,
            forced: false,
        };
        assert_eq!(chain.delete_expired(policy), 0);
        let expired = ExpirePolicy {
            retention: Duration::ZERO,
            ..policy
        };
        assert_eq!(chain.delete_expired(expired), 2);
    }

    #[test]
    fn unit_reclamation_follows_commit_log_min() {
        let dir = tempfile::tempdir().unwrap();
        // two units per segment
        let chain = chain(dir.path(), 40);
        for cl in [0u64, 100, 200, 300, 400, 500] {
            let mut unit = [0u8; 20];
            unit[..8].copy_from_slice(&cl.to_be_bytes());
            chain.tail(0).unwrap().append_bytes(&unit);
        }
        assert_eq!(chain.delete_expired_by_unit(250, 20, Duration::from_millis(10)), 1);
        assert_eq!(chain.min_offset(), 40);
        assert_eq!(chain.delete_expired_by_unit(1000, 20, Duration::from_millis(10)), 1);
        assert_eq!(chain.len(), 1);
    }
}
