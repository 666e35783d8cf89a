//! One fixed-size memory-mapped segment file.
//!
//! A segment is written by exactly one appender (its chain's writer, under the
//! caller's lock) and read concurrently by any number of readers. Readers never
//! look past `write_pos`, so they cannot observe a record that is still being
//! copied in. Lifetime of the mapping is governed by an explicit reference
//! count: the segment starts with one "owner" hold, every read view or flush
//! takes another, and the mapping is dropped at the single point where the
//! count reaches zero, which can only happen after `destroy` released the
//! owner hold.

use crate::store::config::{now_millis, OS_PAGE_SIZE};
use crate::store::error::StoreResult;
use crate::store::os;
use crate::store::paths::create_segment_file;
use memmap2::MmapRaw;
use std::fs::{self, OpenOptions};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Result of handing the tail of a segment to a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    Ok,
    /// The record does not fit; the writer padded the remainder and the
    /// caller must roll to a new segment.
    InsufficientSpace,
    MessageTooLarge,
    PropertiesSizeExceeded,
    UnknownError,
}

/// What a writer callback reports back to `Segment::append`.
#[derive(Debug, Clone, Copy)]
pub struct AppendOutcome<T> {
    pub status: AppendStatus,
    /// Bytes consumed from the tail, including padding on `InsufficientSpace`.
    pub wrote_bytes: usize,
    pub value: T,
}

pub struct Segment {
    path: PathBuf,
    start_offset: u64,
    capacity: usize,
    write_pos: AtomicUsize,
    flush_pos: AtomicUsize,
    refs: AtomicI64,
    available: AtomicBool,
    cleanup_over: AtomicBool,
    unlinked: AtomicBool,
    locked: AtomicBool,
    mapping: Mutex<Option<MmapRaw>>,
    base: *mut u8,
    store_timestamp: AtomicU64,
    last_modified: AtomicU64,
}

// SAFETY: `base` points into `mapping`, which stays alive until the reference
// count reaches zero. Every dereference of `base` happens while the caller
// holds a reference (`hold`), and the only writer is serialized by the owning
// chain; readers and the writer touch disjoint ranges split at `write_pos`.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create and map a new zero-filled segment file.
    pub(crate) fn create(path: &Path, start_offset: u64, capacity: usize) -> StoreResult<Arc<Self>> {
        let file = create_segment_file(path, capacity as u64)?;
        let mapping = MmapRaw::map_raw(&file)?;
        debug!(path = ?path, start_offset, capacity, "segment created");
        Ok(Arc::new(Self::from_mapping(
            path.to_path_buf(),
            start_offset,
            capacity,
            mapping,
            now_millis(),
        )))
    }

    /// Map an existing segment file. Cursors start at zero; the loading chain
    /// moves them once recovery has decided how much of the file is valid.
    pub(crate) fn open(path: &Path, start_offset: u64, capacity: usize) -> StoreResult<Arc<Self>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let modified = file
            .metadata()?
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or_else(now_millis);
        let mapping = MmapRaw::map_raw(&file)?;
        Ok(Arc::new(Self::from_mapping(
            path.to_path_buf(),
            start_offset,
            capacity,
            mapping,
            modified,
        )))
    }

    fn from_mapping(
        path: PathBuf,
        start_offset: u64,
        capacity: usize,
        mapping: MmapRaw,
        last_modified: u64,
    ) -> Self {
        let base = mapping.as_mut_ptr();
        Self {
            path,
            start_offset,
            capacity,
            write_pos: AtomicUsize::new(0),
            flush_pos: AtomicUsize::new(0),
            refs: AtomicI64::new(1),
            available: AtomicBool::new(true),
            cleanup_over: AtomicBool::new(false),
            unlinked: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            mapping: Mutex::new(Some(mapping)),
            base,
            store_timestamp: AtomicU64::new(0),
            last_modified: AtomicU64::new(last_modified),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.capacity as u64
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos.load(Ordering::Acquire)
    }

    /// Highest position readers may see.
    pub fn read_pos(&self) -> usize {
        self.write_pos()
    }

    pub fn flush_pos(&self) -> usize {
        self.flush_pos.load(Ordering::Acquire)
    }

    pub(crate) fn set_write_pos(&self, pos: usize) {
        self.write_pos.store(pos.min(self.capacity), Ordering::Release);
    }

    pub(crate) fn set_flush_pos(&self, pos: usize) {
        self.flush_pos.store(pos.min(self.capacity), Ordering::Release);
    }

    pub fn is_full(&self) -> bool {
        self.write_pos() >= self.capacity
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn is_cleanup_over(&self) -> bool {
        self.cleanup_over.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn store_timestamp(&self) -> u64 {
        self.store_timestamp.load(Ordering::Acquire)
    }

    pub(crate) fn set_store_timestamp(&self, ts: u64) {
        self.store_timestamp.store(ts, Ordering::Release);
    }

    pub fn last_modified(&self) -> u64 {
        self.last_modified.load(Ordering::Acquire)
    }

    /// Take a reference. Fails once the segment has been asked to shut down.
    pub(crate) fn hold(&self) -> bool {
        if !self.is_available() {
            return false;
        }
        if self.refs.fetch_add(1, Ordering::AcqRel) > 0 {
            return true;
        }
        // the count already reached zero, cleanup owns the mapping now
        self.refs.fetch_sub(1, Ordering::AcqRel);
        false
    }

    pub(crate) fn release(&self) {
        let remaining = self.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 {
            return;
        }
        if remaining == 0 {
            self.cleanup();
        }
    }

    fn cleanup(&self) {
        let mapping = match self.mapping.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mapping) = mapping {
            if self.locked.swap(false, Ordering::AcqRel) {
                if let Err(e) = os::munlock(mapping.as_ptr(), mapping.len()) {
                    debug!(path = ?self.path, error = %e, "munlock failed");
                }
            }
            drop(mapping);
            debug!(path = ?self.path, "segment unmapped");
        }
        self.cleanup_over.store(true, Ordering::Release);
    }

    /// Hand `[write_pos, min(capacity, write_pos + limit))` to `writer`, which
    /// receives the writable slice and the absolute offset of its first byte.
    /// Single writer only.
    pub(crate) fn append<T, F>(&self, limit: usize, writer: F) -> AppendOutcome<Option<T>>
    where
        F: FnOnce(&mut [u8], u64) -> AppendOutcome<T>,
    {
        let current = self.write_pos();
        if current >= self.capacity || !self.hold() {
            return AppendOutcome {
                status: AppendStatus::UnknownError,
                wrote_bytes: 0,
                value: None,
            };
        }
        let window = (self.capacity - current).min(limit);
        // SAFETY: we hold a reference so the mapping is alive, and the window
        // lies past `write_pos`, where no reader looks.
        let tail = unsafe { std::slice::from_raw_parts_mut(self.base.add(current), window) };
        let outcome = writer(tail, self.start_offset + current as u64);
        let wrote = outcome.wrote_bytes.min(window);
        if wrote > 0 {
            self.write_pos.fetch_add(wrote, Ordering::AcqRel);
            self.last_modified.store(now_millis(), Ordering::Release);
        }
        self.release();
        AppendOutcome {
            status: outcome.status,
            wrote_bytes: wrote,
            value: Some(outcome.value),
        }
    }

    /// Append raw bytes; false when they do not fit.
    pub(crate) fn append_bytes(&self, data: &[u8]) -> bool {
        let current = self.write_pos();
        if current + data.len() > self.capacity || !self.hold() {
            return false;
        }
        // SAFETY: reference held, destination past `write_pos` and inside the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(current), data.len());
        }
        self.write_pos.fetch_add(data.len(), Ordering::AcqRel);
        self.last_modified.store(now_millis(), Ordering::Release);
        self.release();
        true
    }

    /// Rewrite already written bytes in place. Used for state fields that
    /// change after the unit was appended.
    pub(crate) fn overwrite(&self, pos: usize, data: &[u8]) -> bool {
        if pos + data.len() > self.write_pos() || !self.hold() {
            return false;
        }
        // SAFETY: reference held and the range is inside the written area.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(pos), data.len());
        }
        self.last_modified.store(now_millis(), Ordering::Release);
        // the flush cursor must revisit the rewritten page
        self.flush_pos.fetch_min(pos, Ordering::AcqRel);
        self.release();
        true
    }

    fn is_able_to_flush(&self, least_pages: usize) -> bool {
        let flush = self.flush_pos();
        let write = self.write_pos();
        if write <= flush {
            return false;
        }
        if self.is_full() {
            return true;
        }
        if least_pages > 0 {
            return write / OS_PAGE_SIZE - flush / OS_PAGE_SIZE >= least_pages;
        }
        true
    }

    /// Force dirty pages in `[flush_pos, write_pos)` to disk when at least
    /// `least_pages` are dirty (any amount when zero, always when full).
    /// Returns the flush position afterwards.
    pub(crate) fn commit(&self, least_pages: usize) -> usize {
        if !self.is_able_to_flush(least_pages) {
            return self.flush_pos();
        }
        if !self.hold() {
            // going away; nothing left worth flushing
            warn!(path = ?self.path, "segment unavailable during flush, skipping");
            self.flush_pos.store(self.write_pos(), Ordering::Release);
            return self.flush_pos();
        }
        let target = self.write_pos();
        let from = self.flush_pos();
        let result = match self.mapping.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(mapping) => mapping.flush_range(from, target - from),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        };
        match result {
            Ok(()) => self.flush_pos.store(target, Ordering::Release),
            Err(e) => warn!(path = ?self.path, error = %e, "segment flush failed"),
        }
        self.release();
        self.flush_pos()
    }

    /// Zero-copy view of `[pos, pos + size)`; `None` unless fully written.
    pub fn select_region(self: &Arc<Self>, pos: usize, size: usize) -> Option<SelectedRegion> {
        let read_pos = self.read_pos();
        if size == 0 || pos.checked_add(size)? > read_pos {
            return None;
        }
        if !self.hold() {
            return None;
        }
        Some(SelectedRegion {
            segment: Arc::clone(self),
            pos,
            len: size,
        })
    }

    /// Zero-copy view from `pos` to the current read position.
    pub fn select_region_from(self: &Arc<Self>, pos: usize) -> Option<SelectedRegion> {
        let read_pos = self.read_pos();
        if pos >= read_pos {
            return None;
        }
        self.select_region(pos, read_pos - pos)
    }

    /// Touch every page so later appends do not fault, optionally pinning the
    /// whole mapping in memory.
    pub(crate) fn warm_up(&self, lock: bool) {
        if !self.hold() {
            return;
        }
        let started = Instant::now();
        let mut pos = 0;
        while pos < self.capacity {
            // SAFETY: reference held, the segment is fresh so nobody reads it yet
            unsafe { std::ptr::write_volatile(self.base.add(pos), 0u8) };
            pos += OS_PAGE_SIZE;
        }
        if let Err(e) = os::advise_will_need(self.base, self.capacity) {
            debug!(path = ?self.path, error = %e, "madvise failed");
        }
        if lock {
            match os::mlock(self.base, self.capacity) {
                Ok(()) => self.locked.store(true, Ordering::Release),
                Err(e) => warn!(path = ?self.path, error = %e, "mlock failed"),
            }
        }
        self.release();
        debug!(path = ?self.path, elapsed_ms = started.elapsed().as_millis() as u64, "segment warmed");
    }

    /// Stop handing out references and drop the owner hold. The mapping goes
    /// away as soon as outstanding readers let go; the file stays on disk.
    pub(crate) fn shutdown(&self) {
        if self.available.swap(false, Ordering::AcqRel) {
            self.release();
        }
    }

    /// Stop handing out references, wait up to `timeout` for outstanding ones
    /// to drain, then unlink the file. The mapping goes away when the last
    /// reference is released. Returns whether that already happened.
    pub fn destroy(&self, timeout: Duration) -> bool {
        self.shutdown();

        let started = Instant::now();
        let mut backoff = Duration::from_millis(1);
        while !self.is_cleanup_over() && started.elapsed() < timeout {
            std::thread::sleep(backoff.min(timeout.saturating_sub(started.elapsed())));
            backoff = (backoff * 2).min(Duration::from_millis(50));
        }

        if !self.unlinked.swap(true, Ordering::AcqRel) {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = ?self.path, error = %e, "segment unlink failed"),
            }
        }

        if self.is_cleanup_over() {
            info!(
                path = ?self.path,
                write_pos = self.write_pos(),
                flush_pos = self.flush_pos(),
                "segment destroyed"
            );
            true
        } else {
            warn!(
                path = ?self.path,
                refs = self.ref_count(),
                "segment still referenced after destroy timeout, unmap deferred to last reader"
            );
            false
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("start_offset", &self.start_offset)
            .field("write_pos", &self.write_pos())
            .field("flush_pos", &self.flush_pos())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// A referenced, zero-copy window into a segment. Dropping it releases the reference.
pub struct SelectedRegion {
    segment: Arc<Segment>,
    pos: usize,
    len: usize,
}

impl SelectedRegion {
    /// Absolute offset of the first byte in the owning chain.
    pub fn start_offset(&self) -> u64 {
        self.segment.start_offset + self.pos as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region holds a reference, so the mapping is alive, and
        // `[pos, pos + len)` was below `write_pos` when selected.
        unsafe { std::slice::from_raw_parts(self.segment.base.add(self.pos), self.len) }
    }
}

impl Deref for SelectedRegion {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for SelectedRegion {
    fn drop(&mut self) {
        self.segment.release();
    }
}

impl std::fmt::Debug for SelectedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedRegion")
            .field("start_offset", &self.start_offset())
            .field("len", &self.len)
            .finish()
    }
}
