use crate::store::error::StoreResult;
use crate::store::segment::Segment;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

struct Preallocated {
    path: PathBuf,
    segment: Arc<Segment>,
}

/// Keeps the next commit log segment created (and optionally warmed) ahead of
/// time so a roll under the write lock only swaps in a ready mapping.
#[derive(Clone)]
pub struct SegmentAllocator {
    slot: Arc<Mutex<Option<Preallocated>>>,
    stopped: Arc<AtomicBool>,
    warm: bool,
    lock: bool,
}

impl SegmentAllocator {
    pub fn new(warm: bool, lock: bool) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            stopped: Arc::new(AtomicBool::new(false)),
            warm,
            lock,
        }
    }

    fn create(&self, path: &Path, start_offset: u64, capacity: usize) -> StoreResult<Arc<Segment>> {
        let segment = Segment::create(path, start_offset, capacity)?;
        if self.warm {
            segment.warm_up(self.lock);
        }
        Ok(segment)
    }

    fn take(&self) -> Option<Preallocated> {
        match self.slot.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn replenish(&self, path: PathBuf, start_offset: u64, capacity: usize) {
        {
            let guard = match self.slot.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            if guard.is_some() || self.stopped.load(Ordering::Acquire) {
                return;
            }
        }
        let segment = match self.create(&path, start_offset, capacity) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = ?path, error = %e, "segment preallocation failed");
                return;
            }
        };
        let mut guard = match self.slot.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_none() && !self.stopped.load(Ordering::Acquire) {
            debug!(path = ?path, "segment preallocated");
            *guard = Some(Preallocated { path, segment });
        } else {
            // lost the race or stopped meanwhile; drop the stray file
            drop(guard);
            segment.destroy(Duration::from_secs(1));
        }
    }

    /// Hand out the segment at `path`, creating it inline if it was not
    /// prepared, and start preparing `next_path`.
    pub(crate) fn obtain(
        &self,
        path: &Path,
        start_offset: u64,
        capacity: usize,
    ) -> StoreResult<Arc<Segment>> {
        let ready = match self.take() {
            Some(pre) if pre.path == path && pre.segment.capacity() == capacity => {
                Some(pre.segment)
            }
            Some(stale) => {
                debug!(path = ?stale.path, "discarding stale preallocated segment");
                stale.segment.destroy(Duration::from_secs(1));
                None
            }
            None => None,
        };

        let segment = match ready {
            Some(s) => s,
            None => self.create(path, start_offset, capacity)?,
        };

        if !self.stopped.load(Ordering::Acquire) {
            let next_start = start_offset + capacity as u64;
            let next_path = path.with_file_name(crate::store::paths::segment_file_name(next_start));
            let myself = self.clone();
            let spawned = std::thread::Builder::new()
                .name("segment-allocator".into())
                .spawn(move || myself.replenish(next_path, next_start, capacity));
            if let Err(e) = spawned {
                warn!(error = %e, "failed to spawn segment allocator");
            }
        }
        Ok(segment)
    }

    /// Stop preparing segments and remove one that was prepared but never used.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(pre) = self.take() {
            pre.segment.destroy(Duration::from_secs(1));
        }
    }
}
