use crate::store::error::{StoreError, StoreResult};
use crate::store::config::OS_PAGE_SIZE;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

/// Records older than this before the checkpoint are rescanned after a crash.
const MIN_TIMESTAMP_SLACK_MS: u64 = 3000;

/// Last-flushed store timestamps of the commit log, the consume queues and the
/// index, persisted as three big-endian u64 at offsets 0, 8 and 16.
pub struct StoreCheckpoint {
    path: PathBuf,
    mapping: Mutex<MmapMut>,
    physic_msg_timestamp: AtomicU64,
    logics_msg_timestamp: AtomicU64,
    index_msg_timestamp: AtomicU64,
}

impl StoreCheckpoint {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < OS_PAGE_SIZE as u64 {
            file.set_len(OS_PAGE_SIZE as u64)?;
        }
        // SAFETY: the checkpoint file is private to this store instance.
        let mapping = unsafe { MmapMut::map_mut(&file)? };

        let read = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&mapping[at..at + 8]);
            u64::from_be_bytes(raw)
        };
        let (physic, logics, index) = (read(0), read(8), read(16));
        if existed {
            info!(physic, logics, index, "checkpoint loaded");
        } else {
            warn!(path = ?path, "checkpoint file missing, starting from zero");
        }

        Ok(Self {
            path: path.to_path_buf(),
            physic_msg_timestamp: AtomicU64::new(physic),
            logics_msg_timestamp: AtomicU64::new(logics),
            index_msg_timestamp: AtomicU64::new(index),
            mapping: Mutex::new(mapping),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn physic_msg_timestamp(&self) -> u64 {
        self.physic_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn set_physic_msg_timestamp(&self, ts: u64) {
        self.physic_msg_timestamp.store(ts, Ordering::Release);
    }

    pub fn logics_msg_timestamp(&self) -> u64 {
        self.logics_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn set_logics_msg_timestamp(&self, ts: u64) {
        self.logics_msg_timestamp.store(ts, Ordering::Release);
    }

    pub fn index_msg_timestamp(&self) -> u64 {
        self.index_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn set_index_msg_timestamp(&self, ts: u64) {
        self.index_msg_timestamp.store(ts, Ordering::Release);
    }

    /// Records stored at or before this instant are known to be indexed.
    pub fn min_timestamp(&self) -> u64 {
        self.physic_msg_timestamp()
            .min(self.logics_msg_timestamp())
            .saturating_sub(MIN_TIMESTAMP_SLACK_MS)
    }

    /// Like `min_timestamp`, also bounded by the index timestamp.
    pub fn min_timestamp_index(&self) -> u64 {
        self.min_timestamp().min(self.index_msg_timestamp())
    }

    pub fn flush(&self) -> StoreResult<()> {
        let mut mapping = self
            .mapping
            .lock()
            .map_err(|_| StoreError::Poisoned("checkpoint"))?;
        mapping[0..8].copy_from_slice(&self.physic_msg_timestamp().to_be_bytes());
        mapping[8..16].copy_from_slice(&self.logics_msg_timestamp().to_be_bytes());
        mapping[16..24].copy_from_slice(&self.index_msg_timestamp().to_be_bytes());
        mapping.flush_range(0, 24)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_three_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint");
        {
            let cp = StoreCheckpoint::open(&path).unwrap();
            cp.set_physic_msg_timestamp(10_000);
            cp.set_logics_msg_timestamp(9_000);
            cp.set_index_msg_timestamp(8_000);
            cp.flush().unwrap();
        }
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[0..8], &10_000u64.to_be_bytes());
        assert_eq!(&raw[16..24], &8_000u64.to_be_bytes());

        let cp = StoreCheckpoint::open(&path).unwrap();
        assert_eq!(cp.logics_msg_timestamp(), 9_000);
        assert_eq!(cp.min_timestamp(), 6_000);
        assert_eq!(cp.min_timestamp_index(), 6_000);
    }

    #[test]
    fn min_timestamp_saturates() {
        let dir = tempfile::tempdir().unwrap();
        let cp = StoreCheckpoint::open(&dir.path().join("checkpoint")).unwrap();
        cp.set_physic_msg_timestamp(1000);
        cp.set_logics_msg_timestamp(5000);
        assert_eq!(cp.min_timestamp(), 0);
    }
}
