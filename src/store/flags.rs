use std::sync::atomic::{AtomicU32, Ordering};

const NOT_READABLE: u32 = 1;
const NOT_WRITEABLE: u32 = 1 << 1;
const WRITE_LOGICS_QUEUE_ERROR: u32 = 1 << 2;
const WRITE_INDEX_FILE_ERROR: u32 = 1 << 3;
const DISK_FULL: u32 = 1 << 4;

/// Store health bits consulted by the admission checks.
#[derive(Debug, Default)]
pub struct RunningFlags {
    bits: AtomicU32,
}

impl RunningFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bits(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    fn set(&self, bit: u32) {
        self.bits.fetch_or(bit, Ordering::AcqRel);
    }

    fn clear(&self, bit: u32) {
        self.bits.fetch_and(!bit, Ordering::AcqRel);
    }

    fn is_clear(&self, bit: u32) -> bool {
        self.bits() & bit == 0
    }

    pub fn is_readable(&self) -> bool {
        self.is_clear(NOT_READABLE)
    }

    pub fn make_readable(&self, readable: bool) {
        if readable {
            self.clear(NOT_READABLE)
        } else {
            self.set(NOT_READABLE)
        }
    }

    /// Writeable unless explicitly disabled, a queue or index write failed, or
    /// the disk is full.
    pub fn is_writeable(&self) -> bool {
        self.is_clear(NOT_WRITEABLE | WRITE_LOGICS_QUEUE_ERROR | DISK_FULL | WRITE_INDEX_FILE_ERROR)
    }

    pub fn make_writeable(&self, writeable: bool) {
        if writeable {
            self.clear(NOT_WRITEABLE)
        } else {
            self.set(NOT_WRITEABLE)
        }
    }

    pub fn make_logics_queue_error(&self) {
        self.set(WRITE_LOGICS_QUEUE_ERROR)
    }

    pub fn is_logics_queue_error(&self) -> bool {
        !self.is_clear(WRITE_LOGICS_QUEUE_ERROR)
    }

    pub fn make_index_file_error(&self) {
        self.set(WRITE_INDEX_FILE_ERROR)
    }

    pub fn is_index_file_error(&self) -> bool {
        !self.is_clear(WRITE_INDEX_FILE_ERROR)
    }

    /// Returns whether the disk was already marked full.
    pub fn get_and_make_disk_full(&self) -> bool {
        self.bits.fetch_or(DISK_FULL, Ordering::AcqRel) & DISK_FULL != 0
    }

    /// Returns whether the disk was marked full.
    pub fn get_and_make_disk_ok(&self) -> bool {
        self.bits.fetch_and(!DISK_FULL, Ordering::AcqRel) & DISK_FULL != 0
    }

    pub fn is_disk_full(&self) -> bool {
        !self.is_clear(DISK_FULL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_full_blocks_writes() {
        let flags = RunningFlags::new();
        assert!(flags.is_writeable() && flags.is_readable());
        assert!(!flags.get_and_make_disk_full());
        assert!(flags.get_and_make_disk_full());
        assert!(!flags.is_writeable());
        assert!(flags.get_and_make_disk_ok());
        assert!(flags.is_writeable());
    }

    #[test]
    fn queue_error_sticks() {
        let flags = RunningFlags::new();
        flags.make_logics_queue_error();
        assert!(flags.is_logics_queue_error());
        assert!(!flags.is_writeable());
        flags.make_writeable(true);
        assert!(!flags.is_writeable());
    }
}
