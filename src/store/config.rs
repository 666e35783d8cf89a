use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Fixed width of one consume queue unit: commit log offset(8) + size(4) + tags code(8).
pub const CQ_UNIT_SIZE: usize = 20;

/// Fixed width of one transaction state unit:
/// commit log offset(8) + size(4) + timestamp(4) + producer group hash(4) + state(4).
pub const TS_UNIT_SIZE: usize = 24;

/// Page granularity used for dirty-page accounting.
pub const OS_PAGE_SIZE: usize = 4096;

/// Upper bound of segments removed by one retention pass.
pub const DELETE_FILES_BATCH_MAX: usize = 10;

/// How the commit log reaches durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushDiskType {
    /// Producers wait for a group commit before the put returns.
    SyncFlush,
    /// A background service flushes on an interval.
    AsyncFlush,
}

/// Replication role of this store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerRole {
    AsyncMaster,
    SyncMaster,
    Slave,
}

/// Store configuration. Every field has a default so a partial document
/// deserializes into a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory holding commit log, consume queues, checkpoint and abort marker.
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,

    /// Commit log segment size in bytes (default: 1GB)
    #[serde(default = "default_commit_log_segment_size")]
    pub commit_log_segment_size: usize,

    /// Consume queue segment size in bytes, rounded up to whole units when mapped (default: 300k units)
    #[serde(default = "default_consume_queue_segment_size")]
    pub consume_queue_segment_size: usize,

    /// Transaction state table segment size in bytes, rounded up to whole units when mapped (default: 2M units)
    #[serde(default = "default_transaction_segment_size")]
    pub transaction_segment_size: usize,

    /// Largest accepted encoded record (default: 4MB)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "default_flush_disk_type")]
    pub flush_disk_type: FlushDiskType,

    #[serde(default = "default_broker_role")]
    pub broker_role: BrokerRole,

    #[serde(default = "default_flush_interval_commit_log_ms")]
    pub flush_interval_commit_log_ms: u64,

    #[serde(default = "default_flush_commit_log_least_pages")]
    pub flush_commit_log_least_pages: usize,

    #[serde(default = "default_flush_commit_log_thorough_interval_ms")]
    pub flush_commit_log_thorough_interval_ms: u64,

    #[serde(default = "default_flush_interval_consume_queue_ms")]
    pub flush_interval_consume_queue_ms: u64,

    #[serde(default = "default_flush_consume_queue_least_pages")]
    pub flush_consume_queue_least_pages: usize,

    #[serde(default = "default_flush_consume_queue_thorough_interval_ms")]
    pub flush_consume_queue_thorough_interval_ms: u64,

    /// How long a synchronous put waits for its group commit.
    #[serde(default = "default_sync_flush_timeout_ms")]
    pub sync_flush_timeout_ms: u64,

    /// How long a synchronous-replication put waits for the replica ack.
    #[serde(default = "default_slave_timeout_ms")]
    pub slave_timeout_ms: u64,

    /// The write lock held longer than this marks the page cache busy.
    #[serde(default = "default_os_page_cache_busy_timeout_ms")]
    pub os_page_cache_busy_timeout_ms: u64,

    /// Segments older than this are eligible for retention.
    #[serde(default = "default_file_reserved_time_hours")]
    pub file_reserved_time_hours: u64,

    /// Semicolon separated local hours during which expired segments are deleted, e.g. "04;05".
    #[serde(default = "default_delete_when")]
    pub delete_when: String,

    /// Disk usage percentage above which retention starts regardless of the hour.
    #[serde(default = "default_disk_max_used_space_ratio")]
    pub disk_max_used_space_ratio: u32,

    /// Disk usage above this ratio marks the store disk-full and cleans forcibly.
    #[serde(default = "default_disk_space_warning_level_ratio")]
    pub disk_space_warning_level_ratio: f64,

    /// Disk usage above this ratio cleans forcibly.
    #[serde(default = "default_disk_space_clean_forcibly_ratio")]
    pub disk_space_clean_forcibly_ratio: f64,

    #[serde(default = "default_true")]
    pub clean_file_forcibly_enable: bool,

    #[serde(default = "default_clean_resource_interval_ms")]
    pub clean_resource_interval_ms: u64,

    #[serde(default = "default_delete_files_interval_ms")]
    pub delete_commit_log_files_interval_ms: u64,

    #[serde(default = "default_delete_files_interval_ms")]
    pub delete_consume_queue_files_interval_ms: u64,

    /// Grace period a segment destroy waits for readers to let go.
    #[serde(default = "default_destroy_segment_timeout_ms")]
    pub destroy_segment_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub check_crc_on_recover: bool,

    /// Number of tail segments scanned by a clean-shutdown recovery.
    #[serde(default = "default_normal_recover_segments")]
    pub normal_recover_segments: usize,

    /// Create the next commit log segment in the background.
    #[serde(default = "default_true")]
    pub preallocate_segments: bool,

    /// Touch every page of a freshly created commit log segment.
    #[serde(default)]
    pub warm_mapped_segments: bool,

    /// `mlock` warmed segments.
    #[serde(default)]
    pub lock_mapped_segments: bool,

    /// Dispatch only up to the offset confirmed by replication.
    #[serde(default)]
    pub duplication_enable: bool,

    #[serde(default = "default_true")]
    pub long_polling_enable: bool,

    /// Call the index collaborator for every dispatched record.
    #[serde(default = "default_true")]
    pub message_index_enable: bool,

    /// Maintain the transaction state table and redo log.
    #[serde(default = "default_true")]
    pub transaction_enable: bool,

    #[serde(default = "default_max_transfer_bytes_in_memory")]
    pub max_transfer_bytes_on_message_in_memory: usize,

    #[serde(default = "default_max_transfer_count_in_memory")]
    pub max_transfer_count_on_message_in_memory: usize,

    #[serde(default = "default_max_transfer_bytes_in_disk")]
    pub max_transfer_bytes_on_message_in_disk: usize,

    #[serde(default = "default_max_transfer_count_in_disk")]
    pub max_transfer_count_on_message_in_disk: usize,

    /// Percentage of physical memory assumed to hold hot commit log pages.
    #[serde(default = "default_access_message_in_memory_max_ratio")]
    pub access_message_in_memory_max_ratio: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            commit_log_segment_size: default_commit_log_segment_size(),
            consume_queue_segment_size: default_consume_queue_segment_size(),
            transaction_segment_size: default_transaction_segment_size(),
            max_message_size: default_max_message_size(),
            flush_disk_type: default_flush_disk_type(),
            broker_role: default_broker_role(),
            flush_interval_commit_log_ms: default_flush_interval_commit_log_ms(),
            flush_commit_log_least_pages: default_flush_commit_log_least_pages(),
            flush_commit_log_thorough_interval_ms: default_flush_commit_log_thorough_interval_ms(),
            flush_interval_consume_queue_ms: default_flush_interval_consume_queue_ms(),
            flush_consume_queue_least_pages: default_flush_consume_queue_least_pages(),
            flush_consume_queue_thorough_interval_ms:
                default_flush_consume_queue_thorough_interval_ms(),
            sync_flush_timeout_ms: default_sync_flush_timeout_ms(),
            slave_timeout_ms: default_slave_timeout_ms(),
            os_page_cache_busy_timeout_ms: default_os_page_cache_busy_timeout_ms(),
            file_reserved_time_hours: default_file_reserved_time_hours(),
            delete_when: default_delete_when(),
            disk_max_used_space_ratio: default_disk_max_used_space_ratio(),
            disk_space_warning_level_ratio: default_disk_space_warning_level_ratio(),
            disk_space_clean_forcibly_ratio: default_disk_space_clean_forcibly_ratio(),
            clean_file_forcibly_enable: true,
            clean_resource_interval_ms: default_clean_resource_interval_ms(),
            delete_commit_log_files_interval_ms: default_delete_files_interval_ms(),
            delete_consume_queue_files_interval_ms: default_delete_files_interval_ms(),
            destroy_segment_timeout_ms: default_destroy_segment_timeout_ms(),
            check_crc_on_recover: true,
            normal_recover_segments: default_normal_recover_segments(),
            preallocate_segments: true,
            warm_mapped_segments: false,
            lock_mapped_segments: false,
            duplication_enable: false,
            long_polling_enable: true,
            message_index_enable: true,
            transaction_enable: true,
            max_transfer_bytes_on_message_in_memory: default_max_transfer_bytes_in_memory(),
            max_transfer_count_on_message_in_memory: default_max_transfer_count_in_memory(),
            max_transfer_bytes_on_message_in_disk: default_max_transfer_bytes_in_disk(),
            max_transfer_count_on_message_in_disk: default_max_transfer_count_in_disk(),
            access_message_in_memory_max_ratio: default_access_message_in_memory_max_ratio(),
        }
    }
}

impl StoreConfig {
    /// Default configuration rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            store_root: root.into(),
            ..Default::default()
        }
    }

    pub fn sync_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_flush_timeout_ms)
    }

    pub fn slave_timeout(&self) -> Duration {
        Duration::from_millis(self.slave_timeout_ms)
    }

    pub fn destroy_segment_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_segment_timeout_ms)
    }

    pub fn file_reserved_time(&self) -> Duration {
        Duration::from_secs(self.file_reserved_time_hours.saturating_mul(3600))
    }

    /// Local hours listed in `delete_when`; unparsable entries are ignored.
    pub fn delete_when_hours(&self) -> Vec<u32> {
        self.delete_when
            .split(';')
            .filter_map(|h| h.trim().parse::<u32>().ok())
            .filter(|h| *h < 24)
            .collect()
    }

    /// Consume queue segment size rounded up to whole units.
    pub fn consume_queue_mapped_size(&self) -> usize {
        round_up_to_units(self.consume_queue_segment_size, CQ_UNIT_SIZE)
    }

    /// Transaction state segment size rounded up to whole units.
    pub fn transaction_mapped_size(&self) -> usize {
        round_up_to_units(self.transaction_segment_size, TS_UNIT_SIZE)
    }

    pub fn is_slave(&self) -> bool {
        self.broker_role == BrokerRole::Slave
    }
}

fn round_up_to_units(size: usize, unit: usize) -> usize {
    size.div_ceil(unit).max(1) * unit
}

fn default_store_root() -> PathBuf {
    PathBuf::from("./store")
}

fn default_commit_log_segment_size() -> usize {
    1024 * 1024 * 1024 // 1GB
}

fn default_consume_queue_segment_size() -> usize {
    300_000 * CQ_UNIT_SIZE
}

fn default_transaction_segment_size() -> usize {
    2_000_000 * TS_UNIT_SIZE
}

fn default_max_message_size() -> usize {
    4 * 1024 * 1024 // 4MB
}

fn default_flush_disk_type() -> FlushDiskType {
    FlushDiskType::AsyncFlush
}

fn default_broker_role() -> BrokerRole {
    BrokerRole::AsyncMaster
}

fn default_flush_interval_commit_log_ms() -> u64 {
    500
}

fn default_flush_commit_log_least_pages() -> usize {
    4
}

fn default_flush_commit_log_thorough_interval_ms() -> u64 {
    10_000
}

fn default_flush_interval_consume_queue_ms() -> u64 {
    1000
}

fn default_flush_consume_queue_least_pages() -> usize {
    2
}

fn default_flush_consume_queue_thorough_interval_ms() -> u64 {
    60_000
}

fn default_sync_flush_timeout_ms() -> u64 {
    5000
}

fn default_slave_timeout_ms() -> u64 {
    3000
}

fn default_os_page_cache_busy_timeout_ms() -> u64 {
    1000
}

fn default_file_reserved_time_hours() -> u64 {
    72
}

fn default_delete_when() -> String {
    "04".to_string()
}

fn default_disk_max_used_space_ratio() -> u32 {
    75
}

fn default_disk_space_warning_level_ratio() -> f64 {
    0.90
}

fn default_disk_space_clean_forcibly_ratio() -> f64 {
    0.85
}

fn default_clean_resource_interval_ms() -> u64 {
    10_000
}

fn default_delete_files_interval_ms() -> u64 {
    100
}

fn default_destroy_segment_timeout_ms() -> u64 {
    1000
}

fn default_normal_recover_segments() -> usize {
    3
}

fn default_max_transfer_bytes_in_memory() -> usize {
    256 * 1024
}

fn default_max_transfer_count_in_memory() -> usize {
    32
}

fn default_max_transfer_bytes_in_disk() -> usize {
    64 * 1024
}

fn default_max_transfer_count_in_disk() -> usize {
    8
}

fn default_access_message_in_memory_max_ratio() -> u32 {
    40
}

fn default_true() -> bool {
    true
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

/// 31-multiplier string hash used for tags codes and producer group hashes.
pub fn hash_code(s: &str) -> i32 {
    s.bytes()
        .fold(0i32, |h, b| h.wrapping_mul(31).wrapping_add(b as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_fills_defaults() {
        let cfg: StoreConfig =
            serde_json::from_str(r#"{"store_root":"/tmp/x","flush_disk_type":"sync_flush"}"#)
                .unwrap();
        assert_eq!(cfg.store_root, PathBuf::from("/tmp/x"));
        assert_eq!(cfg.flush_disk_type, FlushDiskType::SyncFlush);
        assert_eq!(cfg.consume_queue_segment_size % CQ_UNIT_SIZE, 0);
        assert_eq!(cfg.normal_recover_segments, 3);
        assert!(cfg.check_crc_on_recover);
    }

    #[test]
    fn delete_when_skips_garbage() {
        let cfg = StoreConfig {
            delete_when: "04; 05;xx;25".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.delete_when_hours(), vec![4, 5]);
    }

    #[test]
    fn unit_segments_round_up_to_whole_units() {
        let cfg = StoreConfig {
            consume_queue_segment_size: 1010,
            transaction_segment_size: 1000,
            ..Default::default()
        };
        assert_eq!(cfg.consume_queue_mapped_size(), 1020);
        assert_eq!(cfg.transaction_mapped_size(), 1008);

        let tiny = StoreConfig {
            consume_queue_segment_size: 0,
            transaction_segment_size: 24 * 8,
            ..Default::default()
        };
        assert_eq!(tiny.consume_queue_mapped_size(), CQ_UNIT_SIZE);
        assert_eq!(tiny.transaction_mapped_size(), 24 * 8);
    }

    #[test]
    fn hash_code_matches_known_values() {
        assert_eq!(hash_code(""), 0);
        assert_eq!(hash_code("a"), 97);
        assert_eq!(hash_code("ab"), 97 * 31 + 98);
    }
}
