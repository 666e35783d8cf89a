#![allow(dead_code)]

use mqstore::{Collaborators, FlushDiskType, Message, StoreConfig, StoreEngine};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[macro_export]
macro_rules! test_println {
    ($($arg:tt)*) => {
        if std::env::var("MQSTORE_QUIET").is_err() {
            println!($($arg)*);
        }
    };
}

/// Fixed part of every encoded record; a record is this plus topic, body and properties.
pub const RECORD_OVERHEAD: usize = 91;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A store root that disappears with the test.
pub struct TestEnv {
    dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        init_tracing();
        Self {
            dir: tempfile::tempdir().expect("failed to create store root"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn commit_log_dir(&self) -> PathBuf {
        self.root().join("commitlog")
    }

    pub fn abort_path(&self) -> PathBuf {
        self.root().join("abort")
    }

    /// Small segments and no scheduled cleanup, so tests control retention.
    pub fn config(&self) -> StoreConfig {
        let mut config = StoreConfig::with_root(self.root());
        config.commit_log_segment_size = 1024;
        config.consume_queue_segment_size = 20 * 64;
        config.transaction_segment_size = 24 * 64;
        config.flush_disk_type = FlushDiskType::AsyncFlush;
        config.flush_interval_commit_log_ms = 10;
        config.flush_interval_consume_queue_ms = 10;
        config.clean_resource_interval_ms = 3_600_000;
        config.destroy_segment_timeout_ms = 50;
        config.preallocate_segments = false;
        config.delete_when = "".to_string();
        // the host disk usage must not trigger cleanup or suspend writes
        config.disk_max_used_space_ratio = 100;
        config.disk_space_warning_level_ratio = 1.0;
        config.disk_space_clean_forcibly_ratio = 1.0;
        config
    }

    pub fn open(&self, config: StoreConfig) -> StoreEngine {
        self.open_with(config, Collaborators::default())
    }

    pub fn open_with(&self, config: StoreConfig, collaborators: Collaborators) -> StoreEngine {
        let store = StoreEngine::new(config, collaborators).expect("store init");
        store.load().expect("store load");
        store
    }

    pub fn start(&self, config: StoreConfig) -> StoreEngine {
        let store = self.open(config);
        store.start().expect("store start");
        store
    }
}

/// A message whose encoded record is exactly `len` bytes.
pub fn sized_message(topic: &str, queue_id: i32, len: usize) -> Message {
    let body_len = len - RECORD_OVERHEAD - topic.len();
    Message::new(topic.to_string(), queue_id, vec![b'x'; body_len])
}

pub fn wait_dispatched(store: &StoreEngine) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while store.dispatch_behind_bytes() > 0 {
        assert!(Instant::now() < deadline, "dispatcher did not catch up");
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}
