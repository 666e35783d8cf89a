mod common;

use common::TestEnv;
use mqstore::{BrokerRole, Collaborators, FlushDiskType, StoreConfig, StoreEngine, StoreError};
use std::time::Duration;

#[test]
fn partial_documents_fill_in_defaults() {
    let config: StoreConfig = serde_json::from_str(
        r#"{
            "store_root": "/data/mq",
            "flush_disk_type": "sync_flush",
            "broker_role": "sync_master",
            "delete_when": "04;16"
        }"#,
    )
    .unwrap();

    let defaults = StoreConfig::default();
    assert_eq!(config.store_root, std::path::PathBuf::from("/data/mq"));
    assert_eq!(config.flush_disk_type, FlushDiskType::SyncFlush);
    assert_eq!(config.broker_role, BrokerRole::SyncMaster);
    assert_eq!(config.delete_when_hours(), vec![4, 16]);
    assert_eq!(config.commit_log_segment_size, defaults.commit_log_segment_size);
    assert_eq!(config.consume_queue_segment_size % 20, 0);
    assert_eq!(config.sync_flush_timeout(), defaults.sync_flush_timeout());
    assert!(!config.is_slave());
}

#[test]
fn config_round_trips_through_json() {
    let mut config = StoreConfig::with_root("/tmp/x");
    config.file_reserved_time_hours = 1;
    config.broker_role = BrokerRole::Slave;
    let json = serde_json::to_string(&config).unwrap();
    let back: StoreConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back.file_reserved_time(), Duration::from_secs(3600));
    assert!(back.is_slave());
}

#[test]
fn unparsable_delete_hours_are_ignored() {
    let mut config = StoreConfig::default();
    config.delete_when = "04; x ;25;7".to_string();
    assert_eq!(config.delete_when_hours(), vec![4, 7]);
}

#[test]
fn start_requires_a_successful_load() {
    let env = TestEnv::new();
    let store = StoreEngine::new(env.config(), Collaborators::default()).unwrap();
    assert!(matches!(store.start(), Err(StoreError::NotLoaded)));
    store.load().unwrap();
    store.start().unwrap();
    store.shutdown();
    assert!(matches!(store.start(), Err(StoreError::Shutdown)));
}

#[test]
fn load_rejects_a_mis_sized_segment() {
    let env = TestEnv::new();
    std::fs::create_dir_all(env.commit_log_dir()).unwrap();
    std::fs::write(env.commit_log_dir().join("00000000000000000000"), [0u8; 100]).unwrap();

    let store = StoreEngine::new(env.config(), Collaborators::default()).unwrap();
    assert!(matches!(store.load(), Err(StoreError::SegmentSize { .. })));
    let r = store.put_message(&mqstore::Message::new("T", 0, "x"));
    assert_eq!(r.status, mqstore::PutStatus::ServiceNotAvailable);
}

#[test]
fn destroy_removes_the_store_files() {
    let env = TestEnv::new();
    let store = env.start(env.config());
    store.put_message(&mqstore::Message::new("T", 0, "x"));
    common::wait_dispatched(&store);
    store.destroy();
    assert!(!env.commit_log_dir().exists());
    assert!(!env.abort_path().exists());
    assert!(!env.root().join("checkpoint").exists());
}

#[test]
fn unaligned_queue_segment_sizes_still_index_everything() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.commit_log_segment_size = 64 * 1024;
    config.consume_queue_segment_size = 1010;
    config.transaction_segment_size = 1000;
    let store = env.start(config);

    for i in 0..60 {
        let r = store.put_message(&mqstore::Message::new("T", 0, format!("m{i}")));
        assert!(r.status.is_stored());
    }
    common::wait_dispatched(&store);

    // 51 units per segment, so the queue spans two of them
    assert_eq!(store.get_max_offset_in_queue("T", 0), 60);
    assert!(!store.flags().is_logics_queue_error());
    let seg = std::fs::metadata(env.root().join("consumequeue").join("T").join("0").join("00000000000000000000"))
        .unwrap();
    assert_eq!(seg.len(), 1020);
    let last = store.get_commit_log_offset_in_queue("T", 0, 59);
    assert_eq!(&store.look_message_by_offset(last).unwrap().body[..], b"m59");
    store.shutdown();
}
