mod common;

use common::{wait_dispatched, wait_until, TestEnv};
use mqstore::{GetMessageStatus, Message, StoreConfig};
use std::collections::HashSet;

fn retention_config(env: &TestEnv) -> StoreConfig {
    let mut config = env.config();
    config.file_reserved_time_hours = 0;
    config.delete_commit_log_files_interval_ms = 0;
    config.delete_consume_queue_files_interval_ms = 0;
    config.clean_resource_interval_ms = 10;
    config
}

/// Three 96-byte "Old" records, then forty 100-byte "T" records: five
/// commit log segments, the "Old" queue confined to the first.
fn fill(store: &mqstore::StoreEngine) {
    for i in 0..3 {
        assert!(store.put_message(&Message::new("Old", 0, format!("o{i}"))).status.is_stored());
    }
    for i in 0..40 {
        assert!(store.put_message(&Message::new("T", 0, format!("body{i:04}"))).status.is_stored());
    }
    wait_dispatched(store);
    assert_eq!(store.max_phy_offset(), 4 * 1024 + 3 * 100);
}

#[test]
fn manual_cleanup_reclaims_all_but_the_last_segment() {
    let env = TestEnv::new();
    let store = env.start(retention_config(&env));
    fill(&store);

    store.execute_delete_files_manually();
    wait_until("commit log head reclaimed", || store.min_phy_offset() == 4 * 1024);
    wait_until("queue head corrected", || store.get_min_offset_in_queue("T", 0) == 37);

    let head = store.get_commit_log_offset_in_queue("T", 0, 37);
    assert_eq!(head, 4 * 1024);
    assert_eq!(store.get_max_offset_in_queue("T", 0), 40);

    let stale = store.get_message("T", 0, 0, 32).unwrap();
    assert_eq!(stale.status, GetMessageStatus::OffsetTooSmall);
    assert_eq!(stale.next_begin_offset, 37);

    let fresh = store.get_message("T", 0, 37, 32).unwrap();
    assert_eq!(fresh.status, GetMessageStatus::Found);
    assert_eq!(fresh.message_count(), 3);
    assert!(store.read(0, 8).is_none());

    assert_eq!(store.clean_expired_queues(), 1);
    assert_eq!(store.get_max_offset_in_queue("Old", 0), 0);
    assert_eq!(
        store.get_message("Old", 0, 0, 32).unwrap().status,
        GetMessageStatus::NoMatchedLogicQueue
    );
    store.shutdown();
}

#[test]
fn pinned_segment_stays_readable_while_reclaimed() {
    let env = TestEnv::new();
    let store = env.start(retention_config(&env));
    fill(&store);

    let pinned = store.read(0, 96).unwrap();
    store.execute_delete_files_manually();
    wait_until("commit log head reclaimed", || store.min_phy_offset() == 4 * 1024);
    assert!(!env.commit_log_dir().join("00000000000000000000").exists());

    // the mapping outlives the file while a reader holds it
    assert_eq!(u32::from_be_bytes([pinned[0], pinned[1], pinned[2], pinned[3]]), 96);
    assert!(!pinned.segment().is_available());
    drop(pinned);
    store.shutdown();
}

#[test]
fn nothing_is_reclaimed_inside_the_retention_window() {
    let env = TestEnv::new();
    let store = env.start(env.config());
    fill(&store);

    store.execute_delete_files_manually();
    std::thread::sleep(std::time::Duration::from_millis(200));
    assert_eq!(store.min_phy_offset(), 0);
    assert_eq!(store.get_min_offset_in_queue("T", 0), 0);
    store.shutdown();
}

#[test]
fn unused_topics_are_dropped() {
    let env = TestEnv::new();
    let store = env.start(env.config());
    fill(&store);

    let in_use: HashSet<String> = ["T".to_string()].into_iter().collect();
    assert_eq!(store.clean_unused_topic(&in_use), 1);
    assert_eq!(store.get_max_offset_in_queue("Old", 0), 0);
    assert_eq!(store.get_max_offset_in_queue("T", 0), 40);
    assert!(!env.root().join("consumequeue").join("Old").join("0").exists());

    // the offset table forgot the topic, so a new record starts it over
    let again = store.put_message(&Message::new("Old", 0, "o9")).append.unwrap();
    assert_eq!(again.queue_offset, 0);
    store.shutdown();
}
