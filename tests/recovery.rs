mod common;

use common::{wait_dispatched, TestEnv};
use mqstore::{Message, PutStatus};
use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;

fn first_segment(env: &TestEnv) -> std::path::PathBuf {
    env.commit_log_dir().join("00000000000000000000")
}

/// 100-byte records on topic "T": 91 fixed + 1 topic + 8 body.
fn put_records(store: &mqstore::StoreEngine, count: usize) {
    for i in 0..count {
        let r = store.put_message(&Message::new("T", 0, format!("body{i:04}")));
        assert_eq!(r.status, PutStatus::Ok);
    }
}

#[test]
fn clean_restart_keeps_everything() {
    let env = TestEnv::new();
    let written = {
        let store = env.start(env.config());
        put_records(&store, 30);
        for i in 0..4 {
            store.put_message(&Message::new("U", 1, format!("u{i}")));
        }
        wait_dispatched(&store);
        store.shutdown();
        store.max_phy_offset()
    };
    assert!(!env.abort_path().exists());

    let store = env.open(env.config());
    assert!(!store.last_exit_abnormal());
    // three full segments of T records, then the U records in a fourth
    assert_eq!(written, 3 * 1024 + 4 * 94);
    assert_eq!(store.max_phy_offset(), written);
    assert_eq!(store.get_max_offset_in_queue("T", 0), 30);
    assert_eq!(store.get_max_offset_in_queue("U", 1), 4);
    assert_eq!(store.reput_from_offset(), store.max_phy_offset());

    let next = store.put_message(&Message::new("T", 0, "bodyNEXT")).append.unwrap();
    assert_eq!(next.queue_offset, 30);
    let next = store.put_message(&Message::new("U", 1, "u4")).append.unwrap();
    assert_eq!(next.queue_offset, 4);
}

#[test]
fn crash_recovery_rebuilds_queues_from_the_commit_log() {
    let env = TestEnv::new();
    {
        // loaded but never started: nothing is dispatched or flushed
        let store = env.open(env.config());
        put_records(&store, 25);
        fs::File::create(env.abort_path()).unwrap();
    }

    let store = env.open(env.config());
    assert!(store.last_exit_abnormal());
    assert_eq!(store.get_max_offset_in_queue("T", 0), 0);
    store.start().unwrap();
    wait_dispatched(&store);
    assert_eq!(store.get_max_offset_in_queue("T", 0), 25);

    let last = store.get_commit_log_offset_in_queue("T", 0, 24);
    let record = store.look_message_by_offset(last).unwrap();
    assert_eq!(&record.body[..], b"body0024");

    let next = store.put_message(&Message::new("T", 0, "bodyNEXT")).append.unwrap();
    assert_eq!(next.queue_offset, 25);
    store.shutdown();
    assert!(!env.abort_path().exists());
}

#[test]
fn crash_after_dispatch_does_not_duplicate_units() {
    let env = TestEnv::new();
    {
        let store = env.start(env.config());
        put_records(&store, 12);
        wait_dispatched(&store);
        store.shutdown();
    }
    // pretend the clean shutdown never happened
    fs::File::create(env.abort_path()).unwrap();

    let store = env.start(env.config());
    wait_dispatched(&store);
    assert_eq!(store.get_max_offset_in_queue("T", 0), 12);
    for logical in 0..12u64 {
        let offset = store.get_commit_log_offset_in_queue("T", 0, logical);
        assert_eq!(store.look_message_by_offset(offset).unwrap().queue_offset, logical as i64);
    }
    store.shutdown();
}

#[test]
fn corrupt_record_truncates_the_tail() {
    let env = TestEnv::new();
    {
        let store = env.open(env.config());
        put_records(&store, 5);
    }

    // flip the last body byte of the fourth record so its crc no longer matches
    let file = OpenOptions::new().read(true).write(true).open(first_segment(&env)).unwrap();
    let at = 3 * 100 + 100 - 4 - 1;
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, at).unwrap();
    file.write_all_at(&[byte[0] ^ 0xFF], at).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let store = env.open(env.config());
    assert_eq!(store.max_phy_offset(), 300);
    assert!(store.look_message_by_offset(200).is_some());
    assert!(store.look_message_by_offset(300).is_none());

    let next = store.put_message(&Message::new("T", 0, "bodyNEXT")).append.unwrap();
    assert_eq!((next.wrote_offset, next.queue_offset), (300, 3));
}

#[test]
fn bad_magic_truncates_the_tail() {
    let env = TestEnv::new();
    {
        let store = env.open(env.config());
        put_records(&store, 5);
    }
    let file = OpenOptions::new().write(true).open(first_segment(&env)).unwrap();
    file.write_all_at(&[0u8; 4], 2 * 100 + 4).unwrap();
    drop(file);

    let store = env.open(env.config());
    assert_eq!(store.max_phy_offset(), 200);
}

#[test]
fn recovery_is_idempotent() {
    let env = TestEnv::new();
    {
        let store = env.open(env.config());
        put_records(&store, 17);
    }
    fs::File::create(env.abort_path()).unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let store = env.open(env.config());
        let mut offsets = Vec::new();
        let mut offset = store.min_phy_offset();
        while let Some(record) = store.look_message_by_offset(offset) {
            offsets.push((record.physical_offset, record.queue_offset));
            offset += record.total_size as u64;
            if offset % 1024 > 1024 - 108 {
                // the rest of the segment is padding
                offset += 1024 - offset % 1024;
            }
        }
        seen.push((store.max_phy_offset(), offsets));
    }
    assert_eq!(seen[0].1.len(), 17);
    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[1], seen[2]);
}
