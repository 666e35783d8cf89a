mod common;

use common::{sized_message, wait_dispatched, wait_until, TestEnv};
use mqstore::store::record::tags_code;
use mqstore::{Collaborators, DispatchRequest, IndexService, Message, MessageArrivingListener};
use rand::Rng;
use std::sync::{Arc, Mutex};

#[test]
fn every_record_gets_exactly_one_unit() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.commit_log_segment_size = 32 * 1024;
    config.long_polling_enable = false;
    config.message_index_enable = false;
    config.transaction_enable = false;
    let store = env.start(config);

    let mut rng = rand::thread_rng();
    let mut appended = Vec::with_capacity(1000);
    for i in 0..1000 {
        let len = rng.gen_range(1..200);
        let msg = Message::new("Dispatch", 0, vec![b'a' + (i % 26) as u8; len]).with_tags(format!("tag-{}", i % 7));
        let r = store.put_message(&msg);
        assert!(r.status.is_stored());
        appended.push((r.append.unwrap(), i % 7));
    }

    wait_dispatched(&store);
    assert_eq!(store.get_max_offset_in_queue("Dispatch", 0), 1000);
    assert_eq!(store.get_min_offset_in_queue("Dispatch", 0), 0);

    let queue = store.consume_queue("Dispatch", 0).unwrap();
    for (logical, (append, tag)) in appended.iter().enumerate() {
        let unit = queue.get_unit(logical as u64).unwrap();
        assert_eq!(unit.commit_log_offset, append.wrote_offset);
        assert_eq!(unit.size as usize, append.wrote_bytes);
        assert_eq!(unit.tags_code, tags_code(Some(format!("tag-{tag}").as_str())));
        assert_eq!(append.queue_offset, logical as i64);
    }
    assert_eq!(store.get_commit_log_offset_in_queue("Dispatch", 0, 999), appended[999].0.wrote_offset);
    store.shutdown();
}

#[test]
fn records_spread_over_queues_in_order() {
    let env = TestEnv::new();
    let store = env.start(env.config());

    for i in 0..60 {
        let topic = if i % 2 == 0 { "Even" } else { "Odd" };
        let r = store.put_message(&Message::new(topic, i % 3, format!("m{i}")));
        assert!(r.status.is_stored());
    }
    wait_dispatched(&store);

    let mut total = 0;
    for topic in ["Even", "Odd"] {
        for queue_id in 0..3 {
            let max = store.get_max_offset_in_queue(topic, queue_id);
            total += max;
            let mut last = None;
            for logical in 0..max {
                let offset = store.get_commit_log_offset_in_queue(topic, queue_id, logical);
                let record = store.look_message_by_offset(offset).unwrap();
                assert_eq!(record.topic, topic);
                assert_eq!(record.queue_id, queue_id);
                assert_eq!(record.queue_offset, logical as i64);
                assert!(last.map_or(true, |prev| prev < offset));
                last = Some(offset);
            }
        }
    }
    assert_eq!(total, 60);
    store.shutdown();
}

#[derive(Default)]
struct Recorder {
    arrived: Mutex<Vec<(String, i32, i64, i64)>>,
    indexed: Mutex<Vec<u64>>,
}

impl MessageArrivingListener for Recorder {
    fn on_arrived(&self, topic: &str, queue_id: i32, logical_offset: i64, tags_code: i64) {
        self.arrived
            .lock()
            .unwrap()
            .push((topic.to_string(), queue_id, logical_offset, tags_code));
    }
}

impl IndexService for Recorder {
    fn build_index(&self, request: &DispatchRequest) {
        self.indexed.lock().unwrap().push(request.commit_log_offset);
    }
}

#[test]
fn collaborators_see_every_dispatched_record() {
    let env = TestEnv::new();
    let recorder = Arc::new(Recorder::default());
    let collaborators = Collaborators {
        arriving: Some(recorder.clone()),
        index: Some(recorder.clone()),
        ..Default::default()
    };
    let store = env.open_with(env.config(), collaborators);
    store.start().unwrap();

    let mut offsets = Vec::new();
    for i in 0..5 {
        let r = store.put_message(&Message::new("Notify", 1, format!("m{i}")).with_tags("hot"));
        offsets.push(r.append.unwrap().wrote_offset);
    }
    wait_dispatched(&store);
    wait_until("index", || recorder.indexed.lock().unwrap().len() == 5);

    let arrived = recorder.arrived.lock().unwrap().clone();
    assert_eq!(arrived.len(), 5);
    for (i, (topic, queue_id, logical, tags)) in arrived.into_iter().enumerate() {
        assert_eq!(topic, "Notify");
        assert_eq!(queue_id, 1);
        // the listener learns the next offset to pull
        assert_eq!(logical, i as i64 + 1);
        assert_eq!(tags, tags_code(Some("hot")));
    }
    assert_eq!(*recorder.indexed.lock().unwrap(), offsets);
    store.shutdown();
}

#[test]
fn replica_bytes_are_dispatched_like_local_writes() {
    let primary_env = TestEnv::new();
    let primary = primary_env.open(primary_env.config());
    for i in 0..4 {
        primary.put_message(&Message::new("Repl", 0, format!("m{i}")));
    }
    let shipped = primary.read(0, primary.max_phy_offset() as usize).unwrap().to_vec();

    let replica_env = TestEnv::new();
    let mut config = replica_env.config();
    config.broker_role = mqstore::BrokerRole::Slave;
    let replica = replica_env.start(config);

    assert!(replica.append_to_commit_log(8, &shipped).is_err());
    replica.append_to_commit_log(0, &shipped).unwrap();
    wait_dispatched(&replica);
    assert_eq!(replica.get_max_offset_in_queue("Repl", 0), 4);
    assert_eq!(replica.look_message_by_offset(0).unwrap().body[..], b"m0"[..]);
    replica.shutdown();
}

fn replica(env: &TestEnv) -> mqstore::StoreEngine {
    let mut config = env.config();
    config.broker_role = mqstore::BrokerRole::Slave;
    env.start(config)
}

#[test]
fn record_shipped_in_two_pieces_is_indexed_once_complete() {
    let primary_env = TestEnv::new();
    let primary = primary_env.open(primary_env.config());
    primary.put_message(&Message::new("Repl", 0, "split-me"));
    let shipped = primary.read(0, primary.max_phy_offset() as usize).unwrap().to_vec();
    let half = shipped.len() / 2;

    let replica_env = TestEnv::new();
    let replica = replica(&replica_env);
    replica.append_to_commit_log(0, &shipped[..half]).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert_eq!(replica.get_max_offset_in_queue("Repl", 0), 0);
    assert_eq!(replica.reput_from_offset(), 0, "the partial record must not be skipped");

    replica.append_to_commit_log(half as u64, &shipped[half..]).unwrap();
    wait_dispatched(&replica);
    assert_eq!(replica.get_max_offset_in_queue("Repl", 0), 1);
    assert_eq!(replica.get_commit_log_offset_in_queue("Repl", 0, 0), 0);
    replica.shutdown();
}

#[test]
fn record_with_unknown_magic_is_skipped_by_its_size() {
    let primary_env = TestEnv::new();
    let primary = primary_env.open(primary_env.config());
    primary.put_message(&sized_message("Junk", 0, 100));
    primary.put_message(&Message::new("Repl", 0, "after-junk"));
    let mut shipped = primary.read(0, primary.max_phy_offset() as usize).unwrap().to_vec();
    shipped[4..8].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());

    let replica_env = TestEnv::new();
    let replica = replica(&replica_env);
    replica.append_to_commit_log(0, &shipped).unwrap();
    wait_dispatched(&replica);

    assert_eq!(replica.get_max_offset_in_queue("Junk", 0), 0);
    assert_eq!(replica.get_max_offset_in_queue("Repl", 0), 1);
    assert_eq!(replica.get_commit_log_offset_in_queue("Repl", 0, 0), 100);
    replica.shutdown();
}
