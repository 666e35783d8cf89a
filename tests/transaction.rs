mod common;

use common::{wait_dispatched, wait_until, TestEnv};
use mqstore::store::record::property;
use mqstore::{Collaborators, Message, PreparedTransaction, TransactionCheckListener, TransactionState};
use std::sync::{Arc, Mutex};

const GROUP: &str = "pg-orders";

fn prepared(body: &str) -> Message {
    Message::new("Orders", 0, body.to_string())
        .with_producer_group(GROUP)
        .with_transaction_state(TransactionState::Prepared)
}

/// The end record for a prepared one, pointing back at its record and slot.
fn resolve(state: TransactionState, prepared_offset: u64, slot: i64, group: &str) -> Message {
    let mut msg = Message::new("Orders", 0, "end")
        .with_producer_group(group)
        .with_transaction_state(state)
        .with_property(property::TRAN_STATE_OFFSET, slot.to_string());
    msg.prepared_transaction_offset = prepared_offset as i64;
    msg
}

#[derive(Default)]
struct Checker {
    seen: Mutex<Vec<PreparedTransaction>>,
}

impl TransactionCheckListener for Checker {
    fn on_prepared(&self, prepared: &PreparedTransaction) {
        self.seen.lock().unwrap().push(*prepared);
    }
}

#[test]
fn prepared_records_wait_for_commit() {
    let env = TestEnv::new();
    let checker = Arc::new(Checker::default());
    let store = env.open_with(
        env.config(),
        Collaborators {
            transaction_check: Some(checker.clone()),
            ..Default::default()
        },
    );
    store.start().unwrap();

    let p0 = store.put_message(&prepared("p0")).append.unwrap();
    let p1 = store.put_message(&prepared("p1")).append.unwrap();
    assert_eq!((p0.queue_offset, p1.queue_offset), (0, 1));
    wait_dispatched(&store);

    // prepared records stay invisible to consumers
    assert_eq!(store.get_max_offset_in_queue("Orders", 0), 0);
    assert_eq!(store.transaction_state(0), Some(TransactionState::Prepared));
    assert_eq!(store.pending_transactions().len(), 2);
    wait_until("check listener", || checker.seen.lock().unwrap().len() == 2);
    assert_eq!(checker.seen.lock().unwrap()[1].commit_log_offset, p1.wrote_offset);

    let c = store.put_message(&resolve(TransactionState::Commit, p0.wrote_offset, 0, GROUP));
    assert!(c.status.is_stored());
    let r = store.put_message(&resolve(TransactionState::Rollback, p1.wrote_offset, 1, GROUP));
    assert!(r.status.is_stored());
    wait_dispatched(&store);

    assert_eq!(store.transaction_state(0), Some(TransactionState::Commit));
    assert_eq!(store.transaction_state(1), Some(TransactionState::Rollback));
    assert!(store.pending_transactions().is_empty());

    // only the commit record becomes consumable
    assert_eq!(store.get_max_offset_in_queue("Orders", 0), 1);
    let committed = store.get_commit_log_offset_in_queue("Orders", 0, 0);
    assert_eq!(committed, c.append.unwrap().wrote_offset);

    let redo = store.transaction_table().unwrap().redo_log().max_offset();
    assert_eq!(redo, 4);
    store.shutdown();
}

#[test]
fn foreign_group_cannot_resolve_a_transaction() {
    let env = TestEnv::new();
    let store = env.start(env.config());

    let p = store.put_message(&prepared("p")).append.unwrap();
    store.put_message(&resolve(TransactionState::Commit, p.wrote_offset, 0, "someone-else"));
    wait_dispatched(&store);

    assert_eq!(store.transaction_state(0), Some(TransactionState::Prepared));
    assert_eq!(store.pending_transactions().len(), 1);
    store.shutdown();
}

#[test]
fn transaction_table_survives_restarts() {
    let env = TestEnv::new();
    let p_offset = {
        let store = env.start(env.config());
        let p = store.put_message(&prepared("p0")).append.unwrap();
        let q = store.put_message(&prepared("p1")).append.unwrap();
        store.put_message(&resolve(TransactionState::Commit, q.wrote_offset, 1, GROUP));
        wait_dispatched(&store);
        store.shutdown();
        p.wrote_offset
    };

    {
        let store = env.start(env.config());
        assert_eq!(store.transaction_state(0), Some(TransactionState::Prepared));
        assert_eq!(store.transaction_state(1), Some(TransactionState::Commit));
        // the next prepared record continues the slot sequence
        let next = store.put_message(&prepared("p2")).append.unwrap();
        assert_eq!(next.queue_offset, 2);
        wait_dispatched(&store);
        store.shutdown();
    }

    // after a crash the table is rebuilt from the redo log with only the open ones
    std::fs::File::create(env.abort_path()).unwrap();
    let store = env.start(env.config());
    let pending = store.pending_transactions();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].commit_log_offset, p_offset);
    assert_eq!(pending[0].producer_group_hash, mqstore::store::hash_code(GROUP));
    store.shutdown();
}
