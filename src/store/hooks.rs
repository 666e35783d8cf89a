//! Contracts of the collaborators living outside the store: long-poll
//! notification, replication, the secondary index and transaction checking.

use crate::store::record::DispatchRequest;
use std::sync::Arc;
use std::time::Duration;

/// Woken whenever a new unit becomes visible in a consume queue.
pub trait MessageArrivingListener: Send + Sync {
    fn on_arrived(&self, topic: &str, queue_id: i32, logical_offset: i64, tags_code: i64);
}

/// The offset-confirmation side of replication.
pub trait ReplicationService: Send + Sync {
    /// Highest commit log offset acknowledged by the replicas.
    fn confirmed_offset(&self) -> u64;

    /// A put finished; `max_offset` is the new end of the commit log.
    fn notify_max_offset(&self, max_offset: u64);

    /// Whether some replica is close enough to ack `offset` in time.
    fn is_slave_ok(&self, offset: u64) -> bool;

    /// Block until a replica acknowledged `offset` or `timeout` elapses.
    fn wait_for_ack(&self, offset: u64, timeout: Duration) -> bool;
}

pub trait IndexService: Send + Sync {
    fn build_index(&self, request: &DispatchRequest);

    fn delete_expired(&self, _min_commit_log_offset: u64) {}

    /// Store timestamp of the last record durably indexed.
    fn flushed_timestamp(&self) -> u64 {
        0
    }
}

/// A prepared record just landed in the transaction state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedTransaction {
    pub commit_log_offset: u64,
    pub size: i32,
    pub store_timestamp_secs: i32,
    pub producer_group_hash: i32,
    pub state_table_offset: i64,
}

pub trait TransactionCheckListener: Send + Sync {
    fn on_prepared(&self, prepared: &PreparedTransaction);
}

/// Optional collaborators wired into a store engine.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub arriving: Option<Arc<dyn MessageArrivingListener>>,
    pub replication: Option<Arc<dyn ReplicationService>>,
    pub index: Option<Arc<dyn IndexService>>,
    pub transaction_check: Option<Arc<dyn TransactionCheckListener>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("arriving", &self.arriving.is_some())
            .field("replication", &self.replication.is_some())
            .field("index", &self.index.is_some())
            .field("transaction_check", &self.transaction_check.is_some())
            .finish()
    }
}
