//! # mqstore
//!
//! The storage engine of a message broker: an append-only commit log split
//! into memory-mapped segments, per-queue index files built asynchronously by
//! a dispatcher, a transaction state table, crash recovery and retention.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mqstore::{Collaborators, Message, StoreConfig, StoreEngine};
//!
//! # fn main() -> mqstore::StoreResult<()> {
//! let store = StoreEngine::new(StoreConfig::with_root("/tmp/mqstore"), Collaborators::default())?;
//! store.load()?;
//! store.start()?;
//!
//! // Append to queue 0 of "orders"
//! let put = store.put_message(&Message::new("orders", 0, "hello").with_tags("created"));
//! assert!(put.status.is_stored());
//!
//! // Records become visible in their queue once dispatched
//! while store.dispatch_behind_bytes() > 0 {
//!     std::thread::sleep(std::time::Duration::from_millis(1));
//! }
//! if let Some(pulled) = store.get_message("orders", 0, 0, 32) {
//!     println!("{:?}: {} records", pulled.status, pulled.message_count());
//! }
//!
//! store.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! Flushing, replication role and retention are driven by [`StoreConfig`]:
//!
//! ```rust,no_run
//! use mqstore::{BrokerRole, FlushDiskType, StoreConfig};
//!
//! let mut config = StoreConfig::with_root("/var/lib/mqstore");
//! // every put waits for its bytes to reach disk
//! config.flush_disk_type = FlushDiskType::SyncFlush;
//! // every put also waits for the slave to catch up
//! config.broker_role = BrokerRole::SyncMaster;
//! // keep commit log segments for a day, reclaim them at 4am
//! config.file_reserved_time_hours = 24;
//! config.delete_when = "04".to_string();
//! ```

pub mod store;

pub use store::hooks::{
    Collaborators, IndexService, MessageArrivingListener, PreparedTransaction, ReplicationService,
    TransactionCheckListener,
};
pub use store::record::{CommitLogRecord, DispatchRequest, Message, TransactionState};
pub use store::{
    BrokerRole, FlushDiskType, GetMessageResult, GetMessageStatus, PutMessageResult, PutStatus, StoreConfig,
    StoreEngine, StoreError, StoreResult,
};
