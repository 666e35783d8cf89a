pub(crate) mod allocator;
pub mod chain;
pub mod checkpoint;
mod config;
mod error;
pub mod flags;
pub mod hooks;
pub(crate) mod os;
pub(crate) mod paths;
pub mod record;
mod runtime;
pub mod segment;

pub use config::{
    hash_code, BrokerRole, FlushDiskType, StoreConfig, CQ_UNIT_SIZE, DELETE_FILES_BATCH_MAX, OS_PAGE_SIZE,
    TS_UNIT_SIZE,
};
pub use error::{StoreError, StoreResult};
pub use runtime::{
    AppendResult, CleanService, CommitLog, ConsumeQueue, ConsumeQueueTable, CqUnit, Dispatcher, GetMessageResult,
    GetMessageStatus, PutMessageResult, PutStatus, StoreEngine, TransactionStateTable, UnitBatch, REDO_LOG_TOPIC,
};
