mod clean;
mod commit_log;
mod consume_queue;
mod dispatch;
mod engine;
mod engine_read;
mod engine_write;
mod flush;
mod service;
mod transaction;

pub use clean::CleanService;
pub use commit_log::{AppendResult, CommitLog, PutMessageResult, PutStatus};
pub use consume_queue::{ConsumeQueue, ConsumeQueueTable, CqUnit, UnitBatch};
pub use dispatch::Dispatcher;
pub use engine::StoreEngine;
pub use engine_read::{GetMessageResult, GetMessageStatus};
pub use transaction::{TransactionStateTable, REDO_LOG_TOPIC};
