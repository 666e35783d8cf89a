//! Background durability: group commit or interval flushing for the commit
//! log, interval flushing plus checkpointing for the consume queues.

use crate::store::checkpoint::StoreCheckpoint;
use crate::store::config::{now_millis, FlushDiskType, StoreConfig};
use crate::store::error::StoreResult;
use crate::store::hooks::IndexService;
use crate::store::runtime::commit_log::CommitLog;
use crate::store::runtime::consume_queue::ConsumeQueueTable;
use crate::store::runtime::service::{ServiceControl, ServiceHandle};
use crate::store::runtime::transaction::TransactionStateTable;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const GROUP_COMMIT_POLL: Duration = Duration::from_millis(10);
const FINAL_FLUSH_ROUNDS: usize = 10;

struct GroupCommitRequest {
    next_offset: u64,
    reply: Sender<bool>,
}

/// The commit log's flush service, chosen by `FlushDiskType`.
pub(crate) enum CommitLogFlusher {
    GroupCommit {
        requests: Mutex<Sender<GroupCommitRequest>>,
        handle: Mutex<ServiceHandle>,
    },
    RealTime {
        handle: Mutex<ServiceHandle>,
    },
}

impl CommitLogFlusher {
    pub(crate) fn start(commit_log: Arc<CommitLog>, checkpoint: Arc<StoreCheckpoint>) -> StoreResult<Self> {
        match commit_log.config().flush_disk_type {
            FlushDiskType::SyncFlush => {
                let (tx, rx) = mpsc::channel();
                let handle = ServiceHandle::spawn(ServiceControl::new("group-commit"), move |ctl| {
                    run_group_commit(ctl, commit_log, checkpoint, rx)
                })?;
                Ok(Self::GroupCommit {
                    requests: Mutex::new(tx),
                    handle: Mutex::new(handle),
                })
            }
            FlushDiskType::AsyncFlush => {
                let handle = ServiceHandle::spawn(ServiceControl::new("flush-commit-log"), move |ctl| {
                    run_real_time_flush(ctl, commit_log, checkpoint)
                })?;
                Ok(Self::RealTime {
                    handle: Mutex::new(handle),
                })
            }
        }
    }

    /// Block until the commit log is durable up to `next_offset` or `timeout`
    /// elapses. Interval flushing only gets a wakeup and reports success.
    pub(crate) fn request_flush(&self, next_offset: u64, timeout: Duration) -> bool {
        match self {
            Self::GroupCommit { requests, .. } => {
                let (reply, done) = mpsc::channel();
                let sent = match requests.lock() {
                    Ok(tx) => tx.send(GroupCommitRequest { next_offset, reply }).is_ok(),
                    Err(_) => false,
                };
                sent && done.recv_timeout(timeout).unwrap_or(false)
            }
            Self::RealTime { .. } => {
                self.wakeup();
                true
            }
        }
    }

    pub(crate) fn wakeup(&self) {
        let handle = match self {
            Self::GroupCommit { handle, .. } | Self::RealTime { handle } => handle,
        };
        if let Ok(h) = handle.lock() {
            h.wakeup();
        }
    }

    pub(crate) fn shutdown(&self) {
        let handle = match self {
            Self::GroupCommit { handle, .. } | Self::RealTime { handle } => handle,
        };
        match handle.lock() {
            Ok(mut h) => h.shutdown(),
            Err(poisoned) => poisoned.into_inner().shutdown(),
        }
    }
}

fn record_physic_timestamp(commit_log: &CommitLog, checkpoint: &StoreCheckpoint) {
    let ts = commit_log.chain().store_timestamp();
    if ts > 0 {
        checkpoint.set_physic_msg_timestamp(ts);
    }
}

fn serve_group_commit(
    batch: Vec<GroupCommitRequest>,
    commit_log: &CommitLog,
    checkpoint: &StoreCheckpoint,
) {
    if batch.is_empty() {
        return;
    }
    for req in batch {
        // a request can straddle a segment boundary, so flush twice at most
        let mut flushed = commit_log.flushed_where() >= req.next_offset;
        for _ in 0..2 {
            if flushed {
                break;
            }
            commit_log.chain().commit(0);
            flushed = commit_log.flushed_where() >= req.next_offset;
        }
        let _ = req.reply.send(flushed);
    }
    record_physic_timestamp(commit_log, checkpoint);
}

fn drain(rx: &Receiver<GroupCommitRequest>, first: GroupCommitRequest) -> Vec<GroupCommitRequest> {
    let mut batch = vec![first];
    batch.extend(rx.try_iter());
    batch
}

fn run_group_commit(
    ctl: Arc<ServiceControl>,
    commit_log: Arc<CommitLog>,
    checkpoint: Arc<StoreCheckpoint>,
    rx: Receiver<GroupCommitRequest>,
) {
    while !ctl.is_stopped() {
        match rx.recv_timeout(GROUP_COMMIT_POLL) {
            Ok(first) => {
                let batch = drain(&rx, first);
                trace!(requests = batch.len(), "group commit");
                serve_group_commit(batch, &commit_log, &checkpoint);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // answer whatever arrived during shutdown
    std::thread::sleep(GROUP_COMMIT_POLL);
    let pending: Vec<_> = rx.try_iter().collect();
    serve_group_commit(pending, &commit_log, &checkpoint);
    final_flush(&commit_log, &checkpoint);
}

fn run_real_time_flush(ctl: Arc<ServiceControl>, commit_log: Arc<CommitLog>, checkpoint: Arc<StoreCheckpoint>) {
    let config: &StoreConfig = commit_log.config();
    let interval = Duration::from_millis(config.flush_interval_commit_log_ms);
    let thorough_interval = config.flush_commit_log_thorough_interval_ms;
    let mut last_thorough = now_millis();

    while !ctl.is_stopped() {
        let mut least_pages = config.flush_commit_log_least_pages;
        let now = now_millis();
        if now >= last_thorough + thorough_interval {
            last_thorough = now;
            least_pages = 0;
        }
        ctl.wait_for_running(interval);

        let started = std::time::Instant::now();
        // catch up across segment boundaries in one tick
        while commit_log.chain().commit(least_pages) {
            if commit_log.flushed_where() >= commit_log.max_offset() {
                break;
            }
        }
        record_physic_timestamp(&commit_log, &checkpoint);
        let elapsed = started.elapsed();
        if elapsed > Duration::from_millis(500) {
            warn!(elapsed_ms = elapsed.as_millis() as u64, "slow commit log flush");
        }
    }
    final_flush(&commit_log, &checkpoint);
}

fn final_flush(commit_log: &CommitLog, checkpoint: &StoreCheckpoint) {
    for _ in 0..FINAL_FLUSH_ROUNDS {
        if !commit_log.chain().commit(0) {
            break;
        }
    }
    record_physic_timestamp(commit_log, checkpoint);
    info!(flushed_where = commit_log.flushed_where(), "commit log final flush done");
}

/// Interval flushing of every consume queue and the transaction tables, with
/// a periodic thorough pass that also persists the checkpoint.
pub(crate) struct ConsumeQueueFlushService {
    handle: Mutex<ServiceHandle>,
}

struct ConsumeQueueFlushContext {
    config: Arc<StoreConfig>,
    queues: Arc<ConsumeQueueTable>,
    transactions: Option<Arc<TransactionStateTable>>,
    index: Option<Arc<dyn IndexService>>,
    checkpoint: Arc<StoreCheckpoint>,
}

impl ConsumeQueueFlushContext {
    fn flush(&self, least_pages: usize, persist_checkpoint: bool) {
        // captured before flushing so the checkpoint never runs ahead
        let logics_ts = self.checkpoint.logics_msg_timestamp();
        self.queues.commit_all(least_pages);
        if let Some(tx) = &self.transactions {
            tx.commit(least_pages);
        }
        if persist_checkpoint {
            if logics_ts > 0 {
                self.checkpoint.set_logics_msg_timestamp(logics_ts);
            }
            if let Some(index) = &self.index {
                let index_ts = index.flushed_timestamp();
                if index_ts > 0 {
                    self.checkpoint.set_index_msg_timestamp(index_ts);
                }
            }
            match self.checkpoint.flush() {
                Ok(()) => debug!("checkpoint persisted"),
                Err(e) => warn!(error = %e, "checkpoint flush failed"),
            }
        }
    }
}

impl ConsumeQueueFlushService {
    pub(crate) fn start(
        config: Arc<StoreConfig>,
        queues: Arc<ConsumeQueueTable>,
        transactions: Option<Arc<TransactionStateTable>>,
        index: Option<Arc<dyn IndexService>>,
        checkpoint: Arc<StoreCheckpoint>,
    ) -> StoreResult<Self> {
        let ctx = ConsumeQueueFlushContext {
            config,
            queues,
            transactions,
            index,
            checkpoint,
        };
        let handle = ServiceHandle::spawn(ServiceControl::new("flush-consume-queue"), move |ctl| {
            let interval = Duration::from_millis(ctx.config.flush_interval_consume_queue_ms);
            let mut last_thorough = now_millis();
            while !ctl.is_stopped() {
                ctl.wait_for_running(interval);
                let now = now_millis();
                let thorough = now >= last_thorough + ctx.config.flush_consume_queue_thorough_interval_ms;
                if thorough {
                    last_thorough = now;
                    ctx.flush(0, true);
                } else {
                    ctx.flush(ctx.config.flush_consume_queue_least_pages, false);
                }
            }
            ctx.flush(0, true);
        })?;
        Ok(Self {
            handle: Mutex::new(handle),
        })
    }

    pub(crate) fn shutdown(&self) {
        match self.handle.lock() {
            Ok(mut h) => h.shutdown(),
            Err(poisoned) => poisoned.into_inner().shutdown(),
        }
    }
}
