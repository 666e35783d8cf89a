//! Tails the commit log and turns every new record into its consume queue
//! unit plus transaction, index and long-poll side effects.

use crate::store::checkpoint::StoreCheckpoint;
use crate::store::config::StoreConfig;
use crate::store::error::StoreResult;
use crate::store::flags::RunningFlags;
use crate::store::hooks::{Collaborators, PreparedTransaction};
use crate::store::record::{decode_dispatch, DecodeOutcome, DispatchRequest, TransactionState};
use crate::store::runtime::commit_log::CommitLog;
use crate::store::runtime::consume_queue::ConsumeQueueTable;
use crate::store::runtime::service::{ServiceControl, ServiceHandle};
use crate::store::runtime::transaction::TransactionStateTable;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const TICK: Duration = Duration::from_millis(1);
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);
const SHUTDOWN_POLLS: usize = 50;

pub(crate) struct DispatchContext {
    pub(crate) config: Arc<StoreConfig>,
    pub(crate) commit_log: Arc<CommitLog>,
    pub(crate) queues: Arc<ConsumeQueueTable>,
    pub(crate) transactions: Option<Arc<TransactionStateTable>>,
    pub(crate) checkpoint: Arc<StoreCheckpoint>,
    pub(crate) flags: Arc<RunningFlags>,
    pub(crate) collaborators: Collaborators,
}

pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
    reput_from_offset: Arc<AtomicU64>,
    handle: Mutex<Option<ServiceHandle>>,
}

impl Dispatcher {
    pub(crate) fn new(ctx: DispatchContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            reput_from_offset: Arc::new(AtomicU64::new(0)),
            handle: Mutex::new(None),
        }
    }

    pub fn reput_from_offset(&self) -> u64 {
        self.reput_from_offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_reput_from_offset(&self, offset: u64) {
        self.reput_from_offset.store(offset, Ordering::Release);
    }

    /// Commit log bytes not yet dispatched.
    pub fn behind(&self) -> u64 {
        self.ctx
            .commit_log
            .max_offset()
            .saturating_sub(self.reput_from_offset())
    }

    pub(crate) fn start(&self) -> StoreResult<()> {
        let ctx = Arc::clone(&self.ctx);
        let cursor = Arc::clone(&self.reput_from_offset);
        let handle = ServiceHandle::spawn(ServiceControl::new("reput"), move |ctl| {
            while !ctl.is_stopped() {
                ctl.wait_for_running(TICK);
                reput(&ctx, &cursor);
            }
        })?;
        match self.handle.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
        info!(reput_from_offset = self.reput_from_offset(), "dispatcher started");
        Ok(())
    }

    pub(crate) fn wakeup(&self) {
        if let Ok(slot) = self.handle.lock() {
            if let Some(h) = slot.as_ref() {
                h.wakeup();
            }
        }
    }

    /// Give the dispatcher a bounded chance to catch up, then stop it.
    pub(crate) fn shutdown(&self) {
        let taken = match self.handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut running) = taken else {
            return;
        };
        for _ in 0..SHUTDOWN_POLLS {
            if self.behind() == 0 {
                break;
            }
            running.wakeup();
            std::thread::sleep(SHUTDOWN_POLL);
        }
        if self.behind() > 0 {
            warn!(behind = self.behind(), "dispatcher stopped before catching up");
        }
        running.shutdown();
    }
}

fn reput(ctx: &DispatchContext, cursor: &AtomicU64) -> usize {
    let commit_log = &ctx.commit_log;
    let mut dispatched = 0;
    loop {
        let from = cursor.load(Ordering::Acquire);
        if from >= commit_log.max_offset() {
            break;
        }
        if ctx.config.duplication_enable {
            if let Some(ha) = &ctx.collaborators.replication {
                if from >= ha.confirmed_offset() {
                    break;
                }
            }
        }
        let min = commit_log.min_offset();
        if from < min {
            warn!(from, min, "reput offset below the commit log head, skipping ahead");
            cursor.store(min, Ordering::Release);
            continue;
        }

        let Some(region) = commit_log.read_from(from) else {
            break;
        };
        let segment_end = region.segment().end_offset();
        let mut pos = 0usize;
        while pos < region.len() {
            let offset = from + pos as u64;
            match decode_dispatch(&region[pos..], false) {
                DecodeOutcome::Record(req) => {
                    let size = req.size as usize;
                    dispatch(ctx, &req);
                    pos += size;
                    cursor.store(offset + size as u64, Ordering::Release);
                    dispatched += 1;
                }
                DecodeOutcome::EndOfSegment => {
                    cursor.store(commit_log.roll_next_file(offset), Ordering::Release);
                    break;
                }
                DecodeOutcome::Incomplete { declared_size }
                    if offset + declared_size as u64 <= segment_end =>
                {
                    // the rest of the record has not been written yet
                    debug!(offset, declared_size, "record incomplete, waiting for the rest");
                    return dispatched;
                }
                DecodeOutcome::Incomplete { declared_size } | DecodeOutcome::Corrupt { declared_size }
                    if declared_size > 0 =>
                {
                    let next = offset + declared_size as u64;
                    error!(offset, declared_size, "undecodable record, skipping");
                    if next >= segment_end {
                        cursor.store(commit_log.roll_next_file(offset), Ordering::Release);
                        break;
                    }
                    cursor.store(next, Ordering::Release);
                    pos += declared_size as usize;
                }
                DecodeOutcome::Incomplete { declared_size } | DecodeOutcome::Corrupt { declared_size } => {
                    debug!(offset, declared_size, "record not decodable yet, retrying next tick");
                    return dispatched;
                }
            }
        }
    }
    dispatched
}

fn dispatch(ctx: &DispatchContext, req: &DispatchRequest) {
    let state = req.transaction_state();

    if state.is_consumable() {
        let queue = ctx.queues.find_or_create(&req.topic, req.queue_id);
        let logical = req.queue_offset.max(0) as u64;
        if let Err(e) = queue.append_index(req.commit_log_offset, req.size, req.tags_code, logical) {
            error!(topic = %req.topic, queue_id = req.queue_id, error = %e, "consume queue append failed");
            ctx.flags.make_logics_queue_error();
        }
        ctx.checkpoint.set_logics_msg_timestamp(req.store_timestamp);
    }

    if ctx.config.transaction_enable {
        if let Some(tx) = &ctx.transactions {
            dispatch_transaction(ctx, tx, req, state);
        }
    }

    if ctx.config.message_index_enable {
        if let Some(index) = &ctx.collaborators.index {
            index.build_index(req);
        }
    }

    if state.is_consumable() && ctx.config.long_polling_enable && !ctx.config.is_slave() {
        if let Some(listener) = &ctx.collaborators.arriving {
            listener.on_arrived(&req.topic, req.queue_id, req.queue_offset + 1, req.tags_code);
        }
    }
}

fn dispatch_transaction(
    ctx: &DispatchContext,
    tx: &TransactionStateTable,
    req: &DispatchRequest,
    state: TransactionState,
) {
    match state {
        TransactionState::Normal => return,
        TransactionState::Prepared => {
            let secs = (req.store_timestamp / 1000) as i32;
            match tx.append_prepared(req.commit_log_offset, req.size, secs, req.producer_group_hash()) {
                Ok(Some(slot)) => {
                    if let Some(listener) = &ctx.collaborators.transaction_check {
                        listener.on_prepared(&PreparedTransaction {
                            commit_log_offset: req.commit_log_offset,
                            size: req.size,
                            store_timestamp_secs: secs,
                            producer_group_hash: req.producer_group_hash(),
                            state_table_offset: slot,
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(offset = req.commit_log_offset, error = %e, "transaction state append failed");
                    ctx.flags.make_logics_queue_error();
                }
            }
        }
        TransactionState::Commit | TransactionState::Rollback => {
            tx.update_state(
                req.state_table_offset,
                req.prepared_transaction_offset.max(0) as u64,
                req.producer_group_hash(),
                state,
            );
        }
    }
    if let Err(e) = tx.append_redo(req.commit_log_offset, req.size, state) {
        error!(offset = req.commit_log_offset, error = %e, "transaction redo log append failed");
        ctx.flags.make_logics_queue_error();
    }
}
