//! Retention: reclaim commit log segments by age, disk pressure or manual
//! request, then drop consume queue and transaction segments that only
//! reference reclaimed data.

use crate::store::chain::ExpirePolicy;
use crate::store::config::StoreConfig;
use crate::store::error::StoreResult;
use crate::store::flags::RunningFlags;
use crate::store::hooks::IndexService;
use crate::store::os;
use crate::store::paths::StorePaths;
use crate::store::runtime::commit_log::CommitLog;
use crate::store::runtime::consume_queue::ConsumeQueueTable;
use crate::store::runtime::service::{ServiceControl, ServiceHandle};
use crate::store::runtime::transaction::TransactionStateTable;
use chrono::{Local, Timelike};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Rounds a manual delete request stays armed.
const MANUAL_DELETE_ROUNDS: u32 = 20;

pub(crate) struct CleanContext {
    pub(crate) config: Arc<StoreConfig>,
    pub(crate) paths: StorePaths,
    pub(crate) commit_log: Arc<CommitLog>,
    pub(crate) queues: Arc<ConsumeQueueTable>,
    pub(crate) transactions: Option<Arc<TransactionStateTable>>,
    pub(crate) index: Option<Arc<dyn IndexService>>,
    pub(crate) flags: Arc<RunningFlags>,
}

#[derive(Default)]
struct CommitLogCleaner {
    manual_delete_remaining: AtomicU32,
    clean_immediately: AtomicBool,
}

impl CommitLogCleaner {
    fn run(&self, ctx: &CleanContext) {
        self.delete_expired_files(ctx);
        if ctx.commit_log.retry_delete_first() {
            info!("pending commit log head segment reclaimed");
        }
    }

    fn take_manual_round(&self) -> bool {
        self.manual_delete_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn delete_expired_files(&self, ctx: &CleanContext) {
        let time_up = is_time_to_delete(&ctx.config);
        let space_full = self.is_space_to_delete(ctx);
        let manual = self.take_manual_round();
        if !(time_up || space_full || manual) {
            return;
        }
        if manual {
            info!(
                remaining = self.manual_delete_remaining.load(Ordering::Acquire),
                "manual commit log cleanup round"
            );
        }
        let clean_at_once = ctx.config.clean_file_forcibly_enable
            && self.clean_immediately.load(Ordering::Acquire);
        let policy = ExpirePolicy {
            retention: ctx.config.file_reserved_time(),
            interval: Duration::from_millis(ctx.config.delete_commit_log_files_interval_ms),
            destroy_timeout: ctx.config.destroy_segment_timeout(),
            clean_immediately: clean_at_once,
            forced: clean_at_once,
        };
        let deleted = ctx.commit_log.delete_expired(policy);
        if deleted > 0 {
            info!(deleted, time_up, space_full, manual, clean_at_once, "commit log segments reclaimed");
        } else if space_full {
            warn!("disk over the usage limit but no commit log segment could be reclaimed");
        }
    }

    fn is_space_to_delete(&self, ctx: &CleanContext) -> bool {
        let cfg = &ctx.config;
        let max_ratio = f64::from(cfg.disk_max_used_space_ratio) / 100.0;
        self.clean_immediately.store(false, Ordering::Release);

        if let Some(physic) = os::disk_usage_ratio(&ctx.paths.commit_log_dir()) {
            if physic > cfg.disk_space_warning_level_ratio {
                if !ctx.flags.get_and_make_disk_full() {
                    error!(ratio = physic, "commit log disk full, writes suspended");
                }
                self.clean_immediately.store(true, Ordering::Release);
            } else if physic > cfg.disk_space_clean_forcibly_ratio {
                self.clean_immediately.store(true, Ordering::Release);
            } else if ctx.flags.get_and_make_disk_ok() {
                info!(ratio = physic, "commit log disk usage back to normal");
            }
            if physic > max_ratio {
                debug!(ratio = physic, "commit log disk over the usage limit");
                return true;
            }
        }

        if let Some(logics) = os::disk_usage_ratio(&ctx.paths.consume_queue_root()) {
            if logics > cfg.disk_space_warning_level_ratio {
                if !ctx.flags.get_and_make_disk_full() {
                    error!(ratio = logics, "consume queue disk full, writes suspended");
                }
                self.clean_immediately.store(true, Ordering::Release);
            } else if logics > cfg.disk_space_clean_forcibly_ratio {
                self.clean_immediately.store(true, Ordering::Release);
            }
            if logics > max_ratio {
                debug!(ratio = logics, "consume queue disk over the usage limit");
                return true;
            }
        }
        false
    }
}

fn is_time_to_delete(config: &StoreConfig) -> bool {
    let hour = Local::now().hour();
    config.delete_when_hours().contains(&hour)
}

#[derive(Default)]
struct ConsumeQueueCleaner {
    last_physical_min_offset: AtomicU64,
}

impl ConsumeQueueCleaner {
    fn run(&self, ctx: &CleanContext) {
        let min = ctx.commit_log.min_offset();
        if min <= self.last_physical_min_offset.load(Ordering::Acquire) {
            return;
        }
        self.last_physical_min_offset.store(min, Ordering::Release);

        let interval = Duration::from_millis(ctx.config.delete_consume_queue_files_interval_ms);
        let mut deleted = 0;
        for queue in ctx.queues.all() {
            let n = queue.delete_expired(min);
            deleted += n;
            if n > 0 && !interval.is_zero() {
                std::thread::sleep(interval);
            }
        }
        if let Some(tx) = &ctx.transactions {
            deleted += tx.delete_expired(min);
        }
        if let Some(index) = &ctx.index {
            index.delete_expired(min);
        }
        if deleted > 0 {
            info!(min_commit_log_offset = min, deleted, "consume queue segments reclaimed");
        }
    }
}

pub struct CleanService {
    ctx: Arc<CleanContext>,
    commit_log: Arc<CommitLogCleaner>,
    consume_queue: Arc<ConsumeQueueCleaner>,
    handle: Mutex<Option<ServiceHandle>>,
}

impl CleanService {
    pub(crate) fn new(ctx: CleanContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            commit_log: Arc::new(CommitLogCleaner::default()),
            consume_queue: Arc::new(ConsumeQueueCleaner::default()),
            handle: Mutex::new(None),
        }
    }

    /// Arm forced cleanup for the next rounds regardless of time and disk usage.
    pub fn execute_delete_files_manually(&self) {
        self.commit_log
            .manual_delete_remaining
            .store(MANUAL_DELETE_ROUNDS, Ordering::Release);
        info!("manual cleanup requested");
        if let Ok(slot) = self.handle.lock() {
            if let Some(h) = slot.as_ref() {
                h.wakeup();
            }
        }
    }

    pub(crate) fn run_once(&self) {
        self.commit_log.run(&self.ctx);
        self.consume_queue.run(&self.ctx);
    }

    pub(crate) fn start(self: &Arc<Self>) -> StoreResult<()> {
        let me = Arc::clone(self);
        let interval = Duration::from_millis(self.ctx.config.clean_resource_interval_ms);
        let handle = ServiceHandle::spawn(ServiceControl::new("clean-resource"), move |ctl| {
            while !ctl.is_stopped() {
                ctl.wait_for_running(interval);
                if ctl.is_stopped() {
                    break;
                }
                me.run_once();
            }
        })?;
        match self.handle.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
        Ok(())
    }

    pub(crate) fn shutdown(&self) {
        let taken = match self.handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut h) = taken {
            h.shutdown();
        }
    }
}
