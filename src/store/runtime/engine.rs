use crate::store::checkpoint::StoreCheckpoint;
use crate::store::config::StoreConfig;
use crate::store::error::{StoreError, StoreResult};
use crate::store::flags::RunningFlags;
use crate::store::hooks::{Collaborators, IndexService};
use crate::store::os;
use crate::store::paths::{fsync_dir, StorePaths};
use crate::store::runtime::clean::{CleanContext, CleanService};
use crate::store::runtime::commit_log::CommitLog;
use crate::store::runtime::consume_queue::{ConsumeQueue, ConsumeQueueTable};
use crate::store::runtime::dispatch::{DispatchContext, Dispatcher};
use crate::store::runtime::flush::ConsumeQueueFlushService;
use crate::store::runtime::transaction::TransactionStateTable;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// The message store: commit log, consume queues, transaction tables and the
/// background services keeping them durable, indexed and within budget.
pub struct StoreEngine {
    pub(crate) config: Arc<StoreConfig>,
    pub(crate) paths: StorePaths,
    pub(crate) flags: Arc<RunningFlags>,
    pub(crate) checkpoint: Arc<StoreCheckpoint>,
    pub(crate) commit_log: Arc<CommitLog>,
    pub(crate) queues: Arc<ConsumeQueueTable>,
    pub(crate) transactions: Option<Arc<TransactionStateTable>>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) cleaner: Arc<CleanService>,
    index: Option<Arc<dyn IndexService>>,
    cq_flusher: Mutex<Option<ConsumeQueueFlushService>>,
    pub(crate) loaded: AtomicBool,
    running: AtomicBool,
    pub(crate) shutdown: AtomicBool,
    pub(crate) total_physical_memory: u64,
}

impl StoreEngine {
    pub fn new(config: StoreConfig, collaborators: Collaborators) -> StoreResult<Self> {
        let config = Arc::new(config);
        let paths = StorePaths::new(config.store_root.clone());
        paths.ensure_root()?;

        let flags = Arc::new(RunningFlags::new());
        let checkpoint = Arc::new(StoreCheckpoint::open(&paths.checkpoint_path())?);
        let transactions = config.transaction_enable.then(|| {
            Arc::new(TransactionStateTable::new(
                &paths,
                config.transaction_mapped_size(),
                config.consume_queue_mapped_size(),
                config.destroy_segment_timeout(),
            ))
        });
        let transaction_offset = match &transactions {
            Some(tx) => tx.next_offset_handle(),
            None => Arc::new(std::sync::atomic::AtomicI64::new(0)),
        };
        let commit_log = Arc::new(CommitLog::new(
            Arc::clone(&config),
            paths.commit_log_dir(),
            transaction_offset,
            collaborators.replication.clone(),
        ));
        let queues = Arc::new(ConsumeQueueTable::new(
            paths.clone(),
            config.consume_queue_mapped_size(),
            config.destroy_segment_timeout(),
        ));

        let dispatcher = Dispatcher::new(DispatchContext {
            config: Arc::clone(&config),
            commit_log: Arc::clone(&commit_log),
            queues: Arc::clone(&queues),
            transactions: transactions.clone(),
            checkpoint: Arc::clone(&checkpoint),
            flags: Arc::clone(&flags),
            collaborators: collaborators.clone(),
        });
        let cleaner = Arc::new(CleanService::new(CleanContext {
            config: Arc::clone(&config),
            paths: paths.clone(),
            commit_log: Arc::clone(&commit_log),
            queues: Arc::clone(&queues),
            transactions: transactions.clone(),
            index: collaborators.index.clone(),
            flags: Arc::clone(&flags),
        }));

        let index = collaborators.index.filter(|_| config.message_index_enable);
        Ok(Self {
            config,
            paths,
            flags,
            checkpoint,
            commit_log,
            queues,
            transactions,
            dispatcher,
            cleaner,
            index,
            cq_flusher: Mutex::new(None),
            loaded: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            total_physical_memory: os::total_physical_memory(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn flags(&self) -> &RunningFlags {
        &self.flags
    }

    pub fn checkpoint(&self) -> &StoreCheckpoint {
        &self.checkpoint
    }

    pub fn commit_log(&self) -> &CommitLog {
        &self.commit_log
    }

    pub fn consume_queue(&self, topic: &str, queue_id: i32) -> Option<Arc<ConsumeQueue>> {
        self.queues.get(topic, queue_id)
    }

    pub fn transaction_table(&self) -> Option<&TransactionStateTable> {
        self.transactions.as_deref()
    }

    /// Whether the previous run ended without a clean shutdown.
    pub fn last_exit_abnormal(&self) -> bool {
        self.paths.abort_path().exists()
    }

    /// Map every file and recover to a consistent state. An error leaves the
    /// store refusing traffic.
    pub fn load(&self) -> StoreResult<()> {
        let last_exit_ok = !self.last_exit_abnormal();
        info!(root = ?self.paths.root(), last_exit_ok, "loading store");

        let loaded = self
            .commit_log
            .load()
            .and_then(|_| self.queues.load())
            .and_then(|_| match &self.transactions {
                Some(tx) => tx.load(),
                None => Ok(()),
            })
            .and_then(|_| self.recover(last_exit_ok));
        if let Err(e) = loaded {
            error!(error = %e, "store load failed");
            return Err(e);
        }
        self.loaded.store(true, Ordering::Release);
        info!(
            min_offset = self.commit_log.min_offset(),
            max_offset = self.commit_log.max_offset(),
            reput_from_offset = self.dispatcher.reput_from_offset(),
            "store loaded"
        );
        Ok(())
    }

    fn recover(&self, last_exit_ok: bool) -> StoreResult<()> {
        self.queues.recover_all();

        let outcome = if last_exit_ok {
            self.commit_log.recover_normally()?
        } else {
            let min_timestamp = match self.index {
                Some(_) => self.checkpoint.min_timestamp_index(),
                None => self.checkpoint.min_timestamp(),
            };
            warn!(min_timestamp, "unclean shutdown detected, recovering abnormally");
            self.commit_log.recover_abnormally(min_timestamp)?
        };
        self.queues.truncate_dirty_all(outcome.process_offset);

        let mut indexed_end = self.queues.max_physic_offset();
        if let Some(tx) = &self.transactions {
            if last_exit_ok {
                tx.recover_normally();
                tx.redo_log().truncate_dirty(outcome.process_offset);
            } else {
                tx.recreate(&self.commit_log)?;
            }
            indexed_end = indexed_end.max(tx.redo_log().max_physic_offset());
        }

        self.commit_log
            .merge_topic_queue_table(self.queues.max_offsets())?;

        let start = if last_exit_ok {
            indexed_end
        } else {
            outcome.scan_start
        };
        let start = start
            .max(self.commit_log.min_offset())
            .min(self.commit_log.max_offset());
        self.dispatcher.set_reput_from_offset(start);
        Ok(())
    }

    /// Start the background services. Requires a successful `load`.
    pub fn start(&self) -> StoreResult<()> {
        if !self.loaded.load(Ordering::Acquire) {
            return Err(StoreError::NotLoaded);
        }
        if self.shutdown.load(Ordering::Acquire) {
            return Err(StoreError::Shutdown);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        fs::File::create(self.paths.abort_path())?;
        fsync_dir(self.paths.root())?;

        self.commit_log.start_flusher(Arc::clone(&self.checkpoint))?;
        let flusher = ConsumeQueueFlushService::start(
            Arc::clone(&self.config),
            Arc::clone(&self.queues),
            self.transactions.clone(),
            self.index.clone(),
            Arc::clone(&self.checkpoint),
        )?;
        match self.cq_flusher.lock() {
            Ok(mut slot) => *slot = Some(flusher),
            Err(poisoned) => *poisoned.into_inner() = Some(flusher),
        }
        self.dispatcher.start()?;
        self.cleaner.start()?;
        info!(root = ?self.paths.root(), "store started");
        Ok(())
    }

    /// Stop every service, flush and checkpoint. The abort marker is removed
    /// only when everything was dispatched, so the next load trusts the tail.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let was_running = self.running.swap(false, Ordering::AcqRel);
        self.cleaner.shutdown();
        self.dispatcher.shutdown();
        let flusher = match self.cq_flusher.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(f) = flusher {
            f.shutdown();
        }
        self.commit_log.shutdown();

        let physic = self.commit_log.chain().store_timestamp();
        if physic > 0 {
            self.checkpoint.set_physic_msg_timestamp(physic);
        }
        if let Err(e) = self.checkpoint.flush() {
            error!(error = %e, "checkpoint flush failed on shutdown");
        }

        if was_running {
            let behind = self.dispatcher.behind();
            if behind == 0 && !self.flags.is_logics_queue_error() {
                if let Err(e) = fs::remove_file(self.paths.abort_path()) {
                    warn!(error = %e, "abort marker not removed");
                }
            } else {
                warn!(behind, "shutdown left undispatched data, next load recovers abnormally");
            }
        }
        info!(root = ?self.paths.root(), "store shut down");
    }

    /// Shut down and delete every file of the store.
    pub fn destroy(&self) {
        self.shutdown();
        self.commit_log.destroy();
        self.queues.destroy_all();
        if let Some(tx) = &self.transactions {
            tx.destroy();
        }
        for path in [self.paths.checkpoint_path(), self.paths.abort_path()] {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = ?path, error = %e, "store file not removed");
                }
            }
        }
        info!(root = ?self.paths.root(), "store destroyed");
    }
}

impl Drop for StoreEngine {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}
