use crate::store::error::{StoreError, StoreResult};
use crate::store::paths::is_valid_topic;
use crate::store::record::{encode_properties, Message, MAX_PROPERTIES_LEN, MAX_TOPIC_LEN};
use crate::store::runtime::commit_log::{PutMessageResult, PutStatus};
use crate::store::runtime::engine::StoreEngine;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const SLOW_PUT: Duration = Duration::from_millis(500);

impl StoreEngine {
    fn admit(&self, msg: &Message) -> Result<(), PutStatus> {
        if self.shutdown.load(Ordering::Acquire) {
            warn!("put rejected: store is shut down");
            return Err(PutStatus::ServiceNotAvailable);
        }
        if !self.loaded.load(Ordering::Acquire) {
            warn!("put rejected: store is not loaded");
            return Err(PutStatus::ServiceNotAvailable);
        }
        if self.config.is_slave() {
            debug!("put rejected: store runs as a slave");
            return Err(PutStatus::ServiceNotAvailable);
        }
        if !self.flags.is_writeable() {
            warn!(flags = self.flags.bits(), "put rejected: store is not writeable");
            return Err(PutStatus::ServiceNotAvailable);
        }
        if msg.topic.len() > MAX_TOPIC_LEN || !is_valid_topic(&msg.topic) {
            warn!(topic = %msg.topic, "put rejected: illegal topic");
            return Err(PutStatus::MessageIllegal);
        }
        if encode_properties(&msg.properties).len() > MAX_PROPERTIES_LEN {
            warn!(topic = %msg.topic, "put rejected: properties too long");
            return Err(PutStatus::PropertiesSizeExceeded);
        }
        if self.commit_log.is_page_cache_busy() {
            return Err(PutStatus::ServiceNotAvailable);
        }
        Ok(())
    }

    /// Append one message to the commit log. Consume queue visibility follows
    /// asynchronously once the dispatcher reaches it.
    pub fn put_message(&self, msg: &Message) -> PutMessageResult {
        if let Err(status) = self.admit(msg) {
            return PutMessageResult::rejected(status);
        }
        let started = Instant::now();
        let result = self.commit_log.put_message(msg);
        let elapsed = started.elapsed();
        if elapsed > SLOW_PUT {
            warn!(
                topic = %msg.topic,
                elapsed_ms = elapsed.as_millis() as u64,
                status = ?result.status,
                "slow put"
            );
        }
        if !result.status.is_stored() {
            debug!(topic = %msg.topic, status = ?result.status, "put not stored");
        }
        result
    }

    /// Replica path: append raw commit log bytes shipped from the master. The
    /// dispatcher indexes them like locally written records.
    pub fn append_to_commit_log(&self, start_offset: u64, data: &[u8]) -> StoreResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(StoreError::Shutdown);
        }
        if !self.loaded.load(Ordering::Acquire) {
            return Err(StoreError::NotLoaded);
        }
        self.commit_log.append_data(start_offset, data)?;
        self.dispatcher.wakeup();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::store::config::StoreConfig;
    use crate::store::hooks::Collaborators;
    use crate::store::record::Message;
    use crate::store::runtime::commit_log::PutStatus;
    use crate::store::runtime::engine::StoreEngine;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn busy_page_cache_turns_puts_away() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoreConfig::with_root(dir.path());
        config.commit_log_segment_size = 4096;
        config.os_page_cache_busy_timeout_ms = 20;
        config.preallocate_segments = false;
        let store = StoreEngine::new(config, Collaborators::default()).unwrap();
        store.load().unwrap();

        let (tx, rx) = mpsc::channel();
        std::thread::scope(|s| {
            store.commit_log.with_put_lock(|| {
                std::thread::sleep(Duration::from_millis(60));
                s.spawn(|| {
                    let _ = tx.send(store.put_message(&Message::new("T", 0, "x")).status);
                });
                // a put that was not turned away would block on the lock we hold
                let status = rx.recv_timeout(Duration::from_secs(5));
                assert_eq!(status, Ok(PutStatus::ServiceNotAvailable));
            });
        });

        let after = store.put_message(&Message::new("T", 0, "x"));
        assert_eq!(after.status, PutStatus::Ok);
        store.shutdown();
    }
}
