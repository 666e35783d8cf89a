//! Prepared-transaction bookkeeping: a fixed-width state table addressed by
//! the offset handed back to the producer, and a redo log recording every
//! prepared, commit and rollback record in dispatch order.

use crate::store::chain::SegmentChain;
use crate::store::config::TS_UNIT_SIZE;
use crate::store::error::StoreResult;
use crate::store::hooks::PreparedTransaction;
use crate::store::paths::StorePaths;
use crate::store::record::{decode_dispatch, DecodeOutcome, TransactionState};
use crate::store::runtime::commit_log::CommitLog;
use crate::store::runtime::consume_queue::ConsumeQueue;
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const REDO_LOG_TOPIC: &str = "TRANSACTION_REDOLOG_TOPIC_XXXX";

const RECOVER_SEGMENTS: usize = 3;
const STATE_POS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StateUnit {
    commit_log_offset: u64,
    size: i32,
    timestamp_secs: i32,
    group_hash: i32,
    state: i32,
}

impl StateUnit {
    fn parse(mut raw: &[u8]) -> Option<Self> {
        if raw.len() < TS_UNIT_SIZE {
            return None;
        }
        Some(Self {
            commit_log_offset: raw.get_u64(),
            size: raw.get_i32(),
            timestamp_secs: raw.get_i32(),
            group_hash: raw.get_i32(),
            state: raw.get_i32(),
        })
    }

    fn encode(&self) -> [u8; TS_UNIT_SIZE] {
        let mut out = [0u8; TS_UNIT_SIZE];
        let mut buf = &mut out[..];
        buf.put_u64(self.commit_log_offset);
        buf.put_i32(self.size);
        buf.put_i32(self.timestamp_secs);
        buf.put_i32(self.group_hash);
        buf.put_i32(self.state);
        out
    }
}

pub struct TransactionStateTable {
    chain: SegmentChain,
    redo_log: ConsumeQueue,
    /// Slot the next prepared record will take. Shared with the commit log,
    /// which hands it out under the write lock.
    next_offset: Arc<AtomicI64>,
    max_physic_offset: AtomicU64,
    destroy_timeout: Duration,
}

impl TransactionStateTable {
    pub(crate) fn new(
        paths: &StorePaths,
        segment_size: usize,
        redo_segment_size: usize,
        destroy_timeout: Duration,
    ) -> Self {
        Self {
            chain: SegmentChain::new(paths.transaction_state_dir(), segment_size, None),
            redo_log: ConsumeQueue::new(
                REDO_LOG_TOPIC,
                0,
                paths.consume_queue_dir(REDO_LOG_TOPIC, 0),
                redo_segment_size,
                destroy_timeout,
            ),
            next_offset: Arc::new(AtomicI64::new(0)),
            max_physic_offset: AtomicU64::new(0),
            destroy_timeout,
        }
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset.load(Ordering::Acquire)
    }

    pub(crate) fn next_offset_handle(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.next_offset)
    }

    pub fn redo_log(&self) -> &ConsumeQueue {
        &self.redo_log
    }

    pub fn load(&self) -> StoreResult<()> {
        self.chain.load()?;
        self.redo_log.load()
    }

    /// Clean shutdown: keep the valid prefix of the table tail.
    pub fn recover_normally(&self) {
        self.redo_log.recover();
        let segments = self.chain.segments();
        if segments.is_empty() {
            return;
        }
        let seg_size = self.chain.segment_size();
        let mut idx = segments.len().saturating_sub(RECOVER_SEGMENTS);
        let mut pos = 0usize;
        let mut max_physic = 0u64;
        loop {
            let segment = &segments[idx];
            let mut valid = true;
            while pos + TS_UNIT_SIZE <= seg_size {
                match segment
                    .select_region(pos, TS_UNIT_SIZE)
                    .and_then(|r| StateUnit::parse(&r))
                {
                    Some(u) if u.size > 0 => {
                        max_physic = u.commit_log_offset + u.size as u64;
                        pos += TS_UNIT_SIZE;
                    }
                    _ => {
                        valid = false;
                        break;
                    }
                }
            }
            if valid && idx + 1 < segments.len() {
                idx += 1;
                pos = 0;
                continue;
            }
            break;
        }
        let process_offset = segments[idx].start_offset() + pos as u64;
        self.chain.truncate_after(process_offset, self.destroy_timeout);
        self.max_physic_offset.store(max_physic, Ordering::Release);
        self.next_offset
            .store((process_offset / TS_UNIT_SIZE as u64) as i64, Ordering::Release);
        info!(next_offset = self.next_offset(), "transaction state table recovered");
    }

    /// Unclean shutdown: rebuild the table from the redo log, keeping only
    /// prepared records that no commit or rollback resolved.
    pub fn recreate(&self, commit_log: &CommitLog) -> StoreResult<()> {
        self.redo_log.recover();
        self.redo_log.truncate_dirty(commit_log.max_offset());
        self.chain.destroy(self.destroy_timeout);
        self.max_physic_offset.store(0, Ordering::Release);

        let mut pending = BTreeMap::new();
        let mut logical = self.redo_log.min_offset();
        while let Some(batch) = self.redo_log.read_index(logical) {
            for (_, unit) in batch.iter() {
                let Some(region) = commit_log.read(unit.commit_log_offset, unit.size.max(0) as usize) else {
                    continue;
                };
                let DecodeOutcome::Record(req) = decode_dispatch(&region, false) else {
                    continue;
                };
                match req.transaction_state() {
                    TransactionState::Prepared => {
                        pending.insert(req.commit_log_offset, req);
                    }
                    TransactionState::Commit | TransactionState::Rollback => {
                        pending.remove(&(req.prepared_transaction_offset as u64));
                    }
                    TransactionState::Normal => {}
                }
            }
            logical = batch.first_logical_offset() + batch.len() as u64;
        }

        self.next_offset.store(0, Ordering::Release);
        for req in pending.values() {
            let slot = self.append_prepared(
                req.commit_log_offset,
                req.size,
                (req.store_timestamp / 1000) as i32,
                req.producer_group_hash(),
            )?;
            debug!(commit_log_offset = req.commit_log_offset, slot = ?slot, "prepared transaction restored");
        }
        info!(pending = pending.len(), "transaction state table recreated from redo log");
        Ok(())
    }

    /// Record a newly dispatched prepared record. Returns its slot, or
    /// `None` when the record was already present.
    pub fn append_prepared(
        &self,
        commit_log_offset: u64,
        size: i32,
        timestamp_secs: i32,
        group_hash: i32,
    ) -> StoreResult<Option<i64>> {
        let end = commit_log_offset + size.max(0) as u64;
        if end <= self.max_physic_offset.load(Ordering::Acquire) {
            return Ok(None);
        }
        let unit = StateUnit {
            commit_log_offset,
            size,
            timestamp_secs,
            group_hash,
            state: TransactionState::Prepared.as_i32(),
        };
        let tail = self.chain.tail(0)?;
        let at = tail.start_offset() + tail.write_pos() as u64;
        if !tail.append_bytes(&unit.encode()) {
            return Err(crate::store::error::StoreError::DataTooLarge {
                len: TS_UNIT_SIZE,
                remaining: tail.capacity() - tail.write_pos(),
            });
        }
        self.max_physic_offset.store(end, Ordering::Release);
        let slot = (at / TS_UNIT_SIZE as u64) as i64;
        self.next_offset.fetch_max(slot + 1, Ordering::AcqRel);
        Ok(Some(slot))
    }

    /// Resolve the prepared record at `slot`. Refuses, leaving the table
    /// untouched, when the slot holds a different record, a different
    /// producer group or an already resolved state.
    pub fn update_state(
        &self,
        slot: i64,
        commit_log_offset: u64,
        group_hash: i32,
        state: TransactionState,
    ) -> bool {
        if slot < 0 {
            warn!(slot, "negative transaction state slot");
            return false;
        }
        let byte = slot as u64 * TS_UNIT_SIZE as u64;
        let Some(segment) = self.chain.find_by_offset(byte) else {
            warn!(slot, "transaction state slot not found");
            return false;
        };
        let pos = (byte - segment.start_offset()) as usize;
        let Some(unit) = segment
            .select_region(pos, TS_UNIT_SIZE)
            .and_then(|r| StateUnit::parse(&r))
        else {
            warn!(slot, "transaction state slot not readable");
            return false;
        };
        if unit.commit_log_offset != commit_log_offset {
            warn!(slot, expected = commit_log_offset, actual = unit.commit_log_offset, "transaction state slot holds another record");
            return false;
        }
        if unit.group_hash != group_hash {
            warn!(slot, expected = group_hash, actual = unit.group_hash, "producer group mismatch, state left unchanged");
            return false;
        }
        if TransactionState::from_i32(unit.state) != TransactionState::Prepared {
            warn!(slot, "transaction already resolved");
            return false;
        }
        segment.overwrite(pos + STATE_POS, &state.as_i32().to_be_bytes())
    }

    pub fn state_of(&self, slot: i64) -> Option<TransactionState> {
        let byte = u64::try_from(slot).ok()? * TS_UNIT_SIZE as u64;
        let segment = self.chain.find_by_offset(byte)?;
        let region = segment.select_region((byte - segment.start_offset()) as usize, TS_UNIT_SIZE)?;
        StateUnit::parse(&region).map(|u| TransactionState::from_i32(u.state))
    }

    /// Prepared records still waiting for a commit or rollback.
    pub fn pending(&self) -> Vec<PreparedTransaction> {
        let mut out = Vec::new();
        for segment in self.chain.segments() {
            let Some(region) = segment.select_region_from(0) else {
                continue;
            };
            for (i, chunk) in region.chunks_exact(TS_UNIT_SIZE).enumerate() {
                let Some(unit) = StateUnit::parse(chunk) else {
                    continue;
                };
                if TransactionState::from_i32(unit.state) == TransactionState::Prepared {
                    out.push(PreparedTransaction {
                        commit_log_offset: unit.commit_log_offset,
                        size: unit.size,
                        store_timestamp_secs: unit.timestamp_secs,
                        producer_group_hash: unit.group_hash,
                        state_table_offset: ((segment.start_offset() + (i * TS_UNIT_SIZE) as u64)
                            / TS_UNIT_SIZE as u64) as i64,
                    });
                }
            }
        }
        out
    }

    /// Log a prepared, commit or rollback record in the redo log.
    pub fn append_redo(&self, commit_log_offset: u64, size: i32, state: TransactionState) -> StoreResult<()> {
        self.redo_log.append_index(
            commit_log_offset,
            size,
            state.as_i32() as i64,
            self.redo_log.max_offset(),
        )
    }

    pub fn delete_expired(&self, min_commit_log_offset: u64) -> usize {
        let tables = self
            .chain
            .delete_expired_by_unit(min_commit_log_offset, TS_UNIT_SIZE, self.destroy_timeout);
        tables + self.redo_log.delete_expired(min_commit_log_offset)
    }

    pub fn commit(&self, least_pages: usize) {
        self.chain.commit(least_pages);
        // state rewrites land behind the flush cursor
        for segment in self.chain.segments() {
            if segment.flush_pos() < segment.write_pos() {
                segment.commit(0);
            }
        }
        self.redo_log.commit(least_pages);
    }

    pub fn destroy(&self) {
        self.chain.destroy(self.destroy_timeout);
        self.redo_log.destroy();
        self.next_offset.store(0, Ordering::Release);
        self.max_physic_offset.store(0, Ordering::Release);
    }
}
