//! Store error types.
//!
//! Put outcomes (`PutStatus`) and lookup outcomes are values, not errors: a
//! rejected record or an empty queue is an expected answer. `StoreError` is
//! reserved for faults the caller cannot retry around, mostly I/O while
//! mapping, truncating or persisting files.

use std::path::PathBuf;
use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("segment {path:?} has length {actual}, expected {expected}")]
    SegmentSize {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("segment file name is not a 20-digit offset: {0:?}")]
    SegmentName(PathBuf),

    #[error("segment chain has a gap: {previous_end} then {next_start}")]
    SegmentNotContiguous { previous_end: u64, next_start: u64 },

    #[error("store has not been loaded")]
    NotLoaded,

    #[error("store is shut down")]
    Shutdown,

    #[error("replica append at {given} but commit log ends at {expected}")]
    ReplicaOffsetMismatch { given: u64, expected: u64 },

    #[error("{len} bytes do not fit into the segment tail ({remaining} left)")]
    DataTooLarge { len: usize, remaining: usize },

    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),
}
