use thiserror::Error;

use crate::worker::WorkerType;

/// Errors that can occur in logrep-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no free worker slot (capacity {capacity}); increase max_workers")]
    NoFreeSlot { capacity: usize },

    #[error("stale worker reference: slot {slot} generation {expected}, live generation {found}")]
    StaleWorkerReference {
        slot: usize,
        expected: u64,
        found: u64,
    },

    #[error("worker slot {slot} holds a {found} worker, expected {expected}")]
    WorkerTypeMismatch {
        slot: usize,
        expected: WorkerType,
        found: WorkerType,
    },

    #[error("worker slot {0} out of range")]
    InvalidSlot(usize),

    #[error("failed to start worker: {0}")]
    Spawn(String),

    #[error("invalid LSN format: {0}")]
    InvalidLsn(String),
}

pub type Result<T> = std::result::Result<T, Error>;
