use thiserror::Error;

use crate::tape::TapeError;
use tapeback_meta::MetaError;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Pipeline-level errors.
///
/// The variants follow the engine's failure taxonomy: transient store and
/// tape conditions are absorbed by the retry layers below and only surface
/// here once retries are exhausted; what a worker sees is already
/// classified.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Tape(#[from] TapeError),

    #[error("compression of group {group_idx} failed repeatedly")]
    Compression {
        group_idx: u32,
        #[source]
        source: anyhow::Error,
    },

    /// The tape (or another shared resource) needs a human: wrong label,
    /// no writable medium. Not retried automatically.
    #[error("operator intervention required: {0}")]
    OperatorRequired(String),

    #[error("task cancelled")]
    Cancelled,

    /// The store stayed unreachable past the recovery window, or a worker
    /// hit a state it cannot continue from.
    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}
