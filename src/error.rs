//! Shared error taxonomy for the engine.
//!
//! Every component returns tagged results instead of raising exceptions.
//! `InvalidTarget` and `CacheError` are recoverable by callers (an ignored
//! setter, an in-memory cache fallback); every other variant aborts the
//! current simulation run.

use thiserror::Error;

/// Tagged error returned by any fallible engine operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Setter targeted an unknown compound, phase, port, unit or stream key.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Structural problem in a flowsheet (unconnected ports, duplicated
    /// endpoints, empty compound list, unknown model key, ...).
    #[error("structural error: {0}")]
    StructuralError(String),

    /// The models manager could not resolve a unit or solver key.
    #[error("model load error: {0}")]
    ModelLoadError(String),

    /// A unit's `simulate` call returned a non-empty error message.
    #[error("unit '{unit}' failed: {message}")]
    UnitError { unit: String, message: String },

    /// A partition failed to converge within the configured iteration limit.
    #[error("partition {partition} diverged after {iterations} iterations")]
    PartitionDiverged { partition: usize, iterations: u32 },

    /// The adaptive time window shrank below `minTimeWindow` without
    /// reaching convergence.
    #[error("time window shrank below the minimum ({min_window}) without converging")]
    MinWindowReached { min_window: f64 },

    /// Disk spill failed. Recoverable: the matrix falls back to in-memory
    /// storage and this is logged once as a warning.
    #[error("cache error: {0}")]
    CacheError(String),

    /// The cooperative cancellation flag was observed.
    #[error("simulation was cancelled by the user")]
    UserAborted,

    /// Persistence load/save failure.
    #[error("I/O error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::IOError(e.to_string())
    }
}

impl From<bincode::Error> for EngineError {
    fn from(e: bincode::Error) -> Self {
        EngineError::IOError(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
