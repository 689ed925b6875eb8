//! Error types for weight loading, the cache, the worker pool and the engine.

use std::fmt;
use std::io;

use crate::pool::BatchOutcome;

/// Error type for weight file loading failures
#[derive(Debug)]
pub enum WeightsError {
    /// Underlying read or write failed
    Io(io::Error),
    /// Binary file does not start with the expected magic number
    BadMagic { found: f32 },
    /// File version is not one this loader understands
    BadVersion { found: String },
    /// Net header declares out-of-range dimensions
    BadDimensions {
        net: usize,
        inputs: i64,
        hidden: i64,
        outputs: i64,
    },
    /// File ended before all declared values were read
    Truncated { net: usize },
    /// A text token could not be parsed as a number
    Parse { line: usize, token: String },
    /// File holds a number of nets other than 3 or 6
    NetCount { found: usize },
    /// A net's output count does not match what its role requires
    OutputMismatch {
        net: usize,
        expected: usize,
        found: usize,
    },
}

impl fmt::Display for WeightsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightsError::Io(err) => write!(f, "I/O error reading weights: {err}"),
            WeightsError::BadMagic { found } => {
                write!(f, "Bad magic number {found} in binary weights")
            }
            WeightsError::BadVersion { found } => {
                write!(f, "Unsupported weights version '{found}'")
            }
            WeightsError::BadDimensions {
                net,
                inputs,
                hidden,
                outputs,
            } => write!(
                f,
                "Net {net} has invalid dimensions {inputs}x{hidden}x{outputs}"
            ),
            WeightsError::Truncated { net } => write!(f, "Weights truncated in net {net}"),
            WeightsError::Parse { line, token } => {
                write!(f, "Cannot parse '{token}' on line {line}")
            }
            WeightsError::NetCount { found } => {
                write!(f, "Expected 3 or 6 nets, found {found}")
            }
            WeightsError::OutputMismatch {
                net,
                expected,
                found,
            } => write!(f, "Net {net} must have {expected} outputs, found {found}"),
        }
    }
}

impl std::error::Error for WeightsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WeightsError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for WeightsError {
    fn from(err: io::Error) -> Self {
        WeightsError::Io(err)
    }
}

/// Error type for cache allocation failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Not enough memory for the requested number of slots
    Allocation { slots: usize },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Allocation { slots } => {
                write!(f, "Cannot allocate evaluation cache with {slots} slots")
            }
        }
    }
}

impl std::error::Error for CacheError {}

/// Error type for pool control failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// A batch is still outstanding
    Busy { pending: usize },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Busy { pending } => {
                write!(f, "Pool is busy with {pending} outstanding tasks")
            }
        }
    }
}

impl std::error::Error for PoolError {}

/// Failure reported by a single task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task returned an error
    Failed(String),
    /// The task panicked
    Panicked(String),
    /// The task stopped because its batch was cancelled
    Cancelled,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Failed(msg) => write!(f, "Task failed: {msg}"),
            TaskError::Panicked(msg) => write!(f, "Task panicked: {msg}"),
            TaskError::Cancelled => write!(f, "Task cancelled"),
        }
    }
}

impl std::error::Error for TaskError {}

/// Error type for engine-level operations
#[derive(Debug)]
pub enum EngineError {
    Weights(WeightsError),
    Cache(CacheError),
    Pool(PoolError),
    /// The evaluator is shared with running tasks and cannot be modified
    Busy,
    /// A batch failed or was cancelled before producing every result
    Incomplete(BatchOutcome),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Weights(err) => write!(f, "{err}"),
            EngineError::Cache(err) => write!(f, "{err}"),
            EngineError::Pool(err) => write!(f, "{err}"),
            EngineError::Busy => write!(f, "Evaluator is in use by outstanding tasks"),
            EngineError::Incomplete(outcome) => write!(
                f,
                "Batch incomplete: {} tasks completed{}",
                outcome.completed,
                if outcome.cancelled { ", cancelled" } else { "" }
            ),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Weights(err) => Some(err),
            EngineError::Cache(err) => Some(err),
            EngineError::Pool(err) => Some(err),
            EngineError::Busy | EngineError::Incomplete(_) => None,
        }
    }
}

impl From<WeightsError> for EngineError {
    fn from(err: WeightsError) -> Self {
        EngineError::Weights(err)
    }
}

impl From<CacheError> for EngineError {
    fn from(err: CacheError) -> Self {
        EngineError::Cache(err)
    }
}

impl From<PoolError> for EngineError {
    fn from(err: PoolError) -> Self {
        EngineError::Pool(err)
    }
}
