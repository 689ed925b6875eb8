//! Backgammon position evaluation: neural network inference, an evaluation
//! cache and a worker pool for batches of evaluations.

pub mod cache;
pub mod engine;
pub mod error;
pub mod eval;
pub mod nn;
pub mod options;
pub mod pool;
pub mod sync;

pub use cache::{CacheStats, EvalCache, EvalContext, PositionKey};
pub use engine::{Calibration, Engine};
pub use error::{CacheError, EngineError, PoolError, TaskError, WeightsError};
pub use eval::{EncodedPosition, EvalConfig, Evaluator, Locking, Outcome, Position, PositionClass};
pub use nn::{NetClass, NetworkSet, NeuralNet, Outputs};
pub use options::{EngineOptions, OptionAction};
pub use pool::{BatchOutcome, Progress, Scheduler, Task, WaitOptions, WorkerContext};
