//! Units of work executed by the pool.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use super::context::WorkerContext;
use crate::error::TaskError;

/// Boxed task body.
pub type TaskFn = Box<dyn FnOnce(&mut WorkerContext) -> Result<(), TaskError> + Send>;

/// A task plus an optional payload that lives exactly as long as the task.
pub struct Task {
    run: TaskFn,
    linked: Option<Box<dyn Any + Send>>,
}

impl Task {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&mut WorkerContext) -> Result<(), TaskError> + Send + 'static,
    {
        Task {
            run: Box::new(f),
            linked: None,
        }
    }

    /// Attach a payload dropped together with the task.
    #[must_use]
    pub fn with_linked<L: Any + Send>(mut self, linked: L) -> Self {
        self.linked = Some(Box::new(linked));
        self
    }

    /// Run the task, turning a panic into [`TaskError::Panicked`]. The task
    /// and its payload are dropped before this returns.
    pub(crate) fn execute(self, ctx: &mut WorkerContext) -> Result<(), TaskError> {
        let Task { run, linked } = self;
        let result = panic::catch_unwind(AssertUnwindSafe(|| run(ctx))).unwrap_or_else(|payload| {
            // An unwound task may have left a bracket open
            ctx.close_incremental();
            Err(TaskError::Panicked(panic_message(payload.as_ref())))
        });
        drop(linked);
        result
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("linked", &self.linked.is_some())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Entry in the pool queue.
#[derive(Debug)]
pub(crate) enum Job {
    Run(Task),
    /// Ends the worker that dequeues it.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_execute_returns_result() {
        let mut ctx = WorkerContext::standalone();
        assert!(Task::new(|_| Ok(())).execute(&mut ctx).is_ok());
        assert_eq!(
            Task::new(|_| Err(TaskError::Failed("bad".into()))).execute(&mut ctx),
            Err(TaskError::Failed("bad".into()))
        );
    }

    #[test]
    fn test_panic_is_caught() {
        let mut ctx = WorkerContext::standalone();
        let result = Task::new(|_| panic!("kaboom")).execute(&mut ctx);
        assert_eq!(result, Err(TaskError::Panicked("kaboom".into())));
    }

    #[test]
    fn test_panic_closes_incremental_bracket() {
        let mut ctx = WorkerContext::standalone();
        let result = Task::new(|ctx| {
            ctx.begin_incremental();
            panic!("mid scan")
        })
        .execute(&mut ctx);
        assert!(result.is_err());
        assert_eq!(
            ctx.states().get(crate::nn::NetClass::Race).marker(),
            crate::nn::StateMarker::Empty
        );

        // The next bracket starts from the outermost level again
        ctx.begin_incremental();
        ctx.end_incremental();
        assert_eq!(
            ctx.states().get(crate::nn::NetClass::Race).marker(),
            crate::nn::StateMarker::Empty
        );
    }

    #[test]
    fn test_linked_payload_dropped_with_task() {
        let mut ctx = WorkerContext::standalone();
        let shared = Arc::new(());
        let task = Task::new(|_| Ok(())).with_linked(Arc::clone(&shared));
        assert_eq!(Arc::strong_count(&shared), 2);

        task.execute(&mut ctx).unwrap();
        assert_eq!(Arc::strong_count(&shared), 1);
    }
}
