//! Per-worker scratch state handed to every task.

use crate::nn::{ClassStates, NetClass};
use crate::sync::CancelToken;

/// Scratch owned by one worker thread and lent to each task it runs.
#[derive(Debug)]
pub struct WorkerContext {
    id: usize,
    states: ClassStates,
    depth: u32,
    pub(crate) inputs: Vec<f32>,
    pub(crate) hidden: Vec<f32>,
    cancel: CancelToken,
}

impl WorkerContext {
    pub(crate) fn new(id: usize, cancel: CancelToken) -> Self {
        WorkerContext {
            id,
            states: ClassStates::new(),
            depth: 0,
            inputs: Vec::new(),
            hidden: Vec::new(),
            cancel,
        }
    }

    /// A context for evaluating on the calling thread, outside any pool.
    #[must_use]
    pub fn standalone() -> Self {
        Self::new(0, CancelToken::new())
    }

    /// Index of the owning worker.
    #[inline]
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether the current batch was abandoned. Long tasks should poll this.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Start reusing saved bases across the following evaluations.
    ///
    /// Brackets nest: only the outermost pair arms and clears the states, so
    /// a look-ahead inside a candidate scan keeps the scan's bases alive.
    pub fn begin_incremental(&mut self) {
        if self.depth == 0 {
            self.states.begin();
        }
        self.depth += 1;
    }

    pub fn end_incremental(&mut self) {
        match self.depth {
            0 => {}
            1 => {
                self.depth = 0;
                self.states.end();
            }
            _ => self.depth -= 1,
        }
    }

    /// Close every open bracket at once.
    pub(crate) fn close_incremental(&mut self) {
        if self.depth > 0 {
            self.depth = 0;
            self.states.end();
        }
    }

    #[must_use]
    pub fn states(&self) -> &ClassStates {
        &self.states
    }

    /// Borrow the incremental state of `class` together with both scratch buffers.
    pub(crate) fn scratch(
        &mut self,
        class: NetClass,
    ) -> (&mut crate::nn::IncrementalState, &mut Vec<f32>, &mut Vec<f32>) {
        (self.states.get_mut(class), &mut self.inputs, &mut self.hidden)
    }
}
