//! Per-worker incremental evaluation state.
//!
//! Consecutive evaluations of related positions (e.g. the candidates of one
//! move) share most of their inputs. The first pass after [`IncrementalState::begin`]
//! saves the inputs and the hidden pre-activation; later passes only apply the
//! input differences to the saved pre-activation.

use super::{NetClass, NUM_NET_CLASSES};

/// Where an [`IncrementalState`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateMarker {
    /// Plain passes only.
    Empty,
    /// The next pass saves a base.
    Incremental,
    /// A base is saved; passes evaluate from it.
    Complete,
}

/// Saved base for one network.
#[derive(Clone, Debug)]
pub struct IncrementalState {
    marker: StateMarker,
    saved_inputs: Vec<f32>,
    saved_hidden: Vec<f32>,
    diff: Vec<f32>,
    from_base: u64,
}

impl Default for IncrementalState {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            marker: StateMarker::Empty,
            saved_inputs: Vec::new(),
            saved_hidden: Vec::new(),
            diff: Vec::new(),
            from_base: 0,
        }
    }

    /// Arm the state: the next pass saves its inputs and pre-activation.
    pub fn begin(&mut self) {
        self.marker = StateMarker::Incremental;
    }

    /// Leave the incremental context.
    pub fn end(&mut self) {
        self.marker = StateMarker::Empty;
    }

    /// Forget any saved base.
    pub fn reset(&mut self) {
        self.marker = StateMarker::Empty;
        self.saved_inputs.clear();
        self.saved_hidden.clear();
    }

    #[inline]
    #[must_use]
    pub fn marker(&self) -> StateMarker {
        self.marker
    }

    /// Number of passes served from a saved base.
    #[must_use]
    pub fn from_base_count(&self) -> u64 {
        self.from_base
    }

    pub(crate) fn save(&mut self, inputs: &[f32], hidden: &[f32]) {
        self.saved_inputs.clear();
        self.saved_inputs.extend_from_slice(inputs);
        self.saved_hidden.clear();
        self.saved_hidden.extend_from_slice(hidden);
        self.marker = StateMarker::Complete;
    }

    /// Compute `inputs - saved` into the diff buffer.
    ///
    /// Returns `false` (and drops back to [`StateMarker::Empty`]) when the
    /// saved base has other dimensions or more than half the inputs changed.
    pub(crate) fn prepare_diff(&mut self, inputs: &[f32], hidden_len: usize) -> bool {
        if self.saved_inputs.len() != inputs.len() || self.saved_hidden.len() != hidden_len {
            self.marker = StateMarker::Empty;
            return false;
        }

        self.diff.clear();
        self.diff.extend(
            inputs
                .iter()
                .zip(&self.saved_inputs)
                .map(|(&now, &then)| now - then),
        );

        let changed = self.diff.iter().filter(|&&d| d != 0.0).count();
        if changed * 2 > inputs.len() {
            self.marker = StateMarker::Empty;
            return false;
        }

        self.from_base += 1;
        true
    }

    #[inline]
    pub(crate) fn saved_hidden(&self) -> &[f32] {
        &self.saved_hidden
    }

    #[inline]
    pub(crate) fn diff(&self) -> &[f32] {
        &self.diff
    }
}

/// One [`IncrementalState`] per network class.
#[derive(Clone, Debug, Default)]
pub struct ClassStates {
    states: [IncrementalState; NUM_NET_CLASSES],
}

impl ClassStates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm every class.
    pub fn begin(&mut self) {
        self.states.iter_mut().for_each(IncrementalState::begin);
    }

    pub fn end(&mut self) {
        self.states.iter_mut().for_each(IncrementalState::end);
    }

    pub fn reset(&mut self) {
        self.states.iter_mut().for_each(IncrementalState::reset);
    }

    #[inline]
    pub fn get(&self, class: NetClass) -> &IncrementalState {
        &self.states[class.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, class: NetClass) -> &mut IncrementalState {
        &mut self.states[class.index()]
    }
}
