//! A position that carries its own network inputs.
//!
//! Useful when the encoding was done elsewhere (or is synthetic, as in
//! benchmarks): the evaluator copies the stored inputs instead of asking a
//! board representation to encode itself.

use rand::Rng;

use super::{Outcome, Position, PositionClass};
use crate::cache::PositionKey;
use crate::nn::NetClass;

#[derive(Clone, Debug, PartialEq)]
pub struct EncodedPosition {
    pub key: PositionKey,
    pub class: PositionClass,
    pub inputs: Vec<f32>,
    /// Inputs for the pruning net; falls back to `inputs` when absent, which
    /// then must fit the pruning net too.
    pub pruning_inputs: Option<Vec<f32>>,
    pub outcomes: Vec<Outcome<EncodedPosition>>,
}

impl EncodedPosition {
    #[must_use]
    pub fn new(key: PositionKey, class: NetClass, inputs: Vec<f32>) -> Self {
        EncodedPosition {
            key,
            class: PositionClass::Net(class),
            inputs,
            pruning_inputs: None,
            outcomes: Vec::new(),
        }
    }

    /// A finished game with fixed outputs.
    #[must_use]
    pub fn game_over(key: PositionKey, outputs: crate::nn::Outputs) -> Self {
        EncodedPosition {
            key,
            class: PositionClass::Over(outputs),
            inputs: Vec::new(),
            pruning_inputs: None,
            outcomes: Vec::new(),
        }
    }

    /// Random sparse inputs in the style of a board encoding: mostly 0,
    /// some 1, a few fractional.
    pub fn random<R: Rng>(rng: &mut R, class: NetClass, inputs: usize) -> Self {
        let mut key = [0u8; 10];
        rng.fill(&mut key);
        let values = (0..inputs)
            .map(|_| match rng.gen_range(0..10) {
                0..=5 => 0.0,
                6..=8 => 1.0,
                _ => rng.gen_range(0.0f32..2.0),
            })
            .collect();
        Self::new(key, class, values)
    }

    #[must_use]
    pub fn with_outcomes(mut self, outcomes: Vec<Outcome<EncodedPosition>>) -> Self {
        self.outcomes = outcomes;
        self
    }
}

impl Position for EncodedPosition {
    fn key(&self) -> PositionKey {
        self.key
    }

    fn class(&self) -> PositionClass {
        self.class
    }

    /// # Panics
    ///
    /// Panics if the stored inputs do not have the network's input count.
    fn encode(&self, _class: NetClass, pruning: bool, inputs: &mut [f32]) {
        let source = match (&self.pruning_inputs, pruning) {
            (Some(p), true) => p,
            _ => &self.inputs,
        };
        assert_eq!(source.len(), inputs.len(), "input length mismatch");
        inputs.copy_from_slice(source);
    }

    fn chance_outcomes(&self, outcomes: &mut Vec<Outcome<Self>>) {
        outcomes.extend(self.outcomes.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_encode_copies_inputs() {
        let pos = EncodedPosition::new([0; 10], NetClass::Race, vec![1.0, 2.0, 3.0]);
        let mut buf = [0.0; 3];
        pos.encode(NetClass::Race, false, &mut buf);
        assert_eq!(buf, [1.0, 2.0, 3.0]);
    }

    #[test]
    #[should_panic(expected = "input length mismatch")]
    fn test_encode_rejects_short_inputs() {
        let pos = EncodedPosition::new([0; 10], NetClass::Race, vec![1.0, 2.0, 3.0]);
        let mut buf = [0.0; 5];
        pos.encode(NetClass::Race, false, &mut buf);
    }

    #[test]
    #[should_panic(expected = "input length mismatch")]
    fn test_encode_rejects_long_inputs() {
        let pos = EncodedPosition::new([0; 10], NetClass::Race, vec![1.0; 500]);
        let mut buf = [0.0; 24];
        pos.encode(NetClass::Race, false, &mut buf);
    }

    #[test]
    fn test_pruning_inputs_selected() {
        let mut pos = EncodedPosition::new([0; 10], NetClass::Contact, vec![1.0]);
        pos.pruning_inputs = Some(vec![7.0]);

        let mut buf = [0.0];
        pos.encode(NetClass::Contact, true, &mut buf);
        assert_eq!(buf, [7.0]);
        pos.encode(NetClass::Contact, false, &mut buf);
        assert_eq!(buf, [1.0]);
    }

    #[test]
    fn test_random_is_sparse() {
        let mut rng = StdRng::seed_from_u64(42);
        let pos = EncodedPosition::random(&mut rng, NetClass::Contact, 1000);
        let zeros = pos.inputs.iter().filter(|&&v| v == 0.0).count();
        assert!(zeros > 400 && zeros < 800, "{zeros} zeros");
    }
}
