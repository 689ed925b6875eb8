//! Position evaluation on top of the networks and the cache.
//!
//! Positions come from outside through the [`Position`] trait. An
//! [`Evaluator`] turns them into [`Outputs`]:
//! - 0-ply: cache probe, then a forward pass through the class network
//! - n-ply: for every chance outcome the mover's best successor (by 0-ply
//!   equity) is evaluated one ply shallower, and the results are averaged
//!
//! Every public entry point picks the cache access mode once, from the
//! evaluator's [`Locking`], and runs a generic implementation for it.

pub mod encoded;
pub mod noise;
pub mod outputs;

pub use encoded::EncodedPosition;
pub use outputs::{cubeless_equity, invert, sanity_check};

use crate::cache::{CacheAccess, EvalCache, EvalContext, Locked, PositionKey, Unlocked};
use crate::nn::{NetClass, NetworkSet, Outputs, NUM_OUTPUTS};
use crate::pool::WorkerContext;

/// How a position is evaluated.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PositionClass {
    /// The game is over; these are the final outputs.
    Over(Outputs),
    /// Evaluated by the network of this class.
    Net(NetClass),
}

/// One chance event (a dice roll) and the positions the mover can reach.
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome<P> {
    /// Relative probability of the event.
    pub weight: f32,
    /// Reachable positions, each seen from the opponent, who is on roll next.
    pub successors: Vec<P>,
}

/// A position as seen from the player on roll.
pub trait Position: Sized {
    /// Identity used for caching.
    fn key(&self) -> PositionKey;

    fn class(&self) -> PositionClass;

    /// Write the network inputs for `class` into `inputs`, which is zeroed
    /// and sized to the network. `pruning` selects the pruning net encoding.
    fn encode(&self, class: NetClass, pruning: bool, inputs: &mut [f32]);

    /// Append the chance outcomes from this position. Positions without
    /// lookahead information leave `outcomes` empty.
    fn chance_outcomes(&self, _outcomes: &mut Vec<Outcome<Self>>) {}
}

/// Evaluation settings.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EvalConfig {
    /// Lookahead depth.
    pub plies: u8,
    /// Standard deviation of the noise added to top-level results; 0 disables it.
    pub noise: f32,
    /// Derive the noise from the position key instead of a random source.
    pub deterministic: bool,
    pub cubeful: bool,
    /// Use the pruning nets for 0-ply evaluations when they are loaded.
    pub use_prune: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        EvalConfig {
            plies: 0,
            noise: 0.0,
            deterministic: true,
            cubeful: false,
            use_prune: false,
        }
    }
}

impl EvalConfig {
    #[must_use]
    pub fn context(&self, plies: u8) -> EvalContext {
        EvalContext::new(plies, self.cubeful, self.use_prune)
    }
}

/// Cache access mode of an [`Evaluator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Locking {
    /// One worker: no slot locks.
    Exclusive,
    /// Several workers: slot locks on every access.
    Shared,
}

impl Locking {
    /// Mode for a pool with `workers` threads.
    #[must_use]
    pub fn for_workers(workers: usize) -> Self {
        if workers <= 1 {
            Locking::Exclusive
        } else {
            Locking::Shared
        }
    }
}

/// Networks plus cache. Shared read-only between workers.
pub struct Evaluator {
    nets: NetworkSet,
    cache: EvalCache,
    locking: Locking,
}

macro_rules! dispatch {
    ($self:ident, $method:ident ( $($arg:expr),* $(,)? )) => {
        match $self.locking {
            Locking::Exclusive => $self.$method::<Unlocked, _>($($arg),*),
            Locking::Shared => $self.$method::<Locked, _>($($arg),*),
        }
    };
}

impl Evaluator {
    #[must_use]
    pub fn new(nets: NetworkSet, cache: EvalCache) -> Self {
        Evaluator {
            nets,
            cache,
            locking: Locking::Shared,
        }
    }

    #[must_use]
    pub fn locking(&self) -> Locking {
        self.locking
    }

    /// Rebind the cache access mode. Needs exclusive access, so it cannot
    /// change under a running evaluation.
    pub fn set_locking(&mut self, locking: Locking) {
        if locking != self.locking {
            log::debug!("evaluator locking: {:?} -> {:?}", self.locking, locking);
        }
        self.locking = locking;
    }

    #[must_use]
    pub fn nets(&self) -> &NetworkSet {
        &self.nets
    }

    #[must_use]
    pub fn cache(&self) -> &EvalCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut EvalCache {
        &mut self.cache
    }

    /// Evaluate at `config.plies`, adding noise if configured.
    pub fn evaluate<P: Position>(&self, ctx: &mut WorkerContext, pos: &P, config: &EvalConfig) -> Outputs {
        dispatch!(self, evaluate_top(ctx, pos, config))
    }

    /// Evaluate at an explicit depth, without noise.
    pub fn evaluate_plies<P: Position>(
        &self,
        ctx: &mut WorkerContext,
        pos: &P,
        plies: u8,
        config: &EvalConfig,
    ) -> Outputs {
        dispatch!(self, eval_plies(ctx, pos, plies, config))
    }

    /// Pick the candidate that is best for the player making the move.
    ///
    /// Candidates are the positions after the move, seen from the opponent.
    /// Returns the index of the best one and its outputs from the mover's
    /// side, or `None` if there are no candidates.
    pub fn find_best<P: Position>(
        &self,
        ctx: &mut WorkerContext,
        candidates: &[P],
        config: &EvalConfig,
    ) -> Option<(usize, Outputs)> {
        dispatch!(self, best_candidate(ctx, candidates, config.plies, config, true))
    }

    /// Forward pass without the cache or lookahead.
    pub fn evaluate_uncached<P: Position>(&self, ctx: &mut WorkerContext, pos: &P, use_prune: bool) -> Outputs {
        match pos.class() {
            PositionClass::Over(out) => out,
            PositionClass::Net(class) => self.forward(ctx, pos, class, use_prune),
        }
    }

    fn evaluate_top<A: CacheAccess, P: Position>(
        &self,
        ctx: &mut WorkerContext,
        pos: &P,
        config: &EvalConfig,
    ) -> Outputs {
        let mut out = self.eval_plies::<A, P>(ctx, pos, config.plies, config);
        if config.noise > 0.0 && matches!(pos.class(), PositionClass::Net(_)) {
            noise::add_noise(&mut out, &pos.key(), config.noise, config.deterministic);
            sanity_check(&mut out);
        }
        out
    }

    fn eval_plies<A: CacheAccess, P: Position>(
        &self,
        ctx: &mut WorkerContext,
        pos: &P,
        plies: u8,
        config: &EvalConfig,
    ) -> Outputs {
        let class = match pos.class() {
            PositionClass::Over(out) => return out,
            PositionClass::Net(class) => class,
        };

        let plies = plies.min(EvalContext::MAX_PLIES);
        let context = config.context(plies);
        let key = pos.key();
        let probe = A::lookup(&self.cache, &key, context);
        if let Some(out) = probe.value {
            return out;
        }

        let out = if plies == 0 {
            self.forward(ctx, pos, class, config.use_prune)
        } else {
            self.lookahead::<A, P>(ctx, pos, plies, config)
                .unwrap_or_else(|| self.eval_plies::<A, P>(ctx, pos, 0, config))
        };

        A::add(&self.cache, probe.slot, &key, context, &out);
        out
    }

    /// Average over the chance outcomes. `None` if no outcome has successors.
    fn lookahead<A: CacheAccess, P: Position>(
        &self,
        ctx: &mut WorkerContext,
        pos: &P,
        plies: u8,
        config: &EvalConfig,
    ) -> Option<Outputs> {
        let mut outcomes = Vec::new();
        pos.chance_outcomes(&mut outcomes);

        let mut sum = [0.0f64; NUM_OUTPUTS];
        let mut total_weight = 0.0f64;

        for outcome in &outcomes {
            if outcome.successors.is_empty() || outcome.weight <= 0.0 {
                continue;
            }
            let Some((best, _)) = self.best_candidate::<A, P>(ctx, &outcome.successors, 0, config, false) else {
                continue;
            };

            let reply = self.eval_plies::<A, P>(ctx, &outcome.successors[best], plies - 1, config);
            let ours = invert(&reply);
            let w = f64::from(outcome.weight);
            for (s, &v) in sum.iter_mut().zip(&ours) {
                *s += w * f64::from(v);
            }
            total_weight += w;
        }

        if total_weight <= 0.0 {
            return None;
        }

        let mut out = sum.map(|s| (s / total_weight) as f32);
        sanity_check(&mut out);
        Some(out)
    }

    fn best_candidate<A: CacheAccess, P: Position>(
        &self,
        ctx: &mut WorkerContext,
        candidates: &[P],
        plies: u8,
        config: &EvalConfig,
        noisy: bool,
    ) -> Option<(usize, Outputs)> {
        let mut best: Option<(usize, Outputs, f32)> = None;

        ctx.begin_incremental();
        for (i, candidate) in candidates.iter().enumerate() {
            let theirs = if noisy {
                self.evaluate_top::<A, P>(ctx, candidate, &EvalConfig { plies, ..*config })
            } else {
                self.eval_plies::<A, P>(ctx, candidate, plies, config)
            };
            let ours = invert(&theirs);
            let equity = cubeless_equity(&ours);
            if best.map_or(true, |(_, _, b)| equity > b) {
                best = Some((i, ours, equity));
            }
        }
        ctx.end_incremental();

        best.map(|(i, out, _)| (i, out))
    }

    fn forward<P: Position>(&self, ctx: &mut WorkerContext, pos: &P, class: NetClass, use_prune: bool) -> Outputs {
        let (net, pruning) = match self.nets.pruning(class) {
            Some(net) if use_prune => (net, true),
            _ => (self.nets.net(class), false),
        };

        let (state, inputs, hidden) = ctx.scratch(class);
        inputs.clear();
        inputs.resize(net.inputs(), 0.0);
        pos.encode(class, pruning, inputs);

        let mut out = [0.0f32; NUM_OUTPUTS];
        // Pruning nets have their own input layout; never mix them into the saved base
        let state = if pruning { None } else { Some(state) };
        net.evaluate(inputs, hidden, &mut out, state);
        sanity_check(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{NetParams, NeuralNet, StateMarker};

    /// Nets with zero weights: every output is exactly 0.5.
    fn flat_nets() -> NetworkSet {
        let net = |inputs: usize| {
            NeuralNet::from_params(NetParams {
                inputs,
                hidden: 2,
                outputs: NUM_OUTPUTS,
                trained: true,
                beta_hidden: 1.0,
                beta_output: 1.0,
                hidden_weights: vec![0.0; inputs * 2],
                output_weights: vec![0.0; NUM_OUTPUTS * 2],
                hidden_thresholds: vec![0.0; 2],
                output_thresholds: vec![0.0; NUM_OUTPUTS],
            })
            .unwrap()
        };
        NetworkSet::from_nets(vec![net(4), net(4), net(4)]).unwrap()
    }

    struct Fixed {
        key: u8,
        class: PositionClass,
    }

    impl Position for Fixed {
        fn key(&self) -> PositionKey {
            [self.key; 10]
        }

        fn class(&self) -> PositionClass {
            self.class
        }

        fn encode(&self, _class: NetClass, _pruning: bool, inputs: &mut [f32]) {
            inputs[0] = 1.0;
        }
    }

    fn evaluator() -> Evaluator {
        Evaluator::new(flat_nets(), EvalCache::new(64).unwrap())
    }

    #[test]
    fn test_zero_ply_uses_cache() {
        let eval = evaluator();
        let mut ctx = WorkerContext::standalone();
        let pos = Fixed {
            key: 1,
            class: PositionClass::Net(NetClass::Contact),
        };

        let first = eval.evaluate(&mut ctx, &pos, &EvalConfig::default());
        let second = eval.evaluate(&mut ctx, &pos, &EvalConfig::default());
        assert_eq!(first, second);

        let stats = eval.cache().stats();
        assert_eq!(stats.lookups, 2);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_game_over_bypasses_net_and_cache() {
        let eval = evaluator();
        let mut ctx = WorkerContext::standalone();
        let result = [1.0, 1.0, 0.0, 0.0, 0.0];
        let pos = Fixed {
            key: 2,
            class: PositionClass::Over(result),
        };

        assert_eq!(eval.evaluate(&mut ctx, &pos, &EvalConfig::default()), result);
        assert_eq!(eval.cache().stats().lookups, 0);
    }

    #[test]
    fn test_outputs_are_sane() {
        let eval = evaluator();
        let mut ctx = WorkerContext::standalone();
        let pos = Fixed {
            key: 3,
            class: PositionClass::Net(NetClass::Race),
        };
        let out = eval.evaluate(&mut ctx, &pos, &EvalConfig::default());
        for &v in &out {
            assert!((0.0..=1.0).contains(&v));
        }
        assert!(out[1] <= out[0]);
        assert!(out[2] <= out[1]);
    }

    #[test]
    fn test_locking_modes_agree() {
        let mut eval = evaluator();
        let mut ctx = WorkerContext::standalone();
        let pos = Fixed {
            key: 4,
            class: PositionClass::Net(NetClass::Crashed),
        };

        let shared = eval.evaluate(&mut ctx, &pos, &EvalConfig::default());
        eval.set_locking(Locking::Exclusive);
        eval.cache_mut().flush();
        let exclusive = eval.evaluate(&mut ctx, &pos, &EvalConfig::default());
        assert_eq!(shared, exclusive);
    }

    #[test]
    fn test_locking_for_workers() {
        assert_eq!(Locking::for_workers(0), Locking::Exclusive);
        assert_eq!(Locking::for_workers(1), Locking::Exclusive);
        assert_eq!(Locking::for_workers(4), Locking::Shared);
    }

    #[test]
    fn test_find_best_empty() {
        let eval = evaluator();
        let mut ctx = WorkerContext::standalone();
        let none: [Fixed; 0] = [];
        assert!(eval.find_best(&mut ctx, &none, &EvalConfig::default()).is_none());
    }

    #[test]
    fn test_find_best_prefers_opponent_loss() {
        let eval = evaluator();
        let mut ctx = WorkerContext::standalone();
        let candidates = [
            Fixed {
                key: 5,
                class: PositionClass::Net(NetClass::Contact),
            },
            // Opponent has already lost: best for the mover
            Fixed {
                key: 6,
                class: PositionClass::Over([0.0, 0.0, 0.0, 1.0, 0.0]),
            },
        ];

        let (index, outputs) = eval
            .find_best(&mut ctx, &candidates, &EvalConfig::default())
            .unwrap();
        assert_eq!(index, 1);
        assert_eq!(outputs, [1.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_lookahead_keeps_outer_scan_incremental() {
        use super::encoded::EncodedPosition;

        let eval = evaluator();
        let mut ctx = WorkerContext::standalone();
        let reply = EncodedPosition::new([20; 10], NetClass::Race, vec![0.0, 1.0, 0.0, 0.0]);
        let candidates = [
            // Scanning this one's replies opens a nested bracket
            EncodedPosition::new([10; 10], NetClass::Contact, vec![1.0, 0.0, 0.0, 0.0]).with_outcomes(vec![
                Outcome {
                    weight: 1.0,
                    successors: vec![reply],
                },
            ]),
            EncodedPosition::new([11; 10], NetClass::Contact, vec![1.0, 1.0, 0.0, 0.0]),
            EncodedPosition::new([12; 10], NetClass::Contact, vec![1.0, 1.0, 1.0, 0.0]),
        ];

        let config = EvalConfig {
            plies: 1,
            ..EvalConfig::default()
        };
        assert!(eval.find_best(&mut ctx, &candidates, &config).is_some());

        // The third candidate reused the second one's base
        assert_eq!(ctx.states().get(NetClass::Contact).from_base_count(), 1);
        assert_eq!(ctx.states().get(NetClass::Contact).marker(), StateMarker::Empty);
    }
}
