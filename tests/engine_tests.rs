use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use bgeval::nn::NUM_OUTPUTS;
use bgeval::pool::WaitOptions;
use bgeval::{
    EncodedPosition, Engine, EngineError, EngineOptions, EvalConfig, Locking, NetClass, NetworkSet, NeuralNet,
    Outcome, Position, PositionClass, PositionKey, WorkerContext,
};

const INPUTS: usize = 24;

fn nets(seed: u64) -> NetworkSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let nets = (0..3)
        .map(|_| NeuralNet::random(INPUTS, 12, NUM_OUTPUTS, &mut rng).unwrap())
        .collect();
    NetworkSet::from_nets(nets).unwrap()
}

fn engine(threads: usize) -> Engine {
    let options = EngineOptions {
        threads,
        cache_size: 4096,
        ..EngineOptions::default()
    };
    Engine::new(nets(7), options).unwrap()
}

fn positions(n: usize) -> Arc<[EncodedPosition]> {
    let mut rng = StdRng::seed_from_u64(99);
    (0..n)
        .map(|i| EncodedPosition::random(&mut rng, NetClass::ALL[i % 3], INPUTS))
        .collect()
}

#[test]
fn parallel_results_match_serial_ones() {
    let positions = positions(200);
    let config = EvalConfig::default();

    let mut parallel = engine(4);
    let results = parallel.evaluate_all(Arc::clone(&positions), &config).unwrap();

    let mut serial = engine(1);
    assert_eq!(results.len(), positions.len());
    for (pos, out) in positions.iter().zip(&results) {
        assert_eq!(&serial.evaluate(pos), out);
    }
}

#[test]
#[should_panic(expected = "input length mismatch")]
fn short_inputs_are_rejected() {
    let mut engine = engine(1);
    engine.evaluate(&EncodedPosition::new([4; 10], NetClass::Contact, vec![1.0; 3]));
}

#[test]
#[should_panic(expected = "input length mismatch")]
fn long_inputs_are_rejected() {
    let mut engine = engine(1);
    engine.evaluate(&EncodedPosition::new([5; 10], NetClass::Race, vec![1.0; 500]));
}

#[test]
fn locking_follows_thread_count() {
    let mut engine = engine(1);
    assert_eq!(engine.evaluator().locking(), Locking::Exclusive);

    engine.set_num_threads(3).unwrap();
    assert_eq!(engine.scheduler().effective_threads(), 3);
    assert_eq!(engine.evaluator().locking(), Locking::Shared);
    assert_eq!(engine.options().threads, 3);

    engine.set_num_threads(1).unwrap();
    assert_eq!(engine.evaluator().locking(), Locking::Exclusive);
}

#[test]
fn held_evaluator_blocks_reconfiguration() {
    let mut engine = engine(2);
    let held = Arc::clone(engine.evaluator());

    assert!(matches!(engine.resize_cache(128), Err(EngineError::Busy)));
    assert!(matches!(engine.flush_cache(), Err(EngineError::Busy)));
    assert!(matches!(engine.set_num_threads(4), Err(EngineError::Busy)));
    assert!(matches!(engine.set_option("threads", Some("4")), Err(EngineError::Busy)));
    assert_eq!(engine.scheduler().num_threads(), 2);
    assert_eq!(engine.options().threads, 2);

    drop(held);
    engine.resize_cache(128).unwrap();
    assert_eq!(engine.cache_stats().capacity, 128);
    engine.set_option("Threads", Some("4")).unwrap();
    assert_eq!(engine.scheduler().num_threads(), 4);
}

#[test]
fn options_by_name() {
    let mut engine = engine(1);
    engine.set_option("Cache Size", Some("1000")).unwrap();
    assert_eq!(engine.cache_stats().capacity, 1024);

    engine.set_option("plies", Some("2")).unwrap();
    engine.set_option("Noise", Some("0.05")).unwrap();
    engine.set_option("no such option", Some("1")).unwrap();
    assert_eq!(engine.options().eval.plies, 2);
    assert_eq!(engine.options().eval.noise, 0.05);
}

#[test]
fn cache_serves_repeated_evaluations() {
    let mut engine = engine(1);
    let positions = positions(10);

    let first: Vec<_> = positions.iter().map(|p| engine.evaluate(p)).collect();
    let second: Vec<_> = positions.iter().map(|p| engine.evaluate(p)).collect();
    assert_eq!(first, second);
    assert!(engine.cache_stats().hits >= 10);

    engine.flush_cache().unwrap();
    let hits = engine.cache_stats().hits;
    engine.evaluate(&positions[0]);
    assert_eq!(engine.cache_stats().hits, hits);
}

#[test]
fn deterministic_noise_is_repeatable() {
    let mut engine = engine(1);
    let pos = &positions(1)[0];
    let clean = engine.evaluate(pos);

    engine.set_option("noise", Some("0.1")).unwrap();
    let noisy = engine.evaluate(pos);
    assert_ne!(noisy, clean);
    assert_eq!(engine.evaluate(pos), noisy);
}

fn over(key: u8, win: f32) -> EncodedPosition {
    EncodedPosition::game_over([key; 10], [win, 0.0, 0.0, 0.0, 0.0])
}

#[test]
fn one_ply_averages_best_replies() {
    let engine = engine(1);
    let mut ctx = WorkerContext::standalone();
    let config = EvalConfig::default();

    let root = EncodedPosition::new([1; 10], NetClass::Contact, vec![1.0; INPUTS]).with_outcomes(vec![
        // The mover picks the successor worst for the opponent: 0.2 -> 0.8 for us
        Outcome {
            weight: 1.0,
            successors: vec![over(10, 0.6), over(11, 0.2)],
        },
        Outcome {
            weight: 3.0,
            successors: vec![over(12, 0.5)],
        },
        // No legal move recorded: skipped
        Outcome {
            weight: 5.0,
            successors: Vec::new(),
        },
    ]);

    let out = engine.evaluator().evaluate_plies(&mut ctx, &root, 1, &config);
    let expected = (1.0 * 0.8 + 3.0 * 0.5) / 4.0;
    assert!((out[0] - expected).abs() < 1e-6, "{} vs {expected}", out[0]);
    assert_eq!(&out[1..], &[0.0; NUM_OUTPUTS - 1]);

    // Without outcomes, a deeper request falls back to a plain evaluation
    let leaf = EncodedPosition::new([2; 10], NetClass::Race, vec![0.5; INPUTS]);
    let deep = engine.evaluator().evaluate_plies(&mut ctx, &leaf, 2, &config);
    let flat = engine.evaluator().evaluate_plies(&mut ctx, &leaf, 0, &config);
    assert_eq!(deep, flat);
}

#[test]
fn find_best_on_the_calling_thread() {
    let mut engine = engine(1);
    let mut candidates: Vec<EncodedPosition> = positions(6).iter().cloned().collect();
    // The opponent has lost a gammon here
    candidates.push(EncodedPosition::game_over([3; 10], [0.0, 0.0, 0.0, 1.0, 0.0]));

    let (index, outputs) = engine.find_best(&candidates).unwrap();
    assert_eq!(index, 6);
    assert_eq!(outputs, [1.0, 1.0, 0.0, 0.0, 0.0]);
}

#[test]
fn calibrate_counts_every_evaluation() {
    let mut engine = engine(2);
    let result = engine.calibrate(positions(8), 10).unwrap();
    assert_eq!(result.evaluations, 2 * 8 * 10);
    assert!(result.per_second >= 0.0);
}

/// A position whose encoding is slow enough to cancel a batch mid-way.
struct Slow(EncodedPosition);

impl Position for Slow {
    fn key(&self) -> PositionKey {
        self.0.key()
    }

    fn class(&self) -> PositionClass {
        self.0.class()
    }

    fn encode(&self, class: NetClass, pruning: bool, inputs: &mut [f32]) {
        thread::sleep(Duration::from_millis(1));
        self.0.encode(class, pruning, inputs);
    }
}

#[test]
fn cancelled_batch_reports_incomplete() {
    let mut engine = engine(2);
    let slow: Arc<[Slow]> = positions(300).iter().cloned().map(Slow).collect();

    let result = engine.evaluate_all_with(
        slow,
        &EvalConfig::default(),
        &mut WaitOptions::new()
            .poll_interval(Duration::from_millis(1))
            .progress(|_| false),
    );
    match result {
        Err(EngineError::Incomplete(outcome)) => {
            assert!(outcome.cancelled);
            assert!(outcome.completed < 300);
        }
        other => panic!("expected an incomplete batch, got {:?}", other.map(|r| r.len())),
    }

    // The next batch runs normally
    let results = engine.evaluate_all(positions(20), &EvalConfig::default()).unwrap();
    assert_eq!(results.len(), 20);
}

#[test]
fn load_binary_weights() {
    let path = std::env::temp_dir().join(format!("bgeval-{}-engine.weights", std::process::id()));
    nets(7).save_binary(&path).unwrap();

    let mut loaded = Engine::load(&path, EngineOptions::default()).unwrap();
    std::fs::remove_file(&path).ok();

    let mut fresh = engine(1);
    let pos = &positions(1)[0];
    assert_eq!(loaded.evaluate(pos), fresh.evaluate(pos));
}
