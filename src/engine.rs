//! Engine facade: an evaluator shared with a worker pool.
//!
//! The engine owns the only long-lived handle to its [`Evaluator`]. Tasks
//! borrow clones of it while a batch runs; operations that change the
//! evaluator (cache resize and flush, switching the locking mode) require
//! every clone to be gone and fail with [`EngineError::Busy`] otherwise.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cache::{CacheStats, EvalCache};
use crate::error::{EngineError, TaskError};
use crate::eval::{EvalConfig, Evaluator, Locking, Position};
use crate::nn::{NetworkSet, Outputs};
use crate::options::{EngineOptions, OptionAction};
use crate::pool::{BatchOutcome, Scheduler, WaitOptions, WorkerContext};

/// Evaluation throughput measured by [`Engine::calibrate`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Calibration {
    pub evaluations: u64,
    pub elapsed: Duration,
    pub per_second: f64,
}

pub struct Engine {
    evaluator: Arc<Evaluator>,
    scheduler: Scheduler,
    options: EngineOptions,
    /// Scratch for evaluations on the calling thread.
    ctx: WorkerContext,
}

impl Engine {
    /// Build an engine and start its workers.
    pub fn new(nets: NetworkSet, options: EngineOptions) -> Result<Self, EngineError> {
        let cache = EvalCache::new(options.cache_size)?;
        let mut scheduler = Scheduler::new(options.threads);
        scheduler.start_threads();

        let mut evaluator = Evaluator::new(nets, cache);
        evaluator.set_locking(Locking::for_workers(scheduler.effective_threads()));
        log::info!(
            "engine ready: {} workers, {} cache slots",
            scheduler.effective_threads(),
            evaluator.cache().capacity()
        );

        Ok(Engine {
            evaluator: Arc::new(evaluator),
            scheduler,
            options,
            ctx: WorkerContext::standalone(),
        })
    }

    /// Load weights from `path` and build an engine.
    pub fn load<P: AsRef<Path>>(path: P, options: EngineOptions) -> Result<Self, EngineError> {
        Self::new(NetworkSet::load(path)?, options)
    }

    #[must_use]
    pub fn evaluator(&self) -> &Arc<Evaluator> {
        &self.evaluator
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    fn evaluator_mut(&mut self) -> Result<&mut Evaluator, EngineError> {
        Arc::get_mut(&mut self.evaluator).ok_or(EngineError::Busy)
    }

    /// Resize the worker pool and rebind the evaluator's locking mode.
    pub fn set_num_threads(&mut self, threads: usize) -> Result<(), EngineError> {
        // Checked first so a busy evaluator leaves the pool untouched
        self.evaluator_mut()?;
        self.scheduler.set_num_threads(threads)?;
        self.options.threads = self.scheduler.num_threads();

        let locking = Locking::for_workers(self.scheduler.effective_threads());
        self.evaluator_mut()?.set_locking(locking);
        Ok(())
    }

    pub fn resize_cache(&mut self, slots: usize) -> Result<(), EngineError> {
        self.evaluator_mut()?.cache_mut().resize(slots)?;
        self.options.cache_size = slots;
        Ok(())
    }

    pub fn flush_cache(&mut self) -> Result<(), EngineError> {
        self.evaluator_mut()?.cache_mut().flush();
        Ok(())
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.evaluator.cache().stats()
    }

    /// Apply a named option, performing any resulting pool or cache change.
    /// On error the options are left as they were.
    pub fn set_option(&mut self, name: &str, value: Option<&str>) -> Result<(), EngineError> {
        let mut next = self.options.clone();
        match next.apply(name, value) {
            Some(OptionAction::SetThreads(n)) => self.set_num_threads(n)?,
            Some(OptionAction::ResizeCache(n)) => self.resize_cache(n)?,
            None => {}
        }
        self.options = next;
        Ok(())
    }

    /// Evaluate one position on the calling thread.
    pub fn evaluate<P: Position>(&mut self, pos: &P) -> Outputs {
        let config = self.options.eval;
        self.evaluator.evaluate(&mut self.ctx, pos, &config)
    }

    /// Choose among candidate positions on the calling thread.
    pub fn find_best<P: Position>(&mut self, candidates: &[P]) -> Option<(usize, Outputs)> {
        let config = self.options.eval;
        self.evaluator.find_best(&mut self.ctx, candidates, &config)
    }

    /// Evaluate every position in parallel, one task per position.
    pub fn evaluate_all<P>(&mut self, positions: Arc<[P]>, config: &EvalConfig) -> Result<Vec<Outputs>, EngineError>
    where
        P: Position + Send + Sync + 'static,
    {
        let poll = self.options.poll_interval();
        self.evaluate_all_with(positions, config, &mut WaitOptions::new().poll_interval(poll))
    }

    /// [`Engine::evaluate_all`] with progress reporting.
    pub fn evaluate_all_with<P>(
        &mut self,
        positions: Arc<[P]>,
        config: &EvalConfig,
        wait: &mut WaitOptions<'_>,
    ) -> Result<Vec<Outputs>, EngineError>
    where
        P: Position + Send + Sync + 'static,
    {
        let n = positions.len();
        let results: Arc<Mutex<Vec<Option<Outputs>>>> = Arc::new(Mutex::new(vec![None; n]));

        let evaluator = Arc::clone(&self.evaluator);
        let sink = Arc::clone(&results);
        let config = *config;
        self.scheduler.add_tasks(n, move |i, ctx| {
            if ctx.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            let out = evaluator.evaluate(ctx, &positions[i], &config);
            sink.lock()[i] = Some(out);
            Ok(())
        });

        let outcome = self.scheduler.wait_for_tasks(wait);
        let results = std::mem::take(&mut *results.lock());
        collect_results(results, outcome)
    }

    /// Measure uncached forward passes per second across all workers.
    ///
    /// Every worker evaluates all `positions` `iterations` times; the workers
    /// start together behind a barrier.
    pub fn calibrate<P>(&mut self, positions: Arc<[P]>, iterations: usize) -> Result<Calibration, EngineError>
    where
        P: Position + Send + Sync + 'static,
    {
        let workers = self.scheduler.effective_threads().max(1);
        let barrier = Arc::new(Barrier::new(workers));
        let evaluations = Arc::new(AtomicU64::new(0));

        let evaluator = Arc::clone(&self.evaluator);
        let counter = Arc::clone(&evaluations);
        let use_prune = self.options.eval.use_prune;
        let start = Instant::now();
        self.scheduler.add_tasks(workers, move |_, ctx| {
            barrier.wait();
            let mut done = 0u64;
            for _ in 0..iterations {
                if ctx.is_cancelled() {
                    break;
                }
                for pos in positions.iter() {
                    let _ = evaluator.evaluate_uncached(ctx, pos, use_prune);
                    done += 1;
                }
            }
            counter.fetch_add(done, Ordering::Relaxed);
            Ok(())
        });

        let outcome = self.scheduler.wait();
        let elapsed = start.elapsed();
        if !outcome.is_success() {
            return Err(EngineError::Incomplete(outcome));
        }

        let evaluations = evaluations.load(Ordering::Relaxed);
        let secs = elapsed.as_secs_f64();
        let per_second = if secs > 0.0 { evaluations as f64 / secs } else { 0.0 };
        log::info!(
            "calibration: {evaluations} evaluations in {elapsed:?} ({per_second:.0}/s, {workers} workers)"
        );
        Ok(Calibration {
            evaluations,
            elapsed,
            per_second,
        })
    }
}

fn collect_results(results: Vec<Option<Outputs>>, outcome: BatchOutcome) -> Result<Vec<Outputs>, EngineError> {
    if !outcome.is_success() {
        return Err(EngineError::Incomplete(outcome));
    }
    results
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or(EngineError::Incomplete(outcome))
}
