//! Worker thread pool.
//!
//! A [`Scheduler`] owns a set of long-lived workers draining one shared FIFO
//! queue. Callers add a batch of tasks, then block in
//! [`Scheduler::wait_for_tasks`] until every task of the batch has finished.
//!
//! Workers sleep on a manual-reset event that is set exactly while the queue
//! holds jobs. The batch counters are atomics; the waiter sleeps on a
//! condition variable signalled after each completion.

pub mod context;
pub mod task;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

pub use context::WorkerContext;
pub use task::Task;
use task::Job;

use crate::error::{PoolError, TaskError};
use crate::sync::{CancelToken, ManualEvent};

/// Default interval between progress callbacks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Snapshot passed to a progress callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
}

/// Result of waiting for a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Tasks that ran to completion (successfully or not).
    pub completed: usize,
    /// At least one task failed, panicked or was cancelled.
    pub failed: bool,
    /// The batch was abandoned.
    pub cancelled: bool,
}

impl BatchOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.failed && !self.cancelled
    }
}

type ProgressFn<'a> = Box<dyn FnMut(Progress) -> bool + 'a>;
type AutosaveFn<'a> = Box<dyn FnMut() + 'a>;

/// How [`Scheduler::wait_for_tasks`] reports while waiting.
pub struct WaitOptions<'a> {
    poll_interval: Duration,
    progress: Option<ProgressFn<'a>>,
    autosave: Option<(Duration, AutosaveFn<'a>)>,
}

impl Default for WaitOptions<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> WaitOptions<'a> {
    /// Block silently until the batch is done.
    #[must_use]
    pub fn new() -> Self {
        WaitOptions {
            poll_interval: DEFAULT_POLL_INTERVAL,
            progress: None,
            autosave: None,
        }
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Call `f` every poll interval. Returning `false` abandons the batch.
    #[must_use]
    pub fn progress<F>(mut self, f: F) -> Self
    where
        F: FnMut(Progress) -> bool + 'a,
    {
        self.progress = Some(Box::new(f));
        self
    }

    /// Call `f` every `interval` while waiting and once when the batch ends.
    #[must_use]
    pub fn autosave<F>(mut self, interval: Duration, f: F) -> Self
    where
        F: FnMut() + 'a,
    {
        self.autosave = Some((interval, Box::new(f)));
        self
    }

    fn polls(&self) -> bool {
        self.progress.is_some() || self.autosave.is_some()
    }
}

/// State shared between the scheduler and its workers.
struct Shared {
    queue: Mutex<VecDeque<Job>>,
    /// Set iff `queue` is non-empty; changed only under the queue lock.
    activity: ManualEvent,
    added: AtomicUsize,
    done: AtomicUsize,
    /// Tasks of the batch removed without running.
    dropped: AtomicUsize,
    failed: AtomicBool,
    cancel: CancelToken,
    completion_lock: Mutex<()>,
    completion: Condvar,
}

impl Shared {
    fn new() -> Self {
        Shared {
            queue: Mutex::new(VecDeque::new()),
            activity: ManualEvent::new(false),
            added: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            cancel: CancelToken::new(),
            completion_lock: Mutex::new(()),
            completion: Condvar::new(),
        }
    }

    fn pop(&self) -> Option<Job> {
        let mut queue = self.queue.lock();
        let job = queue.pop_front();
        if queue.is_empty() {
            self.activity.reset();
        }
        job
    }

    fn run(&self, task: Task, ctx: &mut WorkerContext) {
        if let Err(err) = task.execute(ctx) {
            match err {
                TaskError::Cancelled => log::trace!("worker {}: task cancelled", ctx.id()),
                _ => log::warn!("worker {}: {err}", ctx.id()),
            }
            self.failed.store(true, Ordering::Release);
        }
        self.finish(1);
    }

    fn finish(&self, count: usize) {
        self.done.fetch_add(count, Ordering::AcqRel);
        let _guard = self.completion_lock.lock();
        self.completion.notify_all();
    }

    /// Remove every pending task. Returns how many were dropped.
    fn drain(&self) -> usize {
        let tasks: Vec<Task> = {
            let mut queue = self.queue.lock();
            let mut tasks = Vec::new();
            let mut kept = VecDeque::new();
            for job in queue.drain(..) {
                match job {
                    Job::Run(task) => tasks.push(task),
                    Job::Shutdown => kept.push_back(Job::Shutdown),
                }
            }
            *queue = kept;
            if queue.is_empty() {
                self.activity.reset();
            }
            tasks
        };

        let count = tasks.len();
        drop(tasks);
        if count > 0 {
            self.dropped.fetch_add(count, Ordering::AcqRel);
            self.finish(count);
        }
        count
    }

    fn pending(&self) -> usize {
        self.added
            .load(Ordering::Acquire)
            .saturating_sub(self.done.load(Ordering::Acquire))
    }
}

fn worker_loop(shared: Arc<Shared>, id: usize) {
    let mut ctx = WorkerContext::new(id, shared.cancel.clone());
    log::trace!("worker {id} started");
    loop {
        shared.activity.wait();
        match shared.pop() {
            Some(Job::Run(task)) => shared.run(task, &mut ctx),
            Some(Job::Shutdown) => break,
            None => {}
        }
    }
    log::trace!("worker {id} stopped");
}

/// Task queue plus the workers draining it.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    configured: usize,
    /// Used when no worker could be started.
    inline_ctx: Mutex<WorkerContext>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Scheduler {
    /// Create a scheduler for `threads` workers. No thread starts until
    /// [`Scheduler::start_threads`].
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(Shared::new());
        let inline_ctx = Mutex::new(WorkerContext::new(0, shared.cancel.clone()));
        Scheduler {
            shared,
            workers: Vec::new(),
            configured: threads.max(1),
            inline_ctx,
        }
    }

    /// Configured worker count.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.configured
    }

    /// Workers actually running. May be lower than configured if spawning failed.
    #[must_use]
    pub fn effective_threads(&self) -> usize {
        self.workers.len()
    }

    /// Tasks of the current batch that have finished.
    #[must_use]
    pub fn done_tasks(&self) -> usize {
        self.shared.done.load(Ordering::Acquire)
    }

    /// Tasks of the current batch still queued or running.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.shared.pending()
    }

    /// Start the configured workers if none are running.
    pub fn start_threads(&mut self) {
        if !self.workers.is_empty() {
            return;
        }
        for id in 0..self.configured {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("bgeval-worker-{id}"))
                .spawn(move || worker_loop(shared, id));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(err) => log::warn!("failed to spawn worker {id}: {err}"),
            }
        }
        if self.workers.len() < self.configured {
            log::warn!(
                "running with {} of {} workers",
                self.workers.len(),
                self.configured
            );
        }
        log::debug!("started {} workers", self.workers.len());
    }

    /// Change the worker count. Restarts the pool only if the count changes.
    pub fn set_num_threads(&mut self, threads: usize) -> Result<(), PoolError> {
        let threads = threads.max(1);
        let pending = self.shared.added.load(Ordering::Acquire);
        if pending > 0 {
            return Err(PoolError::Busy {
                pending: self.shared.pending(),
            });
        }
        if threads == self.configured && !self.workers.is_empty() {
            return Ok(());
        }

        self.close();
        self.configured = threads;
        self.start_threads();
        log::info!("worker pool resized to {threads} threads");
        Ok(())
    }

    /// Stop and join every worker. Queued tasks ahead of the shutdown run first.
    pub fn close(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        {
            let mut queue = self.shared.queue.lock();
            queue.extend((0..self.workers.len()).map(|_| Job::Shutdown));
            self.shared.activity.set();
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("worker thread panicked outside a task");
            }
        }
        log::debug!("worker pool closed");
    }

    fn enqueue(&self, jobs: Vec<Job>) {
        if jobs.is_empty() {
            return;
        }
        let count = jobs.len();
        let mut queue = self.shared.queue.lock();
        if self.shared.added.load(Ordering::Acquire) == 0 {
            self.shared.failed.store(false, Ordering::Release);
            self.shared.cancel.reset();
        }
        self.shared.added.fetch_add(count, Ordering::AcqRel);
        queue.extend(jobs);
        self.shared.activity.set();
        log::trace!("queued {count} tasks ({} pending)", queue.len());
    }

    /// Queue one task.
    pub fn add_task(&self, task: Task) {
        self.enqueue(vec![Job::Run(task)]);
    }

    /// Queue `n` tasks sharing one body, each called with its index.
    pub fn add_tasks<F>(&self, n: usize, f: F)
    where
        F: Fn(usize, &mut WorkerContext) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.enqueue(
            (0..n)
                .map(|i| {
                    let f = Arc::clone(&f);
                    Job::Run(Task::new(move |ctx| f(i, ctx)))
                })
                .collect(),
        );
    }

    /// Like [`Scheduler::add_tasks`], with a clone of `linked` attached to
    /// each task and dropped with it.
    pub fn add_tasks_linked<F, L>(&self, n: usize, f: F, linked: L)
    where
        F: Fn(usize, &mut WorkerContext) -> Result<(), TaskError> + Send + Sync + 'static,
        L: Clone + Send + 'static,
    {
        let f = Arc::new(f);
        self.enqueue(
            (0..n)
                .map(|i| {
                    let f = Arc::clone(&f);
                    Job::Run(Task::new(move |ctx| f(i, ctx)).with_linked(linked.clone()))
                })
                .collect(),
        );
    }

    /// Drop every queued task and mark the batch failed and cancelled.
    /// Running tasks see the cancellation through their context.
    pub fn abort_tasks(&self) {
        self.shared.cancel.cancel();
        self.shared.failed.store(true, Ordering::Release);
        let dropped = self.shared.drain();
        log::debug!("aborted batch, dropped {dropped} queued tasks");
    }

    fn run_inline(&self) {
        let mut ctx = self.inline_ctx.lock();
        while let Some(job) = self.shared.pop() {
            if let Job::Run(task) = job {
                self.shared.run(task, &mut ctx);
            }
        }
    }

    /// Block until every task added so far has finished, then reset the
    /// batch counters.
    pub fn wait_for_tasks(&self, opts: &mut WaitOptions<'_>) -> BatchOutcome {
        if self.shared.added.load(Ordering::Acquire) == 0 {
            return BatchOutcome::default();
        }
        if self.workers.is_empty() {
            self.run_inline();
        }

        let mut abandoned = false;
        let start = Instant::now();
        let mut last_progress = start;
        let mut last_save = start;

        let mut guard = self.shared.completion_lock.lock();
        loop {
            let total = self.shared.added.load(Ordering::Acquire);
            let done = self.shared.done.load(Ordering::Acquire);
            if done >= total {
                break;
            }

            if opts.polls() {
                self.shared
                    .completion
                    .wait_for(&mut guard, opts.poll_interval);
            } else {
                self.shared.completion.wait(&mut guard);
            }

            let now = Instant::now();
            if !abandoned && now.duration_since(last_progress) >= opts.poll_interval {
                last_progress = now;
                if let Some(progress) = opts.progress.as_mut() {
                    let snapshot = Progress {
                        done: self.shared.done.load(Ordering::Acquire),
                        total: self.shared.added.load(Ordering::Acquire),
                    };
                    let keep_going = MutexGuard::unlocked(&mut guard, || progress(snapshot));
                    if !keep_going {
                        abandoned = true;
                        self.shared.cancel.cancel();
                        self.shared.failed.store(true, Ordering::Release);
                        let dropped = MutexGuard::unlocked(&mut guard, || self.shared.drain());
                        log::debug!("batch abandoned, dropped {dropped} queued tasks");
                    }
                }
            }

            if let Some((interval, save)) = opts.autosave.as_mut() {
                if now.duration_since(last_save) >= *interval {
                    last_save = now;
                    MutexGuard::unlocked(&mut guard, || save());
                }
            }
        }
        drop(guard);

        if let Some((_, save)) = opts.autosave.as_mut() {
            save();
        }

        let outcome = {
            // Reset under the queue lock so no producer sees a half-reset batch
            let _queue = self.shared.queue.lock();
            let done = self.shared.done.swap(0, Ordering::AcqRel);
            let dropped = self.shared.dropped.swap(0, Ordering::AcqRel);
            self.shared.added.store(0, Ordering::Release);
            BatchOutcome {
                completed: done.saturating_sub(dropped),
                failed: self.shared.failed.load(Ordering::Acquire),
                cancelled: self.shared.cancel.is_cancelled(),
            }
        };
        log::trace!(
            "batch finished in {:?}: {} completed",
            start.elapsed(),
            outcome.completed
        );
        outcome
    }

    /// [`Scheduler::wait_for_tasks`] with no callbacks.
    pub fn wait(&self) -> BatchOutcome {
        self.wait_for_tasks(&mut WaitOptions::new())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_wait_with_nothing_queued() {
        let mut pool = Scheduler::new(2);
        pool.start_threads();
        assert_eq!(pool.wait(), BatchOutcome::default());
    }

    #[test]
    fn test_runs_every_task() {
        let mut pool = Scheduler::new(3);
        pool.start_threads();
        assert_eq!(pool.effective_threads(), 3);

        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        pool.add_tasks(50, move |_, _| {
            c.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        let outcome = pool.wait();
        assert_eq!(outcome.completed, 50);
        assert!(outcome.is_success());
        assert_eq!(counter.load(Ordering::Relaxed), 50);
        assert_eq!(pool.done_tasks(), 0);
    }

    #[test]
    fn test_inline_without_workers() {
        let pool = Scheduler::new(4);
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        pool.add_task(Task::new(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }));

        let outcome = pool.wait();
        assert_eq!(outcome.completed, 1);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_set_num_threads_busy() {
        let mut pool = Scheduler::new(1);
        pool.add_task(Task::new(|_| Ok(())));
        assert!(matches!(pool.set_num_threads(2), Err(PoolError::Busy { .. })));

        pool.wait();
        pool.set_num_threads(2).unwrap();
        assert_eq!(pool.num_threads(), 2);
        assert_eq!(pool.effective_threads(), 2);
    }

    #[test]
    fn test_zero_threads_means_one() {
        let mut pool = Scheduler::new(0);
        assert_eq!(pool.num_threads(), 1);
        pool.set_num_threads(0).unwrap();
        assert_eq!(pool.effective_threads(), 1);
    }

    #[test]
    fn test_abort_drops_pending() {
        // No workers: nothing runs until wait, so abort sees every task queued
        let pool = Scheduler::new(1);
        pool.add_tasks(10, |_, _| Ok(()));
        pool.abort_tasks();

        let outcome = pool.wait();
        assert_eq!(outcome.completed, 0);
        assert!(outcome.failed);
        assert!(outcome.cancelled);
    }

    #[test]
    fn test_next_batch_clears_flags() {
        let pool = Scheduler::new(1);
        pool.add_task(Task::new(|_| Err(TaskError::Failed("x".into()))));
        assert!(pool.wait().failed);

        pool.add_task(Task::new(|_| Ok(())));
        let outcome = pool.wait();
        assert!(outcome.is_success());
    }
}
