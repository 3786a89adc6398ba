/*!
 * Executor
 *
 * Single entry point over the strategies. Picks the backend for the
 * configured running mode, drives its lifecycle for each run and keeps the
 * normalized results of the last completed run.
 *
 * Two ways to submit work:
 * - batch: `run`, `run_from_queue`, `map`, `map_with_function`
 * - incremental: `start_new_worker` repeatedly, then `close` the handles
 */

use crate::core::config::RuntimeConfig;
use crate::core::errors::{RuntimeError, RuntimeResult};
use crate::core::types::{Payload, RunningMode, WorkerId};
use crate::ipc::queue::QueueType;
use crate::monitoring::RunSpan;
use crate::persistence::{ConnectionSharingMode, Persistence};
use crate::registry::FeatureRegistry;
use crate::result::{normalize_all, ResultsExt, WorkerResult};
use crate::strategy::{
    self, Callable, Features, Job, LifecycleState, RunControl, Strategy, WorkerHandle,
};
use crate::sync::EventLoop;
use ahash::RandomState;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs callables on the backend selected by a `RunningMode`
pub struct Executor<A: Payload, T: Payload> {
    strategy: Box<dyn Strategy<A, T>>,
    results: Option<Vec<WorkerResult<T>>>,
    open: HashSet<WorkerId, RandomState>,
    batch: Vec<WorkerResult<T>>,
}

impl<A: Payload, T: Payload> Executor<A, T> {
    /// `executors` workers in `mode`, default settings otherwise
    pub fn new(mode: RunningMode, executors: usize) -> RuntimeResult<Self> {
        Self::from_config(RuntimeConfig::new(mode, executors))
    }

    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::new()
    }

    pub fn from_config(config: RuntimeConfig) -> RuntimeResult<Self> {
        Self::assemble(config, None, None)
    }

    fn assemble(
        config: RuntimeConfig,
        event_loop: Option<EventLoop>,
        persistence: Option<Arc<dyn Persistence>>,
    ) -> RuntimeResult<Self> {
        let mut strategy = strategy::for_mode::<A, T>(config, event_loop)?;
        if let Some(backend) = persistence {
            strategy.set_persistence(backend);
        }
        debug!(mode = %strategy.mode(), workers = strategy.workers(), "Executor created");
        Ok(Self {
            strategy,
            results: None,
            open: HashSet::default(),
            batch: Vec::new(),
        })
    }

    pub fn mode(&self) -> RunningMode {
        self.strategy.mode()
    }

    pub fn workers(&self) -> usize {
        self.strategy.workers()
    }

    pub fn state(&self) -> LifecycleState {
        self.strategy.state()
    }

    /// Primitives and queue of the current run
    pub fn registry(&self) -> Arc<FeatureRegistry> {
        self.strategy.registry()
    }

    /// The loop an async executor drives; build loop-bound primitives from it
    pub fn event_loop(&self) -> Option<&EventLoop> {
        self.strategy.event_loop()
    }

    /// Stop handle usable from other threads while a run blocks
    pub fn controller(&self) -> RunControl {
        self.strategy.control()
    }

    /// Start one worker right away. The first call after a finished run
    /// opens a new batch; `result()` is unavailable until it is closed.
    pub fn start_new_worker(&mut self, target: Callable<A, T>, args: A) -> RuntimeResult<WorkerHandle> {
        if self.open.is_empty() {
            self.batch.clear();
            match self.strategy.state() {
                LifecycleState::Unbuilt | LifecycleState::ResultsCollected => {
                    self.strategy.initialize(None, Features::none())?;
                }
                _ => {}
            }
        }
        let handle = self.strategy.start_worker(Job::new(target, args))?;
        self.open.insert(handle.worker_id());
        debug!(worker_id = handle.worker_id(), open = self.open.len(), "Worker started");
        Ok(handle)
    }

    /// Wait for started workers and store their results
    pub fn close(&mut self, handles: &[WorkerHandle]) -> RuntimeResult<()> {
        if handles.is_empty() || self.open.is_empty() {
            return Err(RuntimeError::configuration(
                "close needs handles of workers started with start_new_worker",
            ));
        }
        if let Some(handle) = handles.iter().find(|h| !self.open.contains(&h.worker_id())) {
            return Err(RuntimeError::configuration(format!(
                "worker handle {} is not open",
                handle
            )));
        }
        let span = RunSpan::new("close", self.run_id(), self.mode(), handles.len());
        let outcomes = self.strategy.join_workers(handles)?;
        for handle in handles {
            self.open.remove(&handle.worker_id());
        }

        let results = normalize_all(outcomes);
        span.record_outcomes(results.successes().len(), results.failures().len());
        self.batch.extend(results);
        if self.open.is_empty() {
            self.results = Some(std::mem::take(&mut self.batch));
        }
        Ok(())
    }

    /// `workers()` copies of `function`, each called with a clone of `args`
    pub fn run(&mut self, function: Callable<A, T>, args: A, features: Features) -> RuntimeResult<()> {
        self.execute("run", None, features, |strategy| {
            strategy.build_workers(function, args)?;
            strategy.activate_all()?;
            strategy.await_completion()
        })
    }

    /// `workers()` copies of `function`, each pulling its argument from a
    /// task queue filled with `tasks`
    pub fn run_from_queue(
        &mut self,
        function: Callable<A, T>,
        tasks: Vec<A>,
        features: Features,
    ) -> RuntimeResult<()> {
        self.execute("run_from_queue", Some(tasks), features, |strategy| {
            strategy.build_workers_from_queue(function)?;
            strategy.activate_all()?;
            strategy.await_completion()
        })
    }

    /// One job per argument
    pub fn map<I>(&mut self, function: Callable<A, T>, args: I, features: Features) -> RuntimeResult<()>
    where
        I: IntoIterator<Item = A>,
    {
        let jobs = args
            .into_iter()
            .map(|arg| Job::new(function.clone(), arg))
            .collect();
        self.execute("map", None, features, |strategy| run_in_batches(strategy, jobs))
    }

    /// Pair functions with arguments one to one, or call every function
    /// with the single argument given
    pub fn map_with_function<I>(
        &mut self,
        functions: Vec<Callable<A, T>>,
        args: I,
        features: Features,
    ) -> RuntimeResult<()>
    where
        I: IntoIterator<Item = A>,
    {
        let mut args: Vec<A> = args.into_iter().collect();
        let jobs: Vec<Job<A, T>> = if functions.len() == args.len() {
            functions
                .into_iter()
                .zip(args)
                .map(|(function, arg)| Job::new(function, arg))
                .collect()
        } else if args.len() == 1 {
            let arg = args.remove(0);
            functions
                .into_iter()
                .map(|function| Job::new(function, arg.clone()))
                .collect()
        } else {
            return Err(RuntimeError::configuration(format!(
                "{} functions cannot be paired with {} arguments",
                functions.len(),
                args.len()
            )));
        };
        self.execute("map_with_function", None, features, |strategy| {
            run_in_batches(strategy, jobs)
        })
    }

    /// Stop starting new work; process workers get SIGTERM
    pub fn terminal(&self) {
        self.strategy.terminal();
    }

    /// Stop everything the backend can stop
    pub fn kill(&self) {
        self.strategy.kill();
    }

    /// Abort one scheduled task (async mode only)
    pub fn cancel(&self, worker_id: WorkerId) -> RuntimeResult<()> {
        self.strategy.cancel(worker_id)
    }

    /// Results of the last completed run
    pub fn result(&self) -> RuntimeResult<Vec<WorkerResult<T>>> {
        if !self.open.is_empty() {
            return Err(RuntimeError::NotYetCompleted(format!(
                "{} started workers have not been closed",
                self.open.len()
            )));
        }
        self.results
            .clone()
            .ok_or_else(|| RuntimeError::NotYetCompleted("no run has completed".into()))
    }

    fn run_id(&self) -> uuid::Uuid {
        self.strategy.run_state().run_id()
    }

    /// Initialize, hand the strategy to `body`, then collect and store.
    /// A failed run leaves the strategy reset and the previous results in place.
    fn execute<F>(
        &mut self,
        operation: &'static str,
        tasks: Option<Vec<A>>,
        features: Features,
        body: F,
    ) -> RuntimeResult<()>
    where
        F: FnOnce(&mut dyn Strategy<A, T>) -> RuntimeResult<()>,
    {
        if !self.open.is_empty() {
            return Err(RuntimeError::configuration(format!(
                "cannot {} while {} started workers are open",
                operation,
                self.open.len()
            )));
        }

        self.strategy.initialize(tasks, features)?;
        let span = RunSpan::new(operation, self.run_id(), self.mode(), self.workers());

        let outcome = body(self.strategy.as_mut()).and_then(|()| self.strategy.collect_raw_outcomes());
        let outcomes = match outcome {
            Ok(outcomes) => outcomes,
            Err(e) => {
                span.record_error(&e);
                warn!(operation, run_id = %span.run_id(), error = %e, "Run aborted");
                self.strategy.reset();
                return Err(e);
            }
        };

        let results = normalize_all(outcomes);
        let (successes, failures) = (results.successes().len(), results.failures().len());
        span.record_jobs(results.len());
        span.record_outcomes(successes, failures);
        info!(operation, run_id = %span.run_id(), successes, failures, "Run finished");
        self.results = Some(results);
        Ok(())
    }
}

/// Build, activate and await `jobs`, at most `batch_limit()` at a time
fn run_in_batches<A: Payload, T: Payload>(
    strategy: &mut dyn Strategy<A, T>,
    jobs: Vec<Job<A, T>>,
) -> RuntimeResult<()> {
    if jobs.is_empty() {
        return Err(RuntimeError::EmptyWorkerSet);
    }
    let chunk = strategy.batch_limit().unwrap_or(jobs.len()).max(1);
    let mut jobs = jobs.into_iter().peekable();
    while jobs.peek().is_some() {
        let batch: Vec<_> = jobs.by_ref().take(chunk).collect();
        debug!(jobs = batch.len(), "Running batch");
        strategy.build_jobs(batch)?;
        strategy.activate_all()?;
        strategy.await_completion()?;
    }
    Ok(())
}

/// Builder for `Executor`
pub struct ExecutorBuilder {
    config: RuntimeConfig,
    event_loop: Option<EventLoop>,
    persistence: Option<Arc<dyn Persistence>>,
}

impl ExecutorBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            event_loop: None,
            persistence: None,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_mode(mut self, mode: RunningMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn with_queue_type(mut self, queue_type: QueueType) -> Self {
        self.config = self.config.with_queue_type(queue_type);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.config = self.config.with_queue_capacity(capacity);
        self
    }

    /// Override the connection count handed to the persistence backend
    pub fn with_db_pool_size(mut self, size: usize) -> Self {
        self.config = self.config.with_db_pool_size(size);
        self
    }

    pub fn with_connection_sharing(mut self, sharing: ConnectionSharingMode) -> Self {
        self.config = self.config.with_connection_sharing(sharing);
        self
    }

    /// Drive this loop instead of a private one (async mode only)
    pub fn with_event_loop(mut self, event_loop: EventLoop) -> Self {
        self.event_loop = Some(event_loop);
        self
    }

    pub fn with_persistence(mut self, backend: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(backend);
        self
    }

    pub fn build<A: Payload, T: Payload>(self) -> RuntimeResult<Executor<A, T>> {
        Executor::assemble(self.config, self.event_loop, self.persistence)
    }
}

impl Default for ExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
