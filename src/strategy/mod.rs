/*!
 * Strategy Execution Engine
 *
 * One strategy per running mode. Every strategy walks the same lifecycle:
 *
 *   Unbuilt -> Initialized -> Built -> Activated -> Joined -> ResultsCollected
 *
 * `RunState` carries the bookkeeping the backends share (lifecycle, registry,
 * adapters, pending jobs, collected outcomes); each backend only supplies how
 * jobs are started and joined.
 */

pub mod coroutine;
pub mod green;
pub mod process;
pub mod task;
pub mod thread;
pub mod worker;

pub use coroutine::CoroutineStrategy;
pub use green::GreenThreadStrategy;
pub use process::{MultiProcessStrategy, ProcessPoolStrategy};
pub use task::{
    Callable, FeatureRequest, Features, Job, JobArg, TaskError, TaskResult, WorkerContext,
};
pub use thread::{MultiThreadStrategy, ThreadPoolStrategy};
pub use worker::{WorkerHandle, WorkerIdentity};

use crate::core::config::RuntimeConfig;
use crate::core::errors::{RuntimeError, RuntimeResult};
use crate::core::types::{Payload, Pid, RunningMode, WorkerId};
use crate::ipc::queue::{QueueAdapter, QueueError};
use crate::persistence::{Persistence, PersistenceGate, PersistenceSettings};
use crate::registry::{FeatureRegistry, PrimitiveKind};
use crate::result::RawOutcome;
use crate::sync::{EventLoop, SyncAdapter};
use ahash::RandomState;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use worker::{IndexedJob, RunEnv};

/// Where a strategy is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unbuilt,
    Initialized,
    Built,
    Activated,
    Joined,
    ResultsCollected,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unbuilt => "unbuilt",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Built => "built",
            LifecycleState::Activated => "activated",
            LifecycleState::Joined => "joined",
            LifecycleState::ResultsCollected => "results_collected",
        };
        f.write_str(name)
    }
}

/// Stop switch shared by a strategy and everything it started.
///
/// Cheap to clone; can be used from another thread while a run is blocked
/// in `await_completion`.
#[derive(Clone, Default)]
pub struct RunControl {
    inner: Arc<ControlState>,
}

#[derive(Default)]
struct ControlState {
    stopping: AtomicBool,
    children: DashSet<Pid, RandomState>,
    tasks: DashMap<WorkerId, AbortHandle, RandomState>,
}

impl RunControl {
    /// Jobs not yet started finish as `Terminated`; child processes get SIGTERM
    pub fn terminal(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.signal_children(nix::sys::signal::Signal::SIGTERM);
        info!(children = self.inner.children.len(), "Run terminated");
    }

    /// Like `terminal`, but child processes get SIGKILL and async tasks are aborted
    pub fn kill(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.signal_children(nix::sys::signal::Signal::SIGKILL);
        for entry in self.inner.tasks.iter() {
            entry.value().abort();
        }
        warn!(
            children = self.inner.children.len(),
            tasks = self.inner.tasks.len(),
            "Run killed; primitives held by killed threads or processes stay acquired"
        );
    }

    /// Abort one scheduled task; `false` when it is not (or no longer) tracked
    pub fn cancel(&self, worker_id: WorkerId) -> bool {
        match self.inner.tasks.remove(&worker_id) {
            Some((_, handle)) => {
                handle.abort();
                debug!(worker_id, "Task cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.inner.stopping.store(false, Ordering::SeqCst);
        self.inner.children.clear();
        self.inner.tasks.clear();
    }

    pub(crate) fn track_child(&self, pid: Pid) {
        self.inner.children.insert(pid);
    }

    pub(crate) fn untrack_child(&self, pid: Pid) {
        self.inner.children.remove(&pid);
    }

    pub(crate) fn track_task(&self, worker_id: WorkerId, handle: AbortHandle) {
        self.inner.tasks.insert(worker_id, handle);
    }

    pub(crate) fn untrack_task(&self, worker_id: WorkerId) {
        self.inner.tasks.remove(&worker_id);
    }

    fn signal_children(&self, signal: nix::sys::signal::Signal) {
        use nix::errno::Errno;
        use nix::unistd::Pid as NixPid;

        for pid in self.inner.children.iter() {
            match nix::sys::signal::kill(NixPid::from_raw(*pid as i32), signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid = *pid, signal = ?signal, error = %e, "Failed to signal worker process"),
            }
        }
    }
}

impl fmt::Debug for RunControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunControl")
            .field("stopping", &self.is_stopping())
            .field("children", &self.inner.children.len())
            .field("tasks", &self.inner.tasks.len())
            .finish()
    }
}

/// Bookkeeping shared by every strategy
pub struct RunState<A, T> {
    config: RuntimeConfig,
    state: LifecycleState,
    registry: Arc<FeatureRegistry>,
    sync: SyncAdapter,
    queues: QueueAdapter,
    persistence: Option<Arc<dyn Persistence>>,
    gate: Option<PersistenceGate>,
    control: RunControl,
    jobs: Vec<IndexedJob<A, T>>,
    outcomes: Vec<RawOutcome<T>>,
    next_worker: WorkerId,
    run_id: Uuid,
}

impl<A: Payload, T: Payload> RunState<A, T> {
    pub fn new(config: RuntimeConfig, event_loop: Option<&EventLoop>) -> RuntimeResult<Self> {
        config.validate()?;
        let sync = SyncAdapter::new(config.mode, event_loop)?;
        let queues = QueueAdapter::new(config.mode, event_loop)?;
        Ok(Self {
            config,
            state: LifecycleState::Unbuilt,
            registry: Arc::new(FeatureRegistry::new()),
            sync,
            queues,
            persistence: None,
            gate: None,
            control: RunControl::default(),
            jobs: Vec::new(),
            outcomes: Vec::new(),
            next_worker: 0,
            run_id: Uuid::new_v4(),
        })
    }

    pub fn mode(&self) -> RunningMode {
        self.config.mode
    }

    pub fn workers(&self) -> usize {
        self.config.workers
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn registry(&self) -> Arc<FeatureRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn sync_adapter(&self) -> &SyncAdapter {
        &self.sync
    }

    pub fn set_persistence(&mut self, backend: Arc<dyn Persistence>) {
        self.persistence = Some(backend);
    }

    /// Allocate the task queue, primitives and persistence gate for a new run
    pub fn initialize(&mut self, tasks: Option<Vec<A>>, features: Features) -> RuntimeResult<()> {
        if self.state == LifecycleState::Activated {
            return Err(RuntimeError::illegal_state("initialize", self.state));
        }

        self.registry.clear();
        self.jobs.clear();
        self.outcomes.clear();
        self.next_worker = 0;
        self.gate = None;
        self.control.reset();
        self.run_id = Uuid::new_v4();

        if let Some(tasks) = tasks {
            let capacity = tasks
                .len()
                .max(self.config.queue_capacity.unwrap_or(0))
                .max(1);
            let queue = self.queues.get_queue::<A>(self.config.queue_type, Some(capacity))?;
            let count = tasks.len();
            for task in tasks {
                match queue.try_put(task) {
                    Ok(()) => {}
                    Err(QueueError::Full { capacity }) => {
                        return Err(RuntimeError::configuration(format!(
                            "{} tasks do not fit a task queue of capacity {}",
                            count, capacity
                        )));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            self.registry.register_queue(Some(queue))?;
            debug!(run_id = %self.run_id, tasks = count, queue_type = %self.config.queue_type, "Task queue filled");
        }

        for primitive in features.realize(&self.sync)? {
            self.registry.register(primitive.kind(), Some(primitive))?;
        }

        if let Some(backend) = &self.persistence {
            let settings = PersistenceSettings {
                connection_count: self.config.db_connection_count(),
                sharing: self.config.connection_sharing,
            };
            backend.initialize(self.config.mode, &settings)?;
            self.gate = Some(PersistenceGate::new(Arc::clone(backend), &settings, &self.sync)?);
        }

        self.state = LifecycleState::Initialized;
        info!(
            run_id = %self.run_id,
            mode = %self.config.mode,
            workers = self.config.workers,
            "Run initialized"
        );
        Ok(())
    }

    /// Append jobs to the pending set
    pub(crate) fn push_jobs(&mut self, jobs: Vec<Job<A, T>>) -> RuntimeResult<()> {
        match self.state {
            LifecycleState::Initialized | LifecycleState::Built | LifecycleState::Joined => {}
            state => return Err(RuntimeError::illegal_state("build workers", state)),
        }
        if jobs.iter().any(|job| matches!(job.arg, JobArg::FromQueue))
            && !self.registry.is_registered(PrimitiveKind::Queue)
        {
            return Err(RuntimeError::configuration(
                "queue-pulling workers need tasks passed to initialize",
            ));
        }
        for job in jobs {
            let worker_id = self.allocate_worker_id();
            self.jobs.push(IndexedJob { worker_id, job });
        }
        self.state = LifecycleState::Built;
        debug!(run_id = %self.run_id, pending = self.jobs.len(), "Workers built");
        Ok(())
    }

    /// Hand the pending jobs to the backend and mark the run active
    pub(crate) fn begin_activation(&mut self) -> RuntimeResult<Vec<IndexedJob<A, T>>> {
        if self.jobs.is_empty() {
            return Err(RuntimeError::EmptyWorkerSet);
        }
        if self.state != LifecycleState::Built {
            return Err(RuntimeError::illegal_state("activate workers", self.state));
        }
        self.state = LifecycleState::Activated;
        info!(run_id = %self.run_id, jobs = self.jobs.len(), "Activating workers");
        Ok(std::mem::take(&mut self.jobs))
    }

    pub(crate) fn check_awaitable(&self) -> RuntimeResult<()> {
        match self.state {
            LifecycleState::Activated => Ok(()),
            LifecycleState::Unbuilt | LifecycleState::Initialized => {
                Err(RuntimeError::EmptyWorkerSet)
            }
            state => Err(RuntimeError::illegal_state("await completion", state)),
        }
    }

    pub(crate) fn finish_await(&mut self, outcomes: Vec<RawOutcome<T>>) {
        let failed = outcomes.iter().filter(|o| !o.successful).count();
        info!(run_id = %self.run_id, finished = outcomes.len(), failed, "Workers joined");
        self.outcomes.extend(outcomes);
        self.state = LifecycleState::Joined;
    }

    pub fn collect(&mut self) -> RuntimeResult<Vec<RawOutcome<T>>> {
        if self.state != LifecycleState::Joined {
            return Err(RuntimeError::illegal_state("collect results", self.state));
        }
        self.state = LifecycleState::ResultsCollected;
        Ok(std::mem::take(&mut self.outcomes))
    }

    /// Index a job started outside the batch lifecycle
    pub(crate) fn incremental_job(&mut self, job: Job<A, T>) -> RuntimeResult<IndexedJob<A, T>> {
        match self.state {
            LifecycleState::Unbuilt | LifecycleState::Activated => {
                Err(RuntimeError::illegal_state("start a worker", self.state))
            }
            _ => {
                let worker_id = self.allocate_worker_id();
                Ok(IndexedJob { worker_id, job })
            }
        }
    }

    pub(crate) fn env(&self) -> RunEnv {
        RunEnv {
            registry: Arc::clone(&self.registry),
            persistence: self.gate.clone(),
            control: self.control.clone(),
        }
    }

    pub fn reset(&mut self) {
        self.registry.clear();
        self.jobs.clear();
        self.outcomes.clear();
        self.next_worker = 0;
        self.gate = None;
        self.control.reset();
        self.state = LifecycleState::Unbuilt;
    }

    fn allocate_worker_id(&mut self) -> WorkerId {
        let id = self.next_worker;
        self.next_worker += 1;
        id
    }
}

/// One concurrency backend
pub trait Strategy<A: Payload, T: Payload>: Send {
    fn run_state(&self) -> &RunState<A, T>;

    fn run_state_mut(&mut self) -> &mut RunState<A, T>;

    fn mode(&self) -> RunningMode {
        self.run_state().mode()
    }

    fn workers(&self) -> usize {
        self.run_state().workers()
    }

    fn state(&self) -> LifecycleState {
        self.run_state().state()
    }

    fn registry(&self) -> Arc<FeatureRegistry> {
        self.run_state().registry()
    }

    fn control(&self) -> RunControl {
        self.run_state().control().clone()
    }

    fn set_persistence(&mut self, backend: Arc<dyn Persistence>) {
        self.run_state_mut().set_persistence(backend);
    }

    fn initialize(&mut self, tasks: Option<Vec<A>>, features: Features) -> RuntimeResult<()> {
        self.run_state_mut().initialize(tasks, features)
    }

    /// Exactly `workers()` jobs, each with a clone of `args`
    fn build_workers(&mut self, callable: Callable<A, T>, args: A) -> RuntimeResult<()> {
        let jobs = (0..self.workers())
            .map(|_| Job::new(callable.clone(), args.clone()))
            .collect();
        self.build_jobs(jobs)
    }

    /// Exactly `workers()` jobs, each taking the next task queue item when it starts
    fn build_workers_from_queue(&mut self, callable: Callable<A, T>) -> RuntimeResult<()> {
        let jobs = (0..self.workers())
            .map(|_| Job::from_queue(callable.clone()))
            .collect();
        self.build_jobs(jobs)
    }

    fn build_jobs(&mut self, jobs: Vec<Job<A, T>>) -> RuntimeResult<()> {
        self.run_state_mut().push_jobs(jobs)
    }

    /// Start every built job in insertion order
    fn activate_all(&mut self) -> RuntimeResult<()>;

    /// Block until every activated job has finished
    fn await_completion(&mut self) -> RuntimeResult<()>;

    fn collect_raw_outcomes(&mut self) -> RuntimeResult<Vec<RawOutcome<T>>> {
        self.run_state_mut().collect()
    }

    /// Start one job right away, outside the batch lifecycle
    fn start_worker(&mut self, job: Job<A, T>) -> RuntimeResult<WorkerHandle>;

    /// Wait for workers started with `start_worker`
    fn join_workers(&mut self, handles: &[WorkerHandle]) -> RuntimeResult<Vec<RawOutcome<T>>>;

    fn terminal(&self) {
        self.run_state().control().terminal();
    }

    fn kill(&self) {
        self.run_state().control().kill();
    }

    /// Abort one scheduled task (async backend only)
    fn cancel(&self, worker_id: WorkerId) -> RuntimeResult<()> {
        let _ = worker_id;
        Err(RuntimeError::UnsupportedPrimitive(format!(
            "task cancellation is not available in {} mode",
            self.mode()
        )))
    }

    /// Jobs per activation for one-unit-per-job strategies; `None` for pools
    fn batch_limit(&self) -> Option<usize>;

    fn event_loop(&self) -> Option<&EventLoop> {
        None
    }

    fn reset(&mut self) {
        self.run_state_mut().reset();
    }
}

/// Build the strategy for `config.mode`.
///
/// `event_loop` is only meaningful for `AsyncCooperative`; that mode creates
/// its own loop when none is given.
pub fn for_mode<A: Payload, T: Payload>(
    config: RuntimeConfig,
    event_loop: Option<EventLoop>,
) -> RuntimeResult<Box<dyn Strategy<A, T>>> {
    if event_loop.is_some() && config.mode != RunningMode::AsyncCooperative {
        return Err(RuntimeError::configuration(format!(
            "an event loop only applies to async_cooperative mode, not {}",
            config.mode
        )));
    }

    let strategy: Box<dyn Strategy<A, T>> = match config.mode {
        RunningMode::MultiThread => Box::new(MultiThreadStrategy::new(config)?),
        RunningMode::ThreadPool => Box::new(ThreadPoolStrategy::new(config)?),
        RunningMode::MultiProcess => Box::new(MultiProcessStrategy::new(config)?),
        RunningMode::ProcessPool => Box::new(ProcessPoolStrategy::new(config)?),
        RunningMode::GreenThreadPool => Box::new(GreenThreadStrategy::new(config)?),
        RunningMode::AsyncCooperative => Box::new(CoroutineStrategy::new(config, event_loop)?),
    };
    Ok(strategy)
}
