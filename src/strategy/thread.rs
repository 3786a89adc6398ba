/*!
 * Thread Strategies
 *
 * MultiThread: one named OS thread per job, joined in worker-index order.
 * ThreadPool: `workers` named threads drain a flume job channel and send
 * outcomes back over a second channel, so results arrive in completion order.
 */

use super::task::{Job, TaskError};
use super::worker::{panic_message, IndexedJob, RunEnv, WorkerHandle, WorkerIdentity};
use super::{RunState, Strategy};
use crate::core::config::RuntimeConfig;
use crate::core::errors::{RuntimeError, RuntimeResult};
use crate::core::limits::WORKER_STACK_SIZE;
use crate::core::types::{Payload, RunningMode, WorkerId};
use crate::result::RawOutcome;
use ahash::RandomState;
use std::collections::{HashMap, HashSet};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

fn spawn_named<F, R>(name: String, f: F) -> RuntimeResult<JoinHandle<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .stack_size(WORKER_STACK_SIZE)
        .spawn(f)
        .map_err(|e| RuntimeError::Spawn(format!("thread {}: {}", name, e)))
}

/// One OS thread per job
pub struct MultiThreadStrategy<A, T> {
    run: RunState<A, T>,
    running: Vec<(WorkerId, JoinHandle<RawOutcome<T>>)>,
    started: HashMap<WorkerId, JoinHandle<RawOutcome<T>>, RandomState>,
}

impl<A: Payload, T: Payload> MultiThreadStrategy<A, T> {
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        Ok(Self {
            run: RunState::new(RuntimeConfig { mode: RunningMode::MultiThread, ..config }, None)?,
            running: Vec::new(),
            started: HashMap::default(),
        })
    }

    fn spawn(env: RunEnv, indexed: IndexedJob<A, T>) -> RuntimeResult<JoinHandle<RawOutcome<T>>> {
        let name = format!("worker-{}", indexed.worker_id);
        let worker_name = name.clone();
        spawn_named(name, move || {
            let identity = WorkerIdentity::current_thread(indexed.worker_id, worker_name);
            env.run_job(&indexed.job, identity)
        })
    }

    fn join(worker_id: WorkerId, handle: JoinHandle<RawOutcome<T>>) -> RawOutcome<T> {
        handle.join().unwrap_or_else(|payload| {
            RawOutcome::failure(
                WorkerIdentity {
                    worker_id,
                    pid: std::process::id(),
                    worker_name: format!("worker-{}", worker_id),
                    native_id: None,
                },
                TaskError::Panicked(panic_message(payload.as_ref())),
            )
        })
    }
}

impl<A: Payload, T: Payload> Strategy<A, T> for MultiThreadStrategy<A, T> {
    fn run_state(&self) -> &RunState<A, T> {
        &self.run
    }

    fn run_state_mut(&mut self) -> &mut RunState<A, T> {
        &mut self.run
    }

    fn activate_all(&mut self) -> RuntimeResult<()> {
        let jobs = self.run.begin_activation()?;
        let env = self.run.env();
        for indexed in jobs {
            let worker_id = indexed.worker_id;
            let handle = Self::spawn(env.clone(), indexed)?;
            self.running.push((worker_id, handle));
        }
        Ok(())
    }

    /// Outcomes come back in worker-index order
    fn await_completion(&mut self) -> RuntimeResult<()> {
        self.run.check_awaitable()?;
        let outcomes = self
            .running
            .drain(..)
            .map(|(worker_id, handle)| Self::join(worker_id, handle))
            .collect();
        self.run.finish_await(outcomes);
        Ok(())
    }

    fn start_worker(&mut self, job: Job<A, T>) -> RuntimeResult<WorkerHandle> {
        let indexed = self.run.incremental_job(job)?;
        let worker_id = indexed.worker_id;
        let handle = Self::spawn(self.run.env(), indexed)?;
        self.started.insert(worker_id, handle);
        debug!(worker_id, "Worker thread started");
        Ok(WorkerHandle::new(worker_id))
    }

    fn join_workers(&mut self, handles: &[WorkerHandle]) -> RuntimeResult<Vec<RawOutcome<T>>> {
        handles
            .iter()
            .map(|handle| {
                let thread = self.started.remove(&handle.worker_id()).ok_or_else(|| {
                    RuntimeError::configuration(format!("unknown worker handle {}", handle))
                })?;
                Ok(Self::join(handle.worker_id(), thread))
            })
            .collect()
    }

    fn batch_limit(&self) -> Option<usize> {
        Some(self.run.workers())
    }

    fn reset(&mut self) {
        for (worker_id, handle) in self.running.drain(..).chain(self.started.drain()) {
            if handle.join().is_err() {
                warn!(worker_id, "Worker thread panicked during reset");
            }
        }
        self.run.reset();
    }
}

struct Pool<A, T> {
    jobs: flume::Sender<IndexedJob<A, T>>,
    outcomes: flume::Receiver<RawOutcome<T>>,
    threads: Vec<JoinHandle<()>>,
}

impl<A: Payload, T: Payload> Pool<A, T> {
    fn start(size: usize, env: RunEnv) -> RuntimeResult<Self> {
        let (job_tx, job_rx) = flume::unbounded::<IndexedJob<A, T>>();
        let (outcome_tx, outcome_rx) = flume::unbounded();

        let threads = (0..size)
            .map(|slot| {
                let name = format!("pool-worker-{}", slot);
                let worker_name = name.clone();
                let jobs = job_rx.clone();
                let outcomes = outcome_tx.clone();
                let env = env.clone();
                spawn_named(name, move || {
                    while let Ok(indexed) = jobs.recv() {
                        let identity =
                            WorkerIdentity::current_thread(indexed.worker_id, worker_name.as_str());
                        let outcome = env.run_job(&indexed.job, identity);
                        if outcomes.send(outcome).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect::<RuntimeResult<Vec<_>>>()?;

        debug!(size, "Thread pool started");
        Ok(Self {
            jobs: job_tx,
            outcomes: outcome_rx,
            threads,
        })
    }

    fn submit(&self, indexed: IndexedJob<A, T>) -> RuntimeResult<()> {
        self.jobs
            .send(indexed)
            .map_err(|_| RuntimeError::Spawn("thread pool is shut down".into()))
    }

    fn shutdown(self) {
        drop(self.jobs);
        for handle in self.threads {
            if handle.join().is_err() {
                warn!("Pool thread panicked outside a task");
            }
        }
        debug!("Thread pool stopped");
    }
}

/// Fixed set of OS threads draining a job channel
pub struct ThreadPoolStrategy<A, T> {
    run: RunState<A, T>,
    pool: Option<Pool<A, T>>,
    batch: HashSet<WorkerId, RandomState>,
    started: HashSet<WorkerId, RandomState>,
    finished: HashMap<WorkerId, RawOutcome<T>, RandomState>,
}

impl<A: Payload, T: Payload> ThreadPoolStrategy<A, T> {
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        Ok(Self {
            run: RunState::new(RuntimeConfig { mode: RunningMode::ThreadPool, ..config }, None)?,
            pool: None,
            batch: HashSet::default(),
            started: HashSet::default(),
            finished: HashMap::default(),
        })
    }

    fn pool(&mut self) -> RuntimeResult<&Pool<A, T>> {
        if self.pool.is_none() {
            self.pool = Some(Pool::start(self.run.workers(), self.run.env())?);
        }
        self.pool
            .as_ref()
            .ok_or_else(|| RuntimeError::Spawn("thread pool unavailable".into()))
    }

    fn receive(&mut self) -> RuntimeResult<RawOutcome<T>> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| RuntimeError::Spawn("thread pool unavailable".into()))?;
        pool.outcomes
            .recv()
            .map_err(|_| RuntimeError::Spawn("thread pool stopped unexpectedly".into()))
    }

    /// Wait until every id in `wanted` has an outcome; others are parked in `finished`
    fn gather(&mut self, wanted: &[WorkerId]) -> RuntimeResult<Vec<RawOutcome<T>>> {
        let mut outcomes = Vec::with_capacity(wanted.len());
        let mut missing: HashSet<WorkerId, RandomState> = wanted.iter().copied().collect();

        for id in wanted {
            if let Some(outcome) = self.finished.remove(id) {
                missing.remove(id);
                outcomes.push(outcome);
            }
        }
        while !missing.is_empty() {
            let outcome = self.receive()?;
            if missing.remove(&outcome.worker_id()) {
                outcomes.push(outcome);
            } else {
                self.finished.insert(outcome.worker_id(), outcome);
            }
        }
        Ok(outcomes)
    }

    fn shutdown_if_idle(&mut self) {
        if self.batch.is_empty() && self.started.is_empty() {
            if let Some(pool) = self.pool.take() {
                pool.shutdown();
            }
        }
    }
}

impl<A: Payload, T: Payload> Strategy<A, T> for ThreadPoolStrategy<A, T> {
    fn run_state(&self) -> &RunState<A, T> {
        &self.run
    }

    fn run_state_mut(&mut self) -> &mut RunState<A, T> {
        &mut self.run
    }

    fn activate_all(&mut self) -> RuntimeResult<()> {
        let jobs = self.run.begin_activation()?;
        for indexed in jobs {
            let worker_id = indexed.worker_id;
            self.pool()?.submit(indexed)?;
            self.batch.insert(worker_id);
        }
        Ok(())
    }

    /// Outcomes come back in completion order
    fn await_completion(&mut self) -> RuntimeResult<()> {
        self.run.check_awaitable()?;
        let wanted: Vec<WorkerId> = self.batch.iter().copied().collect();
        let outcomes = self.gather(&wanted)?;
        self.batch.clear();
        self.shutdown_if_idle();
        self.run.finish_await(outcomes);
        Ok(())
    }

    fn start_worker(&mut self, job: Job<A, T>) -> RuntimeResult<WorkerHandle> {
        let indexed = self.run.incremental_job(job)?;
        let worker_id = indexed.worker_id;
        self.pool()?.submit(indexed)?;
        self.started.insert(worker_id);
        Ok(WorkerHandle::new(worker_id))
    }

    fn join_workers(&mut self, handles: &[WorkerHandle]) -> RuntimeResult<Vec<RawOutcome<T>>> {
        let wanted: Vec<WorkerId> = handles.iter().map(WorkerHandle::worker_id).collect();
        if let Some(unknown) = handles.iter().find(|h| !self.started.contains(&h.worker_id())) {
            return Err(RuntimeError::configuration(format!(
                "unknown worker handle {}",
                unknown
            )));
        }
        let outcomes = self.gather(&wanted)?;
        for id in &wanted {
            self.started.remove(id);
        }
        self.shutdown_if_idle();
        Ok(outcomes)
    }

    fn batch_limit(&self) -> Option<usize> {
        None
    }

    fn reset(&mut self) {
        self.batch.clear();
        self.started.clear();
        self.finished.clear();
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
        self.run.reset();
    }
}
