/*!
 * Async Cooperative Strategy
 *
 * One task per job on the strategy's event loop. Tasks are spawned at
 * activation and progress while `await_completion` drives the loop with its
 * id installed as the thread's current loop. Results come back in completion
 * order. This is the only backend with real cancellation: `cancel` and
 * `kill` abort tasks at their next await point.
 */

use super::task::{Job, TaskError};
use super::worker::{IndexedJob, WorkerHandle, WorkerIdentity};
use super::{RunState, Strategy};
use crate::core::config::RuntimeConfig;
use crate::core::errors::{RuntimeError, RuntimeResult};
use crate::core::types::{Payload, RunningMode, WorkerId};
use crate::result::RawOutcome;
use crate::sync::EventLoop;
use ahash::RandomState;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::debug;

type Running<T> = Vec<(WorkerId, JoinHandle<RawOutcome<T>>)>;

pub struct CoroutineStrategy<A, T> {
    run: RunState<A, T>,
    event_loop: EventLoop,
    running: Running<T>,
    started: HashMap<WorkerId, JoinHandle<RawOutcome<T>>, RandomState>,
}

impl<A: Payload, T: Payload> CoroutineStrategy<A, T> {
    /// Drive `event_loop`, or a new loop when none is given
    pub fn new(config: RuntimeConfig, event_loop: Option<EventLoop>) -> RuntimeResult<Self> {
        let event_loop = match event_loop {
            Some(event_loop) => event_loop,
            None => EventLoop::new()
                .map_err(|e| RuntimeError::Spawn(format!("event loop: {}", e)))?,
        };
        let config = RuntimeConfig {
            mode: RunningMode::AsyncCooperative,
            ..config
        };
        Ok(Self {
            run: RunState::new(config, Some(&event_loop))?,
            event_loop,
            running: Vec::new(),
            started: HashMap::default(),
        })
    }

    fn spawn(&self, indexed: IndexedJob<A, T>) -> JoinHandle<RawOutcome<T>> {
        let env = self.run.env();
        let worker_id = indexed.worker_id;
        let handle = self.event_loop.handle().spawn(async move {
            let identity = WorkerIdentity::cooperative(worker_id, format!("task-{}", worker_id));
            let outcome = env.run_job_async(&indexed.job, identity).await;
            env.control.untrack_task(worker_id);
            outcome
        });
        self.run.control().track_task(worker_id, handle.abort_handle());
        handle
    }

    /// Await `running` on the loop, in completion order
    fn drive(&self, running: Running<T>) -> Vec<RawOutcome<T>> {
        let control = self.run.control().clone();
        self.event_loop.block_on(async move {
            let mut pending: FuturesUnordered<_> = running
                .into_iter()
                .map(|(worker_id, handle)| async move { (worker_id, handle.await) })
                .collect();

            let mut outcomes = Vec::with_capacity(pending.len());
            while let Some((worker_id, joined)) = pending.next().await {
                control.untrack_task(worker_id);
                let outcome = joined.unwrap_or_else(|e| {
                    let error = if e.is_cancelled() {
                        TaskError::Cancelled
                    } else {
                        TaskError::Panicked(e.to_string())
                    };
                    RawOutcome::failure(
                        WorkerIdentity::cooperative(worker_id, format!("task-{}", worker_id)),
                        error,
                    )
                });
                outcomes.push(outcome);
            }
            outcomes
        })
    }
}

impl<A: Payload, T: Payload> Strategy<A, T> for CoroutineStrategy<A, T> {
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
            let handle = self.spawn(indexed);
            self.running.push((worker_id, handle));
        }
        debug!(loop_id = %self.event_loop.id(), tasks = self.running.len(), "Tasks scheduled");
        Ok(())
    }

    fn await_completion(&mut self) -> RuntimeResult<()> {
        self.run.check_awaitable()?;
        let running = std::mem::take(&mut self.running);
        let outcomes = self.drive(running);
        self.run.finish_await(outcomes);
        Ok(())
    }

    fn start_worker(&mut self, job: Job<A, T>) -> RuntimeResult<WorkerHandle> {
        let indexed = self.run.incremental_job(job)?;
        let worker_id = indexed.worker_id;
        let handle = self.spawn(indexed);
        self.started.insert(worker_id, handle);
        Ok(WorkerHandle::new(worker_id))
    }

    fn join_workers(&mut self, handles: &[WorkerHandle]) -> RuntimeResult<Vec<RawOutcome<T>>> {
        let running = handles
            .iter()
            .map(|handle| {
                self.started
                    .remove(&handle.worker_id())
                    .map(|task| (handle.worker_id(), task))
                    .ok_or_else(|| {
                        RuntimeError::configuration(format!("unknown worker handle {}", handle))
                    })
            })
            .collect::<RuntimeResult<Running<T>>>()?;
        Ok(self.drive(running))
    }

    fn cancel(&self, worker_id: WorkerId) -> RuntimeResult<()> {
        if self.run.control().cancel(worker_id) {
            Ok(())
        } else {
            Err(RuntimeError::configuration(format!(
                "no scheduled task for worker {}",
                worker_id
            )))
        }
    }

    fn batch_limit(&self) -> Option<usize> {
        Some(self.run.workers())
    }

    fn event_loop(&self) -> Option<&EventLoop> {
        Some(&self.event_loop)
    }

    fn reset(&mut self) {
        let mut leftover = std::mem::take(&mut self.running);
        leftover.extend(self.started.drain());
        for (_, handle) in &leftover {
            handle.abort();
        }
        let _ = self.drive(leftover);
        self.run.reset();
    }
}
