/*!
 * Green Thread Strategy
 *
 * `workers` green threads on a tokio `LocalSet` over a fresh current-thread
 * loop, draining the job list cooperatively. They only make progress while
 * the loop is driven, so activation queues the batch and `await_completion`
 * runs it. Results come back in worker-index order.
 */

use super::task::{Job, TaskError};
use super::worker::{IndexedJob, RunEnv, WorkerHandle, WorkerIdentity};
use super::{RunState, Strategy};
use crate::core::config::RuntimeConfig;
use crate::core::errors::{RuntimeError, RuntimeResult};
use crate::core::types::{Payload, RunningMode, WorkerId};
use crate::result::RawOutcome;
use crate::sync::EventLoop;
use ahash::RandomState;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tokio::task::LocalSet;
use tracing::debug;

pub struct GreenThreadStrategy<A, T> {
    run: RunState<A, T>,
    queued: Vec<IndexedJob<A, T>>,
    deferred: HashMap<WorkerId, IndexedJob<A, T>, RandomState>,
}

impl<A: Payload, T: Payload> GreenThreadStrategy<A, T> {
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        Ok(Self {
            run: RunState::new(RuntimeConfig { mode: RunningMode::GreenThreadPool, ..config }, None)?,
            queued: Vec::new(),
            deferred: HashMap::default(),
        })
    }

    /// Run `jobs` on `size` green threads; outcomes in job order
    fn drive(env: RunEnv, size: usize, jobs: Vec<IndexedJob<A, T>>) -> RuntimeResult<Vec<RawOutcome<T>>> {
        let event_loop =
            EventLoop::new().map_err(|e| RuntimeError::Spawn(format!("green thread loop: {}", e)))?;
        let ids: Vec<WorkerId> = jobs.iter().map(|indexed| indexed.worker_id).collect();
        let jobs = Rc::new(jobs);
        let next = Rc::new(Cell::new(0usize));
        let slots: Rc<RefCell<Vec<Option<RawOutcome<T>>>>> =
            Rc::new(RefCell::new((0..ids.len()).map(|_| None).collect()));

        let local = LocalSet::new();
        let greenlets = size.min(jobs.len());
        for greenlet in 0..greenlets {
            let (env, jobs, next, slots) = (env.clone(), Rc::clone(&jobs), Rc::clone(&next), Rc::clone(&slots));
            local.spawn_local(async move {
                let worker_name = format!("greenlet-{}", greenlet);
                loop {
                    let index = next.get();
                    let Some(indexed) = jobs.get(index) else {
                        break;
                    };
                    next.set(index + 1);
                    let identity = WorkerIdentity::cooperative(indexed.worker_id, worker_name.as_str());
                    let outcome = env.run_job_async(&indexed.job, identity).await;
                    slots.borrow_mut()[index] = Some(outcome);
                }
            });
        }
        debug!(greenlets, jobs = ids.len(), "Driving green threads");
        event_loop.block_on(local);

        let outcomes = slots
            .take()
            .into_iter()
            .zip(ids)
            .map(|(slot, worker_id)| {
                slot.unwrap_or_else(|| {
                    RawOutcome::failure(
                        WorkerIdentity::cooperative(worker_id, "greenlet"),
                        TaskError::WorkerLost("green thread stopped before finishing".into()),
                    )
                })
            })
            .collect();
        Ok(outcomes)
    }
}

impl<A: Payload, T: Payload> Strategy<A, T> for GreenThreadStrategy<A, T> {
    fn run_state(&self) -> &RunState<A, T> {
        &self.run
    }

    fn run_state_mut(&mut self) -> &mut RunState<A, T> {
        &mut self.run
    }

    fn activate_all(&mut self) -> RuntimeResult<()> {
        self.queued = self.run.begin_activation()?;
        Ok(())
    }

    fn await_completion(&mut self) -> RuntimeResult<()> {
        self.run.check_awaitable()?;
        let jobs = std::mem::take(&mut self.queued);
        let outcomes = Self::drive(self.run.env(), self.run.workers(), jobs)?;
        self.run.finish_await(outcomes);
        Ok(())
    }

    /// Green threads started here run when they are joined
    fn start_worker(&mut self, job: Job<A, T>) -> RuntimeResult<WorkerHandle> {
        let indexed = self.run.incremental_job(job)?;
        let worker_id = indexed.worker_id;
        self.deferred.insert(worker_id, indexed);
        Ok(WorkerHandle::new(worker_id))
    }

    fn join_workers(&mut self, handles: &[WorkerHandle]) -> RuntimeResult<Vec<RawOutcome<T>>> {
        let jobs = handles
            .iter()
            .map(|handle| {
                self.deferred.remove(&handle.worker_id()).ok_or_else(|| {
                    RuntimeError::configuration(format!("unknown worker handle {}", handle))
                })
            })
            .collect::<RuntimeResult<Vec<_>>>()?;
        Self::drive(self.run.env(), self.run.workers(), jobs)
    }

    fn batch_limit(&self) -> Option<usize> {
        None
    }

    fn reset(&mut self) {
        self.queued.clear();
        self.deferred.clear();
        self.run.reset();
    }
}
