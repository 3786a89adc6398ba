/*!
 * Worker Execution
 *
 * Identity of an execution unit and the per-job wrapper every backend runs:
 * resolve the argument, open a persistence session, call the task with
 * panics caught, close the session, report a `RawOutcome`.
 */

use super::task::{Job, JobArg, TaskError, TaskResult, WorkerContext};
use super::RunControl;
use crate::core::types::{Payload, Pid, WorkerId};
use crate::persistence::{PersistenceGate, Session};
use crate::registry::FeatureRegistry;
use crate::result::RawOutcome;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Who ran a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub worker_id: WorkerId,
    pub pid: Pid,
    pub worker_name: String,
    /// OS thread id; `None` for green threads and async tasks
    pub native_id: Option<u64>,
}

impl WorkerIdentity {
    /// Identity of the calling OS thread
    pub fn current_thread(worker_id: WorkerId, worker_name: impl Into<String>) -> Self {
        Self {
            worker_id,
            pid: std::process::id(),
            worker_name: worker_name.into(),
            native_id: Some(native_thread_id()),
        }
    }

    /// Identity of a green thread or scheduled task on the calling thread
    pub fn cooperative(worker_id: WorkerId, worker_name: impl Into<String>) -> Self {
        Self {
            worker_id,
            pid: std::process::id(),
            worker_name: worker_name.into(),
            native_id: None,
        }
    }
}

#[cfg(target_os = "linux")]
fn native_thread_id() -> u64 {
    nix::unistd::gettid().as_raw() as u64
}

#[cfg(not(target_os = "linux"))]
fn native_thread_id() -> u64 {
    std::process::id() as u64
}

/// Ticket for a worker started with `start_worker`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerHandle {
    worker_id: WorkerId,
}

impl WorkerHandle {
    pub(crate) fn new(worker_id: WorkerId) -> Self {
        Self { worker_id }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}", self.worker_id)
    }
}

/// A job with its run index
pub(crate) struct IndexedJob<A, T> {
    pub worker_id: WorkerId,
    pub job: Job<A, T>,
}

/// Everything a worker needs besides its job
#[derive(Clone)]
pub(crate) struct RunEnv {
    pub registry: Arc<FeatureRegistry>,
    pub persistence: Option<PersistenceGate>,
    pub control: RunControl,
}

impl RunEnv {
    fn resolve_arg<A: Payload>(&self, arg: &JobArg<A>) -> TaskResult<A> {
        match arg {
            JobArg::Fixed(arg) => Ok(arg.clone()),
            JobArg::FromQueue => {
                let queue = self.registry.queue::<A>()?;
                match queue.try_get() {
                    Ok(Some(item)) => Ok(item),
                    Ok(None) | Err(crate::ipc::queue::QueueError::Closed) => {
                        Err(TaskError::QueueDrained)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn open_session(&self) -> TaskResult<Option<Arc<Session>>> {
        match &self.persistence {
            Some(gate) => Ok(Some(Arc::new(gate.open()?))),
            None => Ok(None),
        }
    }

    async fn open_session_async(&self) -> TaskResult<Option<Arc<Session>>> {
        match &self.persistence {
            Some(gate) => Ok(Some(Arc::new(gate.open_async().await?))),
            None => Ok(None),
        }
    }

    fn close_session(&self, session: Option<Arc<Session>>) -> TaskResult<()> {
        match (&self.persistence, session) {
            (Some(gate), Some(session)) => Ok(gate.close(&session)?),
            _ => Ok(()),
        }
    }

    /// Run `job` to completion on the calling thread
    pub fn run_job<A: Payload, T: Payload>(
        &self,
        job: &Job<A, T>,
        identity: WorkerIdentity,
    ) -> RawOutcome<T> {
        if self.control.is_stopping() {
            return RawOutcome::failure(identity, TaskError::Terminated);
        }

        let result = self.prepare(job).and_then(|(arg, session)| {
            let ctx = WorkerContext::new(identity.clone(), Arc::clone(&self.registry), session.clone());
            let result = catch_unwind(AssertUnwindSafe(|| job.callable.call_blocking(ctx, arg)))
                .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload.as_ref()))));
            self.finish(result, session)
        });

        RawOutcome::new(identity, result)
    }

    /// Run `job` on the current cooperative runtime
    pub async fn run_job_async<A: Payload, T: Payload>(
        &self,
        job: &Job<A, T>,
        identity: WorkerIdentity,
    ) -> RawOutcome<T> {
        if self.control.is_stopping() {
            return RawOutcome::failure(identity, TaskError::Terminated);
        }

        let result = match self.prepare_async(job).await {
            Ok((arg, session)) => {
                let ctx =
                    WorkerContext::new(identity.clone(), Arc::clone(&self.registry), session.clone());
                let result = AssertUnwindSafe(job.callable.call_async(ctx, arg))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(TaskError::Panicked(panic_message(payload.as_ref())))
                    });
                self.finish(result, session)
            }
            Err(e) => Err(e),
        };

        RawOutcome::new(identity, result)
    }

    fn prepare<A: Payload, T: Payload>(
        &self,
        job: &Job<A, T>,
    ) -> TaskResult<(A, Option<Arc<Session>>)> {
        let arg = self.resolve_arg(&job.arg)?;
        Ok((arg, self.open_session()?))
    }

    async fn prepare_async<A: Payload, T: Payload>(
        &self,
        job: &Job<A, T>,
    ) -> TaskResult<(A, Option<Arc<Session>>)> {
        let arg = self.resolve_arg(&job.arg)?;
        Ok((arg, self.open_session_async().await?))
    }

    /// Close the session even when the task failed or panicked; a task error wins
    fn finish<T>(&self, result: TaskResult<T>, session: Option<Arc<Session>>) -> TaskResult<T> {
        let closed = self.close_session(session);
        result.and_then(|value| closed.map(|_| value))
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
