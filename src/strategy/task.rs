/*!
 * Tasks
 *
 * A job is a callable plus its argument (or a marker to pull the argument
 * from the run's task queue). Callables come in two flavours:
 * - blocking: `Fn(WorkerContext, A) -> TaskResult<T>`
 * - cooperative: `Fn(WorkerContext, A) -> impl Future<Output = TaskResult<T>>`
 *
 * Both run on every backend. Blocking callables on cooperative backends run
 * inline without yield points; cooperative callables on preemptive backends
 * are driven by a per-worker current-thread loop.
 */

use crate::core::errors::{RuntimeError, RuntimeResult};
use crate::core::types::{Payload, WorkerId};
use crate::ipc::queue::QueueError;
use crate::persistence::{PersistenceError, Session};
use crate::registry::FeatureRegistry;
use crate::strategy::worker::WorkerIdentity;
use crate::sync::{EventLoop, Lock, Primitive, SyncAdapter, SyncError};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

pub type TaskResult<T> = Result<T, TaskError>;

/// Failure of one job, captured into its result instead of aborting the run
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("Worker panicked: {0}")]
    Panicked(String),

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Run was terminated before the task started")]
    Terminated,

    #[error("Task queue had no item for this worker")]
    QueueDrained,

    #[error("Worker lost: {0}")]
    WorkerLost(String),

    #[error("Synchronization failed: {0}")]
    Sync(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

impl From<SyncError> for TaskError {
    fn from(err: SyncError) -> Self {
        TaskError::Sync(err.to_string())
    }
}

impl From<QueueError> for TaskError {
    fn from(err: QueueError) -> Self {
        TaskError::Failed(err.to_string())
    }
}

impl From<PersistenceError> for TaskError {
    fn from(err: PersistenceError) -> Self {
        TaskError::Persistence(err.to_string())
    }
}

impl From<RuntimeError> for TaskError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Sync(err) => err.into(),
            RuntimeError::Persistence(err) => err.into(),
            other => TaskError::Failed(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Failed(format!("{:#}", err))
    }
}

/// What a running task can see of its worker and run
#[derive(Clone)]
pub struct WorkerContext {
    identity: WorkerIdentity,
    registry: Arc<FeatureRegistry>,
    session: Option<Arc<Session>>,
}

impl WorkerContext {
    pub fn new(
        identity: WorkerIdentity,
        registry: Arc<FeatureRegistry>,
        session: Option<Arc<Session>>,
    ) -> Self {
        Self {
            identity,
            registry,
            session,
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn worker_id(&self) -> WorkerId {
        self.identity.worker_id
    }

    /// Primitives and queue registered for this run
    pub fn registry(&self) -> &FeatureRegistry {
        &self.registry
    }

    /// Persistence session, when the executor has a persistence collaborator
    pub fn session(&self) -> Option<&Session> {
        self.session.as_deref()
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("identity", &self.identity)
            .field("session", &self.session.is_some())
            .finish()
    }
}

pub type BlockingFn<A, T> = dyn Fn(WorkerContext, A) -> TaskResult<T> + Send + Sync;
pub type CooperativeFn<A, T> =
    dyn Fn(WorkerContext, A) -> BoxFuture<'static, TaskResult<T>> + Send + Sync;

/// Work submitted to an executor
pub enum Callable<A, T> {
    Blocking(Arc<BlockingFn<A, T>>),
    Cooperative(Arc<CooperativeFn<A, T>>),
}

impl<A, T> Clone for Callable<A, T> {
    fn clone(&self) -> Self {
        match self {
            Callable::Blocking(f) => Callable::Blocking(Arc::clone(f)),
            Callable::Cooperative(f) => Callable::Cooperative(Arc::clone(f)),
        }
    }
}

impl<A, T> fmt::Debug for Callable<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Blocking(_) => f.write_str("Callable::Blocking"),
            Callable::Cooperative(_) => f.write_str("Callable::Cooperative"),
        }
    }
}

impl<A: Payload, T: Payload> Callable<A, T> {
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(WorkerContext, A) -> TaskResult<T> + Send + Sync + 'static,
    {
        Callable::Blocking(Arc::new(f))
    }

    pub fn cooperative<F, Fut>(f: F) -> Self
    where
        F: Fn(WorkerContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        Callable::Cooperative(Arc::new(move |ctx, arg| f(ctx, arg).boxed()))
    }

    pub fn is_cooperative(&self) -> bool {
        matches!(self, Callable::Cooperative(_))
    }

    /// Run to completion on the calling thread
    pub(crate) fn call_blocking(&self, ctx: WorkerContext, arg: A) -> TaskResult<T> {
        match self {
            Callable::Blocking(f) => f(ctx, arg),
            Callable::Cooperative(f) => {
                let event_loop = EventLoop::new()
                    .map_err(|e| TaskError::failed(format!("cannot start worker loop: {}", e)))?;
                event_loop.block_on(f(ctx, arg))
            }
        }
    }

    pub(crate) async fn call_async(&self, ctx: WorkerContext, arg: A) -> TaskResult<T> {
        match self {
            Callable::Blocking(f) => f(ctx, arg),
            Callable::Cooperative(f) => f(ctx, arg).await,
        }
    }
}

/// Where a job gets its argument
#[derive(Debug, Clone)]
pub enum JobArg<A> {
    Fixed(A),
    /// Next item of the run's task queue, taken when the job starts
    FromQueue,
}

#[derive(Debug, Clone)]
pub struct Job<A, T> {
    pub callable: Callable<A, T>,
    pub arg: JobArg<A>,
}

impl<A: Payload, T: Payload> Job<A, T> {
    pub fn new(callable: Callable<A, T>, arg: A) -> Self {
        Self {
            callable,
            arg: JobArg::Fixed(arg),
        }
    }

    pub fn from_queue(callable: Callable<A, T>) -> Self {
        Self {
            callable,
            arg: JobArg::FromQueue,
        }
    }
}

/// A primitive a run should create and register before its workers start
#[derive(Debug, Clone)]
pub enum FeatureRequest {
    Lock,
    RLock,
    Semaphore(usize),
    BoundedSemaphore(usize),
    Event,
    /// Condition over the run's Lock when one is requested too, else over a fresh lock
    Condition,
    /// Register a caller-built primitive; it must match the run's family and loop
    Provided(Primitive),
}

/// Bundle of feature requests for one run
#[derive(Debug, Clone, Default)]
pub struct Features {
    requests: Vec<FeatureRequest>,
}

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(mut self, request: FeatureRequest) -> Self {
        self.requests.push(request);
        self
    }

    pub fn lock(self) -> Self {
        self.with(FeatureRequest::Lock)
    }

    pub fn rlock(self) -> Self {
        self.with(FeatureRequest::RLock)
    }

    pub fn semaphore(self, value: usize) -> Self {
        self.with(FeatureRequest::Semaphore(value))
    }

    pub fn bounded_semaphore(self, value: usize) -> Self {
        self.with(FeatureRequest::BoundedSemaphore(value))
    }

    pub fn event(self) -> Self {
        self.with(FeatureRequest::Event)
    }

    pub fn condition(self) -> Self {
        self.with(FeatureRequest::Condition)
    }

    pub fn provided(self, primitive: Primitive) -> Self {
        self.with(FeatureRequest::Provided(primitive))
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn requests(&self) -> &[FeatureRequest] {
        &self.requests
    }

    /// Create every requested primitive with `adapter`
    pub(crate) fn realize(&self, adapter: &SyncAdapter) -> RuntimeResult<Vec<Primitive>> {
        let mut primitives = Vec::with_capacity(self.requests.len());
        let mut run_lock: Option<Lock> = None;

        // Locks first so a condition can share the run's lock
        for request in &self.requests {
            let lock = match request {
                FeatureRequest::Lock => adapter.get_lock()?,
                FeatureRequest::Provided(Primitive::Lock(lock)) => {
                    adapter.check_binding(lock.binding())?;
                    lock.clone()
                }
                _ => continue,
            };
            run_lock = Some(lock.clone());
            primitives.push(Primitive::Lock(lock));
        }

        for request in &self.requests {
            let primitive = match request {
                FeatureRequest::Lock | FeatureRequest::Provided(Primitive::Lock(_)) => continue,
                FeatureRequest::RLock => Primitive::RLock(adapter.get_rlock()?),
                FeatureRequest::Semaphore(value) => {
                    Primitive::Semaphore(adapter.get_semaphore(*value)?)
                }
                FeatureRequest::BoundedSemaphore(value) => {
                    Primitive::BoundedSemaphore(adapter.get_bounded_semaphore(*value)?)
                }
                FeatureRequest::Event => Primitive::Event(adapter.get_event()?),
                FeatureRequest::Condition => {
                    Primitive::Condition(adapter.get_condition(run_lock.clone())?)
                }
                FeatureRequest::Provided(primitive) => {
                    adapter.check_binding(primitive.binding())?;
                    primitive.clone()
                }
            };
            primitives.push(primitive);
        }
        Ok(primitives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RunningMode;
    use crate::registry::PrimitiveKind;

    fn context() -> WorkerContext {
        WorkerContext::new(
            WorkerIdentity::current_thread(0, "worker-0"),
            Arc::new(FeatureRegistry::new()),
            None,
        )
    }

    #[test]
    fn test_blocking_and_cooperative_callables() {
        let double = Callable::<u32, u32>::blocking(|_, x| Ok(x * 2));
        assert_eq!(double.call_blocking(context(), 4), Ok(8));

        let triple = Callable::<u32, u32>::cooperative(|_, x| async move {
            tokio::task::yield_now().await;
            Ok(x * 3)
        });
        assert!(triple.is_cooperative());
        assert_eq!(triple.call_blocking(context(), 4), Ok(12));
    }

    #[test]
    fn test_error_conversions() {
        assert_eq!(
            TaskError::from(SyncError::NotHeld),
            TaskError::Sync(SyncError::NotHeld.to_string())
        );
        let err: TaskError = anyhow::anyhow!("inner").context("outer").into();
        assert_eq!(err, TaskError::Failed("outer: inner".into()));

        let err: TaskError = RuntimeError::FeatureNotRegistered(PrimitiveKind::Lock).into();
        assert!(matches!(err, TaskError::Failed(_)));
    }

    #[test]
    fn test_condition_shares_requested_lock() {
        let adapter = SyncAdapter::new(RunningMode::MultiThread, None).unwrap();
        let primitives = Features::new()
            .condition()
            .lock()
            .event()
            .realize(&adapter)
            .unwrap();
        let kinds: Vec<_> = primitives.iter().map(Primitive::kind).collect();
        assert_eq!(
            kinds,
            vec![PrimitiveKind::Lock, PrimitiveKind::Condition, PrimitiveKind::Event]
        );

        let (Primitive::Lock(lock), Primitive::Condition(condition)) =
            (&primitives[0], &primitives[1])
        else {
            panic!("unexpected primitive order");
        };
        condition.acquire().unwrap();
        assert!(!lock.try_acquire().unwrap());
        condition.release().unwrap();
    }

    #[test]
    fn test_provided_primitive_must_match_family() {
        let thread = SyncAdapter::new(RunningMode::MultiThread, None).unwrap();
        let process = SyncAdapter::new(RunningMode::MultiProcess, None).unwrap();
        let foreign = Primitive::Event(process.get_event().unwrap());
        let err = Features::new().provided(foreign).realize(&thread).unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(_)));
    }
}
