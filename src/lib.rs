/*!
 * multirunnable
 * One executor API over process, thread, green-thread and async-loop workers
 *
 * A caller picks a `RunningMode` and a worker count, hands a callable to the
 * `Executor`, and reads back one normalized `WorkerResult` per worker. Locks,
 * semaphores, events, conditions and task queues come from the family that
 * matches the mode, so the same callable runs unchanged on every backend.
 */

pub mod core;
pub mod decorators;
pub mod executor;
pub mod ipc;
pub mod monitoring;
pub mod persistence;
pub mod registry;
pub mod result;
pub mod strategy;
pub mod sync;

// Re-exports
pub use crate::core::{Family, RunningMode, RuntimeConfig, RuntimeError, RuntimeResult};
pub use decorators::{with_bounded_semaphore, with_lock, with_rlock, with_semaphore, Retry};
pub use executor::{Executor, ExecutorBuilder};
pub use ipc::{QueueType, Shared, SharedCounter, TaskQueue};
pub use monitoring::init_tracing;
pub use persistence::{ConnectionSharingMode, Persistence, Session};
pub use registry::{FeatureRegistry, PrimitiveKind};
pub use result::{ResultState, ResultsExt, WorkerResult};
pub use strategy::{
    Callable, FeatureRequest, Features, LifecycleState, RunControl, TaskError, TaskResult,
    WorkerContext, WorkerHandle,
};
pub use sync::{
    BoundedSemaphore, Condition, Event, EventLoop, Lock, Primitive, RLock, Semaphore,
};
