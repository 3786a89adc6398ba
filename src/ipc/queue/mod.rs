/*!
 * Queue Adapter Layer
 *
 * Task queues with one put/get contract over three backends:
 * - Thread: mutex + condvars, blocking producers and consumers
 * - Green / Async: tokio `Notify`, blocking calls only when immediate
 * - Process: a ring of bincode-encoded slots in shared memory (FIFO only)
 */

mod blocking;
mod cooperative;
mod shared;
mod store;

pub use blocking::BlockingQueue;
pub use cooperative::CoopQueue;
pub use shared::SharedQueue;

use crate::core::errors::{RuntimeError, RuntimeResult};
use crate::core::limits::{MAX_QUEUE_CAPACITY, SHARED_QUEUE_SLOT_BYTES};
use crate::core::types::{Family, Payload, RunningMode};
use crate::sync::{EventLoop, LoopId, SyncError};
use futures::future::BoxFuture;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Queue operation result
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum QueueError {
    #[error("Queue closed")]
    #[diagnostic(code(queue::closed))]
    Closed,

    #[error("Queue full: capacity {capacity}")]
    #[diagnostic(code(queue::full))]
    Full { capacity: usize },

    #[error("{0} does not track unfinished tasks")]
    #[diagnostic(
        code(queue::not_joinable),
        help("Use QueueType::JoinableQueue for task_done/join.")
    )]
    NotJoinable(QueueType),

    #[error("task_done called more times than items were put")]
    #[diagnostic(code(queue::task_done_overflow))]
    TaskDoneOverflow,

    #[error("Encoded item is {size} bytes, shared slots hold {slot}")]
    #[diagnostic(code(queue::item_too_large))]
    ItemTooLarge { size: usize, slot: usize },

    #[error("Blocking queue call would stall the event loop")]
    #[diagnostic(
        code(queue::would_block_loop),
        help("Use put_async/get_async from inside the task.")
    )]
    WouldBlockLoop,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Sync(#[from] SyncError),
}

impl From<bincode::Error> for QueueError {
    fn from(err: bincode::Error) -> Self {
        QueueError::Codec(err.to_string())
    }
}

/// Queue flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// Bounded FIFO
    Queue,
    /// Unbounded FIFO without task tracking
    SimpleQueue,
    /// Bounded FIFO with `task_done`/`join`
    JoinableQueue,
    /// Min-first by explicit key, FIFO among equal keys
    PriorityQueue,
    /// Stack order
    LifoQueue,
}

impl QueueType {
    pub const ALL: [QueueType; 5] = [
        QueueType::Queue,
        QueueType::SimpleQueue,
        QueueType::JoinableQueue,
        QueueType::PriorityQueue,
        QueueType::LifoQueue,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            QueueType::Queue => "queue",
            QueueType::SimpleQueue => "simple_queue",
            QueueType::JoinableQueue => "joinable_queue",
            QueueType::PriorityQueue => "priority_queue",
            QueueType::LifoQueue => "lifo_queue",
        }
    }

    pub const fn is_joinable(self) -> bool {
        matches!(self, QueueType::JoinableQueue)
    }

    pub const fn is_fifo(self) -> bool {
        matches!(
            self,
            QueueType::Queue | QueueType::SimpleQueue | QueueType::JoinableQueue
        )
    }

    /// Whether `family` can provide this queue type
    pub const fn supported_by(self, family: Family) -> bool {
        match family {
            Family::Process => self.is_fifo(),
            _ => true,
        }
    }
}

impl Default for QueueType {
    fn default() -> Self {
        QueueType::Queue
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        QueueType::ALL
            .into_iter()
            .find(|queue_type| queue_type.as_str() == normalized)
            .ok_or_else(|| format!("unknown queue type '{}'", s))
    }
}

/// Storage and blocking behaviour behind a `TaskQueue`.
///
/// Backends track unfinished items for every type; `TaskQueue` only exposes
/// `task_done`/`join` for joinable queues.
pub trait QueueBackend<A>: Send + Sync {
    fn put(&self, item: A, priority: i64) -> QueueResult<()>;
    fn try_put(&self, item: A, priority: i64) -> QueueResult<()>;
    fn put_async(&self, item: A, priority: i64) -> BoxFuture<'_, QueueResult<()>>;

    fn get(&self) -> QueueResult<A>;
    /// `Ok(None)` when empty and still open
    fn try_get(&self) -> QueueResult<Option<A>>;
    /// `Ok(None)` on timeout
    fn get_timeout(&self, timeout: Duration) -> QueueResult<Option<A>>;
    fn get_async(&self) -> BoxFuture<'_, QueueResult<A>>;

    fn len(&self) -> usize;
    fn close(&self);
    fn is_closed(&self) -> bool;

    fn task_done(&self) -> QueueResult<()>;
    /// `false` on timeout
    fn join(&self, timeout: Option<Duration>) -> QueueResult<bool>;
    fn join_async(&self) -> BoxFuture<'_, QueueResult<()>>;
}

/// Shared handle to one task queue
pub struct TaskQueue<A> {
    inner: Arc<dyn QueueBackend<A>>,
    queue_type: QueueType,
    family: Family,
}

impl<A> Clone for TaskQueue<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            queue_type: self.queue_type,
            family: self.family,
        }
    }
}

impl<A: Payload> TaskQueue<A> {
    fn new(inner: Arc<dyn QueueBackend<A>>, queue_type: QueueType, family: Family) -> Self {
        Self {
            inner,
            queue_type,
            family,
        }
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn put(&self, item: A) -> QueueResult<()> {
        self.inner.put(item, 0)
    }

    /// Put with an ordering key; only priority queues honour it
    pub fn put_with_priority(&self, item: A, priority: i64) -> QueueResult<()> {
        self.inner.put(item, priority)
    }

    pub fn try_put(&self, item: A) -> QueueResult<()> {
        self.inner.try_put(item, 0)
    }

    pub async fn put_async(&self, item: A) -> QueueResult<()> {
        self.inner.put_async(item, 0).await
    }

    pub fn get(&self) -> QueueResult<A> {
        self.inner.get()
    }

    pub fn try_get(&self) -> QueueResult<Option<A>> {
        self.inner.try_get()
    }

    pub fn get_timeout(&self, timeout: Duration) -> QueueResult<Option<A>> {
        self.inner.get_timeout(timeout)
    }

    pub async fn get_async(&self) -> QueueResult<A> {
        self.inner.get_async().await
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Wake every blocked producer/consumer; further puts fail with `Closed`
    pub fn close(&self) {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn task_done(&self) -> QueueResult<()> {
        self.require_joinable()?;
        self.inner.task_done()
    }

    /// Block until every put item was marked done; `false` on timeout
    pub fn join(&self, timeout: Option<Duration>) -> QueueResult<bool> {
        self.require_joinable()?;
        self.inner.join(timeout)
    }

    pub async fn join_async(&self) -> QueueResult<()> {
        self.require_joinable()?;
        self.inner.join_async().await
    }

    fn require_joinable(&self) -> QueueResult<()> {
        if self.queue_type.is_joinable() {
            Ok(())
        } else {
            Err(QueueError::NotJoinable(self.queue_type))
        }
    }
}

impl<A> fmt::Debug for TaskQueue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("queue_type", &self.queue_type)
            .field("family", &self.family)
            .field("len", &self.inner.len())
            .finish()
    }
}

/// Factory for the task queues of one family
#[derive(Debug, Clone, Copy)]
pub struct QueueAdapter {
    family: Family,
    event_loop: Option<LoopId>,
}

impl QueueAdapter {
    pub fn new(mode: RunningMode, event_loop: Option<&EventLoop>) -> RuntimeResult<Self> {
        Self::for_family(mode.family(), event_loop.map(EventLoop::id))
    }

    pub fn for_family(family: Family, event_loop: Option<LoopId>) -> RuntimeResult<Self> {
        let event_loop = match family {
            Family::Async => Some(event_loop.ok_or_else(|| {
                RuntimeError::configuration("async queues require an event loop")
            })?),
            _ => None,
        };
        Ok(Self { family, event_loop })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Build a queue; `capacity` of `None` means unbounded where the backend allows it.
    /// `SimpleQueue` ignores `capacity` in-process.
    pub fn get_queue<A: Payload>(
        &self,
        queue_type: QueueType,
        capacity: Option<usize>,
    ) -> RuntimeResult<TaskQueue<A>> {
        if !queue_type.supported_by(self.family) {
            return Err(RuntimeError::UnsupportedPrimitive(format!(
                "{} is not available to {} workers",
                queue_type, self.family
            )));
        }
        if capacity == Some(0) {
            return Err(RuntimeError::configuration("queue capacity must be positive"));
        }
        let capacity = match queue_type {
            QueueType::SimpleQueue if self.family != Family::Process => None,
            _ => capacity.map(|c| c.min(MAX_QUEUE_CAPACITY)),
        };

        let inner: Arc<dyn QueueBackend<A>> = match self.family {
            Family::Thread => Arc::new(BlockingQueue::new(queue_type, capacity)),
            Family::Green | Family::Async => {
                Arc::new(CoopQueue::new(queue_type, capacity, self.event_loop))
            }
            Family::Process => Arc::new(SharedQueue::new(capacity, SHARED_QUEUE_SLOT_BYTES)?),
        };
        Ok(TaskQueue::new(inner, queue_type, self.family))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_type_parse() {
        assert_eq!("lifo_queue".parse::<QueueType>(), Ok(QueueType::LifoQueue));
        assert_eq!("Priority-Queue".parse::<QueueType>(), Ok(QueueType::PriorityQueue));
        assert!("deque".parse::<QueueType>().is_err());
    }

    #[test]
    fn test_process_family_fifo_only() {
        let adapter = QueueAdapter::new(RunningMode::ProcessPool, None).unwrap();
        for queue_type in [QueueType::PriorityQueue, QueueType::LifoQueue] {
            assert!(matches!(
                adapter.get_queue::<u32>(queue_type, None),
                Err(RuntimeError::UnsupportedPrimitive(_))
            ));
        }
        assert!(adapter.get_queue::<u32>(QueueType::JoinableQueue, Some(8)).is_ok());
    }

    #[test]
    fn test_only_joinable_tracks_tasks() {
        let adapter = QueueAdapter::new(RunningMode::ThreadPool, None).unwrap();
        let queue = adapter.get_queue::<u32>(QueueType::Queue, Some(4)).unwrap();
        queue.put(1).unwrap();
        assert_eq!(queue.task_done(), Err(QueueError::NotJoinable(QueueType::Queue)));

        let joinable = adapter.get_queue::<u32>(QueueType::JoinableQueue, None).unwrap();
        joinable.put(1).unwrap();
        assert_eq!(joinable.get().unwrap(), 1);
        joinable.task_done().unwrap();
        assert_eq!(joinable.join(Some(Duration::from_millis(10))), Ok(true));
        assert_eq!(joinable.task_done(), Err(QueueError::TaskDoneOverflow));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let adapter = QueueAdapter::new(RunningMode::MultiThread, None).unwrap();
        assert!(matches!(
            adapter.get_queue::<u32>(QueueType::Queue, Some(0)),
            Err(RuntimeError::Configuration(_))
        ));
    }
}
