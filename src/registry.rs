/*!
 * Feature Registry
 *
 * One slot per primitive kind, owned by a strategy for the duration of a run
 * and handed to every worker through its `WorkerContext`. Slots are
 * `ArcSwapOption`s: workers read without contention, the strategy swaps in
 * new instances between runs.
 *
 * Forked process workers inherit the registry as it was at fork time; the
 * process-family primitives inside it live in shared memory, so parent and
 * children still operate on the same state.
 */

use crate::core::errors::{RuntimeError, RuntimeResult};
use crate::ipc::queue::TaskQueue;
use crate::sync::{BoundedSemaphore, Condition, Event, Lock, Primitive, RLock, Semaphore};
use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Registry slot names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Lock,
    RLock,
    Semaphore,
    BoundedSemaphore,
    Event,
    Condition,
    Queue,
}

impl PrimitiveKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            PrimitiveKind::Lock => "lock",
            PrimitiveKind::RLock => "rlock",
            PrimitiveKind::Semaphore => "semaphore",
            PrimitiveKind::BoundedSemaphore => "bounded_semaphore",
            PrimitiveKind::Event => "event",
            PrimitiveKind::Condition => "condition",
            PrimitiveKind::Queue => "queue",
        }
    }

    const fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const PRIMITIVE_SLOTS: usize = 6;

/// Type-erased task queue (the registry is not generic over the payload)
struct QueueEntry {
    queue: Arc<dyn Any + Send + Sync>,
}

/// Run-scoped home of the primitives and task queue shared by all workers
pub struct FeatureRegistry {
    primitives: [ArcSwapOption<Primitive>; PRIMITIVE_SLOTS],
    queue: ArcSwapOption<QueueEntry>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self {
            primitives: std::array::from_fn(|_| ArcSwapOption::empty()),
            queue: ArcSwapOption::empty(),
        }
    }

    /// Store `primitive` as the current instance of `kind`.
    ///
    /// `None`, or a primitive of another kind, is rejected with
    /// `GlobalizeObject` and the previous instance stays in place.
    pub fn register(&self, kind: PrimitiveKind, primitive: Option<Primitive>) -> RuntimeResult<()> {
        let primitive = match primitive {
            Some(primitive) if primitive.kind() == kind => primitive,
            _ => return Err(RuntimeError::GlobalizeObject(kind)),
        };
        debug!(kind = %kind, binding = %primitive.binding(), "Registered primitive");
        self.primitives[kind.slot()].store(Some(Arc::new(primitive)));
        Ok(())
    }

    /// Store the run's task queue
    pub fn register_queue<A>(&self, queue: Option<TaskQueue<A>>) -> RuntimeResult<()>
    where
        A: Send + Sync + 'static,
    {
        let queue = queue.ok_or(RuntimeError::GlobalizeObject(PrimitiveKind::Queue))?;
        self.queue.store(Some(Arc::new(QueueEntry {
            queue: Arc::new(queue),
        })));
        Ok(())
    }

    /// Current instance of `kind`; queues are read through [`queue`](Self::queue)
    pub fn current(&self, kind: PrimitiveKind) -> RuntimeResult<Primitive> {
        if kind == PrimitiveKind::Queue {
            return Err(RuntimeError::configuration(
                "queues are typed; read them with FeatureRegistry::queue",
            ));
        }
        self.primitives[kind.slot()]
            .load_full()
            .map(|primitive| (*primitive).clone())
            .ok_or(RuntimeError::FeatureNotRegistered(kind))
    }

    pub fn is_registered(&self, kind: PrimitiveKind) -> bool {
        match kind {
            PrimitiveKind::Queue => self.queue.load().is_some(),
            _ => self.primitives[kind.slot()].load().is_some(),
        }
    }

    pub fn lock(&self) -> RuntimeResult<Lock> {
        match self.current(PrimitiveKind::Lock)? {
            Primitive::Lock(lock) => Ok(lock),
            _ => Err(RuntimeError::FeatureNotRegistered(PrimitiveKind::Lock)),
        }
    }

    pub fn rlock(&self) -> RuntimeResult<RLock> {
        match self.current(PrimitiveKind::RLock)? {
            Primitive::RLock(rlock) => Ok(rlock),
            _ => Err(RuntimeError::FeatureNotRegistered(PrimitiveKind::RLock)),
        }
    }

    pub fn semaphore(&self) -> RuntimeResult<Semaphore> {
        match self.current(PrimitiveKind::Semaphore)? {
            Primitive::Semaphore(semaphore) => Ok(semaphore),
            _ => Err(RuntimeError::FeatureNotRegistered(PrimitiveKind::Semaphore)),
        }
    }

    pub fn bounded_semaphore(&self) -> RuntimeResult<BoundedSemaphore> {
        match self.current(PrimitiveKind::BoundedSemaphore)? {
            Primitive::BoundedSemaphore(semaphore) => Ok(semaphore),
            _ => Err(RuntimeError::FeatureNotRegistered(
                PrimitiveKind::BoundedSemaphore,
            )),
        }
    }

    pub fn event(&self) -> RuntimeResult<Event> {
        match self.current(PrimitiveKind::Event)? {
            Primitive::Event(event) => Ok(event),
            _ => Err(RuntimeError::FeatureNotRegistered(PrimitiveKind::Event)),
        }
    }

    pub fn condition(&self) -> RuntimeResult<Condition> {
        match self.current(PrimitiveKind::Condition)? {
            Primitive::Condition(condition) => Ok(condition),
            _ => Err(RuntimeError::FeatureNotRegistered(PrimitiveKind::Condition)),
        }
    }

    /// The run's task queue, if one of payload type `A` was registered
    pub fn queue<A>(&self) -> RuntimeResult<TaskQueue<A>>
    where
        A: Send + Sync + 'static,
    {
        let entry = self
            .queue
            .load_full()
            .ok_or(RuntimeError::FeatureNotRegistered(PrimitiveKind::Queue))?;
        entry
            .queue
            .downcast_ref::<TaskQueue<A>>()
            .cloned()
            .ok_or_else(|| {
                RuntimeError::configuration("registered queue carries a different payload type")
            })
    }

    /// Drop every registered instance
    pub fn clear(&self) {
        for slot in &self.primitives {
            slot.store(None);
        }
        self.queue.store(None);
    }
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FeatureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<PrimitiveKind> = [
            PrimitiveKind::Lock,
            PrimitiveKind::RLock,
            PrimitiveKind::Semaphore,
            PrimitiveKind::BoundedSemaphore,
            PrimitiveKind::Event,
            PrimitiveKind::Condition,
            PrimitiveKind::Queue,
        ]
        .into_iter()
        .filter(|kind| self.is_registered(*kind))
        .collect();
        f.debug_struct("FeatureRegistry")
            .field("registered", &registered)
            .finish()
    }
}
