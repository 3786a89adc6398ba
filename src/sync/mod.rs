/*!
 * Synchronization Adapter Layer
 *
 * One capability surface (acquire/release, set/wait, wait/notify) over four
 * primitive families:
 * - Thread: parking_lot mutex + condvar state machines
 * - Process: atomics in shared memory, inherited across `fork()`
 * - Green / Async: tokio primitives; Async ones are bound to an event loop
 *
 * Handles are cheap to clone and are what the registry stores and workers
 * receive.
 */

mod adapter;
pub mod blocking;
pub mod cooperative;
pub mod event_loop;
pub mod shared;

pub use adapter::SyncAdapter;
pub use event_loop::{current_loop, EventLoop, LoopId};

use crate::core::types::Family;
use crate::registry::PrimitiveKind;
use futures::future::BoxFuture;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Synchronization operation result
pub type SyncResult<T> = Result<T, SyncError>;

/// Misuse and cross-loop errors raised by primitives themselves
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Diagnostic)]
pub enum SyncError {
    #[error("Released a primitive that is not held")]
    #[diagnostic(code(sync::not_held))]
    NotHeld,

    #[error("Re-entrant lock released by a caller that does not own it")]
    #[diagnostic(code(sync::not_owner))]
    NotOwner,

    #[error("Bounded semaphore released above its initial value {bound}")]
    #[diagnostic(code(sync::bound_exceeded))]
    BoundExceeded { bound: usize },

    #[error("Blocking wait on a cooperative primitive would stall the event loop")]
    #[diagnostic(
        code(sync::would_block_loop),
        help("Use the *_async variant from inside the task.")
    )]
    WouldBlockLoop,

    #[error("Primitive bound to {primitive} awaited while {driving} drives the thread")]
    #[diagnostic(code(sync::incompatible_loop))]
    IncompatibleLoop { primitive: LoopId, driving: LoopId },

    #[error("Primitive was closed")]
    Closed,
}

/// Which family made a primitive, and the loop it is bound to (Async only)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub family: Family,
    pub event_loop: Option<LoopId>,
}

impl Binding {
    pub fn new(family: Family, event_loop: Option<LoopId>) -> Self {
        Self { family, event_loop }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.event_loop {
            Some(id) => write!(f, "{}@{}", self.family, id),
            None => write!(f, "{}", self.family),
        }
    }
}

/// Lock-like capability (Lock, RLock, Semaphore, BoundedSemaphore)
pub trait Acquire: Send + Sync {
    /// Block until acquired
    fn acquire(&self) -> SyncResult<()>;

    /// Acquire without waiting; `false` when unavailable
    fn try_acquire(&self) -> SyncResult<bool>;

    /// Block up to `timeout`; `false` on timeout
    fn acquire_timeout(&self, timeout: Duration) -> SyncResult<bool>;

    fn acquire_async(&self) -> BoxFuture<'_, SyncResult<()>>;

    fn release(&self) -> SyncResult<()>;
}

/// Event capability
pub trait Signal: Send + Sync {
    fn set(&self);
    fn clear(&self);
    fn is_set(&self) -> bool;

    /// Wait until set; `false` on timeout
    fn wait(&self, timeout: Option<Duration>) -> SyncResult<bool>;

    fn wait_async(&self) -> BoxFuture<'_, SyncResult<()>>;
}

/// Condition capability. Callers hold the condition's lock around every call.
pub trait Notifier: Send + Sync {
    /// Release the lock, wait for a notification, re-acquire; `false` on timeout
    fn wait(&self, timeout: Option<Duration>) -> SyncResult<bool>;

    fn wait_async(&self) -> BoxFuture<'_, SyncResult<()>>;

    /// Wake up to `n` waiters; returns how many were woken
    fn notify(&self, n: usize) -> SyncResult<usize>;

    fn notify_all(&self) -> SyncResult<usize>;
}

/// Releases the primitive it was taken from on drop
pub struct SyncGuard {
    inner: Arc<dyn Acquire>,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        let _ = self.inner.release();
    }
}

macro_rules! acquire_handle {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            inner: Arc<dyn Acquire>,
            binding: Binding,
        }

        impl $name {
            pub(crate) fn from_parts(inner: Arc<dyn Acquire>, binding: Binding) -> Self {
                Self { inner, binding }
            }

            pub fn binding(&self) -> Binding {
                self.binding
            }

            pub(crate) fn inner(&self) -> Arc<dyn Acquire> {
                Arc::clone(&self.inner)
            }

            #[inline]
            pub fn acquire(&self) -> SyncResult<()> {
                self.inner.acquire()
            }

            #[inline]
            pub fn try_acquire(&self) -> SyncResult<bool> {
                self.inner.try_acquire()
            }

            #[inline]
            pub fn acquire_timeout(&self, timeout: Duration) -> SyncResult<bool> {
                self.inner.acquire_timeout(timeout)
            }

            pub async fn acquire_async(&self) -> SyncResult<()> {
                self.inner.acquire_async().await
            }

            #[inline]
            pub fn release(&self) -> SyncResult<()> {
                self.inner.release()
            }

            /// Acquire and release when the guard drops
            pub fn guard(&self) -> SyncResult<SyncGuard> {
                self.inner.acquire()?;
                Ok(SyncGuard {
                    inner: Arc::clone(&self.inner),
                })
            }

            pub async fn guard_async(&self) -> SyncResult<SyncGuard> {
                self.inner.acquire_async().await?;
                Ok(SyncGuard {
                    inner: Arc::clone(&self.inner),
                })
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("kind", &$kind)
                    .field("binding", &self.binding)
                    .finish()
            }
        }
    };
}

acquire_handle!(
    /// Mutual exclusion; release by a non-holder is an error
    Lock,
    PrimitiveKind::Lock
);
acquire_handle!(
    /// Re-entrant lock; the owner may acquire repeatedly and must release as often
    RLock,
    PrimitiveKind::RLock
);
acquire_handle!(
    /// Counting semaphore
    Semaphore,
    PrimitiveKind::Semaphore
);
acquire_handle!(
    /// Counting semaphore that refuses to grow past its initial value
    BoundedSemaphore,
    PrimitiveKind::BoundedSemaphore
);

/// One-shot flag workers can wait on
#[derive(Clone)]
pub struct Event {
    inner: Arc<dyn Signal>,
    binding: Binding,
}

impl Event {
    pub(crate) fn from_parts(inner: Arc<dyn Signal>, binding: Binding) -> Self {
        Self { inner, binding }
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    pub fn set(&self) {
        self.inner.set()
    }

    pub fn clear(&self) {
        self.inner.clear()
    }

    pub fn is_set(&self) -> bool {
        self.inner.is_set()
    }

    pub fn wait(&self, timeout: Option<Duration>) -> SyncResult<bool> {
        self.inner.wait(timeout)
    }

    pub async fn wait_async(&self) -> SyncResult<()> {
        self.inner.wait_async().await
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("binding", &self.binding)
            .field("is_set", &self.is_set())
            .finish()
    }
}

/// Condition variable bundled with the lock that guards its predicate
#[derive(Clone)]
pub struct Condition {
    lock: Lock,
    inner: Arc<dyn Notifier>,
}

impl Condition {
    pub(crate) fn from_parts(lock: Lock, inner: Arc<dyn Notifier>) -> Self {
        Self { lock, inner }
    }

    pub fn binding(&self) -> Binding {
        self.lock.binding()
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub fn acquire(&self) -> SyncResult<()> {
        self.lock.acquire()
    }

    pub fn try_acquire(&self) -> SyncResult<bool> {
        self.lock.try_acquire()
    }

    pub async fn acquire_async(&self) -> SyncResult<()> {
        self.lock.acquire_async().await
    }

    pub fn release(&self) -> SyncResult<()> {
        self.lock.release()
    }

    pub fn wait(&self, timeout: Option<Duration>) -> SyncResult<bool> {
        self.inner.wait(timeout)
    }

    pub async fn wait_async(&self) -> SyncResult<()> {
        self.inner.wait_async().await
    }

    pub fn notify(&self, n: usize) -> SyncResult<usize> {
        self.inner.notify(n)
    }

    pub fn notify_all(&self) -> SyncResult<usize> {
        self.inner.notify_all()
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("binding", &self.binding())
            .finish()
    }
}

/// Any synchronization primitive, as stored in the registry
#[derive(Debug, Clone)]
pub enum Primitive {
    Lock(Lock),
    RLock(RLock),
    Semaphore(Semaphore),
    BoundedSemaphore(BoundedSemaphore),
    Event(Event),
    Condition(Condition),
}

impl Primitive {
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            Primitive::Lock(_) => PrimitiveKind::Lock,
            Primitive::RLock(_) => PrimitiveKind::RLock,
            Primitive::Semaphore(_) => PrimitiveKind::Semaphore,
            Primitive::BoundedSemaphore(_) => PrimitiveKind::BoundedSemaphore,
            Primitive::Event(_) => PrimitiveKind::Event,
            Primitive::Condition(_) => PrimitiveKind::Condition,
        }
    }

    pub fn binding(&self) -> Binding {
        match self {
            Primitive::Lock(p) => p.binding(),
            Primitive::RLock(p) => p.binding(),
            Primitive::Semaphore(p) => p.binding(),
            Primitive::BoundedSemaphore(p) => p.binding(),
            Primitive::Event(p) => p.binding(),
            Primitive::Condition(p) => p.binding(),
        }
    }
}

/// FIFO wait tickets for in-process conditions.
///
/// `notify(n)` moves the oldest `n` waiting tickets to the notified set; a
/// waiter that times out withdraws its ticket so it cannot swallow a wakeup.
#[derive(Default)]
pub(crate) struct Tickets {
    next: u64,
    waiting: VecDeque<u64>,
    notified: HashSet<u64, ahash::RandomState>,
}

impl Tickets {
    pub fn enqueue(&mut self) -> u64 {
        let ticket = self.next;
        self.next += 1;
        self.waiting.push_back(ticket);
        ticket
    }

    pub fn notify(&mut self, n: usize) -> usize {
        let count = n.min(self.waiting.len());
        self.notified.extend(self.waiting.drain(..count));
        count
    }

    pub fn notify_all(&mut self) -> usize {
        self.notify(self.waiting.len())
    }

    /// Consume the notification for `ticket` if it arrived
    pub fn take(&mut self, ticket: u64) -> bool {
        self.notified.remove(&ticket)
    }

    /// Withdraw a timed-out ticket; `true` if it was notified meanwhile
    pub fn withdraw(&mut self, ticket: u64) -> bool {
        if self.take(ticket) {
            return true;
        }
        self.waiting.retain(|t| *t != ticket);
        false
    }
}
