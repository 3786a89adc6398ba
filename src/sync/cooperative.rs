/*!
 * Cooperative Primitives (Green / Async families)
 *
 * tokio `Semaphore` and `Notify` underneath. Async-family primitives carry
 * the `LoopId` they were created for and refuse to be awaited from another
 * loop. Blocking calls succeed only when they complete immediately; anything
 * that would park the loop thread returns `WouldBlockLoop`.
 */

use super::event_loop::current_loop;
use super::{Acquire, LoopId, Notifier, Signal, SyncError, SyncResult, Tickets};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// Fail when a loop other than `bound` is driving this thread
pub(crate) fn check_loop(bound: Option<LoopId>) -> SyncResult<()> {
    match (bound, current_loop()) {
        (Some(primitive), Some(driving)) if primitive != driving => {
            Err(SyncError::IncompatibleLoop { primitive, driving })
        }
        _ => Ok(()),
    }
}

/// Lock and (bounded) semaphore over one tokio semaphore
pub struct CoopSemaphore {
    permits: Semaphore,
    bound: Option<usize>,
    event_loop: Option<LoopId>,
    /// Lock semantics: releasing with a free permit is `NotHeld`
    exclusive: bool,
}

impl CoopSemaphore {
    pub fn lock(event_loop: Option<LoopId>) -> Self {
        Self {
            permits: Semaphore::new(1),
            bound: Some(1),
            event_loop,
            exclusive: true,
        }
    }

    pub fn new(value: usize, event_loop: Option<LoopId>) -> Self {
        Self {
            permits: Semaphore::new(value),
            bound: None,
            event_loop,
            exclusive: false,
        }
    }

    pub fn bounded(value: usize, event_loop: Option<LoopId>) -> Self {
        Self {
            bound: Some(value),
            ..Self::new(value, event_loop)
        }
    }

    fn take(&self) -> bool {
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }
}

impl Acquire for CoopSemaphore {
    fn acquire(&self) -> SyncResult<()> {
        if self.try_acquire()? {
            Ok(())
        } else {
            Err(SyncError::WouldBlockLoop)
        }
    }

    fn try_acquire(&self) -> SyncResult<bool> {
        check_loop(self.event_loop)?;
        Ok(self.take())
    }

    /// A zero timeout is a plain try; any longer wait would park the loop
    fn acquire_timeout(&self, timeout: Duration) -> SyncResult<bool> {
        if self.try_acquire()? {
            Ok(true)
        } else if timeout.is_zero() {
            Ok(false)
        } else {
            Err(SyncError::WouldBlockLoop)
        }
    }

    fn acquire_async(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move {
            check_loop(self.event_loop)?;
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| SyncError::Closed)?;
            permit.forget();
            Ok(())
        })
    }

    fn release(&self) -> SyncResult<()> {
        if let Some(bound) = self.bound {
            if self.permits.available_permits() >= bound {
                return Err(if self.exclusive {
                    SyncError::NotHeld
                } else {
                    SyncError::BoundExceeded { bound }
                });
            }
        }
        self.permits.add_permits(1);
        Ok(())
    }
}

/// Owner of a cooperative re-entrant lock: the running task, or the loop's root future
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOwner {
    Task(tokio::task::Id),
    Root,
}

fn task_owner() -> TaskOwner {
    tokio::task::try_id().map_or(TaskOwner::Root, TaskOwner::Task)
}

#[derive(Default)]
struct Ownership {
    owner: Option<TaskOwner>,
    depth: usize,
}

pub struct CoopRLock {
    state: Mutex<Ownership>,
    released: Notify,
    event_loop: Option<LoopId>,
}

impl CoopRLock {
    pub fn new(event_loop: Option<LoopId>) -> Self {
        Self {
            state: Mutex::new(Ownership::default()),
            released: Notify::new(),
            event_loop,
        }
    }

    fn take(&self) -> bool {
        let me = task_owner();
        let mut state = self.state.lock();
        let owner = state.owner;
        match owner {
            Some(owner) if owner != me => false,
            _ => {
                state.owner = Some(me);
                state.depth += 1;
                true
            }
        }
    }
}

impl Acquire for CoopRLock {
    fn acquire(&self) -> SyncResult<()> {
        if self.try_acquire()? {
            Ok(())
        } else {
            Err(SyncError::WouldBlockLoop)
        }
    }

    fn try_acquire(&self) -> SyncResult<bool> {
        check_loop(self.event_loop)?;
        Ok(self.take())
    }

    /// A zero timeout is a plain try; any longer wait would park the loop
    fn acquire_timeout(&self, timeout: Duration) -> SyncResult<bool> {
        if self.try_acquire()? {
            Ok(true)
        } else if timeout.is_zero() {
            Ok(false)
        } else {
            Err(SyncError::WouldBlockLoop)
        }
    }

    fn acquire_async(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move {
            check_loop(self.event_loop)?;
            loop {
                let mut notified = pin!(self.released.notified());
                notified.as_mut().enable();
                if self.take() {
                    return Ok(());
                }
                notified.await;
            }
        })
    }

    fn release(&self) -> SyncResult<()> {
        let mut state = self.state.lock();
        let owner = state.owner;
        match owner {
            None => Err(SyncError::NotHeld),
            Some(owner) if owner != task_owner() => Err(SyncError::NotOwner),
            Some(_) => {
                state.depth -= 1;
                if state.depth == 0 {
                    state.owner = None;
                    drop(state);
                    self.released.notify_one();
                }
                Ok(())
            }
        }
    }
}

pub struct CoopEvent {
    flag: AtomicBool,
    changed: Notify,
    event_loop: Option<LoopId>,
}

impl CoopEvent {
    pub fn new(event_loop: Option<LoopId>) -> Self {
        Self {
            flag: AtomicBool::new(false),
            changed: Notify::new(),
            event_loop,
        }
    }
}

impl Signal for CoopEvent {
    fn set(&self) {
        self.flag.store(true, Ordering::Release);
        self.changed.notify_waiters();
    }

    fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn wait(&self, timeout: Option<Duration>) -> SyncResult<bool> {
        check_loop(self.event_loop)?;
        match (self.is_set(), timeout) {
            (true, _) => Ok(true),
            (false, Some(t)) if t.is_zero() => Ok(false),
            (false, _) => Err(SyncError::WouldBlockLoop),
        }
    }

    fn wait_async(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move {
            check_loop(self.event_loop)?;
            loop {
                let mut notified = pin!(self.changed.notified());
                notified.as_mut().enable();
                if self.is_set() {
                    return Ok(());
                }
                notified.await;
            }
        })
    }
}

/// Async-family condition; the green family has none
pub struct CoopCondition {
    lock: Arc<dyn Acquire>,
    tickets: Mutex<Tickets>,
    notified: Notify,
    event_loop: Option<LoopId>,
}

impl CoopCondition {
    pub fn new(lock: Arc<dyn Acquire>, event_loop: Option<LoopId>) -> Self {
        Self {
            lock,
            tickets: Mutex::new(Tickets::default()),
            notified: Notify::new(),
            event_loop,
        }
    }
}

impl Notifier for CoopCondition {
    fn wait(&self, _timeout: Option<Duration>) -> SyncResult<bool> {
        check_loop(self.event_loop)?;
        Err(SyncError::WouldBlockLoop)
    }

    fn wait_async(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move {
            check_loop(self.event_loop)?;
            let ticket = self.tickets.lock().enqueue();
            if let Err(e) = self.lock.release() {
                self.tickets.lock().withdraw(ticket);
                return Err(e);
            }

            loop {
                let mut notified = pin!(self.notified.notified());
                notified.as_mut().enable();
                if self.tickets.lock().take(ticket) {
                    break;
                }
                notified.await;
            }

            self.lock.acquire_async().await
        })
    }

    fn notify(&self, n: usize) -> SyncResult<usize> {
        let woken = self.tickets.lock().notify(n);
        if woken > 0 {
            self.notified.notify_waiters();
        }
        Ok(woken)
    }

    fn notify_all(&self) -> SyncResult<usize> {
        let woken = self.tickets.lock().notify_all();
        if woken > 0 {
            self.notified.notify_waiters();
        }
        Ok(woken)
    }
}
