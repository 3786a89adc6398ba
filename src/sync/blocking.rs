/*!
 * Thread Family Primitives
 *
 * State machines over `parking_lot::Mutex` + `Condvar`. Blocking calls park
 * the OS thread; the async variants run the blocking path inside the future
 * (thread workers drive async callables on their own runtime).
 */

use super::{Acquire, Notifier, Signal, SyncError, SyncResult, Tickets};
use futures::future::BoxFuture;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Wait on `cv` until `done` holds or the deadline passes; returns `done`'s final value
fn wait_while<T>(
    cv: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: Option<Instant>,
    mut done: impl FnMut(&mut T) -> bool,
) -> bool {
    loop {
        if done(&mut **guard) {
            return true;
        }
        match deadline {
            Some(deadline) => {
                if cv.wait_until(guard, deadline).timed_out() {
                    return done(&mut **guard);
                }
            }
            None => cv.wait(guard),
        }
    }
}

fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

pub struct BlockingLock {
    locked: Mutex<bool>,
    available: Condvar,
}

impl BlockingLock {
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            available: Condvar::new(),
        }
    }

    fn acquire_until(&self, deadline: Option<Instant>) -> bool {
        let mut locked = self.locked.lock();
        wait_while(&self.available, &mut locked, deadline, |locked| {
            if *locked {
                false
            } else {
                *locked = true;
                true
            }
        })
    }
}

impl Default for BlockingLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Acquire for BlockingLock {
    fn acquire(&self) -> SyncResult<()> {
        self.acquire_until(None);
        Ok(())
    }

    fn try_acquire(&self) -> SyncResult<bool> {
        let mut locked = self.locked.lock();
        if *locked {
            return Ok(false);
        }
        *locked = true;
        Ok(true)
    }

    fn acquire_timeout(&self, timeout: Duration) -> SyncResult<bool> {
        Ok(self.acquire_until(deadline_after(Some(timeout))))
    }

    fn acquire_async(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move { self.acquire() })
    }

    fn release(&self) -> SyncResult<()> {
        let mut locked = self.locked.lock();
        if !*locked {
            return Err(SyncError::NotHeld);
        }
        *locked = false;
        self.available.notify_one();
        Ok(())
    }
}

#[derive(Default)]
struct Ownership {
    owner: Option<ThreadId>,
    depth: usize,
}

pub struct BlockingRLock {
    state: Mutex<Ownership>,
    available: Condvar,
}

impl BlockingRLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Ownership::default()),
            available: Condvar::new(),
        }
    }

    fn acquire_until(&self, deadline: Option<Instant>) -> bool {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        wait_while(&self.available, &mut state, deadline, |state| {
            match state.owner {
                Some(owner) if owner != me => false,
                _ => {
                    state.owner = Some(me);
                    state.depth += 1;
                    true
                }
            }
        })
    }
}

impl Default for BlockingRLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Acquire for BlockingRLock {
    fn acquire(&self) -> SyncResult<()> {
        self.acquire_until(None);
        Ok(())
    }

    fn try_acquire(&self) -> SyncResult<bool> {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        let owner = state.owner;
        match owner {
            Some(owner) if owner != me => Ok(false),
            _ => {
                state.owner = Some(me);
                state.depth += 1;
                Ok(true)
            }
        }
    }

    fn acquire_timeout(&self, timeout: Duration) -> SyncResult<bool> {
        Ok(self.acquire_until(deadline_after(Some(timeout))))
    }

    fn acquire_async(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move { self.acquire() })
    }

    fn release(&self) -> SyncResult<()> {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        let owner = state.owner;
        match owner {
            None => Err(SyncError::NotHeld),
            Some(owner) if owner != me => Err(SyncError::NotOwner),
            Some(_) => {
                state.depth -= 1;
                if state.depth == 0 {
                    state.owner = None;
                    self.available.notify_one();
                }
                Ok(())
            }
        }
    }
}

/// Counting semaphore; `bound` makes it a bounded semaphore
pub struct BlockingSemaphore {
    permits: Mutex<usize>,
    available: Condvar,
    bound: Option<usize>,
}

impl BlockingSemaphore {
    pub fn new(value: usize) -> Self {
        Self {
            permits: Mutex::new(value),
            available: Condvar::new(),
            bound: None,
        }
    }

    pub fn bounded(value: usize) -> Self {
        Self {
            bound: Some(value),
            ..Self::new(value)
        }
    }

    fn acquire_until(&self, deadline: Option<Instant>) -> bool {
        let mut permits = self.permits.lock();
        wait_while(&self.available, &mut permits, deadline, |permits| {
            if *permits == 0 {
                false
            } else {
                *permits -= 1;
                true
            }
        })
    }
}

impl Acquire for BlockingSemaphore {
    fn acquire(&self) -> SyncResult<()> {
        self.acquire_until(None);
        Ok(())
    }

    fn try_acquire(&self) -> SyncResult<bool> {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return Ok(false);
        }
        *permits -= 1;
        Ok(true)
    }

    fn acquire_timeout(&self, timeout: Duration) -> SyncResult<bool> {
        Ok(self.acquire_until(deadline_after(Some(timeout))))
    }

    fn acquire_async(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move { self.acquire() })
    }

    fn release(&self) -> SyncResult<()> {
        let mut permits = self.permits.lock();
        if let Some(bound) = self.bound {
            if *permits >= bound {
                return Err(SyncError::BoundExceeded { bound });
            }
        }
        *permits += 1;
        self.available.notify_one();
        Ok(())
    }
}

pub struct BlockingEvent {
    flag: Mutex<bool>,
    changed: Condvar,
}

impl BlockingEvent {
    pub fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            changed: Condvar::new(),
        }
    }
}

impl Default for BlockingEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal for BlockingEvent {
    fn set(&self) {
        *self.flag.lock() = true;
        self.changed.notify_all();
    }

    fn clear(&self) {
        *self.flag.lock() = false;
    }

    fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    fn wait(&self, timeout: Option<Duration>) -> SyncResult<bool> {
        let mut flag = self.flag.lock();
        Ok(wait_while(
            &self.changed,
            &mut flag,
            deadline_after(timeout),
            |flag| *flag,
        ))
    }

    fn wait_async(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move { self.wait(None).map(|_| ()) })
    }
}

pub struct BlockingCondition {
    lock: Arc<dyn Acquire>,
    tickets: Mutex<Tickets>,
    notified: Condvar,
}

impl BlockingCondition {
    pub fn new(lock: Arc<dyn Acquire>) -> Self {
        Self {
            lock,
            tickets: Mutex::new(Tickets::default()),
            notified: Condvar::new(),
        }
    }
}

impl Notifier for BlockingCondition {
    fn wait(&self, timeout: Option<Duration>) -> SyncResult<bool> {
        let ticket = self.tickets.lock().enqueue();
        if let Err(e) = self.lock.release() {
            self.tickets.lock().withdraw(ticket);
            return Err(e);
        }

        let woken = {
            let mut tickets = self.tickets.lock();
            let woken = wait_while(
                &self.notified,
                &mut tickets,
                deadline_after(timeout),
                |tickets| tickets.take(ticket),
            );
            woken || tickets.withdraw(ticket)
        };

        self.lock.acquire()?;
        Ok(woken)
    }

    fn wait_async(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move { self.wait(None).map(|_| ()) })
    }

    fn notify(&self, n: usize) -> SyncResult<usize> {
        let woken = self.tickets.lock().notify(n);
        if woken > 0 {
            self.notified.notify_all();
        }
        Ok(woken)
    }

    fn notify_all(&self) -> SyncResult<usize> {
        let woken = self.tickets.lock().notify_all();
        if woken > 0 {
            self.notified.notify_all();
        }
        Ok(woken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_lock_release_unheld() {
        let lock = BlockingLock::new();
        assert_eq!(lock.release(), Err(SyncError::NotHeld));
        lock.acquire().unwrap();
        assert!(!lock.try_acquire().unwrap());
        lock.release().unwrap();
        assert!(lock.try_acquire().unwrap());
    }

    #[test]
    fn test_lock_timeout() {
        let lock = BlockingLock::new();
        lock.acquire().unwrap();
        let start = Instant::now();
        assert!(!lock.acquire_timeout(Duration::from_millis(30)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_rlock_reentrant_and_owned() {
        let lock = Arc::new(BlockingRLock::new());
        lock.acquire().unwrap();
        lock.acquire().unwrap();

        let other = Arc::clone(&lock);
        let result = thread::spawn(move || (other.try_acquire(), other.release()))
            .join()
            .unwrap();
        assert_eq!(result, (Ok(false), Err(SyncError::NotOwner)));

        lock.release().unwrap();
        lock.release().unwrap();
        assert_eq!(lock.release(), Err(SyncError::NotHeld));
    }

    #[test]
    fn test_bounded_semaphore_over_release() {
        let sem = BlockingSemaphore::bounded(2);
        assert_eq!(sem.release(), Err(SyncError::BoundExceeded { bound: 2 }));
        sem.acquire().unwrap();
        sem.release().unwrap();

        let unbounded = BlockingSemaphore::new(1);
        unbounded.release().unwrap();
        assert!(unbounded.try_acquire().unwrap());
        assert!(unbounded.try_acquire().unwrap());
        assert!(!unbounded.try_acquire().unwrap());
    }

    #[test]
    fn test_semaphore_limits_concurrency() {
        let sem = Arc::new(BlockingSemaphore::new(2));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let (sem, inside, peak) = (sem.clone(), inside.clone(), peak.clone());
                thread::spawn(move || {
                    sem.acquire().unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    sem.release().unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_event_wait() {
        let event = Arc::new(BlockingEvent::new());
        assert!(!event.wait(Some(Duration::from_millis(10))).unwrap());

        let setter = Arc::clone(&event);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        assert!(event.wait(Some(Duration::from_secs(5))).unwrap());
        handle.join().unwrap();

        event.clear();
        assert!(!event.is_set());
    }

    #[test]
    fn test_condition_notify_one_waiter() {
        let lock: Arc<dyn Acquire> = Arc::new(BlockingLock::new());
        let cond = Arc::new(BlockingCondition::new(Arc::clone(&lock)));
        let ready = Arc::new(AtomicUsize::new(0));

        let (l, c, r) = (Arc::clone(&lock), Arc::clone(&cond), Arc::clone(&ready));
        let waiter = thread::spawn(move || {
            l.acquire().unwrap();
            while r.load(Ordering::SeqCst) == 0 {
                c.wait(Some(Duration::from_secs(5))).unwrap();
            }
            l.release().unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        lock.acquire().unwrap();
        ready.store(1, Ordering::SeqCst);
        cond.notify(1).unwrap();
        lock.release().unwrap();

        waiter.join().unwrap();
    }

    #[test]
    fn test_condition_wait_times_out_and_reacquires() {
        let lock: Arc<dyn Acquire> = Arc::new(BlockingLock::new());
        let cond = BlockingCondition::new(Arc::clone(&lock));
        lock.acquire().unwrap();
        assert!(!cond.wait(Some(Duration::from_millis(10))).unwrap());
        // Lock is held again after the wait
        assert!(!lock.try_acquire().unwrap());
        lock.release().unwrap();
        assert_eq!(cond.notify(1).unwrap(), 0);
    }

    #[test]
    fn test_condition_wait_without_lock() {
        let lock: Arc<dyn Acquire> = Arc::new(BlockingLock::new());
        let cond = BlockingCondition::new(lock);
        assert_eq!(cond.wait(None), Err(SyncError::NotHeld));
    }
}
