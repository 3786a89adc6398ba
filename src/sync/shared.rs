/*!
 * Process Family Primitives
 *
 * Words in an anonymous shared mapping, polled with adaptive backoff. A
 * primitive created before `fork()` is the same primitive in every child.
 *
 * The condition follows the sleeping/woken/wait-semaphore protocol so a
 * waiter that times out never swallows a later notification.
 */

use super::{Acquire, Notifier, Signal, SyncError, SyncResult};
use crate::core::backoff::spin_until;
use crate::ipc::shm::{SharedCell, ShmResult, ShmSafe};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_THREAD_TOKEN: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_TOKEN: u32 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Owner token unique across processes: pid in the high half, thread in the low
fn owner_token() -> u64 {
    let pid = std::process::id() as u64;
    let thread = THREAD_TOKEN.with(|token| *token) as u64;
    (pid << 32) | thread
}

/// Decrement `word` if positive
fn try_take(word: &AtomicI64) -> bool {
    let mut current = word.load(Ordering::Acquire);
    while current > 0 {
        match word.compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
    false
}

pub struct SharedLock {
    word: SharedCell<AtomicU32>,
}

impl SharedLock {
    pub fn new() -> ShmResult<Self> {
        Ok(Self {
            word: SharedCell::new()?,
        })
    }

    fn try_lock(&self) -> bool {
        self.word
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl Acquire for SharedLock {
    fn acquire(&self) -> SyncResult<()> {
        spin_until(None, || self.try_lock());
        Ok(())
    }

    fn try_acquire(&self) -> SyncResult<bool> {
        Ok(self.try_lock())
    }

    fn acquire_timeout(&self, timeout: Duration) -> SyncResult<bool> {
        Ok(spin_until(Some(timeout), || self.try_lock()))
    }

    fn acquire_async(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move { self.acquire() })
    }

    fn release(&self) -> SyncResult<()> {
        self.word
            .compare_exchange(1, 0, Ordering::Release, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| SyncError::NotHeld)
    }
}

#[repr(C)]
struct RLockWords {
    owner: AtomicU64,
    depth: AtomicU64,
}

unsafe impl ShmSafe for RLockWords {}

pub struct SharedRLock {
    words: SharedCell<RLockWords>,
}

impl SharedRLock {
    pub fn new() -> ShmResult<Self> {
        Ok(Self {
            words: SharedCell::new()?,
        })
    }

    fn try_lock(&self) -> bool {
        let me = owner_token();
        if self.words.owner.load(Ordering::Acquire) == me {
            self.words.depth.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if self
            .words
            .owner
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.words.depth.store(1, Ordering::Relaxed);
            return true;
        }
        false
    }
}

impl Acquire for SharedRLock {
    fn acquire(&self) -> SyncResult<()> {
        spin_until(None, || self.try_lock());
        Ok(())
    }

    fn try_acquire(&self) -> SyncResult<bool> {
        Ok(self.try_lock())
    }

    fn acquire_timeout(&self, timeout: Duration) -> SyncResult<bool> {
        Ok(spin_until(Some(timeout), || self.try_lock()))
    }

    fn acquire_async(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move { self.acquire() })
    }

    fn release(&self) -> SyncResult<()> {
        match self.words.owner.load(Ordering::Acquire) {
            0 => Err(SyncError::NotHeld),
            owner if owner != owner_token() => Err(SyncError::NotOwner),
            _ => {
                if self.words.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
                    self.words.owner.store(0, Ordering::Release);
                }
                Ok(())
            }
        }
    }
}

/// Counting semaphore; `bound` makes it a bounded semaphore
pub struct SharedSemaphore {
    permits: SharedCell<AtomicI64>,
    bound: Option<usize>,
}

impl SharedSemaphore {
    pub fn new(value: usize) -> ShmResult<Self> {
        let permits = SharedCell::<AtomicI64>::new()?;
        permits.store(value as i64, Ordering::Release);
        Ok(Self {
            permits,
            bound: None,
        })
    }

    pub fn bounded(value: usize) -> ShmResult<Self> {
        Ok(Self {
            bound: Some(value),
            ..Self::new(value)?
        })
    }
}

impl Acquire for SharedSemaphore {
    fn acquire(&self) -> SyncResult<()> {
        spin_until(None, || try_take(&self.permits));
        Ok(())
    }

    fn try_acquire(&self) -> SyncResult<bool> {
        Ok(try_take(&self.permits))
    }

    fn acquire_timeout(&self, timeout: Duration) -> SyncResult<bool> {
        Ok(spin_until(Some(timeout), || try_take(&self.permits)))
    }

    fn acquire_async(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move { self.acquire() })
    }

    fn release(&self) -> SyncResult<()> {
        let Some(bound) = self.bound else {
            self.permits.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        };
        let mut current = self.permits.load(Ordering::Acquire);
        loop {
            if current >= bound as i64 {
                return Err(SyncError::BoundExceeded { bound });
            }
            match self.permits.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }
}

pub struct SharedEvent {
    flag: SharedCell<AtomicU32>,
}

impl SharedEvent {
    pub fn new() -> ShmResult<Self> {
        Ok(Self {
            flag: SharedCell::new()?,
        })
    }
}

impl Signal for SharedEvent {
    fn set(&self) {
        self.flag.store(1, Ordering::Release);
    }

    fn clear(&self) {
        self.flag.store(0, Ordering::Release);
    }

    fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire) == 1
    }

    fn wait(&self, timeout: Option<Duration>) -> SyncResult<bool> {
        Ok(spin_until(timeout, || self.is_set()))
    }

    fn wait_async(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move { self.wait(None).map(|_| ()) })
    }
}

#[repr(C)]
struct ConditionWords {
    sleeping: AtomicI64,
    woken: AtomicI64,
    wakeups: AtomicI64,
}

unsafe impl ShmSafe for ConditionWords {}

pub struct SharedCondition {
    lock: Arc<dyn Acquire>,
    words: SharedCell<ConditionWords>,
}

impl SharedCondition {
    pub fn new(lock: Arc<dyn Acquire>) -> ShmResult<Self> {
        Ok(Self {
            lock,
            words: SharedCell::new()?,
        })
    }
}

impl Notifier for SharedCondition {
    fn wait(&self, timeout: Option<Duration>) -> SyncResult<bool> {
        self.words.sleeping.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.lock.release() {
            self.words.sleeping.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }

        let woken = spin_until(timeout, || try_take(&self.words.wakeups));

        self.words.woken.fetch_add(1, Ordering::AcqRel);
        self.lock.acquire()?;
        Ok(woken)
    }

    fn wait_async(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move { self.wait(None).map(|_| ()) })
    }

    fn notify(&self, n: usize) -> SyncResult<usize> {
        let words = &*self.words;

        // Retire waiters that already left (timed out) since the last notify
        while try_take(&words.woken) {
            try_take(&words.sleeping);
        }

        let mut sleepers = 0;
        while sleepers < n && try_take(&words.sleeping) {
            words.wakeups.fetch_add(1, Ordering::AcqRel);
            sleepers += 1;
        }

        if sleepers > 0 {
            for _ in 0..sleepers {
                spin_until(None, || try_take(&words.woken));
            }
            // Wakeups left over by waiters that timed out concurrently
            while try_take(&words.wakeups) {}
        }
        Ok(sleepers)
    }

    fn notify_all(&self) -> SyncResult<usize> {
        self.notify(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_lock_release_unheld() {
        let lock = SharedLock::new().unwrap();
        assert_eq!(lock.release(), Err(SyncError::NotHeld));
        lock.acquire().unwrap();
        assert!(!lock.try_acquire().unwrap());
        lock.release().unwrap();
    }

    #[test]
    fn test_lock_timeout() {
        let lock = SharedLock::new().unwrap();
        lock.acquire().unwrap();
        let start = Instant::now();
        assert!(!lock.acquire_timeout(Duration::from_millis(20)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_rlock_owner_checks() {
        let lock = Arc::new(SharedRLock::new().unwrap());
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
    fn test_bounded_semaphore() {
        let sem = SharedSemaphore::bounded(1).unwrap();
        assert_eq!(sem.release(), Err(SyncError::BoundExceeded { bound: 1 }));
        assert!(sem.try_acquire().unwrap());
        assert!(!sem.try_acquire().unwrap());
        sem.release().unwrap();
    }

    #[test]
    fn test_event_across_threads() {
        let event = Arc::new(SharedEvent::new().unwrap());
        let setter = Arc::clone(&event);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            setter.set();
        });
        assert!(event.wait(Some(Duration::from_secs(5))).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_condition_notify() {
        let lock: Arc<dyn Acquire> = Arc::new(SharedLock::new().unwrap());
        let cond = Arc::new(SharedCondition::new(Arc::clone(&lock)).unwrap());
        let flag = Arc::new(SharedEvent::new().unwrap());

        let (l, c, f) = (Arc::clone(&lock), Arc::clone(&cond), Arc::clone(&flag));
        let waiter = thread::spawn(move || {
            l.acquire().unwrap();
            while !f.is_set() {
                c.wait(Some(Duration::from_millis(50))).unwrap();
            }
            l.release().unwrap();
        });

        thread::sleep(Duration::from_millis(10));
        lock.acquire().unwrap();
        flag.set();
        cond.notify_all().unwrap();
        lock.release().unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_condition_timeout_then_notify_finds_nobody() {
        let lock: Arc<dyn Acquire> = Arc::new(SharedLock::new().unwrap());
        let cond = SharedCondition::new(Arc::clone(&lock)).unwrap();
        lock.acquire().unwrap();
        assert!(!cond.wait(Some(Duration::from_millis(5))).unwrap());
        assert_eq!(cond.notify(1).unwrap(), 0);
        lock.release().unwrap();
    }
}
