/*!
 * Thread Queue
 * Bounded/unbounded queue over a mutex and three condvars
 */

use super::store::OrderedStore;
use super::{QueueBackend, QueueError, QueueResult, QueueType};
use futures::future::BoxFuture;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct State<A> {
    store: OrderedStore<A>,
    unfinished: usize,
    closed: bool,
}

pub struct BlockingQueue<A> {
    state: Mutex<State<A>>,
    not_empty: Condvar,
    not_full: Condvar,
    all_done: Condvar,
    capacity: Option<usize>,
}

impl<A> BlockingQueue<A> {
    pub fn new(queue_type: QueueType, capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(State {
                store: OrderedStore::new(queue_type.into()),
                unfinished: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            all_done: Condvar::new(),
            capacity,
        }
    }

    fn is_full(&self, state: &State<A>) -> bool {
        self.capacity.is_some_and(|cap| state.store.len() >= cap)
    }

    fn push_locked(&self, state: &mut State<A>, item: A, priority: i64) {
        state.store.push(item, priority);
        state.unfinished += 1;
        self.not_empty.notify_one();
    }

    fn pop_until(&self, deadline: Option<Instant>) -> QueueResult<Option<A>> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.store.pop() {
                self.not_full.notify_one();
                return Ok(Some(item));
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            if !wait(&self.not_empty, &mut state, deadline) {
                return Ok(None);
            }
        }
    }
}

/// Wait on `cv`; `false` once the deadline has passed
fn wait<T>(cv: &Condvar, guard: &mut MutexGuard<'_, T>, deadline: Option<Instant>) -> bool {
    match deadline {
        Some(deadline) => !cv.wait_until(guard, deadline).timed_out(),
        None => {
            cv.wait(guard);
            true
        }
    }
}

impl<A: Send + 'static> QueueBackend<A> for BlockingQueue<A> {
    fn put(&self, item: A, priority: i64) -> QueueResult<()> {
        let mut state = self.state.lock();
        while !state.closed && self.is_full(&state) {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(QueueError::Closed);
        }
        self.push_locked(&mut state, item, priority);
        Ok(())
    }

    fn try_put(&self, item: A, priority: i64) -> QueueResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if let Some(capacity) = self.capacity.filter(|_| self.is_full(&state)) {
            return Err(QueueError::Full { capacity });
        }
        self.push_locked(&mut state, item, priority);
        Ok(())
    }

    fn put_async(&self, item: A, priority: i64) -> BoxFuture<'_, QueueResult<()>> {
        Box::pin(async move { self.put(item, priority) })
    }

    fn get(&self) -> QueueResult<A> {
        // Without a deadline the wait only ends with an item or Closed
        self.pop_until(None)?.ok_or(QueueError::Closed)
    }

    fn try_get(&self) -> QueueResult<Option<A>> {
        let mut state = self.state.lock();
        match state.store.pop() {
            Some(item) => {
                self.not_full.notify_one();
                Ok(Some(item))
            }
            None if state.closed => Err(QueueError::Closed),
            None => Ok(None),
        }
    }

    fn get_timeout(&self, timeout: Duration) -> QueueResult<Option<A>> {
        self.pop_until(Some(Instant::now() + timeout))
    }

    fn get_async(&self) -> BoxFuture<'_, QueueResult<A>> {
        Box::pin(async move { self.get() })
    }

    fn len(&self) -> usize {
        self.state.lock().store.len()
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn task_done(&self) -> QueueResult<()> {
        let mut state = self.state.lock();
        if state.unfinished == 0 {
            return Err(QueueError::TaskDoneOverflow);
        }
        state.unfinished -= 1;
        if state.unfinished == 0 {
            self.all_done.notify_all();
        }
        Ok(())
    }

    fn join(&self, timeout: Option<Duration>) -> QueueResult<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while state.unfinished > 0 {
            if !wait(&self.all_done, &mut state, deadline) {
                return Ok(state.unfinished == 0);
            }
        }
        Ok(true)
    }

    fn join_async(&self) -> BoxFuture<'_, QueueResult<()>> {
        Box::pin(async move { self.join(None).map(|_| ()) })
    }
}
