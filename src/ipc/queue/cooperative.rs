/*!
 * Cooperative Queue
 *
 * Green-thread and event-loop queue. Waiters park on a tokio `Notify`;
 * blocking calls return `WouldBlockLoop` instead of stalling the loop thread.
 */

use super::store::OrderedStore;
use super::{QueueBackend, QueueError, QueueResult, QueueType};
use crate::sync::cooperative::check_loop;
use crate::sync::LoopId;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::pin::pin;
use std::time::Duration;
use tokio::sync::Notify;

struct State<A> {
    store: OrderedStore<A>,
    unfinished: usize,
    closed: bool,
}

pub struct CoopQueue<A> {
    state: Mutex<State<A>>,
    changed: Notify,
    capacity: Option<usize>,
    event_loop: Option<LoopId>,
}

/// Outcome of one push: finished, or the item handed back for a retry
enum Attempt<A> {
    Done(QueueResult<()>),
    Pending(A),
}

impl<A> CoopQueue<A> {
    pub fn new(queue_type: QueueType, capacity: Option<usize>, event_loop: Option<LoopId>) -> Self {
        Self {
            state: Mutex::new(State {
                store: OrderedStore::new(queue_type.into()),
                unfinished: 0,
                closed: false,
            }),
            changed: Notify::new(),
            capacity,
            event_loop,
        }
    }

    /// Push if there is room; hands the item back otherwise
    fn try_push(&self, item: A, priority: i64) -> Attempt<A> {
        let mut state = self.state.lock();
        if state.closed {
            return Attempt::Done(Err(QueueError::Closed));
        }
        if self.capacity.is_some_and(|cap| state.store.len() >= cap) {
            return Attempt::Pending(item);
        }
        state.store.push(item, priority);
        state.unfinished += 1;
        drop(state);
        self.changed.notify_waiters();
        Attempt::Done(Ok(()))
    }

    fn try_pop(&self) -> QueueResult<Option<A>> {
        let mut state = self.state.lock();
        let popped = state.store.pop();
        match popped {
            Some(item) => {
                drop(state);
                self.changed.notify_waiters();
                Ok(Some(item))
            }
            None if state.closed => Err(QueueError::Closed),
            None => Ok(None),
        }
    }
}

impl<A: Send + 'static> QueueBackend<A> for CoopQueue<A> {
    fn put(&self, item: A, priority: i64) -> QueueResult<()> {
        check_loop(self.event_loop)?;
        match self.try_push(item, priority) {
            Attempt::Done(result) => result,
            Attempt::Pending(_) => Err(QueueError::WouldBlockLoop),
        }
    }

    fn try_put(&self, item: A, priority: i64) -> QueueResult<()> {
        check_loop(self.event_loop)?;
        match self.try_push(item, priority) {
            Attempt::Done(result) => result,
            Attempt::Pending(_) => Err(QueueError::Full {
                capacity: self.capacity.unwrap_or_default(),
            }),
        }
    }

    fn put_async(&self, item: A, priority: i64) -> BoxFuture<'_, QueueResult<()>> {
        Box::pin(async move {
            check_loop(self.event_loop)?;
            let mut item = item;
            loop {
                let mut notified = pin!(self.changed.notified());
                notified.as_mut().enable();
                match self.try_push(item, priority) {
                    Attempt::Done(result) => return result,
                    Attempt::Pending(back) => item = back,
                }
                notified.await;
            }
        })
    }

    fn get(&self) -> QueueResult<A> {
        self.try_get()?.ok_or(QueueError::WouldBlockLoop)
    }

    fn try_get(&self) -> QueueResult<Option<A>> {
        check_loop(self.event_loop)?;
        self.try_pop()
    }

    fn get_timeout(&self, timeout: Duration) -> QueueResult<Option<A>> {
        match self.try_get()? {
            Some(item) => Ok(Some(item)),
            None if timeout.is_zero() => Ok(None),
            None => Err(QueueError::WouldBlockLoop),
        }
    }

    fn get_async(&self) -> BoxFuture<'_, QueueResult<A>> {
        Box::pin(async move {
            check_loop(self.event_loop)?;
            loop {
                let mut notified = pin!(self.changed.notified());
                notified.as_mut().enable();
                if let Some(item) = self.try_pop()? {
                    return Ok(item);
                }
                notified.await;
            }
        })
    }

    fn len(&self) -> usize {
        self.state.lock().store.len()
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_waiters();
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
            drop(state);
            self.changed.notify_waiters();
        }
        Ok(())
    }

    fn join(&self, _timeout: Option<Duration>) -> QueueResult<bool> {
        check_loop(self.event_loop)?;
        if self.state.lock().unfinished == 0 {
            Ok(true)
        } else {
            Err(QueueError::WouldBlockLoop)
        }
    }

    fn join_async(&self) -> BoxFuture<'_, QueueResult<()>> {
        Box::pin(async move {
            check_loop(self.event_loop)?;
            loop {
                let mut notified = pin!(self.changed.notified());
                notified.as_mut().enable();
                if self.state.lock().unfinished == 0 {
                    return Ok(());
                }
                notified.await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{EventLoop, SyncError};
    use std::sync::Arc;

    #[test]
    fn test_blocking_calls_never_park() {
        let queue = CoopQueue::<u32>::new(QueueType::Queue, Some(1), None);
        assert_eq!(queue.get(), Err(QueueError::WouldBlockLoop));
        queue.put(1u32, 0).unwrap();
        assert_eq!(queue.put(2, 0), Err(QueueError::WouldBlockLoop));
        assert_eq!(queue.try_put(2, 0), Err(QueueError::Full { capacity: 1 }));
        assert_eq!(queue.get(), Ok(1));
    }

    #[test]
    fn test_async_producer_consumer() {
        let event_loop = EventLoop::new().unwrap();
        let queue = Arc::new(CoopQueue::new(
            QueueType::Queue,
            Some(2),
            Some(event_loop.id()),
        ));

        let received = event_loop.block_on(async {
            let producer = {
                let queue = Arc::clone(&queue);
                tokio::task::spawn(async move {
                    for i in 0..10u32 {
                        queue.put_async(i, 0).await.unwrap();
                    }
                    queue.close();
                })
            };
            let mut received = Vec::new();
            while let Ok(item) = queue.get_async().await {
                received.push(item);
            }
            producer.await.unwrap();
            received
        });
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_put_async_waits_for_room() {
        let event_loop = EventLoop::new().unwrap();
        let queue = Arc::new(CoopQueue::new(
            QueueType::Queue,
            Some(1),
            Some(event_loop.id()),
        ));

        let drained = event_loop.block_on(async {
            queue.try_put(1u32, 0).unwrap();
            assert_eq!(queue.try_put(2, 0), Err(QueueError::Full { capacity: 1 }));

            let producer = {
                let queue = Arc::clone(&queue);
                tokio::task::spawn(async move { queue.put_async(2, 0).await })
            };
            tokio::task::yield_now().await;
            assert_eq!(queue.len(), 1);

            let first = queue.get_async().await.unwrap();
            producer.await.unwrap().unwrap();
            let second = queue.get_async().await.unwrap();
            (first, second)
        });
        assert_eq!(drained, (1, 2));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_other_loop_rejected() {
        let home = EventLoop::new().unwrap();
        let other = EventLoop::new().unwrap();
        let queue = CoopQueue::<u32>::new(QueueType::Queue, None, Some(home.id()));
        let err = other.block_on(async { queue.get_async().await.unwrap_err() });
        assert!(matches!(
            err,
            QueueError::Sync(SyncError::IncompatibleLoop { .. })
        ));
    }

    #[test]
    fn test_join_async() {
        let event_loop = EventLoop::new().unwrap();
        let queue = Arc::new(CoopQueue::new(
            QueueType::JoinableQueue,
            None,
            Some(event_loop.id()),
        ));
        queue.put(1u32, 0).unwrap();
        assert_eq!(queue.join(None), Err(QueueError::WouldBlockLoop));

        event_loop.block_on(async {
            let worker = {
                let queue = Arc::clone(&queue);
                tokio::task::spawn(async move {
                    queue.get_async().await.unwrap();
                    queue.task_done().unwrap();
                })
            };
            queue.join_async().await.unwrap();
            worker.await.unwrap();
        });
    }
}
