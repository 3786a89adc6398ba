/*!
 * Shared-Memory Queue
 *
 * Fixed ring of length-prefixed bincode slots in one shared mapping, guarded
 * by a spin lock word in the header. Survives `fork()`, so the parent can fill
 * it before activation and every child pulls from the same ring. FIFO only.
 */

use super::{QueueBackend, QueueError, QueueResult};
use crate::core::backoff::spin_until;
use crate::core::limits::DEFAULT_SHARED_QUEUE_SLOTS;
use crate::core::types::Payload;
use crate::ipc::shm::{spin_lock, SharedCell, ShmResult, ShmSafe};
use futures::future::BoxFuture;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

#[repr(C)]
struct RingHeader {
    lock: AtomicU32,
    closed: AtomicU32,
    head: AtomicU64,
    tail: AtomicU64,
    unfinished: AtomicI64,
}

unsafe impl ShmSafe for RingHeader {}

const LEN_PREFIX: usize = size_of::<u64>();

pub struct SharedQueue<A> {
    ring: SharedCell<RingHeader>,
    slots: usize,
    slot_bytes: usize,
    _marker: PhantomData<fn() -> A>,
}

/// Retry `attempt` with backoff until it yields or `timeout` passes
fn poll<T>(timeout: Option<Duration>, mut attempt: impl FnMut() -> Option<T>) -> Option<T> {
    let mut outcome = None;
    spin_until(timeout, || {
        outcome = attempt();
        outcome.is_some()
    });
    outcome
}

impl<A> SharedQueue<A> {
    /// `capacity` slots of `slot_bytes` each; `None` takes the default ring size
    pub fn new(capacity: Option<usize>, slot_bytes: usize) -> ShmResult<Self> {
        let slots = capacity.unwrap_or(DEFAULT_SHARED_QUEUE_SLOTS).max(1);
        let ring = SharedCell::with_trailing(slots * Self::stride(slot_bytes))?;
        Ok(Self {
            ring,
            slots,
            slot_bytes,
            _marker: PhantomData,
        })
    }

    fn stride(slot_bytes: usize) -> usize {
        (LEN_PREFIX + slot_bytes).next_multiple_of(LEN_PREFIX)
    }

    fn slot_ptr(&self, index: u64) -> *mut u8 {
        let offset = (index as usize % self.slots) * Self::stride(self.slot_bytes);
        unsafe { self.ring.trailing_ptr().add(offset) }
    }

    fn try_write(&self, bytes: &[u8]) -> Option<QueueResult<()>> {
        let _guard = spin_lock(&self.ring.lock);
        if self.ring.closed.load(Ordering::Acquire) != 0 {
            return Some(Err(QueueError::Closed));
        }
        let head = self.ring.head.load(Ordering::Acquire);
        let tail = self.ring.tail.load(Ordering::Acquire);
        if (tail - head) as usize >= self.slots {
            return None;
        }

        let slot = self.slot_ptr(tail);
        unsafe {
            // Slots are 8-byte aligned: the header and stride are multiples of 8
            (slot as *mut u64).write(bytes.len() as u64);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), slot.add(LEN_PREFIX), bytes.len());
        }
        self.ring.tail.store(tail + 1, Ordering::Release);
        self.ring.unfinished.fetch_add(1, Ordering::AcqRel);
        Some(Ok(()))
    }

    fn try_read(&self) -> Option<QueueResult<Vec<u8>>> {
        let _guard = spin_lock(&self.ring.lock);
        let head = self.ring.head.load(Ordering::Acquire);
        let tail = self.ring.tail.load(Ordering::Acquire);
        if head == tail {
            if self.ring.closed.load(Ordering::Acquire) != 0 {
                return Some(Err(QueueError::Closed));
            }
            return None;
        }

        let slot = self.slot_ptr(head);
        let bytes = unsafe {
            let len = (slot as *const u64).read() as usize;
            std::slice::from_raw_parts(slot.add(LEN_PREFIX), len).to_vec()
        };
        self.ring.head.store(head + 1, Ordering::Release);
        Some(Ok(bytes))
    }

    fn decode(bytes: QueueResult<Vec<u8>>) -> QueueResult<A>
    where
        A: Payload,
    {
        Ok(bincode::deserialize(&bytes?)?)
    }

    fn encode(&self, item: &A) -> QueueResult<Vec<u8>>
    where
        A: Payload,
    {
        let bytes = bincode::serialize(item)?;
        if bytes.len() > self.slot_bytes {
            return Err(QueueError::ItemTooLarge {
                size: bytes.len(),
                slot: self.slot_bytes,
            });
        }
        Ok(bytes)
    }
}

impl<A: Payload> QueueBackend<A> for SharedQueue<A> {
    fn put(&self, item: A, _priority: i64) -> QueueResult<()> {
        let bytes = self.encode(&item)?;
        poll(None, || self.try_write(&bytes)).unwrap_or(Err(QueueError::Closed))
    }

    fn try_put(&self, item: A, _priority: i64) -> QueueResult<()> {
        let bytes = self.encode(&item)?;
        self.try_write(&bytes).unwrap_or(Err(QueueError::Full {
            capacity: self.slots,
        }))
    }

    fn put_async(&self, item: A, priority: i64) -> BoxFuture<'_, QueueResult<()>> {
        Box::pin(async move { self.put(item, priority) })
    }

    fn get(&self) -> QueueResult<A> {
        match poll(None, || self.try_read()) {
            Some(bytes) => Self::decode(bytes),
            None => Err(QueueError::Closed),
        }
    }

    fn try_get(&self) -> QueueResult<Option<A>> {
        self.try_read().map(Self::decode).transpose()
    }

    fn get_timeout(&self, timeout: Duration) -> QueueResult<Option<A>> {
        poll(Some(timeout), || self.try_read())
            .map(Self::decode)
            .transpose()
    }

    fn get_async(&self) -> BoxFuture<'_, QueueResult<A>> {
        Box::pin(async move { self.get() })
    }

    fn len(&self) -> usize {
        let _guard = spin_lock(&self.ring.lock);
        let head = self.ring.head.load(Ordering::Acquire);
        let tail = self.ring.tail.load(Ordering::Acquire);
        (tail - head) as usize
    }

    fn close(&self) {
        self.ring.closed.store(1, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.ring.closed.load(Ordering::Acquire) != 0
    }

    fn task_done(&self) -> QueueResult<()> {
        let mut current = self.ring.unfinished.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return Err(QueueError::TaskDoneOverflow);
            }
            match self.ring.unfinished.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn join(&self, timeout: Option<Duration>) -> QueueResult<bool> {
        Ok(spin_until(timeout, || {
            self.ring.unfinished.load(Ordering::Acquire) == 0
        }))
    }

    fn join_async(&self) -> BoxFuture<'_, QueueResult<()>> {
        Box::pin(async move { self.join(None).map(|_| ()) })
    }
}
