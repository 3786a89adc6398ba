/*!
 * Ordered Store
 * One heap serves FIFO, LIFO and priority ordering through its sort key
 */

use super::QueueType;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum QueueOrder {
    Fifo,
    Lifo,
    Priority,
}

impl From<QueueType> for QueueOrder {
    fn from(queue_type: QueueType) -> Self {
        match queue_type {
            QueueType::Queue | QueueType::SimpleQueue | QueueType::JoinableQueue => {
                QueueOrder::Fifo
            }
            QueueType::LifoQueue => QueueOrder::Lifo,
            QueueType::PriorityQueue => QueueOrder::Priority,
        }
    }
}

struct Entry<A> {
    key: (i64, i64),
    item: A,
}

impl<A> PartialEq for Entry<A> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<A> Eq for Entry<A> {}

impl<A> PartialOrd for Entry<A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<A> Ord for Entry<A> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Min-heap keyed by (priority, sequence); LIFO negates the sequence
pub(super) struct OrderedStore<A> {
    heap: BinaryHeap<Reverse<Entry<A>>>,
    order: QueueOrder,
    seq: i64,
}

impl<A> OrderedStore<A> {
    pub fn new(order: QueueOrder) -> Self {
        Self {
            heap: BinaryHeap::new(),
            order,
            seq: 0,
        }
    }

    pub fn push(&mut self, item: A, priority: i64) {
        let seq = self.seq;
        self.seq += 1;
        let key = match self.order {
            QueueOrder::Fifo => (0, seq),
            QueueOrder::Lifo => (0, -seq),
            QueueOrder::Priority => (priority, seq),
        };
        self.heap.push(Reverse(Entry { key, item }));
    }

    pub fn pop(&mut self) -> Option<A> {
        self.heap.pop().map(|Reverse(entry)| entry.item)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
