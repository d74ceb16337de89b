//! Bounded blocking FIFO shared between threads.
//!
//! [`RingBuffer`] is the queue behind the channel's send and receive paths,
//! the consumer's SYN backlog, and each peer's inbound queue.
//! Producers never block: when the buffer is full the [`Overflow`] policy
//! decides whether the newest or the oldest item is dropped.  Consumers
//! block on a condition variable, optionally with a deadline.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// What `produce` does when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Keep the queue, drop the new item.
    RejectNewest,
    /// Evict the oldest item to make room.
    DropOldest,
}

/// Outcome of a bounded wait.
#[derive(Debug, PartialEq, Eq)]
pub enum Consumed<T> {
    Item(T),
    TimedOut,
    /// The buffer was closed and is empty.
    Closed,
}

impl<T> Consumed<T> {
    pub fn item(self) -> Option<T> {
        match self {
            Consumed::Item(item) => Some(item),
            Consumed::TimedOut | Consumed::Closed => None,
        }
    }
}

struct Ring<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct RingBuffer<T> {
    ring: Mutex<Ring<T>>,
    ready: Condvar,
    capacity: usize,
    overflow: Overflow,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize, overflow: Overflow) -> Self {
        Self {
            ring: Mutex::new(Ring {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
            overflow,
        }
    }

    /// Append an item.  Returns the item that was dropped to respect the
    /// capacity, if any.  Items produced after `close` are returned as dropped.
    pub fn produce(&self, item: T) -> Option<T> {
        let mut ring = self.ring.lock();
        if ring.closed {
            return Some(item);
        }
        let dropped = if ring.items.len() < self.capacity {
            None
        } else {
            match self.overflow {
                Overflow::RejectNewest => return Some(item),
                Overflow::DropOldest => ring.items.pop_front(),
            }
        };
        ring.items.push_back(item);
        drop(ring);
        self.ready.notify_one();
        dropped
    }

    /// Wait until an item is available.  Returns `None` once closed and empty.
    pub fn consume(&self) -> Option<T> {
        let mut ring = self.ring.lock();
        loop {
            if let Some(item) = ring.items.pop_front() {
                return Some(item);
            }
            if ring.closed {
                return None;
            }
            self.ready.wait(&mut ring);
        }
    }

    /// Wait at most `timeout` for an item.
    pub fn try_consume(&self, timeout: Duration) -> Consumed<T> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock();
        loop {
            if let Some(item) = ring.items.pop_front() {
                return Consumed::Item(item);
            }
            if ring.closed {
                return Consumed::Closed;
            }
            if self.ready.wait_until(&mut ring, deadline).timed_out() {
                return match ring.items.pop_front() {
                    Some(item) => Consumed::Item(item),
                    None if ring.closed => Consumed::Closed,
                    None => Consumed::TimedOut,
                };
            }
        }
    }

    /// Pop without waiting.
    pub fn pop(&self) -> Option<T> {
        self.ring.lock().items.pop_front()
    }

    /// Remove and return the first item matching `predicate`, waiting at
    /// most `timeout` for one to arrive.
    pub fn take_matching(&self, timeout: Duration, mut predicate: impl FnMut(&T) -> bool) -> Consumed<T> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock();
        loop {
            if let Some(index) = ring.items.iter().position(&mut predicate) {
                if let Some(item) = ring.items.remove(index) {
                    return Consumed::Item(item);
                }
            }
            if ring.closed {
                return Consumed::Closed;
            }
            if self.ready.wait_until(&mut ring, deadline).timed_out() {
                return Consumed::TimedOut;
            }
        }
    }

    /// Stop accepting items and wake every waiter.  Queued items can still be
    /// consumed.
    pub fn close(&self) {
        self.ring.lock().closed = true;
        self.ready.notify_all();
    }

    /// Accept items again after [`RingBuffer::close`].
    pub fn reopen(&self) {
        self.ring.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.ring.lock().closed
    }

    pub fn len(&self) -> usize {
        self.ring.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every queued item.
    pub fn clear(&self) {
        self.ring.lock().items.clear();
    }
}
