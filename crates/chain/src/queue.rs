//! Bounded inter-stage queues.
//!
//! The queue is the single backpressure channel between adjacent stages.
//! Its three-state lifecycle (enabled / disabled / delayed-disable) is how
//! the chain expresses every shutdown mode: a hard cancel disables queues
//! outright, a graceful stop delayed-disables the head queue and lets data
//! drain.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Enabled,
    Disabled,
    DelayedDisable,
}

struct Inner<T> {
    items: VecDeque<T>,
    phase: Phase,
}

/// Fixed-capacity FIFO with producer/consumer wakeup.
///
/// `push` blocks while the queue is full and enabled; `pop` blocks while it
/// is empty and enabled. Disabling wakes every waiter so it can observe the
/// state change and return.
pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

/// Outcome of a deadline-bounded pop.
#[derive(Debug, PartialEq, Eq)]
pub enum PopResult<T> {
    Item(T),
    Timeout,
    Disabled,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedQueue {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                phase: Phase::Enabled,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an element. Returns `false` if the queue was, or became,
    /// non-enabled while waiting for room; the element is dropped in that
    /// case.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.phase == Phase::Enabled && inner.items.len() >= self.capacity {
            inner = self.not_full.wait(inner).unwrap();
        }
        if inner.phase != Phase::Enabled {
            return false;
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// Remove the oldest element. `None` once the queue is hard-disabled,
    /// or delayed-disabled and fully drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.phase {
                Phase::Disabled => return None,
                Phase::DelayedDisable => return self.take(inner),
                Phase::Enabled => {
                    if !inner.items.is_empty() {
                        return self.take(inner);
                    }
                    inner = self.not_empty.wait(inner).unwrap();
                }
            }
        }
    }

    /// Like [`pop`](Self::pop) but gives up at `deadline`. Drives the
    /// "upstream went silent" paths (fake-frame insertion and the like).
    pub fn pop_deadline(&self, deadline: Instant) -> PopResult<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.phase {
                Phase::Disabled => return PopResult::Disabled,
                Phase::DelayedDisable => {
                    return match self.take(inner) {
                        Some(item) => PopResult::Item(item),
                        None => PopResult::Disabled,
                    }
                }
                Phase::Enabled => {
                    if !inner.items.is_empty() {
                        // take() consumes the guard, so this cannot fall through
                        return match self.take(inner) {
                            Some(item) => PopResult::Item(item),
                            None => PopResult::Disabled,
                        };
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return PopResult::Timeout;
                    }
                    let (guard, timeout) = self
                        .not_empty
                        .wait_timeout(inner, deadline - now)
                        .unwrap();
                    inner = guard;
                    if timeout.timed_out() && inner.items.is_empty() && inner.phase == Phase::Enabled {
                        return PopResult::Timeout;
                    }
                }
            }
        }
    }

    fn take(&self, mut inner: std::sync::MutexGuard<'_, Inner<T>>) -> Option<T> {
        let item = inner.items.pop_front();
        if item.is_some() {
            drop(inner);
            self.not_full.notify_one();
        }
        item
    }

    /// Re-arm the queue for a fresh run. Leftover elements are discarded.
    pub fn enable(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.clear();
        inner.phase = Phase::Enabled;
        drop(inner);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Hard-disable: all pushes and pops fail from now on, queued elements
    /// are discarded, every waiter is woken.
    pub fn disable(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.phase = Phase::Disabled;
        inner.items.clear();
        drop(inner);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// No further pushes succeed, but consumers may drain what is queued
    /// before pops start returning `None`.
    pub fn delayed_disable(&self) {
        let mut inner = self.inner.lock().unwrap();
        // a hard disable must not be softened after the fact
        if inner.phase == Phase::Enabled {
            inner.phase = Phase::DelayedDisable;
        }
        drop(inner);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

/// Popping endpoint handed to a stage function.
pub struct InQ<T> {
    q: std::sync::Arc<BoundedQueue<T>>,
}

impl<T> InQ<T> {
    /// Endpoint over an existing queue. Chains build these internally;
    /// stages that run private worker pools (the fan-out writer) construct
    /// their own.
    pub fn new(q: std::sync::Arc<BoundedQueue<T>>) -> Self {
        InQ { q }
    }

    pub fn pop(&self) -> Option<T> {
        self.q.pop()
    }

    pub fn pop_deadline(&self, deadline: Instant) -> PopResult<T> {
        self.q.pop_deadline(deadline)
    }
}

/// Pushing endpoint handed to a stage function.
pub struct OutQ<T> {
    q: std::sync::Arc<BoundedQueue<T>>,
}

impl<T> OutQ<T> {
    /// See [`InQ::new`].
    pub fn new(q: std::sync::Arc<BoundedQueue<T>>) -> Self {
        OutQ { q }
    }

    pub fn push(&self, item: T) -> bool {
        self.q.push(item)
    }
}
