//! Trampoline scheduler
//!
//! A bounded ring buffer of ready continuations. Enqueuing while a drain is
//! in progress only appends, so resumptions batch up instead of recursing;
//! enqueuing from outside drains synchronously. Native stack depth therefore
//! stays bounded however long the computation runs.

use std::cell::{Cell, RefCell};

use tracing::debug;

/// A ready continuation
pub type Task = Box<dyn FnOnce()>;

/// Default ring buffer capacity
pub const DEFAULT_CAPACITY: usize = 1024;

/* ===================== Stats ===================== */

/// Counters describing scheduler activity since creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SchedulerStats {
    /// Tasks run to completion
    pub executed: u64,
    /// Drains forced by a full buffer
    pub forced_drains: u64,
    /// Largest number of queued tasks observed
    pub high_water: usize,
}

/* ===================== Ring Buffer ===================== */

struct Ring {
    slots: Vec<Option<Task>>,
    ix: usize,
    size: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            ix: 0,
            size: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.size == self.capacity()
    }

    fn push(&mut self, task: Task) {
        let slot = (self.ix + self.size) % self.capacity();
        self.slots[slot] = Some(task);
        self.size += 1;
    }

    fn pop(&mut self) -> Option<Task> {
        if self.size == 0 {
            return None;
        }
        let task = self.slots[self.ix].take();
        self.ix = (self.ix + 1) % self.capacity();
        self.size -= 1;
        task
    }
}

/* ===================== Scheduler ===================== */

pub struct Scheduler {
    ring: RefCell<Ring>,
    draining: Cell<bool>,
    stats: Cell<SchedulerStats>,
}

/// Clears the draining flag even if a task panics
struct DrainGuard<'a>(&'a Cell<bool>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Scheduler {
    /// Create a scheduler. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RefCell::new(Ring::new(capacity.max(1))),
            draining: Cell::new(false),
            stats: Cell::new(SchedulerStats::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.borrow().capacity()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.get()
    }

    /// Number of tasks waiting to run
    pub fn len(&self) -> usize {
        self.ring.borrow().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.get()
    }

    /// Queue a task.
    ///
    /// A full buffer is drained first to make room, keeping whatever
    /// draining state was in effect. Outside of a drain the queue is
    /// drained before returning.
    pub fn enqueue(&self, task: Task) {
        if self.ring.borrow().is_full() {
            let was_draining = self.draining.get();
            self.update_stats(|s| s.forced_drains += 1);
            debug!(capacity = self.capacity(), "scheduler full, forcing drain");
            self.drain();
            self.draining.set(was_draining);
        }

        let size = {
            let mut ring = self.ring.borrow_mut();
            ring.push(task);
            ring.size
        };
        self.update_stats(|s| s.high_water = s.high_water.max(size));

        if !self.draining.get() {
            self.drain();
        }
    }

    /// Run queued tasks in FIFO order until the queue is empty
    pub fn drain(&self) {
        self.draining.set(true);
        let _guard = DrainGuard(&self.draining);
        loop {
            // Bind first so the ring borrow ends before the task runs
            let next = self.ring.borrow_mut().pop();
            let Some(task) = next else {
                break;
            };
            task();
            self.update_stats(|s| s.executed += 1);
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut SchedulerStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
