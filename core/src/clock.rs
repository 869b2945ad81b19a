//! Virtual time
//!
//! [`VirtualClock`] is a deterministic timer source for driving workflows
//! without a host event loop. Time only moves when [`advance`] is called,
//! which fires due timers in deadline order (ties in scheduling order).
//!
//! [`advance`]: VirtualClock::advance

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::Error;
use crate::workflow::{Canceler, Workflow};

/// Identifies a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerId {
    deadline: u64,
    seq: u64,
}

#[derive(Default)]
struct ClockState {
    now: u64,
    seq: u64,
    timers: BTreeMap<TimerId, Box<dyn FnOnce()>>,
}

#[derive(Clone, Default)]
pub struct VirtualClock {
    state: Rc<RefCell<ClockState>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Milliseconds elapsed since creation
    pub fn now(&self) -> u64 {
        self.state.borrow().now
    }

    /// Timers waiting to fire
    pub fn pending(&self) -> usize {
        self.state.borrow().timers.len()
    }

    /// Run `f` once `after` milliseconds have elapsed
    pub fn schedule(&self, after: u64, f: impl FnOnce() + 'static) -> TimerId {
        let mut state = self.state.borrow_mut();
        let id = TimerId {
            deadline: state.now + after,
            seq: state.seq,
        };
        state.seq += 1;
        state.timers.insert(id, Box::new(f));
        id
    }

    /// Drop a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.state.borrow_mut().timers.remove(&id).is_some()
    }

    /// Move time forward by `ms`, firing every timer that comes due.
    /// Timers scheduled by fired callbacks fire too if they fall in range.
    /// Returns the number of timers fired.
    pub fn advance(&self, ms: u64) -> usize {
        let target = self.now() + ms;
        let mut fired = 0;
        loop {
            let due = {
                let mut state = self.state.borrow_mut();
                let next = state.timers.first_key_value().map(|(id, _)| id.deadline);
                match next {
                    Some(deadline) if deadline <= target => {
                        state.now = deadline;
                        state.timers.pop_first().map(|(_, f)| f)
                    }
                    _ => None,
                }
            };
            let Some(f) = due else {
                break;
            };
            f();
            fired += 1;
        }
        let mut state = self.state.borrow_mut();
        state.now = state.now.max(target);
        fired
    }

    fn until_next(&self) -> Option<u64> {
        let state = self.state.borrow();
        state
            .timers
            .first_key_value()
            .map(|(id, _)| id.deadline.saturating_sub(state.now))
    }

    /// Advance to the earliest pending deadline. Returns false when idle.
    pub fn advance_to_next(&self) -> bool {
        match self.until_next() {
            Some(ms) => {
                self.advance(ms);
                true
            }
            None => false,
        }
    }

    /// Advance until no timers remain. Returns the number fired.
    pub fn run_until_idle(&self) -> usize {
        let mut fired = 0;
        while let Some(ms) = self.until_next() {
            fired += self.advance(ms);
        }
        fired
    }

    /* ---------- Workflows ---------- */

    /// Resume after `ms` milliseconds. Killing the waiting fiber removes
    /// the timer.
    pub fn delay(&self, ms: u64) -> Workflow<()> {
        let clock = self.clone();
        Workflow::async_effect(move |resolver| {
            let id = clock.schedule(ms, move || resolver.succeed(()));
            let clock = clock.clone();
            Ok(Canceler::sync(move || {
                clock.cancel(id);
            }))
        })
    }

    /// Produce `value` after `ms` milliseconds
    pub fn after<T: Clone + 'static>(&self, ms: u64, value: T) -> Workflow<T> {
        self.delay(ms).map(move |_| value.clone())
    }

    /// Fail with `error` after `ms` milliseconds
    pub fn fail_after<T: Clone + 'static>(&self, ms: u64, error: Error) -> Workflow<T> {
        self.delay(ms)
            .and_then(move |_| Workflow::throw(error.clone()))
    }
}

impl std::fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualClock")
            .field("now", &self.now())
            .field("pending", &self.pending())
            .finish()
    }
}
