//! Fiber supervision
//!
//! A [`Supervisor`] tracks the fibers forked under it until they complete, so
//! a scope can kill whatever it left running.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::debug;

use crate::error::Error;
use crate::fiber::state::Listener;
use crate::fiber::{RawFiber, Subscription};
use crate::runtime::Runtime;
use crate::workflow::{Canceler, Workflow};

struct SupervisorInner {
    runtime: Runtime,
    fibers: RefCell<BTreeMap<u64, RawFiber>>,
}

/// Registry of live fibers, keyed by fiber id
#[derive(Clone)]
pub struct Supervisor {
    inner: Rc<SupervisorInner>,
}

impl Supervisor {
    pub(crate) fn new(runtime: Runtime) -> Self {
        Self {
            inner: Rc::new(SupervisorInner {
                runtime,
                fibers: RefCell::new(BTreeMap::new()),
            }),
        }
    }

    /// Track `fiber` until it completes
    pub(crate) fn register(&self, fiber: &RawFiber) {
        let id = fiber.id();
        self.inner.fibers.borrow_mut().insert(id, fiber.clone());

        let weak = Rc::downgrade(&self.inner);
        // Tracking is not handling: the listener keeps failures reportable
        let subscription = fiber.on_complete(Listener {
            rethrow: true,
            handler: Box::new(move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.fibers.borrow_mut().remove(&id);
                }
            }),
        });
        // Removal happens on completion; there is nothing to unsubscribe
        drop(subscription);
    }

    /// Number of fibers still tracked
    pub fn len(&self) -> usize {
        self.inner.fibers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of the fibers still tracked, in fork order
    pub fn fiber_ids(&self) -> Vec<u64> {
        self.inner.fibers.borrow().keys().copied().collect()
    }

    /// Kill every tracked fiber with `reason`.
    ///
    /// `done` runs exactly once, after the last of them completed (right away
    /// if none are tracked). A finalizer failure surfacing from one of the
    /// kills is reported as unhandled.
    pub fn kill_all(&self, reason: Error, done: impl FnOnce() + 'static) -> Vec<Subscription> {
        let fibers = std::mem::take(&mut *self.inner.fibers.borrow_mut());
        if fibers.is_empty() {
            done();
            return Vec::new();
        }
        debug!(count = fibers.len(), reason = %reason, "supervisor killing fibers");

        let remaining = Rc::new(Cell::new(fibers.len()));
        let done: Rc<RefCell<Option<Box<dyn FnOnce()>>>> =
            Rc::new(RefCell::new(Some(Box::new(done))));

        fibers
            .into_values()
            .map(|fiber| {
                let runtime = self.inner.runtime.clone();
                let remaining = remaining.clone();
                let done = done.clone();
                fiber.kill(reason.clone(), move |result| {
                    if let Err(error) = result {
                        runtime.report_unhandled(&error);
                    }
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        let finish = done.borrow_mut().take();
                        if let Some(finish) = finish {
                            finish();
                        }
                    }
                })
            })
            .collect()
    }

    /// [`kill_all`](Self::kill_all) as a workflow that resumes once every
    /// tracked fiber completed
    pub fn kill_all_workflow(&self, reason: Error) -> Workflow<()> {
        let supervisor = self.clone();
        Workflow::async_effect(move |resolver| {
            let subscriptions = supervisor.kill_all(reason.clone(), move || resolver.succeed(()));
            Ok(Canceler::sync(move || {
                for subscription in subscriptions {
                    subscription.cancel();
                }
            }))
        })
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("fibers", &self.fiber_ids())
            .finish()
    }
}
