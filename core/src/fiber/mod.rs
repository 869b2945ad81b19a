//! # Fibers
//!
//! A fiber is the mutable execution context of one launched workflow. The
//! interpreter in [`exec_loop`] drives it as an explicit state machine; this
//! module holds the handle types and the operations other parties perform on
//! a fiber: listening for completion, joining, killing.
//!
//! ## Core Principles
//!
//! 1. **Stack-driven execution**: pending continuations and handler frames
//!    live in fiber-local `Vec`s, never on the native stack
//! 2. **No borrow across user code**: the state `RefCell` is released before
//!    any closure supplied by the caller runs, so a fiber may kill or join
//!    itself from inside its own effects
//! 3. **Scheduled resumption**: asynchronous callbacks and kills never run
//!    the interpreter inline; they queue it on the runtime's scheduler

pub mod exec_loop;
pub mod state;

#[cfg(test)]
mod tests;

use std::cell::{RefCell, RefMut};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use crate::error::{guard, Error, Outcome};
use crate::runtime::Runtime;
use crate::supervisor::Supervisor;
use crate::workflow::{cast, Canceler, Instr, Node, Workflow};

pub use state::Status;
use state::{Current, FiberState, Frame, Listener};

/* ===================== Raw Fiber ===================== */

pub(crate) struct FiberCell {
    id: u64,
    runtime: Runtime,
    supervisor: Option<Supervisor>,
    state: RefCell<FiberState>,
}

/// Untyped fiber handle used inside the engine
#[derive(Clone)]
pub(crate) struct RawFiber(Rc<FiberCell>);

impl RawFiber {
    pub fn new(runtime: Runtime, supervisor: Option<Supervisor>, root: Node) -> Self {
        let id = runtime.next_fiber_id();
        trace!(runtime = %runtime.id(), fiber = id, root = root.tag(), "fiber created");
        Self(Rc::new(FiberCell {
            id,
            runtime,
            supervisor,
            state: RefCell::new(FiberState::new(root)),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.0.runtime
    }

    pub fn supervisor(&self) -> Option<&Supervisor> {
        self.0.supervisor.as_ref()
    }

    pub(crate) fn state(&self) -> RefMut<'_, FiberState> {
        self.0.state.borrow_mut()
    }

    pub fn status(&self) -> Status {
        self.state().status
    }

    pub fn outcome(&self) -> Option<Outcome<crate::workflow::Dyn>> {
        self.state().outcome().cloned()
    }

    /// Start a suspended fiber. Inside a drain it runs right away, otherwise
    /// it is queued (which drains immediately).
    pub fn run(&self) {
        if self.status() != Status::Suspended {
            return;
        }
        if self.runtime().scheduler().is_draining() {
            exec_loop::run(self);
        } else {
            let fiber = self.clone();
            self.runtime().enqueue(move || {
                if fiber.status() == Status::Suspended {
                    exec_loop::run(&fiber);
                }
            });
        }
    }

    /// Queue the interpreter, unless the fiber moved past `tick` meanwhile
    pub(crate) fn resume_at(&self, tick: u64) {
        let fiber = self.clone();
        self.runtime().enqueue(move || {
            if fiber.state().run_tick == tick {
                exec_loop::run(&fiber);
            }
        });
    }

    /// Register a completion listener. Listeners added after completion are
    /// invoked through the scheduler with the cached outcome.
    pub fn on_complete(&self, listener: Listener) -> Subscription {
        let mut st = self.state();
        if let Some(outcome) = st.outcome().cloned() {
            st.rethrow = st.rethrow && listener.rethrow;
            drop(st);
            let handler = listener.handler;
            self.runtime().enqueue(move || handler(outcome));
            return Subscription::noop();
        }

        let id = st.next_join_id;
        st.next_join_id += 1;
        st.joins.get_or_insert_with(BTreeMap::new).insert(id, listener);
        Subscription {
            target: Some((Rc::downgrade(&self.0), id)),
        }
    }

    /// Wait for completion, starting the fiber if it never ran
    pub fn join(&self, cb: impl FnOnce(Outcome<crate::workflow::Dyn>) + 'static) -> Subscription {
        let subscription = self.on_complete(Listener {
            rethrow: false,
            handler: Box::new(cb),
        });
        if self.status() == Status::Suspended {
            self.run();
        }
        subscription
    }

    /// Interrupt the fiber.
    ///
    /// `cb` runs once the fiber completed, with `Err` if a finalizer raised
    /// while the interrupt unwound. Inside a bracket's acquire or release the
    /// interrupt is only recorded and takes effect once that region ends.
    pub fn kill(
        &self,
        reason: Error,
        cb: impl FnOnce(Result<(), Error>) + 'static,
    ) -> Subscription {
        if self.status() == Status::Completed {
            self.runtime().enqueue(move || cb(Ok(())));
            return Subscription::noop();
        }

        let weak = Rc::downgrade(&self.0);
        let subscription = self.on_complete(Listener {
            rethrow: false,
            handler: Box::new(move |_| {
                let suppressed = weak
                    .upgrade()
                    .and_then(|cell| cell.state.borrow().fail.clone());
                cb(suppressed.map_or(Ok(()), Err));
            }),
        });

        let mut st = self.state();
        debug!(
            fiber = self.id(),
            status = ?st.status,
            depth = st.bracket_depth,
            reason = %reason,
            "kill requested"
        );
        match st.status {
            Status::Completed => {}

            Status::Suspended => {
                st.record_interrupt(reason);
                let interrupt = st.interrupt.as_ref().map(|i| (**i).clone());
                st.status = Status::Completed;
                st.current = Current::Outcome(Outcome::Interrupted(
                    interrupt.unwrap_or_else(Error::killed),
                ));
                let tick = st.run_tick;
                drop(st);
                self.resume_at(tick);
            }

            Status::Pending => {
                st.record_interrupt(reason.clone());
                if st.bracket_depth > 0 {
                    return subscription;
                }
                // Invalidate the outstanding callback before cancelling it
                st.run_tick += 1;
                let tick = st.run_tick;
                let canceler = match st.current.take() {
                    Current::Canceler(canceler) => canceler,
                    _ => Canceler::none(),
                };
                drop(st);

                let finalizer = guard(|| canceler.into_node(reason))
                    .unwrap_or_else(|e| Some(Rc::new(Instr::Throw(e))));

                let mut st = self.state();
                if st.run_tick != tick {
                    return subscription;
                }
                if let Some(node) = finalizer {
                    st.push_attempt(Frame::Finalizer(node));
                }
                st.force_return();
                drop(st);
                self.resume_at(tick);
            }

            _ => {
                st.record_interrupt(reason);
                if st.bracket_depth == 0 {
                    st.force_return();
                }
            }
        }
        subscription
    }
}

/* ===================== Subscription ===================== */

/// Handle to a registered completion listener
#[must_use = "dropping a Subscription keeps the listener registered"]
pub struct Subscription {
    target: Option<(Weak<FiberCell>, u64)>,
}

impl Subscription {
    pub(crate) fn noop() -> Self {
        Self { target: None }
    }

    /// Remove the listener if it has not fired yet
    pub fn cancel(self) {
        let Some((weak, id)) = self.target else {
            return;
        };
        if let Some(cell) = weak.upgrade() {
            if let Some(joins) = cell.state.borrow_mut().joins.as_mut() {
                joins.remove(&id);
            }
        }
    }
}

/* ===================== Typed Handle ===================== */

/// Handle to a running (or finished) workflow producing a `T`
pub struct Fiber<T> {
    raw: RawFiber,
    _t: PhantomData<fn() -> T>,
}

impl<T> Clone for Fiber<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _t: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Fiber<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.raw.id())
            .field("status", &self.raw.status())
            .finish()
    }
}

impl<T: Clone + 'static> Fiber<T> {
    pub(crate) fn from_raw(raw: RawFiber) -> Self {
        Self {
            raw,
            _t: PhantomData,
        }
    }

    pub fn id(&self) -> u64 {
        self.raw.id()
    }

    pub fn status(&self) -> Status {
        self.raw.status()
    }

    pub fn is_suspended(&self) -> bool {
        self.status() == Status::Suspended
    }

    pub fn is_completed(&self) -> bool {
        self.status() == Status::Completed
    }

    /// Start the fiber if it is still suspended
    pub fn run(&self) {
        self.raw.run();
    }

    /// Cached outcome, once completed
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.raw.outcome().map(|o| o.map(cast))
    }

    /// The supervisor this fiber reports to, if any
    pub fn supervisor(&self) -> Option<Supervisor> {
        self.raw.supervisor().cloned()
    }

    /// Raw completion listener. A failure is reported as unhandled unless
    /// at least one listener was registered with `rethrow == false`.
    pub fn on_complete(
        &self,
        rethrow: bool,
        f: impl FnOnce(Outcome<T>) + 'static,
    ) -> Subscription {
        self.raw.on_complete(Listener {
            rethrow,
            handler: Box::new(move |outcome| f(outcome.map(cast))),
        })
    }

    /// Callback-style join
    pub fn join_with(&self, f: impl FnOnce(Outcome<T>) + 'static) -> Subscription {
        self.raw.join(move |outcome| f(outcome.map(cast)))
    }

    /// Callback-style kill
    pub fn kill_with(
        &self,
        reason: Error,
        f: impl FnOnce(Result<(), Error>) + 'static,
    ) -> Subscription {
        self.raw.kill(reason, f)
    }

    /// Wait for the fiber. Failures and interrupts are re-raised.
    pub fn join(&self) -> Workflow<T> {
        let raw = self.raw.clone();
        Workflow::async_effect(move |resolver| {
            let subscription =
                raw.join(move |outcome| resolver.resolve(outcome.map(cast::<T>).into_result()));
            Ok(Canceler::sync(move || subscription.cancel()))
        })
    }

    /// Kill the fiber and wait until it finished unwinding
    pub fn kill(&self, reason: Error) -> Workflow<()> {
        let raw = self.raw.clone();
        Workflow::async_effect(move |resolver| {
            let subscription = raw.kill(reason.clone(), move |result| resolver.resolve(result));
            Ok(Canceler::sync(move || subscription.cancel()))
        })
    }
}
