//! Core execution loop
//!
//! [`step`] advances a fiber by one state transition. Every transition either
//! rewrites the fiber's state and continues, or parks the fiber (pending on
//! a callback, or completed) and stops. Continuations and handler frames are
//! held in explicit stacks, so arbitrarily long bind chains use constant
//! native stack.
//!
//! ## Function Organization
//! 1. run() - Top-level driver (calls step repeatedly)
//! 2. step() - Dispatches on the fiber status
//! 3. One function per status, then the unwinder and completion

use std::rc::Rc;

use tracing::trace;

use super::state::{out_of_scope, Attempt, Current, Frame, Status};
use super::RawFiber;
use crate::error::{guard, Error, Outcome};
use crate::supervisor::Supervisor;
use crate::workflow::instr::Register;
use crate::workflow::{erase, ForkScope, Instr, Node, RawResolver};

/// Result of one transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Done,
}

/* ===================== Public API ===================== */

/// Run the fiber until it parks on a callback or completes
pub(crate) fn run(fiber: &RawFiber) {
    loop {
        match step(fiber) {
            Step::Continue => continue,
            Step::Done => break,
        }
    }
}

/// Execute one transition
pub(crate) fn step(fiber: &RawFiber) -> Step {
    let status = fiber.status();
    match status {
        Status::Suspended => {
            fiber.state().status = Status::Continue;
            Step::Continue
        }
        Status::Continue => step_continue(fiber),
        Status::StepBind => step_bind(fiber),
        Status::StepResult => {
            step_result(fiber);
            Step::Continue
        }
        Status::Pending => Step::Done,
        Status::Return => step_return(fiber),
        Status::Completed => {
            complete(fiber);
            Step::Done
        }
    }
}

/* ===================== Instructions ===================== */

fn step_continue(fiber: &RawFiber) -> Step {
    let node = match fiber.state().current.take() {
        Current::Node(node) => node,
        _ => unreachable!("Continue without an instruction"),
    };

    match &*node {
        Instr::Bind(body, k) => {
            let mut st = fiber.state();
            st.binds.push(k.clone());
            st.current = Current::Node(body.clone());
        }

        Instr::Then(first, next) => {
            let next = next.clone();
            let mut st = fiber.state();
            st.binds.push(Rc::new(move |_| next.clone()));
            st.current = Current::Node(first.clone());
        }

        Instr::Pure(value) => {
            let mut st = fiber.state();
            st.status = if st.binds.is_empty() {
                Status::Return
            } else {
                Status::StepBind
            };
            st.current = Current::Value(value.clone());
        }

        Instr::Throw(error) => {
            let mut st = fiber.state();
            st.status = Status::Return;
            st.fail = Some(error.clone());
        }

        Instr::Sync(thunk) => {
            fiber.state().status = Status::StepResult;
            let result = guard(|| thunk()).and_then(|r| r);
            let mut st = fiber.state();
            // A kill may have forced an unwind while the effect ran
            if st.status == Status::StepResult {
                st.current = Current::Result(result);
            }
        }

        Instr::Async(register) => return step_async(fiber, register.clone()),

        Instr::Catch(body, handler) => {
            let mut st = fiber.state();
            st.save_binds();
            st.push_attempt(Frame::Catch(handler.clone()));
            st.current = Current::Node(body.clone());
        }

        Instr::Bracket {
            acquire,
            release,
            use_fn,
        } => {
            let mut st = fiber.state();
            st.bracket_depth += 1;
            st.save_binds();
            st.push_attempt(Frame::Bracket {
                release: release.clone(),
                use_fn: use_fn.clone(),
            });
            st.current = Current::Node(acquire.clone());
        }

        Instr::Fork {
            immediate,
            scope,
            body,
        } => step_fork(fiber, *immediate, *scope, body.clone()),

        Instr::Par(par) => {
            let register = crate::par::eval::register(
                fiber.runtime().clone(),
                fiber.supervisor().cloned(),
                par.clone(),
            );
            fiber.state().current = Current::Node(Rc::new(Instr::Async(register)));
        }
    }
    Step::Continue
}

fn step_async(fiber: &RawFiber, register: Register) -> Step {
    let tick = {
        let mut st = fiber.state();
        st.status = Status::Pending;
        st.run_tick
    };
    let resolver = resolver(fiber, tick);

    match guard(|| register(resolver.clone())).and_then(|r| r) {
        Ok(canceler) => {
            let mut st = fiber.state();
            if st.status == Status::Pending && st.run_tick == tick {
                st.current = Current::Canceler(canceler);
            }
        }
        Err(error) => resolver(Err(error)),
    }
    Step::Done
}

/// One-shot callback for the asynchronous step registered at `tick`.
///
/// The first call moves the fiber to the next tick, which turns every later
/// call (and any kill-time cancellation race) into a no-op. The fiber itself
/// resumes through the scheduler.
fn resolver(fiber: &RawFiber, tick: u64) -> RawResolver {
    let fiber = fiber.clone();
    Rc::new(move |result: Result<crate::workflow::Dyn, Error>| {
        {
            let mut st = fiber.state();
            if st.run_tick != tick {
                return;
            }
            st.run_tick += 1;
        }
        let resumed = fiber.clone();
        fiber.runtime().enqueue(move || {
            {
                let mut st = resumed.state();
                if st.run_tick != tick + 1 {
                    return;
                }
                st.status = Status::StepResult;
                st.current = Current::Result(result);
            }
            run(&resumed);
        });
    })
}

fn step_fork(fiber: &RawFiber, immediate: bool, scope: ForkScope, body: Node) {
    let runtime = fiber.runtime().clone();
    let supervisor = match scope {
        ForkScope::Inherit => fiber.supervisor().cloned(),
        ForkScope::Isolated => Some(Supervisor::new(runtime.clone())),
    };
    let child = RawFiber::new(runtime, supervisor.clone(), body);
    if scope == ForkScope::Inherit {
        if let Some(supervisor) = &supervisor {
            supervisor.register(&child);
        }
    }
    trace!(parent = fiber.id(), child = child.id(), ?scope, immediate, "fork");

    fiber.state().status = Status::StepResult;
    if immediate {
        child.run();
    }
    let mut st = fiber.state();
    if st.status == Status::StepResult {
        st.current = Current::Result(Ok(erase(child)));
    }
}

/* ===================== Values ===================== */

fn step_bind(fiber: &RawFiber) -> Step {
    let (k, value) = {
        let mut st = fiber.state();
        st.status = Status::Continue;
        let Some(k) = st.binds.pop() else {
            unreachable!("StepBind with an empty bind stack")
        };
        let value = match st.current.take() {
            Current::Value(value) => value,
            _ => unreachable!("StepBind without a value"),
        };
        (k, value)
    };
    set_next(fiber, guard(|| k(value)));
    Step::Continue
}

fn step_result(fiber: &RawFiber) {
    let mut st = fiber.state();
    match st.current.take() {
        Current::Result(Ok(value)) => {
            st.status = if st.binds.is_empty() {
                Status::Return
            } else {
                Status::StepBind
            };
            st.current = Current::Value(value);
        }
        Current::Result(Err(error)) => {
            st.status = Status::Return;
            st.fail = Some(error);
        }
        _ => unreachable!("StepResult without a result"),
    }
}

/// Install the node a handler produced. A kill that forced an unwind while
/// the handler ran wins over the node; a panicking handler raises.
fn set_next(fiber: &RawFiber, next: Result<Node, Error>) {
    let mut st = fiber.state();
    match next {
        Ok(node) => {
            if st.status == Status::Continue {
                st.current = Current::Node(node);
            }
        }
        Err(error) => {
            st.status = Status::Return;
            st.current = Current::Empty;
            st.fail = Some(error);
        }
    }
}

/* ===================== Unwinding ===================== */

/// Pop one attempt frame and act on it
fn step_return(fiber: &RawFiber) -> Step {
    let mut st = fiber.state();
    st.binds.clear();

    let Some(Attempt { frame, token }) = st.attempts.pop() else {
        trace!(fiber = fiber.id(), "unwound to the root");
        let outcome = if let Some(interrupt) = &st.interrupt {
            Outcome::Interrupted((**interrupt).clone())
        } else if let Some(fail) = &st.fail {
            Outcome::Failed(fail.clone())
        } else {
            match st.current.take() {
                Current::Value(value) => Outcome::Succeeded(value),
                _ => unreachable!("Return without a value, failure or interrupt"),
            }
        };
        st.status = Status::Completed;
        st.current = Current::Outcome(outcome);
        return Step::Continue;
    };
    trace!(
        fiber = fiber.id(),
        frame = frame.tag(),
        failing = st.fail.is_some(),
        interrupted = st.interrupt.is_some(),
        "pop frame"
    );

    match frame {
        Frame::Catch(handler) => {
            if st.interrupted_out_of_scope(&token) {
                return Step::Continue;
            }
            if let Some(error) = st.fail.take() {
                st.status = Status::Continue;
                drop(st);
                set_next(fiber, guard(|| handler(error)));
            }
        }

        Frame::Resume(binds) => {
            if !st.interrupted_out_of_scope(&token) && st.fail.is_none() {
                st.binds = binds;
                st.status = Status::StepBind;
            }
        }

        Frame::Bracket { release, use_fn } => {
            st.bracket_depth -= 1;
            if st.fail.is_some() {
                return Step::Continue;
            }
            let resource = match &st.current {
                Current::Value(value) => value.clone(),
                _ => unreachable!("acquisition finished without a resource"),
            };
            st.attempts.push(Attempt {
                frame: Frame::Release {
                    release,
                    resource: resource.clone(),
                },
                token: token.clone(),
            });
            // An interrupt from outside this scope skips the use phase
            if !out_of_scope(&st.interrupt, &token) || st.bracket_depth > 0 {
                st.status = Status::Continue;
                st.current = Current::Empty;
                drop(st);
                set_next(fiber, guard(|| use_fn.node(resource)));
            }
        }

        Frame::Release { release, resource } => {
            let value = match st.current.take() {
                Current::Value(value) => Some(value),
                _ => None,
            };
            let fail = st.fail.take();
            let killed_by = if st.interrupted_out_of_scope(&token) {
                st.interrupt.clone()
            } else {
                None
            };
            let fallback = st.interrupt.clone();
            st.push_attempt(Frame::Finalized {
                value: value.clone(),
                fail: fail.clone(),
            });
            st.status = Status::Continue;
            st.bracket_depth += 1;
            drop(st);

            let next = guard(|| match (killed_by, fail, value) {
                (Some(interrupt), _, _) => (release.killed)((*interrupt).clone(), resource),
                (None, Some(error), _) => (release.failed)(error, resource),
                (None, None, Some(value)) => (release.completed)(value, resource),
                (None, None, None) => {
                    let reason = fallback.map_or_else(Error::killed, |i| (*i).clone());
                    (release.killed)(reason, resource)
                }
            });
            set_next(fiber, next);
        }

        Frame::Finalizer(node) => {
            st.bracket_depth += 1;
            let value = match st.current.take() {
                Current::Value(value) => Some(value),
                _ => None,
            };
            let fail = st.fail.take();
            st.push_attempt(Frame::Finalized { value, fail });
            st.status = Status::Continue;
            st.current = Current::Node(node);
        }

        Frame::Finalized { value, fail } => {
            st.bracket_depth -= 1;
            // A failure raised by the release supersedes the saved outcome
            if st.fail.is_none() {
                st.fail = fail;
                st.current = value.map_or(Current::Empty, Current::Value);
            }
        }
    }
    Step::Continue
}

/* ===================== Completion ===================== */

/// Fire completion listeners once, then report an unhandled failure unless
/// some listener handled it
fn complete(fiber: &RawFiber) {
    let (listeners, outcome) = {
        let mut st = fiber.state();
        let Some(listeners) = st.joins.take() else {
            return;
        };
        let Some(outcome) = st.outcome().cloned() else {
            return;
        };
        (listeners, outcome)
    };
    trace!(
        fiber = fiber.id(),
        outcome = outcome_tag(&outcome),
        listeners = listeners.len(),
        "fiber completed"
    );

    for (_, listener) in listeners {
        {
            let mut st = fiber.state();
            st.rethrow = st.rethrow && listener.rethrow;
        }
        (listener.handler)(outcome.clone());
    }

    if let Outcome::Failed(error) = outcome {
        let reporter = fiber.clone();
        fiber.runtime().enqueue(move || {
            let rethrow = reporter.state().rethrow;
            if rethrow {
                reporter.runtime().report_unhandled(&error);
            }
        });
    }
}

fn outcome_tag<T>(outcome: &Outcome<T>) -> &'static str {
    match outcome {
        Outcome::Succeeded(_) => "succeeded",
        Outcome::Failed(_) => "failed",
        Outcome::Interrupted(_) => "interrupted",
    }
}
