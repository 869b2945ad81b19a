//! Fiber state and frame types
//!
//! All interpreter state lives in [`FiberState`]: the status of the state
//! machine, the slot being worked on, and two explicit stacks that stand in
//! for native recursion.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::{Error, Outcome};
use crate::workflow::instr::{Cont, Handler, ReleaseHandlers, Use};
use crate::workflow::{Canceler, Dyn, Node};

/* ===================== Status ===================== */

/// Interpreter state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Created but never run
    Suspended,
    /// Interpret the node in `current`
    Continue,
    /// Feed the value in `current` to the top continuation
    StepBind,
    /// Route the result in `current` to the next bind or to `Return`
    StepResult,
    /// Waiting for an asynchronous callback
    Pending,
    /// Unwinding through the attempt stack
    Return,
    /// Terminal; `current` holds the cached outcome
    Completed,
}

/// The slot the current status operates on
pub(crate) enum Current {
    Empty,
    Node(Node),
    Value(Dyn),
    Result(Result<Dyn, Error>),
    Canceler(Canceler),
    Outcome(Outcome<Dyn>),
}

impl Current {
    pub fn take(&mut self) -> Current {
        std::mem::replace(self, Current::Empty)
    }
}

/* ===================== Interrupts ===================== */

/// A recorded cancellation. Its identity is the scope token.
pub(crate) type Interrupt = Rc<Error>;

/// Whether `interrupt` belongs to a scope other than the one that pushed a
/// frame with `token`
pub(crate) fn out_of_scope(interrupt: &Option<Interrupt>, token: &Option<Interrupt>) -> bool {
    match (interrupt, token) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(i), Some(t)) => !Rc::ptr_eq(i, t),
    }
}

/* ===================== Frames ===================== */

/// An entry of the attempt stack
pub(crate) enum Frame {
    /// Intercepts raised failures
    Catch(Handler),
    /// Binds saved when a catch or bracket frame was pushed
    Resume(Vec<Cont>),
    /// Acquisition in progress
    Bracket {
        release: Rc<ReleaseHandlers>,
        use_fn: Use,
    },
    /// Resource acquired; release runs when this frame is reached
    Release {
        release: Rc<ReleaseHandlers>,
        resource: Dyn,
    },
    /// Cancellation workflow of an interrupted asynchronous step
    Finalizer(Node),
    /// Outcome saved while a release or finalizer runs
    Finalized {
        value: Option<Dyn>,
        fail: Option<Error>,
    },
}

impl Frame {
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::Catch(_) => "Catch",
            Frame::Resume(_) => "Resume",
            Frame::Bracket { .. } => "Bracket",
            Frame::Release { .. } => "Release",
            Frame::Finalizer(_) => "Finalizer",
            Frame::Finalized { .. } => "Finalized",
        }
    }
}

/// A frame together with the interrupt active when it was pushed
pub(crate) struct Attempt {
    pub frame: Frame,
    pub token: Option<Interrupt>,
}

/* ===================== Listeners ===================== */

pub(crate) type ListenerFn = Box<dyn FnOnce(Outcome<Dyn>)>;

/// Completion callback registered through `on_complete`, `join` or `kill`
pub(crate) struct Listener {
    /// Whether this listener lets an unhandled failure be reported
    pub rethrow: bool,
    pub handler: ListenerFn,
}

/* ===================== Fiber State ===================== */

pub(crate) struct FiberState {
    pub status: Status,
    pub current: Current,
    pub fail: Option<Error>,
    pub interrupt: Option<Interrupt>,
    pub binds: Vec<Cont>,
    pub attempts: Vec<Attempt>,
    pub bracket_depth: usize,
    pub run_tick: u64,
    /// `None` once completion listeners have fired
    pub joins: Option<BTreeMap<u64, Listener>>,
    pub next_join_id: u64,
    pub rethrow: bool,
}

impl FiberState {
    pub fn new(root: Node) -> Self {
        Self {
            status: Status::Suspended,
            current: Current::Node(root),
            fail: None,
            interrupt: None,
            binds: Vec::new(),
            attempts: Vec::new(),
            bracket_depth: 0,
            run_tick: 0,
            joins: Some(BTreeMap::new()),
            next_join_id: 0,
            rethrow: true,
        }
    }

    /// Push an attempt frame tagged with the current interrupt
    pub fn push_attempt(&mut self, frame: Frame) {
        let token = self.interrupt.clone();
        self.attempts.push(Attempt { frame, token });
    }

    /// Save pending binds below a new catch or bracket frame
    pub fn save_binds(&mut self) {
        if !self.binds.is_empty() {
            let saved = std::mem::take(&mut self.binds);
            self.push_attempt(Frame::Resume(saved));
        }
    }

    /// Record a cancellation; the first reason wins
    pub fn record_interrupt(&mut self, reason: Error) {
        if self.interrupt.is_none() {
            self.interrupt = Some(Rc::new(reason));
        }
    }

    pub fn interrupted_out_of_scope(&self, token: &Option<Interrupt>) -> bool {
        out_of_scope(&self.interrupt, token) && self.bracket_depth == 0
    }

    /// Force an unwind, dropping whatever was in flight
    pub fn force_return(&mut self) {
        self.status = Status::Return;
        self.current = Current::Empty;
        self.fail = None;
    }

    /// Cached outcome once completed
    pub fn outcome(&self) -> Option<&Outcome<Dyn>> {
        match (&self.status, &self.current) {
            (Status::Completed, Current::Outcome(outcome)) => Some(outcome),
            _ => None,
        }
    }
}
