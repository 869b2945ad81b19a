//! Untyped instruction tree
//!
//! The typed [`Workflow`](super::Workflow) facade erases every value to a
//! shared `Rc<dyn Any>` so one interpreter can run workflows of any type.
//! Nodes are reference counted and never mutated, so a workflow can be
//! launched any number of times.

use std::any::Any;
use std::rc::Rc;

use crate::error::Error;

/* ===================== Erased Values ===================== */

/// A value flowing through the interpreter
pub(crate) type Dyn = Rc<dyn Any>;

pub(crate) fn erase<T: 'static>(value: T) -> Dyn {
    Rc::new(value)
}

/// Recover a typed value. The typed facade guarantees the type matches.
pub(crate) fn cast<T: Clone + 'static>(value: Dyn) -> T {
    match value.downcast::<T>() {
        Ok(rc) => Rc::try_unwrap(rc).unwrap_or_else(|rc| (*rc).clone()),
        Err(_) => unreachable!(
            "workflow value is not a {}",
            std::any::type_name::<T>()
        ),
    }
}

/* ===================== Closures ===================== */

pub(crate) type Node = Rc<Instr>;
pub(crate) type Thunk = Rc<dyn Fn() -> Result<Dyn, Error>>;
pub(crate) type Cont = Rc<dyn Fn(Dyn) -> Node>;
pub(crate) type Handler = Rc<dyn Fn(Error) -> Node>;
pub(crate) type RawResolver = Rc<dyn Fn(Result<Dyn, Error>)>;
pub(crate) type Register = Rc<dyn Fn(RawResolver) -> Result<super::Canceler, Error>>;
pub(crate) type MapFn = Rc<dyn Fn(Dyn) -> Dyn>;
pub(crate) type ZipFn = Rc<dyn Fn(Dyn, Dyn) -> Dyn>;

/// The three release handlers of a bracket. Exactly one runs per acquisition.
pub(crate) struct ReleaseHandlers {
    pub killed: Rc<dyn Fn(Error, Dyn) -> Node>,
    pub failed: Rc<dyn Fn(Error, Dyn) -> Node>,
    pub completed: Rc<dyn Fn(Dyn, Dyn) -> Node>,
}

/// What a bracket runs once its resource is acquired
#[derive(Clone)]
pub(crate) enum Use {
    /// Built from the resource
    With(Cont),
    /// Fixed body that ignores the resource
    Run(Node),
}

impl Use {
    pub fn node(&self, resource: Dyn) -> Node {
        match self {
            Use::With(f) => f(resource),
            Use::Run(node) => node.clone(),
        }
    }
}

/// Which supervisor a forked fiber reports to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ForkScope {
    /// Same supervisor as the forking fiber
    Inherit,
    /// A fresh supervisor owned by the child
    Isolated,
}

/* ===================== Instructions ===================== */

pub(crate) enum Instr {
    Pure(Dyn),
    Throw(Error),
    Catch(Node, Handler),
    Sync(Thunk),
    Async(Register),
    Bind(Node, Cont),
    /// Run the first node, discard its value, run the second
    Then(Node, Node),
    Bracket {
        acquire: Node,
        release: Rc<ReleaseHandlers>,
        use_fn: Use,
    },
    Fork {
        immediate: bool,
        scope: ForkScope,
        body: Node,
    },
    Par(ParNode),
}

impl Instr {
    pub fn tag(&self) -> &'static str {
        match self {
            Instr::Pure(_) => "Pure",
            Instr::Throw(_) => "Throw",
            Instr::Catch(..) => "Catch",
            Instr::Sync(_) => "Sync",
            Instr::Async(_) => "Async",
            Instr::Bind(..) => "Bind",
            Instr::Then(..) => "Then",
            Instr::Bracket { .. } => "Bracket",
            Instr::Fork { .. } => "Fork",
            Instr::Par(_) => "Par",
        }
    }
}

impl std::fmt::Debug for Instr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/* ===================== Parallel Tree ===================== */

pub(crate) type ParNode = Rc<ParInstr>;

/// Static shape of a parallel block, built by `Par` and copied into an
/// evaluation arena each time the block runs
pub(crate) enum ParInstr {
    Leaf(Node),
    Map(MapFn, ParNode),
    Apply(ParNode, ParNode, ZipFn),
    Alt(ParNode, ParNode),
}

/* ===================== Teardown ===================== */

// Long chains (a map applied in a loop, a fold of `then`, a wide
// par_sequence) nest one node per step. Dropping them recursively would
// overflow the stack, so children are detached and released from a work list
// instead. Nodes captured inside user closures are out of reach; the
// combinators that only sequence prebuilt workflows store them as nodes.

thread_local! {
    static HOLE: Node = Rc::new(Instr::Pure(Rc::new(()) as Dyn));
    static PAR_HOLE: ParNode = Rc::new(ParInstr::Leaf(Rc::new(Instr::Pure(Rc::new(()) as Dyn))));
}

fn detach<T>(slot: &mut Rc<T>, hole: &Rc<T>, out: &mut Vec<Rc<T>>) {
    if !Rc::ptr_eq(slot, hole) {
        out.push(std::mem::replace(slot, hole.clone()));
    }
}

impl Instr {
    fn detach_children(&mut self, hole: &Node, out: &mut Vec<Node>) {
        match self {
            Instr::Catch(body, _) | Instr::Bind(body, _) => detach(body, hole, out),
            Instr::Then(first, next) => {
                detach(first, hole, out);
                detach(next, hole, out);
            }
            Instr::Bracket {
                acquire, use_fn, ..
            } => {
                detach(acquire, hole, out);
                if let Use::Run(body) = use_fn {
                    detach(body, hole, out);
                }
            }
            Instr::Fork { body, .. } => detach(body, hole, out),
            Instr::Pure(_) | Instr::Throw(_) | Instr::Sync(_) | Instr::Async(_) | Instr::Par(_) => {}
        }
    }
}

impl Drop for Instr {
    fn drop(&mut self) {
        let _ = HOLE.try_with(|hole| {
            let mut pending = Vec::new();
            self.detach_children(hole, &mut pending);
            while let Some(node) = pending.pop() {
                if let Ok(mut instr) = Rc::try_unwrap(node) {
                    instr.detach_children(hole, &mut pending);
                }
            }
        });
    }
}

impl ParInstr {
    fn detach_children(&mut self, hole: &ParNode, out: &mut Vec<ParNode>) {
        match self {
            ParInstr::Leaf(_) => {}
            ParInstr::Map(_, child) => detach(child, hole, out),
            ParInstr::Apply(left, right, _) | ParInstr::Alt(left, right) => {
                detach(left, hole, out);
                detach(right, hole, out);
            }
        }
    }
}

impl Drop for ParInstr {
    fn drop(&mut self) {
        let _ = PAR_HOLE.try_with(|hole| {
            let mut pending = Vec::new();
            self.detach_children(hole, &mut pending);
            while let Some(node) = pending.pop() {
                if let Ok(mut par) = Rc::try_unwrap(node) {
                    par.detach_children(hole, &mut pending);
                }
            }
        });
    }
}
