//! Parallel block evaluation
//!
//! Running a [`ParInstr`] tree copies its shape into an arena, forks one
//! fiber per leaf and combines results bottom-up as leaves complete. Each
//! internal node is settled by whichever child resolves it first; later
//! results for that node are dropped.
//!
//! - `Apply` waits for both sides, or fails as soon as either side fails and
//!   kills the other subtree with an early-exit reason.
//! - `Alt` takes the first success and kills the other subtree; it fails
//!   only once both sides failed, with the left side's error.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::trace;

use crate::error::{guard, Error};
use crate::fiber::state::Listener;
use crate::fiber::{RawFiber, Subscription};
use crate::runtime::Runtime;
use crate::supervisor::Supervisor;
use crate::workflow::instr::{MapFn, ParInstr, ParNode, Register, ZipFn};
use crate::workflow::{Canceler, Dyn, RawResolver, Workflow};

const UNSET: usize = usize::MAX;

type Settled = Result<Dyn, Error>;

/* ===================== Arena ===================== */

enum Kind {
    Leaf(Option<RawFiber>),
    Map(MapFn, usize),
    Apply(usize, usize, ZipFn),
    Alt(usize, usize),
}

/// Owned copy of an internal node's links
enum Shape {
    Map(MapFn),
    Apply(usize, usize, ZipFn),
    Alt(usize, usize),
}

impl Kind {
    fn shape(&self) -> Shape {
        match self {
            Kind::Leaf(_) => unreachable!("leaf nodes have no children"),
            Kind::Map(f, _) => Shape::Map(f.clone()),
            Kind::Apply(l, r, f) => Shape::Apply(*l, *r, f.clone()),
            Kind::Alt(l, r) => Shape::Alt(*l, *r),
        }
    }
}

struct EvalNode {
    kind: Kind,
    parent: Option<usize>,
    settled: bool,
    /// The node's result until its parent consumes it. Values are moved out,
    /// never cloned, so combining functions receive uniquely owned values.
    slot: Option<Settled>,
}

impl EvalNode {
    fn settle(&mut self, result: Settled) {
        self.settled = true;
        self.slot = Some(result);
    }

    fn take_value(&mut self) -> Option<Dyn> {
        match self.slot.take() {
            Some(Ok(value)) => Some(value),
            other => {
                self.slot = other;
                None
            }
        }
    }

    fn error(&self) -> Option<Error> {
        match &self.slot {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    Only,
    Left,
    Right,
}

struct ParEval {
    runtime: Runtime,
    nodes: Vec<EvalNode>,
    resolver: RawResolver,
    interrupted: bool,
    next_kill: u64,
    /// Sibling kills still waiting for their fibers to finish
    kills: BTreeMap<u64, Vec<Subscription>>,
}

type Shared = Rc<RefCell<ParEval>>;

/// Registration of the asynchronous step a `Par` instruction runs as
pub(crate) fn register(
    runtime: Runtime,
    supervisor: Option<Supervisor>,
    par: ParNode,
) -> Register {
    Rc::new(move |resolver: RawResolver| {
        let shared = Rc::new(RefCell::new(ParEval {
            runtime: runtime.clone(),
            nodes: Vec::new(),
            resolver,
            interrupted: false,
            next_kill: 0,
            kills: BTreeMap::new(),
        }));
        let leaves = build(&shared, &par, &runtime, supervisor.as_ref());
        trace!(leaves = leaves.len(), "parallel block started");

        for (idx, fiber) in &leaves {
            let (shared, idx) = (shared.clone(), *idx);
            let subscription = fiber.on_complete(Listener {
                rethrow: false,
                handler: Box::new(move |outcome| {
                    resolve(&shared, idx, outcome.into_result());
                }),
            });
            drop(subscription);
        }
        for (_, fiber) in &leaves {
            fiber.run();
        }

        Ok::<_, Error>(canceler(shared))
    })
}

/// Copy the tree into the arena and create (but not start) the leaf fibers.
/// Leaves come back in left-to-right order.
fn build(
    shared: &Shared,
    root: &ParNode,
    runtime: &Runtime,
    supervisor: Option<&Supervisor>,
) -> Vec<(usize, RawFiber)> {
    let mut eval = shared.borrow_mut();
    let mut leaves = Vec::new();
    let mut stack: Vec<(ParNode, Option<(usize, Side)>)> = vec![(root.clone(), None)];

    while let Some((par, link)) = stack.pop() {
        let idx = eval.nodes.len();
        let kind = match &*par {
            ParInstr::Leaf(node) => {
                let fiber = RawFiber::new(runtime.clone(), supervisor.cloned(), node.clone());
                if let Some(supervisor) = supervisor {
                    supervisor.register(&fiber);
                }
                leaves.push((idx, fiber.clone()));
                Kind::Leaf(Some(fiber))
            }
            ParInstr::Map(f, child) => {
                stack.push((child.clone(), Some((idx, Side::Only))));
                Kind::Map(f.clone(), UNSET)
            }
            ParInstr::Apply(left, right, f) => {
                stack.push((right.clone(), Some((idx, Side::Right))));
                stack.push((left.clone(), Some((idx, Side::Left))));
                Kind::Apply(UNSET, UNSET, f.clone())
            }
            ParInstr::Alt(left, right) => {
                stack.push((right.clone(), Some((idx, Side::Right))));
                stack.push((left.clone(), Some((idx, Side::Left))));
                Kind::Alt(UNSET, UNSET)
            }
        };
        eval.nodes.push(EvalNode {
            kind,
            parent: link.map(|(parent, _)| parent),
            settled: false,
            slot: None,
        });

        if let Some((parent, side)) = link {
            match (&mut eval.nodes[parent].kind, side) {
                (Kind::Map(_, child), Side::Only) => *child = idx,
                (Kind::Apply(l, _, _) | Kind::Alt(l, _), Side::Left) => *l = idx,
                (Kind::Apply(_, r, _) | Kind::Alt(_, r), Side::Right) => *r = idx,
                _ => unreachable!("parallel node linked on the wrong side"),
            }
        }
    }
    leaves
}

/* ===================== Joining ===================== */

/// A leaf fiber completed
fn resolve(shared: &Shared, leaf: usize, result: Settled) {
    {
        let mut eval = shared.borrow_mut();
        let node = &mut eval.nodes[leaf];
        node.kind = Kind::Leaf(None);
        node.settle(result);
    }
    join(shared, leaf);
}

/// What to do at a parent once the borrow is released
enum Action {
    /// The parent is settled; keep climbing
    Climb,
    Map(MapFn, Dyn),
    Zip(ZipFn, Dyn, Dyn),
    KillSibling(usize),
}

/// Propagate the result settled at node `from` towards the root
fn join(shared: &Shared, mut from: usize) {
    loop {
        let (head, action) = {
            let mut eval = shared.borrow_mut();
            if eval.interrupted {
                return;
            }
            let Some(head) = eval.nodes[from].parent else {
                let resolver = eval.resolver.clone();
                let Some(result) = eval.nodes[from].slot.take() else {
                    return;
                };
                drop(eval);
                resolver(result);
                return;
            };
            if eval.nodes[head].settled {
                return;
            }

            let action = match eval.nodes[head].kind.shape() {
                Shape::Map(f) => match eval.nodes[from].slot.take() {
                    Some(Ok(value)) => Action::Map(f, value),
                    Some(Err(error)) => {
                        eval.nodes[head].settle(Err(error));
                        Action::Climb
                    }
                    None => return,
                },
                Shape::Apply(l, r, f) => {
                    if let Some(error) = eval.nodes[from].error() {
                        let sibling = if from == l { r } else { l };
                        eval.nodes[head].settle(Err(error));
                        Action::KillSibling(sibling)
                    } else {
                        let ready = matches!(
                            (&eval.nodes[l].slot, &eval.nodes[r].slot),
                            (Some(Ok(_)), Some(Ok(_)))
                        );
                        if !ready {
                            return;
                        }
                        match (eval.nodes[l].take_value(), eval.nodes[r].take_value()) {
                            (Some(lv), Some(rv)) => Action::Zip(f, lv, rv),
                            _ => return,
                        }
                    }
                }
                Shape::Alt(l, r) => {
                    if let Some(value) = eval.nodes[from].take_value() {
                        let sibling = if from == l { r } else { l };
                        eval.nodes[head].settle(Ok(value));
                        Action::KillSibling(sibling)
                    } else {
                        // Both sides failed: the left one's error wins
                        match (eval.nodes[l].error(), eval.nodes[r].error()) {
                            (Some(left), Some(_)) => {
                                eval.nodes[head].settle(Err(left));
                                Action::Climb
                            }
                            _ => return,
                        }
                    }
                }
            };
            (head, action)
        };

        let result = match action {
            Action::Climb => None,
            Action::Map(f, value) => Some(guard(|| f(value))),
            Action::Zip(f, lv, rv) => Some(guard(|| f(lv, rv))),
            Action::KillSibling(sibling) => {
                if !kill_sibling(shared, sibling, head) {
                    return;
                }
                None
            }
        };

        if let Some(result) = result {
            let mut eval = shared.borrow_mut();
            // User code ran without the borrow; someone may have settled it
            if eval.interrupted || eval.nodes[head].settled {
                return;
            }
            eval.nodes[head].settle(result);
        }
        from = head;
    }
}

/// Kill the subtree under `sibling`. Returns true if that finished right
/// away and the caller should keep climbing from `head`; otherwise the
/// propagation resumes from `head` once the kill completes.
fn kill_sibling(shared: &Shared, sibling: usize, head: usize) -> bool {
    let id = {
        let mut eval = shared.borrow_mut();
        let id = eval.next_kill;
        eval.next_kill += 1;
        id
    };
    let in_flight = Rc::new(Cell::new(true));

    let (flag, resumed) = (in_flight.clone(), shared.clone());
    let subscriptions = kill_subtree(shared, sibling, Error::early_exit(), move || {
        resumed.borrow_mut().kills.remove(&id);
        if flag.get() {
            flag.set(false);
        } else {
            join(&resumed, head);
        }
    });

    if in_flight.get() {
        in_flight.set(false);
        shared.borrow_mut().kills.insert(id, subscriptions);
        false
    } else {
        true
    }
}

/// Kill every live leaf under `root`; `done` runs once all have completed
fn kill_subtree(
    shared: &Shared,
    root: usize,
    reason: Error,
    done: impl FnOnce() + 'static,
) -> Vec<Subscription> {
    let (runtime, fibers) = {
        let eval = shared.borrow();
        let mut fibers = Vec::new();
        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            match &eval.nodes[idx].kind {
                Kind::Leaf(Some(fiber)) => fibers.push(fiber.clone()),
                Kind::Leaf(None) => {}
                Kind::Map(_, child) => stack.push(*child),
                Kind::Apply(l, r, _) | Kind::Alt(l, r) => {
                    stack.push(*r);
                    stack.push(*l);
                }
            }
        }
        (eval.runtime.clone(), fibers)
    };

    if fibers.is_empty() {
        done();
        return Vec::new();
    }

    let remaining = Rc::new(Cell::new(fibers.len()));
    let done: Rc<RefCell<Option<Box<dyn FnOnce()>>>> =
        Rc::new(RefCell::new(Some(Box::new(done))));
    fibers
        .iter()
        .map(|fiber| {
            let (runtime, remaining, done) = (runtime.clone(), remaining.clone(), done.clone());
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

/* ===================== Cancellation ===================== */

/// Canceler for the whole block: stop joining, drop pending sibling kills
/// and kill every live leaf with the parent's kill reason
fn canceler(shared: Shared) -> Canceler {
    Canceler::new(move |reason| {
        Workflow::async_effect(move |resolver| {
            let pending = {
                let mut eval = shared.borrow_mut();
                eval.interrupted = true;
                std::mem::take(&mut eval.kills)
            };
            for subscription in pending.into_values().flatten() {
                subscription.cancel();
            }
            let subscriptions = kill_subtree(&shared, 0, reason.clone(), move || {
                resolver.succeed(())
            });
            Ok(Canceler::sync(move || {
                for subscription in subscriptions {
                    subscription.cancel();
                }
            }))
        })
    })
}
