//! # Parallel composition
//!
//! [`Par<T>`] is the applicative/alternative counterpart of [`Workflow<T>`].
//! A `Par` value only describes a static tree of branches; nothing runs until
//! [`Par::sequential`] turns it back into a workflow. Each leaf then runs in
//! its own fiber.
//!
//! ```
//! use strand_core::{Outcome, Par, Runtime, Workflow};
//!
//! let runtime = Runtime::default();
//! let both = Par::new(Workflow::pure(1))
//!     .zip_with(Par::new(Workflow::pure(2)), |a, b| a + b)
//!     .sequential();
//! assert_eq!(runtime.launch(both).outcome(), Some(Outcome::Succeeded(3)));
//! ```

pub(crate) mod eval;

#[cfg(test)]
mod tests;

use std::marker::PhantomData;
use std::rc::Rc;

use crate::workflow::instr::{ParInstr, ParNode};
use crate::workflow::{cast, erase, Workflow};

/// A parallel block producing a `T`
pub struct Par<T> {
    pub(crate) node: ParNode,
    _t: PhantomData<fn() -> T>,
}

impl<T> Clone for Par<T> {
    fn clone(&self) -> Self {
        Self::from_node(self.node.clone())
    }
}

impl<T> std::fmt::Debug for Par<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match &*self.node {
            ParInstr::Leaf(_) => "Leaf",
            ParInstr::Map(..) => "Map",
            ParInstr::Apply(..) => "Apply",
            ParInstr::Alt(..) => "Alt",
        };
        write!(f, "Par({tag})")
    }
}

impl<T> Par<T> {
    fn from_node(node: ParNode) -> Self {
        Self {
            node,
            _t: PhantomData,
        }
    }
}

impl<T: Clone + 'static> Par<T> {
    /// A single branch running `workflow`
    pub fn new(workflow: Workflow<T>) -> Self {
        Self::from_node(Rc::new(ParInstr::Leaf(workflow.node)))
    }

    pub fn map<U: Clone + 'static>(self, f: impl Fn(T) -> U + 'static) -> Par<U> {
        Par::from_node(Rc::new(ParInstr::Map(
            Rc::new(move |v| erase(f(cast(v)))),
            self.node,
        )))
    }

    /// Run both branches; fail as soon as either fails
    pub fn zip_with<U: Clone + 'static, V: Clone + 'static>(
        self,
        other: Par<U>,
        f: impl Fn(T, U) -> V + 'static,
    ) -> Par<V> {
        Par::from_node(Rc::new(ParInstr::Apply(
            self.node,
            other.node,
            Rc::new(move |a, b| erase(f(cast(a), cast(b)))),
        )))
    }

    pub fn zip<U: Clone + 'static>(self, other: Par<U>) -> Par<(T, U)> {
        self.zip_with(other, |a, b| (a, b))
    }

    /// Race both branches: the first success wins and the loser is killed.
    /// If both fail, the failure of `self` is raised.
    pub fn alt(self, other: Par<T>) -> Par<T> {
        Par::from_node(Rc::new(ParInstr::Alt(self.node, other.node)))
    }

    /// Run the block as a single workflow step
    pub fn sequential(self) -> Workflow<T> {
        Workflow::sequential(self)
    }
}

/* ===================== Combinators ===================== */

/// Run every workflow in parallel and collect the results in input order.
/// The first failure kills the remaining branches.
pub fn par_sequence<T: Clone + 'static>(workflows: Vec<Workflow<T>>) -> Workflow<Vec<T>> {
    let mut branches = workflows.into_iter();
    let Some(first) = branches.next() else {
        return Workflow::pure(Vec::new());
    };
    branches
        .fold(Par::new(first).map(|v| vec![v]), |acc, wf| {
            acc.zip_with(Par::new(wf), |mut values, v| {
                values.push(v);
                values
            })
        })
        .sequential()
}

/// Map every item to a workflow and run them in parallel
pub fn par_traverse<A, T: Clone + 'static>(
    items: impl IntoIterator<Item = A>,
    f: impl Fn(A) -> Workflow<T>,
) -> Workflow<Vec<T>> {
    par_sequence(items.into_iter().map(f).collect())
}

/// First workflow to succeed wins; the others are killed. When all fail the
/// first one's failure is raised. An empty race never completes.
pub fn race<T: Clone + 'static>(workflows: Vec<Workflow<T>>) -> Workflow<T> {
    let mut branches = workflows.into_iter();
    let Some(first) = branches.next() else {
        return Workflow::never();
    };
    branches
        .fold(Par::new(first), |acc, wf| acc.alt(Par::new(wf)))
        .sequential()
}
