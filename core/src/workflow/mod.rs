//! # Workflows
//!
//! A [`Workflow<T>`] is an immutable description of an effectful computation
//! producing a `T`. Building one performs no effects; it only runs once a
//! [`Runtime`](crate::Runtime) launches it as a fiber.
//!
//! ```
//! use strand_core::{Error, Outcome, Runtime, Workflow};
//!
//! let runtime = Runtime::default();
//! let wf = Workflow::pure(20)
//!     .and_then(|n| Workflow::effect(move || n + 1))
//!     .map(|n| n * 2)
//!     .catch(|_: Error| Workflow::pure(0));
//!
//! let fiber = runtime.launch(wf);
//! assert_eq!(fiber.outcome(), Some(Outcome::Succeeded(42)));
//! ```

pub(crate) mod instr;

use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::Error;
use crate::fiber::{Fiber, RawFiber};
use crate::par::Par;

pub(crate) use instr::{cast, erase, Dyn, ForkScope, Instr, Node, RawResolver, ReleaseHandlers, Use};

/* ===================== Workflow ===================== */

/// Immutable, structurally shared description of an effect
pub struct Workflow<T> {
    pub(crate) node: Node,
    _t: PhantomData<fn() -> T>,
}

impl<T> Clone for Workflow<T> {
    fn clone(&self) -> Self {
        Self::from_node(self.node.clone())
    }
}

impl<T> std::fmt::Debug for Workflow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Workflow({})", self.node.tag())
    }
}

impl<T> Workflow<T> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _t: PhantomData,
        }
    }

    fn instr(instr: Instr) -> Self {
        Self::from_node(Rc::new(instr))
    }
}

impl<T: Clone + 'static> Workflow<T> {
    /* ---------- Constructors ---------- */

    pub fn pure(value: T) -> Self {
        Self::instr(Instr::Pure(erase(value)))
    }

    pub fn throw(error: Error) -> Self {
        Self::instr(Instr::Throw(error))
    }

    /// Synchronous effect that may fail. Panics are captured as failures.
    pub fn sync(thunk: impl Fn() -> Result<T, Error> + 'static) -> Self {
        Self::instr(Instr::Sync(Rc::new(move || thunk().map(erase))))
    }

    /// Synchronous effect that cannot fail (except by panicking)
    pub fn effect(thunk: impl Fn() -> T + 'static) -> Self {
        Self::instr(Instr::Sync(Rc::new(move || Ok(erase(thunk())))))
    }

    /// Asynchronous effect.
    ///
    /// `register` receives a [`Resolver`] to call once the effect settles and
    /// returns the [`Canceler`] to use if the fiber is killed while waiting.
    /// Returning `Err` (or panicking) fails the effect immediately.
    pub fn async_effect(
        register: impl Fn(Resolver<T>) -> Result<Canceler, Error> + 'static,
    ) -> Self {
        Self::instr(Instr::Async(Rc::new(move |raw: RawResolver| {
            register(Resolver::from_raw(raw))
        })))
    }

    /// An effect that never resumes
    pub fn never() -> Self {
        Self::async_effect(|_| Ok(Canceler::none()))
    }

    /* ---------- Sequencing ---------- */

    pub fn and_then<U: Clone + 'static>(
        self,
        f: impl Fn(T) -> Workflow<U> + 'static,
    ) -> Workflow<U> {
        Workflow::instr(Instr::Bind(self.node, Rc::new(move |v| f(cast(v)).node)))
    }

    pub fn map<U: Clone + 'static>(self, f: impl Fn(T) -> U + 'static) -> Workflow<U> {
        Workflow::instr(Instr::Bind(
            self.node,
            Rc::new(move |v| Rc::new(Instr::Pure(erase(f(cast(v)))))),
        ))
    }

    /// Run `self`, discard its value, then run `next`
    pub fn then<U: Clone + 'static>(self, next: Workflow<U>) -> Workflow<U> {
        Workflow::instr(Instr::Then(self.node, next.node))
    }

    pub fn void(self) -> Workflow<()> {
        self.map(|_| ())
    }

    /* ---------- Errors ---------- */

    /// Intercept raised failures. Interrupts pass through untouched.
    pub fn catch(self, handler: impl Fn(Error) -> Workflow<T> + 'static) -> Self {
        Self::instr(Instr::Catch(self.node, Rc::new(move |e| handler(e).node)))
    }

    /// Reify a raised failure as a value
    pub fn attempt(self) -> Workflow<Result<T, Error>> {
        self.map(Ok).catch(|e| Workflow::pure(Err(e)))
    }

    /* ---------- Resources ---------- */

    /// Acquire with `self`, run `use_fn`, and always run `release`.
    ///
    /// Acquisition and release are protected: a kill arriving meanwhile is
    /// deferred until they finish.
    pub fn bracket<B: Clone + 'static>(
        self,
        release: impl Fn(T) -> Workflow<()> + 'static,
        use_fn: impl Fn(T) -> Workflow<B> + 'static,
    ) -> Workflow<B> {
        self.general_bracket(BracketConditions::uniform(release), use_fn)
    }

    /// Bracket with a separate release handler per outcome of `use_fn`
    pub fn general_bracket<B: Clone + 'static>(
        self,
        conditions: BracketConditions<T, B>,
        use_fn: impl Fn(T) -> Workflow<B> + 'static,
    ) -> Workflow<B> {
        self.bracket_with(
            conditions,
            Use::With(Rc::new(move |r| use_fn(cast(r)).node)),
        )
    }

    fn bracket_with<B: Clone + 'static>(
        self,
        conditions: BracketConditions<T, B>,
        use_fn: Use,
    ) -> Workflow<B> {
        let BracketConditions {
            killed,
            failed,
            completed,
            ..
        } = conditions;
        let release = ReleaseHandlers {
            killed: Rc::new(move |e, r| killed(e, cast(r)).node),
            failed: Rc::new(move |e, r| failed(e, cast(r)).node),
            completed: Rc::new(move |v, r| completed(cast(v), cast(r)).node),
        };
        Workflow::instr(Instr::Bracket {
            acquire: self.node,
            release: Rc::new(release),
            use_fn,
        })
    }

    /// Run `finalizer` after `self` whatever the outcome
    pub fn finally(self, finalizer: Workflow<()>) -> Self {
        Workflow::pure(()).bracket_with(
            BracketConditions::uniform(move |_| finalizer.clone()),
            Use::Run(self.node),
        )
    }

    /// Make `self` uninterruptible: a kill waits for it to finish
    pub fn invincible(self) -> Self {
        self.bracket(|_| Workflow::pure(()), Workflow::pure)
    }

    /* ---------- Concurrency ---------- */

    /// Fork `self` into a sibling fiber that starts running immediately
    pub fn fork(self) -> Workflow<Fiber<T>> {
        self.fork_with(true, ForkScope::Inherit)
    }

    /// Fork `self` into a sibling fiber that only starts once joined or run
    pub fn suspend(self) -> Workflow<Fiber<T>> {
        self.fork_with(false, ForkScope::Inherit)
    }

    fn fork_with(self, immediate: bool, scope: ForkScope) -> Workflow<Fiber<T>> {
        Workflow::<RawFiber>::instr(Instr::Fork {
            immediate,
            scope,
            body: self.node,
        })
        .map(Fiber::from_raw)
    }

    /// Run `self` with a fresh supervisor. Every fiber it forks is killed
    /// once it finishes; if the scope itself is killed the children receive
    /// the same reason.
    pub fn supervise(self) -> Self {
        fn kill_children<T: Clone + 'static>(child: &Fiber<T>, reason: Error) -> Workflow<()> {
            match child.supervisor() {
                Some(supervisor) => supervisor.kill_all_workflow(reason),
                None => Workflow::pure(()),
            }
        }

        let conditions = BracketConditions::new(
            |reason: Error, child: Fiber<T>| {
                Par::new(child.kill(reason.clone()))
                    .zip(Par::new(kill_children(&child, reason)))
                    .sequential()
                    .void()
            },
            |_, child: Fiber<T>| kill_children(&child, Error::child_outlived_parent()),
            |_, child: Fiber<T>| kill_children(&child, Error::child_outlived_parent()),
        );
        self.fork_with(true, ForkScope::Isolated)
            .general_bracket(conditions, |child| child.join())
    }

    /// Lift into the parallel algebra
    pub fn parallel(self) -> Par<T> {
        Par::new(self)
    }

    /// Evaluate a parallel block
    pub fn sequential(par: Par<T>) -> Self {
        Self::instr(Instr::Par(par.node))
    }
}

/* ===================== Resolver ===================== */

/// Completion callback handed to an asynchronous effect's registration.
///
/// Only the first call after registration has any effect; later calls, and
/// calls made after the fiber was killed, are ignored.
pub struct Resolver<T> {
    raw: RawResolver,
    _t: PhantomData<fn(T)>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _t: PhantomData,
        }
    }
}

impl<T: 'static> Resolver<T> {
    pub(crate) fn from_raw(raw: RawResolver) -> Self {
        Self {
            raw,
            _t: PhantomData,
        }
    }

    pub fn resolve(&self, result: Result<T, Error>) {
        (self.raw)(result.map(erase));
    }

    pub fn succeed(&self, value: T) {
        self.resolve(Ok(value));
    }

    pub fn fail(&self, error: Error) {
        self.resolve(Err(error));
    }
}

/* ===================== Canceler ===================== */

/// Cancellation action returned by an asynchronous registration.
///
/// When a fiber is killed while waiting on the effect, the canceler is given
/// the kill reason and produces a workflow that runs as a protected
/// finalizer before the interrupt propagates.
#[derive(Default)]
pub struct Canceler(Option<Box<dyn FnOnce(Error) -> Node>>);

impl Canceler {
    /// Nothing to cancel
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new(f: impl FnOnce(Error) -> Workflow<()> + 'static) -> Self {
        Self(Some(Box::new(move |reason| f(reason).node)))
    }

    /// Cancel with a synchronous action
    pub fn sync(f: impl FnOnce() + 'static) -> Self {
        Self::new(move |_| {
            let cell = std::cell::Cell::new(Some(f));
            Workflow::effect(move || {
                if let Some(f) = cell.take() {
                    f();
                }
            })
        })
    }

    pub(crate) fn into_node(self, reason: Error) -> Option<Node> {
        self.0.map(|f| f(reason))
    }
}

impl std::fmt::Debug for Canceler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0.is_some() { "Canceler" } else { "Canceler(none)" })
    }
}

/* ===================== Bracket Conditions ===================== */

/// Release handlers of a general bracket over a resource `R` whose use
/// produces a `B`
pub struct BracketConditions<R, B> {
    killed: Rc<dyn Fn(Error, R) -> Workflow<()>>,
    failed: Rc<dyn Fn(Error, R) -> Workflow<()>>,
    completed: Rc<dyn Fn(B, R) -> Workflow<()>>,
    _t: PhantomData<fn(R, B)>,
}

impl<R: 'static, B: 'static> BracketConditions<R, B> {
    pub fn new(
        killed: impl Fn(Error, R) -> Workflow<()> + 'static,
        failed: impl Fn(Error, R) -> Workflow<()> + 'static,
        completed: impl Fn(B, R) -> Workflow<()> + 'static,
    ) -> Self {
        Self {
            killed: Rc::new(killed),
            failed: Rc::new(failed),
            completed: Rc::new(completed),
            _t: PhantomData,
        }
    }

    /// Same release whatever the outcome
    pub fn uniform(release: impl Fn(R) -> Workflow<()> + 'static) -> Self {
        let release = Rc::new(release);
        let (r1, r2, r3) = (release.clone(), release.clone(), release);
        Self::new(
            move |_, r| r1(r),
            move |_, r| r2(r),
            move |_, r| r3(r),
        )
    }
}
