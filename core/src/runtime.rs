//! Engine instance
//!
//! A [`Runtime`] owns the scheduler, the engine configuration and the
//! unhandled-error channel. Fibers keep a handle to the runtime that launched
//! them, so several isolated runtimes can live side by side.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, error};
use uuid::Uuid;

use crate::config::{Config, RuntimeConfig};
use crate::error::Error;
use crate::fiber::{Fiber, RawFiber};
use crate::scheduler::{Scheduler, SchedulerStats, Task};
use crate::workflow::Workflow;

/// Receives failures nobody handled
pub type UnhandledHook = Rc<dyn Fn(&Error)>;

pub(crate) struct RuntimeInner {
    id: Uuid,
    scheduler: Scheduler,
    config: RuntimeConfig,
    unhandled: RefCell<Option<UnhandledHook>>,
    next_fiber_id: Cell<u64>,
}

/// Cheaply cloneable handle to an engine instance
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    pub fn new(config: &Config) -> Self {
        let runtime = Self {
            inner: Rc::new(RuntimeInner {
                id: Uuid::new_v4(),
                scheduler: Scheduler::new(config.scheduler.capacity),
                config: config.runtime.clone(),
                unhandled: RefCell::new(None),
                next_fiber_id: Cell::new(0),
            }),
        };
        debug!(
            runtime = %runtime.id(),
            capacity = config.scheduler.capacity,
            "runtime created"
        );
        runtime
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Launch a workflow as a new fiber and run it to its first suspension
    pub fn launch<T: Clone + 'static>(&self, workflow: Workflow<T>) -> Fiber<T> {
        let fiber = self.launch_suspended(workflow);
        fiber.run();
        fiber
    }

    /// Create a fiber without starting it. It starts on `run` or `join`.
    pub fn launch_suspended<T: Clone + 'static>(&self, workflow: Workflow<T>) -> Fiber<T> {
        Fiber::from_raw(RawFiber::new(self.clone(), None, workflow.node))
    }

    /// Queue a task on this runtime's scheduler
    pub fn enqueue(&self, task: impl FnOnce() + 'static) {
        self.inner.scheduler.enqueue(Box::new(task) as Task);
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats()
    }

    /// Replace the unhandled-error hook (default: log with `tracing::error!`)
    pub fn set_unhandled_hook(&self, hook: impl Fn(&Error) + 'static) {
        *self.inner.unhandled.borrow_mut() = Some(Rc::new(hook));
    }

    pub(crate) fn next_fiber_id(&self) -> u64 {
        let id = self.inner.next_fiber_id.get();
        self.inner.next_fiber_id.set(id + 1);
        id
    }

    /// Surface an unhandled failure on the host channel
    pub(crate) fn report_unhandled(&self, err: &Error) {
        if !self.inner.config.report_unhandled {
            return;
        }
        let hook = self.inner.unhandled.borrow().clone();
        match hook {
            Some(hook) => hook(err),
            None => error!(runtime = %self.id(), code = %err.code, "unhandled failure: {}", err.message),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.inner.id)
            .field("capacity", &self.inner.scheduler.capacity())
            .finish()
    }
}
