//! Shared fixtures for unit tests

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Once;

use crate::error::Error;
use crate::runtime::Runtime;
use crate::workflow::Workflow;

static LOGGING: Once = Once::new();

/// Route engine traces to the test harness. `RUST_LOG=strand_core=trace`
/// shows every transition.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Fresh runtime with test logging installed
pub fn runtime() -> Runtime {
    init_test_logging();
    Runtime::default()
}

pub fn counter() -> Rc<Cell<usize>> {
    Rc::new(Cell::new(0))
}

/// Effect incrementing `c`
pub fn bump(c: &Rc<Cell<usize>>) -> Workflow<()> {
    let c = c.clone();
    Workflow::effect(move || c.set(c.get() + 1))
}

/// Shared event log
pub type Log = Rc<RefCell<Vec<String>>>;

pub fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

/// Effect appending `entry` to `log`
pub fn record(log: &Log, entry: &str) -> Workflow<()> {
    let (log, entry) = (log.clone(), entry.to_string());
    Workflow::effect(move || log.borrow_mut().push(entry.clone()))
}

/// Collect unhandled failures reported by `runtime`
pub fn unhandled(runtime: &Runtime) -> Rc<RefCell<Vec<Error>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let s = seen.clone();
    runtime.set_unhandled_hook(move |e| s.borrow_mut().push(e.clone()));
    seen
}
