pub mod bench;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod fiber;
pub mod host;
pub mod logging;
pub mod par;
pub mod runtime;
pub mod scheduler;
pub mod supervisor;
pub mod workflow;

#[cfg(test)]
mod test_helpers;

// Re-export main types
pub use clock::VirtualClock;
pub use config::Config;
pub use error::{codes, Error, Outcome};
pub use fiber::{Fiber, Status, Subscription};
pub use par::{par_sequence, par_traverse, race, Par};
pub use runtime::Runtime;
pub use supervisor::Supervisor;
pub use workflow::{BracketConditions, Canceler, Resolver, Workflow};
