//! Failure and outcome types
//!
//! A fiber ends in exactly one of three ways: a value, a raised failure, or an
//! interrupt. Raised failures and interrupts share the same [`Error`] payload
//! but are kept apart by [`Outcome`], since catch frames only see the former.

use serde::{Deserialize, Serialize};
use std::any::Any;

/* ===================== Error Codes ===================== */

pub mod codes {
    /// Generic raised failure
    pub const ERROR: &str = "Error";
    /// A panic captured from a synchronous effect, registration or continuation
    pub const PANIC: &str = "Panic";
    /// Default reason used when a fiber is killed without a specific error
    pub const KILLED: &str = "Killed";
    /// Used to cancel the losing side of a zip or race
    pub const EARLY_EXIT: &str = "EarlyExit";
    /// Used by `supervise` to kill fibers left running by a finished scope
    pub const CHILD_OUTLIVED_PARENT: &str = "ChildOutlivedParent";
    /// A host future ran past its deadline
    pub const TIMEOUT: &str = "Timeout";
}

/* ===================== Error ===================== */

/// Failure payload carried by raised errors and interrupts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Error {
    pub code: String,
    pub message: String,
}

impl Error {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Plain failure with the generic error code
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(codes::ERROR, message)
    }

    pub fn killed() -> Self {
        Self::new(codes::KILLED, "fiber killed")
    }

    pub(crate) fn early_exit() -> Self {
        Self::new(codes::EARLY_EXIT, "parallel branch exited early")
    }

    pub(crate) fn child_outlived_parent() -> Self {
        Self::new(codes::CHILD_OUTLIVED_PARENT, "child fiber outlived parent")
    }

    /// Convert a captured panic payload into a failure
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(codes::PANIC, message)
    }

    pub fn is_code(&self, code: &str) -> bool {
        self.code == code
    }
}

/// Run user code, turning a panic into a failure
pub(crate) fn guard<R>(f: impl FnOnce() -> R) -> Result<R, Error> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).map_err(Error::from_panic)
}

/* ===================== Outcome ===================== */

/// Final result of a fiber
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Succeeded(T),
    Failed(Error),
    Interrupted(Error),
}

impl<T> Outcome<T> {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Outcome::Interrupted(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Succeeded(v) => Outcome::Succeeded(f(v)),
            Outcome::Failed(e) => Outcome::Failed(e),
            Outcome::Interrupted(e) => Outcome::Interrupted(e),
        }
    }

    /// Collapse into a `Result`; interrupts become ordinary errors
    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Outcome::Succeeded(v) => Ok(v),
            Outcome::Failed(e) | Outcome::Interrupted(e) => Err(e),
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Outcome::Succeeded(_) => None,
            Outcome::Failed(e) | Outcome::Interrupted(e) => Some(e),
        }
    }
}
