//! Tokio host bindings
//!
//! The engine itself is a single-threaded, `!Send` callback machine. This
//! module wires it to a tokio current-thread runtime: host timers and futures
//! become asynchronous effects, and a launched workflow can be awaited.
//! Everything here must run inside a [`tokio::task::LocalSet`].

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;

use crate::error::{codes, Error, Outcome};
use crate::par::race;
use crate::runtime::Runtime;
use crate::workflow::{Canceler, Workflow};

/// Resume after `duration` of wall-clock time
pub fn sleep(duration: Duration) -> Workflow<()> {
    Workflow::async_effect(move |resolver| {
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(duration).await;
            resolver.succeed(());
        });
        Ok(Canceler::sync(move || handle.abort()))
    })
}

/// Run a host future as an asynchronous effect.
///
/// `make` is called each time the workflow runs. Killing the waiting fiber
/// drops the future.
pub fn from_future<T, F, Fut>(make: F) -> Workflow<T>
where
    T: Clone + 'static,
    F: Fn() -> Fut + 'static,
    Fut: Future<Output = Result<T, Error>> + 'static,
{
    Workflow::async_effect(move |resolver| {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let future = make();
        tokio::task::spawn_local(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                result = future => resolver.resolve(result),
            }
        });
        Ok(Canceler::sync(move || token.cancel()))
    })
}

/// Fail with a timeout error unless `workflow` finishes within `duration`.
/// An earlier failure of `workflow` is raised right away.
pub fn timeout<T: Clone + 'static>(workflow: Workflow<T>, duration: Duration) -> Workflow<T> {
    let expired = sleep(duration).map(move |_| -> Result<T, Error> {
        Err(Error::new(
            codes::TIMEOUT,
            format!("timed out after {}ms", duration.as_millis()),
        ))
    });
    race(vec![workflow.attempt(), expired]).and_then(|result| match result {
        Ok(value) => Workflow::pure(value),
        Err(error) => Workflow::throw(error),
    })
}

/// Launch `workflow` and wait for its outcome
pub async fn run<T: Clone + 'static>(runtime: &Runtime, workflow: Workflow<T>) -> Outcome<T> {
    let (tx, rx) = oneshot::channel();
    let fiber = runtime.launch_suspended(workflow);
    let subscription = fiber.join_with(move |outcome| {
        let _ = tx.send(outcome);
    });
    match rx.await {
        Ok(outcome) => outcome,
        Err(_) => {
            subscription.cancel();
            Outcome::Interrupted(Error::new(codes::KILLED, "fiber dropped before completing"))
        }
    }
}

/// Build a current-thread tokio runtime and drive `workflow` to completion
pub fn block_on<T: Clone + 'static>(runtime: &Runtime, workflow: Workflow<T>) -> Result<Outcome<T>> {
    let host = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let local = LocalSet::new();
    Ok(local.block_on(&host, run(runtime, workflow)))
}
