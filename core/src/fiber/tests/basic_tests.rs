//! Sequencing, failures and asynchronous steps

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::{Config, SchedulerConfig};
use crate::error::codes;
use crate::test_helpers::{bump, counter, log, record, runtime, unhandled};
use crate::{Canceler, Error, Outcome, Resolver, Runtime, Workflow};

#[test]
fn test_pure_value() {
    let fiber = runtime().launch(Workflow::pure(42));
    assert_eq!(fiber.outcome(), Some(Outcome::Succeeded(42)));
    assert!(fiber.is_completed());
}

#[test]
fn test_binds_run_in_order() {
    let events = log();
    let wf = record(&events, "first")
        .then(record(&events, "second"))
        .and_then({
            let events = events.clone();
            move |_| record(&events, "third").map(|_| 3)
        })
        .map(|n| n * 10);

    let fiber = runtime().launch(wf);
    assert_eq!(fiber.outcome(), Some(Outcome::Succeeded(30)));
    assert_eq!(*events.borrow(), vec!["first", "second", "third"]);
}

#[test]
fn test_throw_skips_binds_until_catch() {
    let skipped = counter();
    let wf = Workflow::<i32>::throw(Error::msg("boom"))
        .and_then({
            let skipped = skipped.clone();
            move |n| bump(&skipped).map(move |_| n)
        })
        .catch(|e| Workflow::pure(if e.message == "boom" { 7 } else { 0 }))
        .map(|n| n + 1);

    let fiber = runtime().launch(wf);
    assert_eq!(fiber.outcome(), Some(Outcome::Succeeded(8)));
    assert_eq!(skipped.get(), 0);
}

#[test]
fn test_catch_ignores_success() {
    let handled = counter();
    let h = handled.clone();
    let wf = Workflow::pure(1).catch(move |_| {
        h.set(h.get() + 1);
        Workflow::pure(2)
    });
    assert_eq!(runtime().launch(wf).outcome(), Some(Outcome::Succeeded(1)));
    assert_eq!(handled.get(), 0);
}

#[test]
fn test_sync_failure_and_attempt() {
    let failing = Workflow::<i32>::sync(|| Err(Error::new("Io", "disk full")));
    let fiber = runtime().launch(failing.clone());
    assert_eq!(
        fiber.outcome(),
        Some(Outcome::Failed(Error::new("Io", "disk full")))
    );

    let fiber = runtime().launch(failing.attempt());
    assert_eq!(
        fiber.outcome(),
        Some(Outcome::Succeeded(Err(Error::new("Io", "disk full"))))
    );
}

#[test]
fn test_panics_become_failures() {
    let in_effect = Workflow::<i32>::effect(|| panic!("effect exploded"));
    match runtime().launch(in_effect).outcome() {
        Some(Outcome::Failed(e)) => {
            assert!(e.is_code(codes::PANIC));
            assert_eq!(e.message, "effect exploded");
        }
        other => panic!("expected a panic failure, got {:?}", other),
    }

    let in_bind = Workflow::pure(1).and_then(|_| -> Workflow<i32> { panic!("bind exploded") });
    let recovered = in_bind.catch(|e| Workflow::pure(if e.is_code(codes::PANIC) { -1 } else { 0 }));
    assert_eq!(
        runtime().launch(recovered).outcome(),
        Some(Outcome::Succeeded(-1))
    );
}

#[test]
fn test_building_is_pure_and_workflows_are_reusable() {
    let hits = counter();
    let wf = bump(&hits).then(bump(&hits));
    assert_eq!(hits.get(), 0);

    let runtime = runtime();
    runtime.launch(wf.clone());
    runtime.launch(wf);
    assert_eq!(hits.get(), 4);
}

#[test]
fn test_deep_bind_chains_use_constant_stack() {
    // Left-nested: every bind is on the stack before the first value arrives
    let mut left = Workflow::pure(0u64);
    for _ in 0..100_000 {
        left = left.map(|n| n + 1);
    }
    assert_eq!(
        runtime().launch(left).outcome(),
        Some(Outcome::Succeeded(100_000))
    );

    // Right-nested: each continuation builds the next step lazily
    fn count(n: u64) -> Workflow<u64> {
        if n == 0 {
            return Workflow::pure(0);
        }
        Workflow::effect(move || n - 1).and_then(|m| count(m).map(|k| k + 1))
    }
    assert_eq!(
        runtime().launch(count(100_000)).outcome(),
        Some(Outcome::Succeeded(100_000))
    );
}

#[test]
fn test_prebuilt_then_chain_runs_twice_and_drops_flat() {
    let ran = counter();
    let chain = (0..200_000).fold(Workflow::pure(()), |acc, _| bump(&ran).then(acc));

    let runtime = runtime();
    let first = runtime.launch(chain.clone());
    let second = runtime.launch(chain.clone());
    assert!(first.outcome().unwrap().is_succeeded());
    assert!(second.outcome().unwrap().is_succeeded());
    assert_eq!(ran.get(), 400_000);

    drop(first);
    drop(second);
    drop(chain);
}

#[test]
fn test_killed_then_chain_drops_flat() {
    let ran = counter();
    let chain = (0..200_000).fold(Workflow::<()>::never(), |acc, _| bump(&ran).then(acc));

    let fiber = runtime().launch(chain.clone());
    assert_eq!(ran.get(), 200_000);
    drop(chain);
    let _sub = fiber.kill_with(Error::killed(), |_| {});
    assert!(fiber.outcome().unwrap().is_interrupted());
    drop(fiber);
}

#[test]
fn test_deeply_nested_finally() {
    let finalized = counter();
    let wf = (0..50_000).fold(Workflow::pure(7), |acc, _| acc.finally(bump(&finalized)));
    let fiber = runtime().launch(wf.clone());

    assert_eq!(fiber.outcome(), Some(Outcome::Succeeded(7)));
    assert_eq!(finalized.get(), 50_000);
    drop(wf);
}

#[test]
fn test_many_async_steps_with_a_tiny_scheduler() {
    let runtime = Runtime::new(&Config {
        scheduler: SchedulerConfig { capacity: 2 },
        ..Config::default()
    });
    fn tick(n: u32) -> Workflow<u32> {
        if n == 0 {
            return Workflow::pure(0);
        }
        Workflow::async_effect(|resolver: Resolver<()>| {
            resolver.succeed(());
            Ok(Canceler::none())
        })
        .and_then(move |_| tick(n - 1).map(|k| k + 1))
    }
    let fiber = runtime.launch(tick(50_000));
    assert_eq!(fiber.outcome(), Some(Outcome::Succeeded(50_000)));
    assert!(runtime.stats().executed >= 50_000);
}

#[test]
fn test_async_resolves_once() {
    let stored: Rc<RefCell<Option<Resolver<i32>>>> = Rc::new(RefCell::new(None));
    let s = stored.clone();
    let wf = Workflow::async_effect(move |resolver| {
        *s.borrow_mut() = Some(resolver);
        Ok(Canceler::none())
    });

    let fiber = runtime().launch(wf);
    assert_eq!(fiber.outcome(), None);

    let resolver = stored.borrow_mut().take().unwrap();
    resolver.succeed(1);
    resolver.succeed(2);
    resolver.fail(Error::msg("late"));
    assert_eq!(fiber.outcome(), Some(Outcome::Succeeded(1)));
}

#[test]
fn test_failed_registration_fails_the_step() {
    let refused = Workflow::<i32>::async_effect(|_| Err(Error::msg("refused")));
    assert_eq!(
        runtime().launch(refused).outcome(),
        Some(Outcome::Failed(Error::msg("refused")))
    );

    let panicked = Workflow::<i32>::async_effect(|_| panic!("register exploded"));
    let outcome = runtime().launch(panicked).outcome();
    assert!(matches!(outcome, Some(Outcome::Failed(e)) if e.is_code(codes::PANIC)));
}

#[test]
fn test_unhandled_failures_are_reported_once() {
    let runtime = runtime();
    let seen = unhandled(&runtime);

    runtime.launch(Workflow::<()>::throw(Error::msg("lost")));
    assert_eq!(*seen.borrow(), vec![Error::msg("lost")]);

    // A join handles the failure
    let fiber = runtime.launch_suspended(Workflow::<()>::throw(Error::msg("joined")));
    let _sub = fiber.join_with(|_| {});
    assert_eq!(seen.borrow().len(), 1);

    // Successes and interrupts are never reported
    runtime.launch(Workflow::pure(()));
    let never = runtime.launch(Workflow::<()>::never());
    let _kill = never.kill_with(Error::killed(), |_| {});
    assert_eq!(seen.borrow().len(), 1);
}

#[test]
fn test_finally_runs_on_every_outcome() {
    let events = log();
    let ok = Workflow::pure(1).finally(record(&events, "after ok"));
    let failed = Workflow::<i32>::throw(Error::msg("x")).finally(record(&events, "after failure"));

    let runtime = runtime();
    assert_eq!(runtime.launch(ok).outcome(), Some(Outcome::Succeeded(1)));
    assert_eq!(
        runtime.launch(failed).outcome(),
        Some(Outcome::Failed(Error::msg("x")))
    );
    assert_eq!(*events.borrow(), vec!["after ok", "after failure"]);
}
