use crate::clock::VirtualClock;
use crate::error::codes;
use crate::test_helpers::{log, record, runtime, unhandled, Log};
use crate::{par_sequence, par_traverse, race, Canceler, Error, Outcome, Par, Workflow};

/// Never completes on its own; records the kill reason's code
fn watched<T: Clone + 'static>(events: &Log, name: &str) -> Workflow<T> {
    let (events, name) = (events.clone(), name.to_string());
    Workflow::async_effect(move |_| {
        let (events, name) = (events.clone(), name.clone());
        Ok(Canceler::new(move |reason| {
            events.borrow_mut().push(format!("{} {}", name, reason.code));
            Workflow::pure(())
        }))
    })
}

#[test]
fn test_zip_keeps_argument_order() {
    let clock = VirtualClock::new();
    let wf = Par::new(clock.after(20, "left"))
        .zip(Par::new(clock.after(10, "right")))
        .sequential();
    let fiber = runtime().launch(wf);

    clock.advance(10);
    assert_eq!(fiber.outcome(), None);
    clock.advance(10);
    assert_eq!(fiber.outcome(), Some(Outcome::Succeeded(("left", "right"))));
}

#[test]
fn test_synchronous_branches_complete_immediately() {
    let wf = Par::new(Workflow::pure(2))
        .zip_with(Par::new(Workflow::effect(|| 3)), |a, b| a * b)
        .sequential();
    assert_eq!(runtime().launch(wf).outcome(), Some(Outcome::Succeeded(6)));
}

#[test]
fn test_zip_failure_kills_the_other_branch() {
    let clock = VirtualClock::new();
    let events = log();
    let wf = Par::new(clock.fail_after::<i32>(5, Error::msg("left failed")))
        .zip(Par::new(watched::<i32>(&events, "right")))
        .sequential();
    let fiber = runtime().launch(wf);

    clock.advance(5);
    assert_eq!(fiber.outcome(), Some(Outcome::Failed(Error::msg("left failed"))));
    assert_eq!(*events.borrow(), vec![format!("right {}", codes::EARLY_EXIT)]);
    assert_eq!(clock.pending(), 0);
}

#[test]
fn test_zip_waits_for_the_killed_branch_to_unwind() {
    let clock = VirtualClock::new();
    let events = log();
    let c = clock.clone();
    let e = events.clone();
    let slow = Workflow::pure(()).bracket(
        move |_| c.delay(10).then(record(&e, "released")),
        {
            let clock = clock.clone();
            move |_| clock.delay(100)
        },
    );
    let wf = Par::new(clock.fail_after::<()>(5, Error::msg("boom")))
        .zip(Par::new(slow))
        .sequential()
        .attempt();
    let fiber = runtime().launch(wf);

    clock.advance(5);
    assert_eq!(fiber.outcome(), None);
    clock.advance(10);
    assert_eq!(*events.borrow(), vec!["released"]);
    assert_eq!(fiber.outcome(), Some(Outcome::Succeeded(Err(Error::msg("boom")))));
}

#[test]
fn test_race_takes_the_first_success() {
    let clock = VirtualClock::new();
    let runtime = runtime();
    let fast_right = runtime.launch(race(vec![clock.after(10, "slow"), clock.after(5, "fast")]));
    let fast_left = runtime.launch(race(vec![clock.after(5, "fast"), clock.after(10, "slow")]));

    clock.advance(5);
    assert_eq!(fast_right.outcome(), Some(Outcome::Succeeded("fast")));
    assert_eq!(fast_left.outcome(), Some(Outcome::Succeeded("fast")));
    assert_eq!(clock.pending(), 0);
}

#[test]
fn test_race_loser_is_killed_with_early_exit() {
    let clock = VirtualClock::new();
    let events = log();
    let wf = Par::new(watched::<i32>(&events, "loser"))
        .alt(Par::new(clock.after(3, 1)))
        .sequential();
    let fiber = runtime().launch(wf);

    clock.advance(3);
    assert_eq!(fiber.outcome(), Some(Outcome::Succeeded(1)));
    assert_eq!(*events.borrow(), vec![format!("loser {}", codes::EARLY_EXIT)]);
}

#[test]
fn test_race_ignores_a_single_failure() {
    let clock = VirtualClock::new();
    let wf = race(vec![
        clock.fail_after(1, Error::msg("early failure")),
        clock.after(5, 3),
    ]);
    let fiber = runtime().launch(wf);

    clock.advance(1);
    assert_eq!(fiber.outcome(), None);
    clock.advance(4);
    assert_eq!(fiber.outcome(), Some(Outcome::Succeeded(3)));
}

#[test]
fn test_race_of_failures_raises_the_left_error() {
    let clock = VirtualClock::new();
    let wf = race::<()>(vec![
        clock.fail_after(5, Error::msg("left")),
        clock.fail_after(1, Error::msg("right")),
    ]);
    let fiber = runtime().launch(wf);

    clock.run_until_idle();
    assert_eq!(fiber.outcome(), Some(Outcome::Failed(Error::msg("left"))));
}

#[test]
fn test_par_sequence_collects_in_input_order() {
    let clock = VirtualClock::new();
    let wf = par_sequence(vec![
        clock.after(30, 'a'),
        clock.after(10, 'b'),
        clock.after(20, 'c'),
    ]);
    let fiber = runtime().launch(wf);

    clock.run_until_idle();
    assert_eq!(fiber.outcome(), Some(Outcome::Succeeded(vec!['a', 'b', 'c'])));
    // Branches ran concurrently
    assert_eq!(clock.now(), 30);
}

#[test]
fn test_par_traverse_maps_then_runs() {
    let clock = VirtualClock::new();
    let c = clock.clone();
    let wf = par_traverse(1..=4u64, move |n| c.after(10 * (5 - n), n * n));
    let fiber = runtime().launch(wf);

    clock.run_until_idle();
    assert_eq!(fiber.outcome(), Some(Outcome::Succeeded(vec![1, 4, 9, 16])));
}

#[test]
fn test_empty_inputs() {
    let runtime = runtime();
    let none = runtime.launch(par_sequence::<i32>(Vec::new()));
    assert_eq!(none.outcome(), Some(Outcome::Succeeded(Vec::new())));

    let empty_race = runtime.launch(race::<i32>(Vec::new()));
    assert_eq!(empty_race.outcome(), None);
    let _sub = empty_race.kill_with(Error::killed(), |_| {});
    assert!(empty_race.outcome().unwrap().is_interrupted());
}

#[test]
fn test_killing_the_parent_kills_every_leaf() {
    let events = log();
    let wf = par_sequence(vec![
        watched::<u8>(&events, "a"),
        watched::<u8>(&events, "b"),
        watched::<u8>(&events, "c"),
    ]);
    let fiber = runtime().launch(wf);
    assert_eq!(fiber.outcome(), None);

    let reason = Error::new("Shutdown", "stop");
    let _sub = fiber.kill_with(reason.clone(), |_| {});

    assert_eq!(*events.borrow(), vec!["a Shutdown", "b Shutdown", "c Shutdown"]);
    assert_eq!(fiber.outcome(), Some(Outcome::Interrupted(reason)));
}

#[test]
fn test_map_identity() {
    let clock = VirtualClock::new();
    let runtime = runtime();
    let plain = runtime.launch(clock.after(5, 42));
    let mapped = runtime.launch(Par::new(clock.after(5, 42)).map(|x| x).sequential());

    clock.advance(5);
    assert_eq!(plain.outcome(), mapped.outcome());
}

#[test]
fn test_panic_in_map_fails_the_block() {
    let wf = Par::new(Workflow::pure(1))
        .map(|n: i32| -> i32 {
            if n == 1 {
                panic!("bad map");
            }
            n
        })
        .sequential();
    let fiber = runtime().launch(wf);
    match fiber.outcome() {
        Some(Outcome::Failed(e)) => {
            assert!(e.is_code(codes::PANIC));
            assert!(e.message.contains("bad map"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_branch_failures_are_not_reported_twice() {
    let runtime = runtime();
    let seen = unhandled(&runtime);
    let wf = Par::new(Workflow::<i32>::throw(Error::msg("branch")))
        .zip(Par::new(Workflow::pure(1)))
        .sequential()
        .attempt();
    let fiber = runtime.launch(wf);

    assert_eq!(
        fiber.outcome(),
        Some(Outcome::Succeeded(Err(Error::msg("branch"))))
    );
    assert!(seen.borrow().is_empty());
}

#[test]
fn test_nested_blocks() {
    let clock = VirtualClock::new();
    let events = log();
    let inner = Par::new(watched::<i32>(&events, "inner"))
        .alt(Par::new(clock.after(2, 10)));
    let wf = inner
        .zip_with(Par::new(clock.after(4, 5)), |a, b| a + b)
        .sequential();
    let fiber = runtime().launch(wf);

    clock.advance(2);
    assert_eq!(*events.borrow(), vec![format!("inner {}", codes::EARLY_EXIT)]);
    clock.advance(2);
    assert_eq!(fiber.outcome(), Some(Outcome::Succeeded(15)));
}

/// Counts how often it is cloned
struct Tracked(std::rc::Rc<std::cell::Cell<usize>>);

impl Clone for Tracked {
    fn clone(&self) -> Self {
        self.0.set(self.0.get() + 1);
        Tracked(self.0.clone())
    }
}

#[test]
fn test_wide_par_sequence_does_not_copy_the_accumulator() {
    const WIDTH: usize = 500;
    let clones = crate::test_helpers::counter();
    let branches = (0..WIDTH)
        .map(|_| Workflow::pure(Tracked(clones.clone())))
        .collect();
    let fiber = runtime().launch(par_sequence(branches));

    let values = match fiber.outcome() {
        Some(Outcome::Succeeded(values)) => values,
        _ => panic!("par_sequence did not succeed"),
    };
    assert_eq!(values.len(), WIDTH);
    // A constant number of copies per branch, not one per accumulated element
    assert!(clones.get() <= 3 * WIDTH, "{} clones", clones.get());
}
