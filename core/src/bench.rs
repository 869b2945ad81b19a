use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

use crate::clock::VirtualClock;
use crate::config::Config;
use crate::error::Outcome;
use crate::fiber::Fiber;
use crate::par::{par_sequence, race};
use crate::runtime::Runtime;
use crate::scheduler::SchedulerStats;
use crate::workflow::Workflow;

pub struct BenchmarkParams {
    /// Length of the bind chain
    pub depth: usize,
    /// Fibers forked and joined
    pub fibers: usize,
    /// Branches of the parallel and race scenarios
    pub width: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub size: usize,
    pub elapsed_ms: f64,
    pub outcome: String,
    pub scheduler: SchedulerStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub capacity: usize,
    pub scenarios: Vec<ScenarioReport>,
}

pub fn run_benchmark(config: &Config, params: &BenchmarkParams) -> Result<BenchmarkReport> {
    validate_params(params)?;
    let started_at = Utc::now();

    let scenarios = vec![
        measure(config, "bind_chain", params.depth, || bind_chain(params.depth))?,
        measure(config, "fork_join", params.fibers, || fork_join(params.fibers))?,
        measure(config, "par_sequence", params.width, || par_width(params.width))?,
        measure(config, "race_cancel", params.width, || race_cancel(params.width))?,
    ];

    Ok(BenchmarkReport {
        started_at,
        finished_at: Utc::now(),
        capacity: config.scheduler.capacity,
        scenarios,
    })
}

fn validate_params(params: &BenchmarkParams) -> Result<()> {
    if params.depth == 0 || params.fibers == 0 || params.width == 0 {
        return Err(anyhow!("--depth, --fibers and --width must all be at least 1"));
    }
    Ok(())
}

/// Run one scenario on a fresh runtime
fn measure(
    config: &Config,
    name: &str,
    size: usize,
    scenario: impl FnOnce() -> Workflow<usize>,
) -> Result<ScenarioReport> {
    let runtime = Runtime::new(config);
    let run_id = Uuid::new_v4();
    tracing::debug!(%run_id, scenario = name, size, "benchmark scenario started");

    let start = Instant::now();
    let fiber = runtime.launch(scenario());
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let outcome = match fiber.outcome() {
        Some(Outcome::Succeeded(n)) if n == size => "ok".to_string(),
        Some(Outcome::Succeeded(n)) => {
            return Err(anyhow!("{}: expected {} but got {}", name, size, n));
        }
        Some(Outcome::Failed(e)) | Some(Outcome::Interrupted(e)) => {
            return Err(anyhow!("{}: {}", name, e));
        }
        None => return Err(anyhow!("{}: did not complete", name)),
    };

    Ok(ScenarioReport {
        name: name.to_string(),
        size,
        elapsed_ms,
        outcome,
        scheduler: runtime.stats(),
    })
}

/* ===================== Scenarios ===================== */

/// A chain of `depth` effects, each bound to the next
fn bind_chain(depth: usize) -> Workflow<usize> {
    fn step(n: usize, depth: usize) -> Workflow<usize> {
        if n == depth {
            return Workflow::pure(n);
        }
        Workflow::effect(move || n + 1).and_then(move |next| step(next, depth))
    }
    step(0, depth)
}

/// Fork `count` fibers, then join them all
fn fork_join(count: usize) -> Workflow<usize> {
    let forks: Vec<Workflow<Fiber<usize>>> = (0..count)
        .map(|_| Workflow::effect(|| 1usize).fork())
        .collect();
    collect(forks).and_then(|fibers| {
        let joins = fibers.into_iter().map(|f| f.join()).collect();
        collect(joins).map(|ones: Vec<usize>| ones.into_iter().sum())
    })
}

/// Sequence workflows one after the other
fn collect<T: Clone + 'static>(workflows: Vec<Workflow<T>>) -> Workflow<Vec<T>> {
    workflows
        .into_iter()
        .fold(Workflow::pure(Vec::new()), |acc, wf| {
            acc.and_then(move |values| {
                wf.clone().map(move |v| {
                    let mut values = values.clone();
                    values.push(v);
                    values
                })
            })
        })
}

fn par_width(width: usize) -> Workflow<usize> {
    par_sequence((0..width).map(|_| Workflow::effect(|| 1usize)).collect())
        .map(|ones| ones.into_iter().sum())
}

/// Race `width` timers; the winner's completion kills every other branch
fn race_cancel(width: usize) -> Workflow<usize> {
    let clock = VirtualClock::new();
    let branches = (0..width)
        .map(|i| clock.after((i as u64) + 1, width))
        .collect();
    // Fire the first timer once every branch is waiting
    let tick = Workflow::effect(move || {
        clock.advance(1);
    });
    race(branches)
        .fork()
        .and_then(move |fiber| tick.clone().then(fiber.join()))
}

pub fn display_report(report: &BenchmarkReport) {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("📊 Strand Benchmark Results");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("   Scheduler capacity: {}", report.capacity);
    println!();
    for scenario in &report.scenarios {
        println!(
            "   {:<14} n={:<8} {:>10.2}ms  tasks={:<8} forced_drains={:<4} {}",
            scenario.name,
            scenario.size,
            scenario.elapsed_ms,
            scenario.scheduler.executed,
            scenario.scheduler.forced_drains,
            scenario.outcome
        );
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_benchmark_completes() {
        let params = BenchmarkParams {
            depth: 1_000,
            fibers: 20,
            width: 16,
        };
        let mut config = Config::default();
        config.scheduler.capacity = 8;
        let report = run_benchmark(&config, &params).unwrap();
        assert_eq!(report.scenarios.len(), 4);
        assert!(report.scenarios.iter().all(|s| s.outcome == "ok"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["capacity"], 8);
        assert_eq!(json["scenarios"][0]["name"], "bind_chain");
    }

    #[test]
    fn test_zero_sizes_are_rejected() {
        let params = BenchmarkParams {
            depth: 0,
            fibers: 1,
            width: 1,
        };
        assert!(run_benchmark(&Config::default(), &params).is_err());
    }
}
