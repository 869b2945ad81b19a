use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "strand")]
#[command(about = "Strand - A cooperative fiber engine for effectful workflows", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Scheduler ring buffer capacity (overrides config file and env vars)
    #[arg(long, global = true)]
    pub capacity: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine benchmark (bind chains, forks, parallel blocks, races)
    Bench {
        /// Length of the bind chain
        #[arg(long, default_value = "100000")]
        depth: usize,

        /// Number of fibers to fork and join
        #[arg(long, default_value = "1000")]
        fibers: usize,

        /// Branches in the parallel and race scenarios
        #[arg(long, default_value = "256")]
        width: usize,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Race two host timers and report which one won
    Race {
        /// Left timer in milliseconds
        #[arg(long, default_value = "50")]
        left_ms: u64,

        /// Right timer in milliseconds
        #[arg(long, default_value = "20")]
        right_ms: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

/// Run the CLI by parsing process arguments
pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli)
}

/// Run the CLI with provided arguments (for hosts embedding the binary)
pub fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args);
    run_cli_with_args(cli)
}

/// Internal function that handles CLI commands
fn run_cli_with_args(cli: Cli) -> Result<()> {
    use crate::bench::{display_report, run_benchmark, BenchmarkParams};
    use crate::config::Config;
    use crate::host;
    use crate::logging;
    use crate::par::race;
    use crate::runtime::Runtime;
    use crate::Outcome;

    // Load and validate configuration before executing any command
    let config = Config::builder()
        .config_path(cli.config.map(PathBuf::from))
        .capacity(cli.capacity)
        .build()?;
    logging::init(&config.logging)?;

    match cli.command {
        Commands::Bench {
            depth,
            fibers,
            width,
            json,
        } => {
            let params = BenchmarkParams {
                depth,
                fibers,
                width,
            };
            let report = run_benchmark(&config, &params)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                display_report(&report);
            }
        }

        Commands::Race { left_ms, right_ms } => {
            let runtime = Runtime::new(&config);
            let left = host::sleep(Duration::from_millis(left_ms)).map(|_| "left");
            let right = host::sleep(Duration::from_millis(right_ms)).map(|_| "right");
            match host::block_on(&runtime, race(vec![left, right]))? {
                Outcome::Succeeded(winner) => println!("✓ {} won", winner),
                Outcome::Failed(e) | Outcome::Interrupted(e) => {
                    eprintln!("Race failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bench_arguments() {
        let cli = Cli::parse_from(["strand", "--capacity", "32", "bench", "--depth", "10", "--json"]);
        assert_eq!(cli.capacity, Some(32));
        match cli.command {
            Commands::Bench {
                depth,
                fibers,
                width,
                json,
            } => {
                assert_eq!(depth, 10);
                assert_eq!(fibers, 1000);
                assert_eq!(width, 256);
                assert!(json);
            }
            _ => panic!("expected the bench command"),
        }
    }

    #[test]
    fn test_parse_race_defaults() {
        let cli = Cli::parse_from(["strand", "race"]);
        assert!(matches!(
            cli.command,
            Commands::Race {
                left_ms: 50,
                right_ms: 20
            }
        ));
    }
}
