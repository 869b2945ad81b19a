/// Strand CLI
///
/// Runs the engine benchmark and small host demos without embedding the
/// library in another program.

use strand_core::cli;

fn main() {
    if let Err(e) = cli::run_cli() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
