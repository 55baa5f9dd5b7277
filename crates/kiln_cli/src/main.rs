//! Kiln CLI — precompile an application directory and inspect the result.
//!
//! `kiln precompile` walks a directory, compiles every eligible file into the
//! artifact cache, and saves the configuration snapshot a read-only session
//! replays. `kiln status` summarizes a previously written cache.

#![warn(missing_docs)]

mod precompile;
mod status;

use std::process;

use clap::{Parser, Subcommand};

/// Kiln — a build-artifact cache for source-to-source compilation.
#[derive(Parser, Debug)]
#[command(name = "kiln", version, about = "Kiln build-artifact cache")]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Enable verbose (debug-level) output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile everything under a directory into the cache.
    Precompile(precompile::PrecompileArgs),
    /// Summarize a previously written cache.
    Status(status::StatusArgs),
}

fn init_tracing(quiet: bool, verbose: bool) {
    let default_level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose);

    let outcome = match &cli.command {
        Command::Precompile(args) => precompile::run(args),
        Command::Status(args) => status::run(args),
    };

    match outcome {
        Ok(exit_code) => process::exit(exit_code),
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(1);
        }
    }
}
