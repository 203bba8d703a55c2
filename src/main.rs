//! netpolc - network policy compiler
//!
//! Compiles a topology independent security policy into per device filter
//! rules.
//!
//! # Usage
//!
//! ```bash
//! netpolc compile policy.json out/    # Compile and write device configs
//! netpolc compile policy.json         # Compile, report diagnostics only
//! netpolc check policy.json           # Same as compile without output
//! netpolc version                     # Show build information
//! ```
//!
//! The exit status is the number of errors found, at most 255.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use netpolc::core::diag::{Diagnostics, Severity};
use netpolc::core::{emit, import};
use netpolc::{Error, compile, config};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "netpolc")]
#[command(about = "Network policy compiler - per device filter rules from one policy", long_about = None)]
struct Cli {
    /// Compiler configuration file (default: netpolc.json next to the input)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Only log warnings and errors, don't print warnings
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Worker threads (overrides the configuration)
    #[arg(short = 'j', long, global = true, value_name = "N")]
    threads: Option<usize>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a policy model into device configs
    Compile {
        /// Policy model (JSON)
        input: PathBuf,
        /// Directory the device configs are written to
        out_dir: Option<PathBuf>,
    },
    /// Check a policy model without writing anything
    Check {
        /// Policy model (JSON)
        input: PathBuf,
    },
    /// Show version and build information
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.quiet {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: Failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(&cli)) {
        Ok(errors) => ExitCode::from(u8::try_from(errors).unwrap_or(u8::MAX)),
        Err(e) => {
            let translation = e.translate();
            eprintln!("Error: {}", translation.user_message);
            for suggestion in translation.suggestions {
                eprintln!("  hint: {suggestion}");
            }
            ExitCode::FAILURE
        }
    }
}

fn print_diagnostics(diagnostics: &Diagnostics, quiet: bool) {
    for d in diagnostics.iter() {
        if quiet && d.severity != Severity::Error {
            continue;
        }
        eprintln!("{d}");
    }
}

/// Compiles `input`, writing to `out_dir` if given. Returns the error count.
async fn run_compile(cli: &Cli, input: &Path, out_dir: Option<&Path>) -> Result<usize, Error> {
    let mut config = config::load_config(cli.config.as_deref(), input).await?;
    if cli.threads.is_some() {
        config.threads = cli.threads;
    }
    config.validate()?;
    let model = import::load_policy(input).await?;

    match compile(&model, &config) {
        Ok(compiled) => {
            print_diagnostics(&compiled.diagnostics, cli.quiet);
            if let Some(dir) = out_dir {
                let index = emit::emit(dir, &compiled).await?;
                if !cli.quiet {
                    println!(
                        "Wrote {} device configs to {}",
                        index.devices.len(),
                        dir.display()
                    );
                }
            }
            Ok(compiled.diagnostics.error_count())
        }
        Err(halted) => {
            print_diagnostics(&halted.diagnostics, cli.quiet);
            eprintln!("{halted}");
            Ok(halted.diagnostics.error_count())
        }
    }
}

async fn handle_cli(cli: &Cli) -> Result<usize, Error> {
    match &cli.command {
        Commands::Compile { input, out_dir } => run_compile(cli, input, out_dir.as_deref()).await,
        Commands::Check { input } => run_compile(cli, input, None).await,
        Commands::Version => {
            println!("netpolc {}", build::PKG_VERSION);
            println!(
                "commit {}{}",
                build::SHORT_COMMIT,
                if build::GIT_CLEAN { "" } else { " (dirty)" }
            );
            println!("built {}", build::BUILD_TIME);
            Ok(0)
        }
    }
}
