//! Tether CLI - exercises the ownership primitives and reports what diagnostics saw.
//!
//! ```text
//! tether stress [--threads N] [--readers N] [--iterations N] [--deadlock]
//! tether deadlock-demo [--patience-ms N]
//! tether config
//! ```
//!
//! Logs go to stderr (filter with `RUST_LOG`); results go to stdout as JSON.

mod workload;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, ensure};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tether_core::Coordinator;

use crate::workload::StressPlan;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of `$TETHER_CONFIG` / `~/.tether/config.toml`.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run Owned and SharedRef contention workloads and print diagnostics")]
    Stress {
        /// Writer threads per workload.
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Operations per thread.
        #[arg(long, default_value_t = 1_000)]
        iterations: usize,
        /// Reader threads per workload.
        #[arg(long, default_value_t = 4)]
        readers: usize,
        /// Track the wait-for graph while the workloads run.
        #[arg(long)]
        deadlock: bool,
    },
    #[command(about = "Provoke a lock-order inversion and print the deadlock reports")]
    DeadlockDemo {
        /// How long each thread waits for the other before giving up.
        #[arg(long, default_value_t = 250)]
        patience_ms: u64,
    },
    #[command(about = "Print the effective configuration")]
    Config,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn coordinator(config: Option<&Path>) -> Result<Coordinator> {
    match config {
        Some(path) => Coordinator::from_path(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Coordinator::from_env().context("loading config"),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{json}");
    Ok(())
}

fn stress(coord: &Coordinator, plan: StressPlan, deadlock: bool) -> Result<()> {
    ensure!(plan.writers > 0, "--threads must be at least 1");
    plan.expected_writes()?;
    coord.diagnostics().set_enabled(true);
    if deadlock {
        coord.diagnostics().set_deadlock_detection(true);
    }

    let started = Instant::now();
    workload::owned_counter(coord, plan)?;
    workload::shared_pair(coord, plan)?;
    info!(elapsed = ?started.elapsed(), "Stress run complete");

    print_json(&coord.snapshot())
}

fn deadlock_demo(coord: &Coordinator, patience: Duration) -> Result<()> {
    coord.diagnostics().set_enabled(true);
    coord.diagnostics().set_deadlock_detection(true);

    let reports = workload::lock_order_inversion(coord, patience);
    for report in &reports {
        info!("{report}");
    }
    print_json(&reports)
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let coord = coordinator(cli.config.as_deref())?;

    match cli.command {
        Commands::Stress {
            threads,
            iterations,
            readers,
            deadlock,
        } => stress(
            &coord,
            StressPlan {
                writers: threads,
                readers,
                iterations,
            },
            deadlock,
        ),
        Commands::DeadlockDemo { patience_ms } => {
            deadlock_demo(&coord, Duration::from_millis(patience_ms))
        }
        Commands::Config => print_json(coord.config()),
    }
}
