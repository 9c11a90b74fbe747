//! statter helper executable.
//!
//! No PATH: persistent stat/head service on stdin/stdout.
//! One PATH: stream a walk of PATH to stdout and exit.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;

use statter::config::{CliArgs, HelperConfig, HelperMode};
use statter::service::{serve, LocalInspector};
use statter::walk::{stream_walk, ParallelWalker};
use statter::writer::WriterConfig;
use statter::{logging, Connection};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("statter: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();

    logging::init(args.verbose);

    let config = HelperConfig::from_args(args).context("Invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")?;

    let result = runtime.block_on(async {
        match config.mode.clone() {
            HelperMode::Persistent => run_persistent(&config).await,
            HelperMode::Walk(root) => run_walk(root, &config).await,
        }
    });

    // A timed-out lstat may still be blocked in the kernel; don't wait for it.
    runtime.shutdown_background();

    result
}

async fn run_persistent(config: &HelperConfig) -> Result<()> {
    debug!(timeout = ?config.timeout, "Serving requests on stdio");

    let mut conn = Connection::new(tokio::io::stdin(), tokio::io::stdout());
    serve(&mut conn, Arc::new(LocalInspector), config.timeout)
        .await
        .context("Request service stopped")
}

async fn run_walk(root: PathBuf, config: &HelperConfig) -> Result<()> {
    debug!(root = %root.display(), workers = config.walk_workers, "Walking");

    stream_walk(
        root,
        Arc::new(ParallelWalker::new(config.walk_workers)),
        tokio::io::stdout(),
        WriterConfig {
            channel_capacity: config.channel_capacity,
        },
    )
    .await
    .context("Failed to write walk output")
}
