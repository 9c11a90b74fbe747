//! Configuration types for the statter helper
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{Result, StatterError};
use crate::writer::DEFAULT_CHANNEL_CAPACITY;

/// Default per-request bound in persistent mode.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum reasonable walk worker count
const MAX_WORKERS: usize = 64;

/// Out-of-process lstat, first-byte reads and directory walks
#[derive(Parser, Debug, Clone)]
#[command(
    name = "statter",
    version,
    about = "Out-of-process lstat, first-byte reads and directory walks",
    long_about = "Without PATH, serves stat and head requests read from stdin, writing \
                  binary responses to stdout.\n\n\
                  With PATH, walks that directory tree once, streaming one frame per \
                  entry to stdout, then exits.",
    after_help = "EXAMPLES:\n    \
        statter --timeout 250ms    # persistent mode\n    \
        statter /data/project      # walk mode"
)]
pub struct CliArgs {
    /// Directory to walk; persistent mode when omitted
    #[arg(value_name = "PATH")]
    pub path: Option<OsString>,

    /// Per-request timeout in persistent mode (e.g. 1s, 250ms)
    #[arg(long, default_value = "1s", value_name = "DURATION")]
    pub timeout: humantime::Duration,

    /// Number of worker threads for walk mode
    #[arg(short = 'w', long, default_value_t = default_walk_workers(), value_name = "NUM")]
    pub workers: usize,

    /// Enable debug logging on stderr
    #[arg(short, long)]
    pub verbose: bool,
}

/// Default walk worker count: available parallelism, clamped to 1..=64.
pub fn default_walk_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_WORKERS)
}

/// Which protocol the helper speaks for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperMode {
    /// Many stat/head requests on stdin/stdout.
    Persistent,
    /// One traversal of this root, streamed to stdout.
    Walk(PathBuf),
}

/// Validated helper configuration.
#[derive(Debug, Clone)]
pub struct HelperConfig {
    pub mode: HelperMode,
    pub timeout: Duration,
    pub walk_workers: usize,
    /// Walk frames queued ahead of the writer task.
    pub channel_capacity: usize,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            mode: HelperMode::Persistent,
            timeout: DEFAULT_TIMEOUT,
            walk_workers: default_walk_workers(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl HelperConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let timeout: Duration = args.timeout.into();
        if timeout.is_zero() {
            return Err(StatterError::InvalidArgument(
                "timeout must be greater than zero".to_string(),
            ));
        }

        if args.workers == 0 || args.workers > MAX_WORKERS {
            return Err(StatterError::InvalidArgument(format!(
                "workers must be between 1 and {MAX_WORKERS}, got {}",
                args.workers
            )));
        }

        let mode = match args.path {
            Some(path) => HelperMode::Walk(PathBuf::from(path)),
            None => HelperMode::Persistent,
        };

        Ok(Self {
            mode,
            timeout,
            walk_workers: args.workers,
            ..Self::default()
        })
    }
}
