//! # statter
//!
//! Out-of-process filesystem metadata over a binary stdio protocol.
//!
//! A controller starts the `statter` helper and talks to it in one of two
//! modes, fixed when the helper starts:
//!
//! - **Persistent** (no argument): many `lstat` and first-byte requests, one
//!   at a time, each bounded by a timeout.
//! - **Walk** (one path argument): a single recursive traversal streamed as
//!   one frame per entry, then the helper exits.
//!
//! ## Example
//!
//! ```ignore
//! use statter::{walk_path, StatterError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), StatterError> {
//!     walk_path(
//!         "/usr/local/bin/statter",
//!         "/data",
//!         |entry| {
//!             println!("{}", entry.path.display());
//!             Ok::<_, StatterError>(())
//!         },
//!         |path, errno| {
//!             eprintln!("{}: {}", path.display(), errno.desc());
//!             Ok(())
//!         },
//!     )
//!     .await
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod protocol;
pub mod service;
pub mod walk;
pub mod writer;

mod connection;

pub use client::{head, read_walk, stat, walk_path, Statter};
pub use connection::Connection;
pub use error::{PathError, Result, StatterError};
pub use process::{start_persistent, start_walk, terminate, HelperOptions, ProcessHandle, WalkStream};
pub use protocol::{DirEntry, StatRecord};
