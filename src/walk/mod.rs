//! Walk mode: recursive traversal streamed as walk frames.
//!
//! ```text
//! ParallelWalker ──visit / visit_error──► FrameVisitor ──► writer task ──► stdout
//! ```
//!
//! The traversal is pluggable through [`Traversal`]; [`stream_walk`] is the
//! driver the helper runs in one-shot mode.

mod parallel;
mod stream;

use std::io;
use std::path::Path;

pub use parallel::ParallelWalker;
pub use stream::{stream_walk, terminal_message, FrameVisitor};

use crate::protocol::DirEntry;

/// Receives every node a traversal discovers.
///
/// Traversals may call both methods from several threads at once. Returning
/// an error from either asks the traversal to stop; the traversal then
/// returns that error.
pub trait WalkVisitor: Sync {
    fn visit(&self, entry: DirEntry) -> io::Result<()>;

    /// A node that could not be read. The traversal carries on with the rest
    /// of the tree.
    fn visit_error(&self, path: &Path, err: io::Error) -> io::Result<()>;
}

/// A recursive directory traversal.
pub trait Traversal: Send + Sync + 'static {
    /// Visit `root` and every node below it.
    ///
    /// Returns an error when the walk as a whole could not complete, or when
    /// the visitor asked to stop.
    fn walk(&self, root: &Path, visitor: &dyn WalkVisitor) -> io::Result<()>;
}
