//! Walk streamer: turns traversal callbacks into walk frames.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use super::{Traversal, WalkVisitor};
use crate::error::{errno_of, Result, StatterError};
use crate::protocol::{build_entry_frame, build_terminal_frame, path_fits, DirEntry};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// [`WalkVisitor`] that encodes each callback as a frame and queues it on the
/// writer task.
///
/// Callbacks run on traversal worker threads, never inside the runtime.
pub struct FrameVisitor {
    writer: WriterHandle,
}

impl FrameVisitor {
    pub fn new(writer: WriterHandle) -> Self {
        Self { writer }
    }

    fn send(&self, frame: bytes::Bytes) -> io::Result<()> {
        self.writer.blocking_send(frame).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "walk output closed")
        })
    }
}

impl WalkVisitor for FrameVisitor {
    fn visit(&self, entry: DirEntry) -> io::Result<()> {
        if !path_fits(&entry.path) {
            warn!(
                len = entry.path.as_os_str().len(),
                "Skipping entry whose path does not fit in a frame"
            );
            return Ok(());
        }

        self.send(build_entry_frame(
            entry.path.as_os_str().as_bytes(),
            entry.inode,
            entry.mode,
        ))
    }

    fn visit_error(&self, path: &Path, err: io::Error) -> io::Result<()> {
        debug!(path = %path.display(), error = %err, "Walk entry failed");

        if !path_fits(path) {
            warn!(
                len = path.as_os_str().len(),
                "Skipping error whose path does not fit in a frame"
            );
            return Ok(());
        }

        self.send(build_entry_frame(path.as_os_str().as_bytes(), 0, errno_of(&err)))
    }
}

/// Text written in the terminal frame for a fatal traversal error.
///
/// Bare OS errors render as their lower-case description, so an empty root
/// yields `invalid argument`.
pub fn terminal_message(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(code) => Errno::from_raw(code).desc().to_lowercase(),
        None => err.to_string(),
    }
}

/// Walk `root` with `traversal`, streaming frames to `output`.
///
/// A fatal traversal error is written as one terminal frame and the walk
/// still counts as delivered. The returned error is reserved for failures of
/// the output stream itself.
pub async fn stream_walk<T, W>(
    root: PathBuf,
    traversal: Arc<T>,
    output: W,
    config: WriterConfig,
) -> Result<()>
where
    T: Traversal,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (writer, writer_task) = spawn_writer_task(output, config);

    let visitor = FrameVisitor::new(writer.clone());
    let walk_root = root.clone();
    let outcome = tokio::task::spawn_blocking(move || traversal.walk(&walk_root, &visitor))
        .await
        .map_err(|e| StatterError::Io(e.into()))?;

    if let Err(err) = outcome {
        let message = terminal_message(&err);
        warn!(root = %root.display(), error = %message, "Walk terminated");

        // A closed output also fails this send; the writer task reports it.
        let _ = writer.send(build_terminal_frame(&message)).await;
    }

    drop(writer);
    writer_task
        .await
        .map_err(|e| StatterError::Io(e.into()))?
}
