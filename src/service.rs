//! Persistent request/response service run by the helper.
//!
//! Requests are handled strictly one at a time:
//!
//! ```text
//! AwaitRequest → Dispatch → AwaitResult (bounded) → WriteResponse → AwaitRequest
//! ```
//!
//! Each filesystem call runs on the blocking pool and races the configured
//! timeout. A call that loses the race is detached, never cancelled, and the
//! loop ends with [`StatterError::Timeout`]: a stuck syscall may never return,
//! so the connection is not reused.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{errno_of, Result, StatterError};
use crate::protocol::{
    path_from_bytes, read_request, HeadResponse, RequestKind, StatRecord, StatResponse,
};

/// The filesystem primitives behind the service.
///
/// Both calls may block for an unbounded time; the service never calls them
/// on an async worker thread.
pub trait Inspector: Send + Sync + 'static {
    /// lstat `path`, reporting OS failures in-band.
    fn lstat(&self, path: &Path) -> StatResponse;

    /// Read the first byte of `path`, reporting OS failures in-band.
    fn head(&self, path: &Path) -> HeadResponse;
}

/// [`Inspector`] backed by the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalInspector;

impl Inspector for LocalInspector {
    fn lstat(&self, path: &Path) -> StatResponse {
        match std::fs::symlink_metadata(path) {
            Ok(meta) => StatResponse::found(StatRecord {
                inode: meta.ino(),
                mode: meta.mode(),
                nlink: meta.nlink(),
                uid: meta.uid(),
                gid: meta.gid(),
                size: meta.size(),
                mtime: meta.mtime().max(0) as u64,
            }),
            Err(e) => StatResponse::Failed { errno: errno_of(&e) },
        }
    }

    fn head(&self, path: &Path) -> HeadResponse {
        let mut byte = [0u8; 1];

        let read = File::open(path).and_then(|mut file| file.read(&mut byte));
        match read {
            Ok(1) => HeadResponse::Byte(byte[0]),
            // Empty file.
            Ok(_) => HeadResponse::Failed { errno: 0 },
            Err(e) => HeadResponse::Failed { errno: errno_of(&e) },
        }
    }
}

/// Serve requests on `conn` until the input ends or a fatal error occurs.
///
/// Returns `Ok(())` when the peer closes the input between requests. Every
/// other exit is an error: a malformed request, a failed response write, or
/// [`StatterError::Timeout`] when an operation outlives `timeout`.
pub async fn serve<R, W, I>(
    conn: &mut Connection<R, W>,
    inspector: Arc<I>,
    timeout: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    I: Inspector,
{
    loop {
        let request = match read_request(&mut conn.reader).await? {
            Some(request) => request,
            None => {
                debug!("Input closed, stopping service");
                return Ok(());
            }
        };

        let kind = request.kind;
        let path = path_from_bytes(request.path);
        debug!(?kind, path = %path.display(), "Request");

        let inspector = Arc::clone(&inspector);
        let task_path = path.clone();
        let task = tokio::task::spawn_blocking(move || dispatch(&*inspector, kind, &task_path));

        let response = match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined.map_err(|e| StatterError::Io(e.into()))?,
            Err(_) => {
                warn!(?kind, path = %path.display(), ?timeout, "Operation timed out, abandoning it");
                return Err(StatterError::Timeout);
            }
        };

        conn.writer.write_all(&response).await?;
        conn.writer.flush().await?;
    }
}

fn dispatch<I: Inspector + ?Sized>(inspector: &I, kind: RequestKind, path: &Path) -> Bytes {
    match kind {
        RequestKind::Stat => Bytes::copy_from_slice(&inspector.lstat(path).encode()),
        RequestKind::Head => Bytes::copy_from_slice(&inspector.head(path).encode()),
    }
}
