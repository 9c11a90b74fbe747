//! Controller side of both helper modes.
//!
//! [`stat`] and [`head`] frame one request on a persistent connection and
//! decode its response. [`walk_path`] starts a walk helper and hands every
//! frame it streams to caller callbacks. [`Statter`] bundles a persistent
//! helper process with its connection.
//!
//! # Example
//!
//! ```ignore
//! use statter::{HelperOptions, Statter};
//!
//! let mut statter = Statter::start("/usr/local/bin/statter", &HelperOptions::default())?;
//! let record = statter.stat("/etc/hosts").await?;
//! println!("inode {}", record.inode);
//! statter.terminate().await?;
//! ```

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::connection::Connection;
use crate::error::{PathError, Result, StatterError};
use crate::process::{start_persistent, start_walk, HelperConnection, HelperOptions, ProcessHandle};
use crate::protocol::{
    check_path_len, read_head_response, read_stat_response, read_walk_frame, DirEntry,
    HeadResponse, PathRequest, RequestKind, StatRecord, StatResponse, WalkFrame,
};

async fn send_request<R, W>(conn: &mut Connection<R, W>, kind: RequestKind, path: &Path) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let bytes = path.as_os_str().as_bytes();
    check_path_len(bytes)?;

    let request = PathRequest::new(kind, bytes);
    conn.writer
        .write_all(&request.encode())
        .await
        .map_err(StatterError::from_transport)?;
    conn.writer
        .flush()
        .await
        .map_err(StatterError::from_transport)
}

/// lstat `path` through a persistent helper.
///
/// An OS failure comes back as [`StatterError::Path`] with operation
/// `lstat`; a helper that went away as [`StatterError::ConnectionClosed`].
pub async fn stat<R, W>(conn: &mut Connection<R, W>, path: impl AsRef<Path>) -> Result<StatRecord>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let path = path.as_ref();
    send_request(conn, RequestKind::Stat, path).await?;

    match read_stat_response(&mut conn.reader).await? {
        StatResponse::Found(record) => Ok(record),
        StatResponse::Failed { errno } => {
            Err(PathError::new(RequestKind::Stat.op(), path, errno).into())
        }
    }
}

/// Read the first byte of `path` through a persistent helper.
///
/// Failures use operation `read`. An empty file fails with an
/// `UnexpectedEof` [`PathError`].
pub async fn head<R, W>(conn: &mut Connection<R, W>, path: impl AsRef<Path>) -> Result<u8>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let path = path.as_ref();
    send_request(conn, RequestKind::Head, path).await?;

    match read_head_response(&mut conn.reader).await? {
        HeadResponse::Byte(byte) => Ok(byte),
        HeadResponse::Failed { errno } => {
            Err(PathError::new(RequestKind::Head.op(), path, errno).into())
        }
    }
}

/// Walk `root` in a fresh helper process.
///
/// `on_entry` sees every node, the root first. `on_error` sees every node
/// that could not be read, and the walk goes on. An error returned by either
/// callback stops the walk and is returned as is. A terminal frame from the
/// helper becomes [`StatterError::WalkTerminated`]. The helper is killed and
/// reaped before this returns.
pub async fn walk_path<E, F, G>(
    exe: impl AsRef<Path>,
    root: impl AsRef<OsStr>,
    on_entry: F,
    on_error: G,
) -> std::result::Result<(), E>
where
    E: From<StatterError>,
    F: FnMut(DirEntry) -> std::result::Result<(), E>,
    G: FnMut(&Path, Errno) -> std::result::Result<(), E>,
{
    let root = root.as_ref();
    let mut stream = BufReader::new(start_walk(exe, root)?);

    let outcome = read_walk(&mut stream, on_entry, on_error).await;
    if outcome.is_err() {
        debug!(root = %Path::new(root).display(), "Walk stopped early, killing helper");
    }

    let closed = stream.into_inner().close().await;
    outcome?;
    closed.map_err(E::from)
}

/// Hand every frame of a walk stream to the callbacks, until end of stream.
///
/// Stops at the first callback error and returns it unchanged; nothing more
/// is read from `reader` after that.
pub async fn read_walk<R, E, F, G>(
    reader: &mut R,
    mut on_entry: F,
    mut on_error: G,
) -> std::result::Result<(), E>
where
    R: AsyncRead + Unpin,
    E: From<StatterError>,
    F: FnMut(DirEntry) -> std::result::Result<(), E>,
    G: FnMut(&Path, Errno) -> std::result::Result<(), E>,
{
    while let Some(frame) = read_walk_frame(reader).await? {
        match frame {
            WalkFrame::Entry(entry) => on_entry(entry)?,
            WalkFrame::EntryError { path, errno } => {
                on_error(&path, Errno::from_raw(errno as i32))?
            }
            WalkFrame::Terminal(message) => {
                return Err(StatterError::WalkTerminated(message).into());
            }
        }
    }

    Ok(())
}

/// A persistent helper process and its connection.
#[derive(Debug)]
pub struct Statter {
    conn: HelperConnection,
    process: ProcessHandle,
}

impl Statter {
    /// Start a persistent helper from `exe`.
    pub fn start(exe: impl AsRef<Path>, options: &HelperOptions) -> Result<Self> {
        let (conn, process) = start_persistent(exe, options)?;
        Ok(Self { conn, process })
    }

    pub async fn stat(&mut self, path: impl AsRef<Path>) -> Result<StatRecord> {
        stat(&mut self.conn, path).await
    }

    pub async fn head(&mut self, path: impl AsRef<Path>) -> Result<u8> {
        head(&mut self.conn, path).await
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    /// Kill the helper. Further calls would fail, so this consumes `self`.
    pub async fn terminate(mut self) -> Result<()> {
        self.process.terminate().await
    }
}
