//! Process manager: starts the helper executable in either mode.
//!
//! Persistent helpers speak over a [`Connection`] built from the child's
//! stdout and stdin. Walk helpers only write, so the controller gets a
//! [`WalkStream`] that reads stdout and owns the child.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::connection::Connection;
use crate::error::{Result, StatterError};

/// Controller-side options for a persistent helper.
#[derive(Debug, Clone, Default)]
pub struct HelperOptions {
    /// Per-request timeout passed as `--timeout`; the helper default when
    /// unset.
    pub timeout: Option<Duration>,
}

/// Connection to a persistent helper.
pub type HelperConnection = Connection<ChildStdout, ChildStdin>;

/// Owns a running helper process. The process is killed when dropped.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
}

impl ProcessHandle {
    /// OS process id of the helper.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Kill the helper and reap it.
    pub async fn terminate(&mut self) -> Result<()> {
        debug!(pid = self.pid, "Terminating helper");
        kill_and_reap(&mut self.child).await
    }
}

/// Start a helper in persistent mode.
pub fn start_persistent(
    exe: impl AsRef<Path>,
    options: &HelperOptions,
) -> Result<(HelperConnection, ProcessHandle)> {
    let exe = exe.as_ref();
    let mut cmd = Command::new(exe);
    if let Some(timeout) = options.timeout {
        cmd.arg("--timeout")
            .arg(humantime::format_duration(timeout).to_string());
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = spawn(&mut cmd, exe)?;
    let pid = child.id().ok_or_else(|| spawn_failed(exe, "helper exited at start"))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_failed(exe, "helper stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_failed(exe, "helper stdout not captured"))?;

    debug!(pid, exe = %exe.display(), "Started persistent helper");

    Ok((Connection::new(stdout, stdin), ProcessHandle { child, pid }))
}

/// Start a helper that walks `root` and streams the result.
///
/// The helper's stderr is passed through to ours. `root` follows `--`, so
/// a root that looks like an option is still taken as the path.
pub fn start_walk(exe: impl AsRef<Path>, root: impl AsRef<OsStr>) -> Result<WalkStream> {
    let exe = exe.as_ref();
    let mut cmd = Command::new(exe);
    cmd.arg("--")
        .arg(root.as_ref())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = spawn(&mut cmd, exe)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_failed(exe, "helper stdout not captured"))?;

    debug!(pid = ?child.id(), exe = %exe.display(), "Started walk helper");

    Ok(WalkStream { stdout, child })
}

/// Kill a process by id.
///
/// A process that has already gone is not an error.
pub fn terminate(pid: u32) -> Result<()> {
    let pid = i32::try_from(pid)
        .map_err(|_| StatterError::InvalidArgument(format!("pid {pid} out of range")))?;

    match kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(StatterError::Io(e.into())),
    }
}

/// Read side of a walk helper. Owns the subprocess.
#[derive(Debug)]
pub struct WalkStream {
    stdout: ChildStdout,
    child: Child,
}

impl WalkStream {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the helper, if still running, and reap it.
    pub async fn close(mut self) -> Result<()> {
        kill_and_reap(&mut self.child).await
    }
}

impl AsyncRead for WalkStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

fn spawn(cmd: &mut Command, exe: &Path) -> Result<Child> {
    cmd.spawn().map_err(|source| StatterError::Spawn {
        exe: exe.to_path_buf(),
        source,
    })
}

fn spawn_failed(exe: &Path, reason: &str) -> StatterError {
    StatterError::Spawn {
        exe: PathBuf::from(exe),
        source: io::Error::new(io::ErrorKind::Other, reason),
    }
}

async fn kill_and_reap(child: &mut Child) -> Result<()> {
    if child.id().is_some() {
        match child.start_kill() {
            Ok(()) => {}
            // Exited on its own since the last poll.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(StatterError::Io(e)),
        }
    }

    child.wait().await?;
    Ok(())
}
