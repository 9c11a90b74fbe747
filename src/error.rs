//! Error types for statter.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use thiserror::Error;

/// Main error type for all statter operations.
#[derive(Debug, Error)]
pub enum StatterError {
    /// I/O error on the helper's pipes.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream while a response was expected.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Malformed header or unexpected frame contents.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A request ended before its header or path was complete.
    #[error("short buffer")]
    ShortBuffer,

    /// A stat or head operation did not finish within the configured bound.
    #[error("timeout")]
    Timeout,

    /// In-band OS failure reported by the helper for one path.
    #[error(transparent)]
    Path(#[from] PathError),

    /// Path does not fit in the 16-bit length field.
    #[error("path of {0} bytes exceeds the 65535 byte protocol limit")]
    PathTooLong(usize),

    /// The helper reported that the walk could not complete.
    #[error("{0}")]
    WalkTerminated(String),

    /// Invalid configuration or arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The helper executable could not be started.
    #[error("failed to start helper {exe}: {source}")]
    Spawn {
        exe: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StatterError {
    /// Map a transport error, treating a closed pipe as end of stream.
    pub(crate) fn from_transport(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => Self::ConnectionClosed,
            _ => Self::Io(err),
        }
    }
}

/// Result type alias using StatterError.
pub type Result<T> = std::result::Result<T, StatterError>;

/// An OS-level failure for a single path, as reported by the helper.
///
/// Displays like `lstat /not/a/path: No such file or directory`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathError {
    op: &'static str,
    path: PathBuf,
    errno: i32,
}

impl PathError {
    pub fn new(op: &'static str, path: impl AsRef<Path>, errno: u32) -> Self {
        Self {
            op,
            path: path.as_ref().to_path_buf(),
            errno: errno as i32,
        }
    }

    /// Operation that failed (`lstat` or `read`).
    pub fn op(&self) -> &'static str {
        self.op
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Platform error code; `0` marks end of file on a head read.
    pub fn raw_errno(&self) -> i32 {
        self.errno
    }

    pub fn errno(&self) -> Errno {
        Errno::from_raw(self.errno)
    }

    pub fn kind(&self) -> io::ErrorKind {
        if self.errno == 0 {
            io::ErrorKind::UnexpectedEof
        } else {
            io::Error::from_raw_os_error(self.errno).kind()
        }
    }

    fn description(&self) -> &'static str {
        if self.errno == 0 {
            "unexpected end of file"
        } else {
            self.errno().desc()
        }
    }
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {}",
            self.op,
            self.path.display(),
            self.description()
        )
    }
}

impl std::error::Error for PathError {}

impl From<PathError> for io::Error {
    fn from(err: PathError) -> Self {
        if err.errno == 0 {
            io::Error::new(io::ErrorKind::UnexpectedEof, err)
        } else {
            io::Error::from_raw_os_error(err.errno)
        }
    }
}

/// Extract the platform error code from an I/O error.
///
/// Errors without an OS code are reported as `EIO`.
pub fn errno_of(err: &io::Error) -> u32 {
    err.raw_os_error().unwrap_or(Errno::EIO as i32) as u32
}
