//! Walk stream frames.
//!
//! Every frame starts with a 16-bit path length. A non-zero length means a
//! directory entry:
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────────┐
//! │ Path len │ Inode    │ Other    │ Path         │
//! │ uint16 LE│ uint64 LE│ uint32 LE│ len bytes    │
//! └──────────┴──────────┴──────────┴──────────────┘
//! ```
//! `Other` holds the file-type bits, or the errno when the inode is 0.
//!
//! A zero length marks the terminal error that ends the stream:
//! ```text
//! ┌──────────┬──────────┬──────────────┐
//! │ 0 (u16)  │ Msg len  │ Message      │
//! └──────────┴──────────┴──────────────┘
//! ```

use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use nix::sys::stat::SFlag;

use super::wire_format::{read_u16, read_u32, read_u64, MAX_PATH_LEN};

/// Size of the leading path length field.
pub const PATH_LEN_SIZE: usize = 2;

/// Entry header size (path length + inode + other).
pub const ENTRY_HEADER_SIZE: usize = 14;

/// Terminal error header size (zero path length + message length).
pub const TERMINAL_HEADER_SIZE: usize = 4;

/// One node visited during a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Full path; directories end with `/`.
    pub path: PathBuf,
    /// File-type bits (`st_mode & S_IFMT`).
    pub mode: u32,
    pub inode: u64,
}

impl DirEntry {
    pub fn new(path: impl Into<PathBuf>, mode: u32, inode: u64) -> Self {
        Self {
            path: path.into(),
            mode,
            inode,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & SFlag::S_IFMT.bits() == SFlag::S_IFDIR.bits()
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & SFlag::S_IFMT.bits() == SFlag::S_IFLNK.bits()
    }
}

/// A decoded walk frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkFrame {
    /// A successfully visited node.
    Entry(DirEntry),
    /// A node that could not be read; the walk continues.
    EntryError { path: PathBuf, errno: u32 },
    /// The walk could not complete; nothing follows.
    Terminal(String),
}

/// Header fields that follow a non-zero path length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub path_len: u16,
    pub inode: u64,
    pub other: u32,
}

impl EntryHeader {
    /// Decode the 12 bytes after the path length.
    pub fn decode(path_len: u16, rest: &[u8; ENTRY_HEADER_SIZE - PATH_LEN_SIZE]) -> Self {
        Self {
            path_len,
            inode: read_u64(rest, 0),
            other: read_u32(rest, 8),
        }
    }

    /// Combine the header with its path into a frame.
    pub fn into_frame(self, path: Vec<u8>) -> WalkFrame {
        let path = path_from_bytes(path);

        if self.inode == 0 {
            WalkFrame::EntryError {
                path,
                errno: self.other,
            }
        } else {
            WalkFrame::Entry(DirEntry {
                path,
                mode: self.other,
                inode: self.inode,
            })
        }
    }
}

/// Read the leading path length of any walk frame.
#[inline]
pub fn decode_path_len(buf: &[u8; PATH_LEN_SIZE]) -> u16 {
    read_u16(buf, 0)
}

/// Read the message length of a terminal frame.
#[inline]
pub fn decode_message_len(buf: &[u8; PATH_LEN_SIZE]) -> u16 {
    read_u16(buf, 0)
}

impl WalkFrame {
    /// Encode the frame into one contiguous buffer.
    ///
    /// Entry paths must not exceed [`MAX_PATH_LEN`]; terminal messages are
    /// truncated to fit.
    pub fn encode(&self) -> Bytes {
        match self {
            WalkFrame::Entry(entry) => {
                build_entry_frame(entry.path.as_os_str().as_bytes(), entry.inode, entry.mode)
            }
            WalkFrame::EntryError { path, errno } => {
                build_entry_frame(path.as_os_str().as_bytes(), 0, *errno)
            }
            WalkFrame::Terminal(message) => build_terminal_frame(message),
        }
    }
}

/// Build a directory entry frame. An inode of 0 makes it a failure frame.
pub fn build_entry_frame(path: &[u8], inode: u64, other: u32) -> Bytes {
    debug_assert!(!path.is_empty() && path.len() <= MAX_PATH_LEN);

    let mut buf = BytesMut::with_capacity(ENTRY_HEADER_SIZE + path.len());
    buf.put_u16_le(path.len() as u16);
    buf.put_u64_le(inode);
    buf.put_u32_le(other);
    buf.put_slice(path);
    buf.freeze()
}

/// Build the terminal error frame.
pub fn build_terminal_frame(message: &str) -> Bytes {
    let message = truncate_message(message);

    let mut buf = BytesMut::with_capacity(TERMINAL_HEADER_SIZE + message.len());
    buf.put_u16_le(0);
    buf.put_u16_le(message.len() as u16);
    buf.put_slice(message.as_bytes());
    buf.freeze()
}

fn truncate_message(message: &str) -> &str {
    if message.len() <= MAX_PATH_LEN {
        return message;
    }

    let mut end = MAX_PATH_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

/// Whether a path can be carried in an entry frame.
pub fn path_fits(path: &Path) -> bool {
    let len = path.as_os_str().as_bytes().len();
    len > 0 && len <= MAX_PATH_LEN
}

pub(crate) fn path_from_bytes(bytes: Vec<u8>) -> PathBuf {
    PathBuf::from(OsString::from_vec(bytes))
}
