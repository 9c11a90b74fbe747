//! Wire format encoding and decoding.
//!
//! Request (controller to helper):
//! ```text
//! ┌───────┬──────────┬──────────────┐
//! │ Kind  │ Path len │ Path         │
//! │ 1 byte│ uint16 LE│ len bytes    │
//! └───────┴──────────┴──────────────┘
//! ```
//!
//! Stat response (44 bytes, fixed):
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────┬─────────┬──────────┬──────────┐
//! │ Inode    │ Mode     │ Nlink    │ Uid     │ Gid     │ Size     │ Mtime    │
//! │ uint64 LE│ uint32 LE│ uint64 LE│uint32 LE│uint32 LE│ uint64 LE│ uint64 LE│
//! └──────────┴──────────┴──────────┴─────────┴─────────┴──────────┴──────────┘
//! ```
//! An inode of 0 marks a failure; the mode field then holds the errno.
//!
//! Head response (5 bytes, fixed): `ok:u8`, then either the byte and three
//! unused bytes, or the errno as uint32 LE.
//!
//! All multi-byte integers are Little Endian.

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::sys::stat::SFlag;

use crate::error::{Result, StatterError};

/// Request header size in bytes (kind + path length).
pub const REQUEST_HEADER_SIZE: usize = 3;

/// Stat response size in bytes.
pub const STAT_RESPONSE_SIZE: usize = 44;

/// Head response size in bytes.
pub const HEAD_RESPONSE_SIZE: usize = 5;

/// Longest path or message representable by a 16-bit length field.
pub const MAX_PATH_LEN: usize = u16::MAX as usize;

const INODE_START: usize = 0;
const MODE_START: usize = 8;
const NLINK_START: usize = 12;
const UID_START: usize = 20;
const GID_START: usize = 24;
const SIZE_START: usize = 28;
const MTIME_START: usize = 36;

/// Which operation a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestKind {
    /// lstat the path.
    Stat = 0,
    /// Read the first byte of the path.
    Head = 1,
}

impl RequestKind {
    /// Operation name used when reporting a failure for this kind.
    pub fn op(self) -> &'static str {
        match self {
            RequestKind::Stat => "lstat",
            RequestKind::Head => "read",
        }
    }
}

impl TryFrom<u8> for RequestKind {
    type Error = StatterError;

    fn try_from(flag: u8) -> Result<Self> {
        match flag {
            0 => Ok(RequestKind::Stat),
            1 => Ok(RequestKind::Head),
            other => Err(StatterError::Protocol(format!(
                "unknown request kind {other}"
            ))),
        }
    }
}

/// Decoded request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub kind: RequestKind,
    /// Path length in bytes (never 0 on a valid request).
    pub path_len: u16,
}

impl RequestHeader {
    pub fn new(kind: RequestKind, path_len: u16) -> Self {
        Self { kind, path_len }
    }

    pub fn encode(&self) -> [u8; REQUEST_HEADER_SIZE] {
        let mut buf = [0u8; REQUEST_HEADER_SIZE];
        buf[0] = self.kind as u8;
        buf[1..3].copy_from_slice(&self.path_len.to_le_bytes());
        buf
    }

    /// Decode and validate a request header.
    ///
    /// A zero path length is rejected as a short buffer, an unknown kind as
    /// a protocol error.
    pub fn decode(buf: &[u8; REQUEST_HEADER_SIZE]) -> Result<Self> {
        let kind = RequestKind::try_from(buf[0])?;
        let path_len = u16::from_le_bytes([buf[1], buf[2]]);

        if path_len == 0 {
            return Err(StatterError::ShortBuffer);
        }

        Ok(Self { kind, path_len })
    }
}

/// A single stat or head query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRequest {
    pub kind: RequestKind,
    pub path: Vec<u8>,
}

impl PathRequest {
    pub fn new(kind: RequestKind, path: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    /// Encode header and path into one buffer.
    ///
    /// # Panics
    ///
    /// Debug builds panic when the path exceeds [`MAX_PATH_LEN`]; callers
    /// must check with [`check_path_len`] first.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.path.len() <= MAX_PATH_LEN);

        let header = RequestHeader::new(self.kind, self.path.len() as u16);
        let mut buf = Vec::with_capacity(REQUEST_HEADER_SIZE + self.path.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&self.path);
        buf
    }
}

/// Reject paths that cannot be framed, and empty paths.
pub fn check_path_len(path: &[u8]) -> Result<u16> {
    if path.is_empty() {
        return Err(StatterError::InvalidArgument("empty path".to_string()));
    }

    u16::try_from(path.len()).map_err(|_| StatterError::PathTooLong(path.len()))
}

/// Metadata carried by a successful stat response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatRecord {
    pub inode: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Modification time, whole seconds since the epoch.
    pub mtime: u64,
}

impl StatRecord {
    /// File-type bits of the mode.
    pub fn file_type(&self) -> SFlag {
        SFlag::from_bits_truncate(self.mode & SFlag::S_IFMT.bits())
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == SFlag::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == SFlag::S_IFLNK
    }

    pub fn permissions(&self) -> Permissions {
        Permissions::from_mode(self.mode & 0o7777)
    }

    /// Modification time at whole-second precision.
    pub fn modified(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.mtime)
    }
}

/// Stat response: metadata or the errno of a failed lstat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatResponse {
    Found(StatRecord),
    Failed { errno: u32 },
}

impl StatResponse {
    /// Response carrying `record`.
    ///
    /// Inode 0 marks a failure on the wire, so a record with that inode can't
    /// be sent and becomes an `EIO` failure instead.
    pub fn found(record: StatRecord) -> Self {
        if record.inode == 0 {
            StatResponse::Failed {
                errno: Errno::EIO as u32,
            }
        } else {
            StatResponse::Found(record)
        }
    }

    pub fn encode(&self) -> [u8; STAT_RESPONSE_SIZE] {
        let mut buf = [0u8; STAT_RESPONSE_SIZE];

        let response = match *self {
            StatResponse::Found(record) => StatResponse::found(record),
            failed => failed,
        };

        match response {
            StatResponse::Found(record) => {
                buf[INODE_START..MODE_START].copy_from_slice(&record.inode.to_le_bytes());
                buf[MODE_START..NLINK_START].copy_from_slice(&record.mode.to_le_bytes());
                buf[NLINK_START..UID_START].copy_from_slice(&record.nlink.to_le_bytes());
                buf[UID_START..GID_START].copy_from_slice(&record.uid.to_le_bytes());
                buf[GID_START..SIZE_START].copy_from_slice(&record.gid.to_le_bytes());
                buf[SIZE_START..MTIME_START].copy_from_slice(&record.size.to_le_bytes());
                buf[MTIME_START..STAT_RESPONSE_SIZE].copy_from_slice(&record.mtime.to_le_bytes());
            }
            StatResponse::Failed { errno } => {
                buf[MODE_START..NLINK_START].copy_from_slice(&errno.to_le_bytes());
            }
        }

        buf
    }

    pub fn decode(buf: &[u8; STAT_RESPONSE_SIZE]) -> Self {
        let inode = read_u64(buf, INODE_START);
        let mode = read_u32(buf, MODE_START);

        if inode == 0 {
            return StatResponse::Failed { errno: mode };
        }

        StatResponse::Found(StatRecord {
            inode,
            mode,
            nlink: read_u64(buf, NLINK_START),
            uid: read_u32(buf, UID_START),
            gid: read_u32(buf, GID_START),
            size: read_u64(buf, SIZE_START),
            mtime: read_u64(buf, MTIME_START),
        })
    }
}

/// Head response: the first byte of a file or the errno of the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadResponse {
    Byte(u8),
    Failed { errno: u32 },
}

impl HeadResponse {
    pub fn encode(&self) -> [u8; HEAD_RESPONSE_SIZE] {
        let mut buf = [0u8; HEAD_RESPONSE_SIZE];

        match self {
            HeadResponse::Byte(byte) => {
                buf[0] = 1;
                buf[1] = *byte;
            }
            HeadResponse::Failed { errno } => {
                buf[1..HEAD_RESPONSE_SIZE].copy_from_slice(&errno.to_le_bytes());
            }
        }

        buf
    }

    pub fn decode(buf: &[u8; HEAD_RESPONSE_SIZE]) -> Self {
        if buf[0] == 1 {
            HeadResponse::Byte(buf[1])
        } else {
            HeadResponse::Failed {
                errno: read_u32(buf, 1),
            }
        }
    }
}

#[inline]
pub(crate) fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

#[inline]
pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline]
pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
