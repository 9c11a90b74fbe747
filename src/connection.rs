//! Explicit connection handle: one reader and one writer owned together.
//!
//! The helper serves a `Connection<Stdin, Stdout>`, the controller talks
//! through a `Connection<ChildStdout, ChildStdin>`, and tests use the two
//! ends of `tokio::io::duplex`.

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

/// A bidirectional byte stream made of two halves.
#[derive(Debug)]
pub struct Connection<R, W> {
    pub(crate) reader: R,
    pub(crate) writer: W,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl Connection<DuplexStream, DuplexStream> {
    /// Two in-memory connections wired to each other.
    pub fn pair(max_buf_size: usize) -> (Self, Self) {
        let (a_read, b_write) = tokio::io::duplex(max_buf_size);
        let (b_read, a_write) = tokio::io::duplex(max_buf_size);

        (Self::new(a_read, a_write), Self::new(b_read, b_write))
    }
}
