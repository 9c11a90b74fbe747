//! Dedicated writer task for walk frames.
//!
//! Traversal workers never touch the output stream directly. Each encoded
//! frame is handed whole to one writer task over an mpsc channel, so frames
//! from concurrent workers can never interleave on the wire.
//!
//! # Architecture
//!
//! ```text
//! Worker 1 ─┐
//! Worker 2 ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► stdout
//! Worker N ─┘
//! ```
//!
//! Ready frames are batched and written with `write_vectored`.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, StatterError};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Frames queued before senders wait.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending encoded frames to the writer task.
///
/// Cheap to clone; one clone per worker.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
}

impl WriterHandle {
    /// Queue a frame from async code.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| StatterError::ConnectionClosed)
    }

    /// Queue a frame from a worker thread outside the runtime.
    ///
    /// Must not be called from within an async context.
    pub fn blocking_send(&self, frame: Bytes) -> Result<()> {
        self.tx
            .blocking_send(frame)
            .map_err(|_| StatterError::ConnectionClosed)
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends once every handle is dropped and the queue is drained. Its
/// result carries the first write failure, after which senders observe
/// [`StatterError::ConnectionClosed`].
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer));

    (WriterHandle { tx }, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    while let Some(first) = rx.recv().await {
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
        batch.clear();
    }

    writer.flush().await?;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O, then flush.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(Bytes::len).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;

        if written == 0 {
            return Err(StatterError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.len();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame[start..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        handle.send(Bytes::from_static(b"hello")).await.unwrap();
        drop(handle);
        task.await.unwrap().unwrap();

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn test_writer_keeps_frame_order() {
        let (client, mut server) = duplex(64);
        let (handle, task) = spawn_writer_task(client, WriterConfig { channel_capacity: 4 });

        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            server.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let mut expected = Vec::new();
        for i in 0..100u32 {
            let frame = Bytes::copy_from_slice(&i.to_le_bytes());
            expected.extend_from_slice(&frame);
            handle.send(frame).await.unwrap();
        }
        drop(handle);
        task.await.unwrap().unwrap();

        assert_eq!(reader.await.unwrap(), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_send_from_threads() {
        let (client, mut server) = duplex(1024);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            server.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let threads: Vec<_> = (0..4u8)
            .map(|t| {
                let handle = handle.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        handle.blocking_send(Bytes::from(vec![t; 8])).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        drop(handle);
        task.await.unwrap().unwrap();

        let written = reader.await.unwrap();
        assert_eq!(written.len(), 4 * 50 * 8);
        for chunk in written.chunks(8) {
            assert!(chunk.iter().all(|b| *b == chunk[0]));
        }
    }

    #[tokio::test]
    async fn test_send_after_reader_gone() {
        let (client, server) = duplex(16);
        drop(server);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        handle.send(Bytes::from_static(b"lost")).await.unwrap();
        assert!(task.await.unwrap().is_err());
        assert!(matches!(
            handle.send(Bytes::from_static(b"x")).await,
            Err(StatterError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defg")];

        assert_eq!(build_remaining_slices(&batch, 0).len(), 2);

        let slices = build_remaining_slices(&batch, 2);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"c");

        let slices = build_remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"defg");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|_| Bytes::from_static(b"abc")).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner(), b"abcabcabcabcabc");
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        assert!(task.await.unwrap().is_ok());
    }
}
