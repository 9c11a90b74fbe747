//! Header-first decoding over async byte streams.
//!
//! Every reader pulls a fixed-size header, then exactly the number of bytes
//! the header announces. Nothing is read speculatively, so a stream can be
//! handed from one reader to the next at any frame boundary.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::frame::{
    decode_message_len, decode_path_len, EntryHeader, WalkFrame, ENTRY_HEADER_SIZE,
    PATH_LEN_SIZE,
};
use super::wire_format::{
    HeadResponse, PathRequest, RequestHeader, StatResponse, HEAD_RESPONSE_SIZE,
    REQUEST_HEADER_SIZE, STAT_RESPONSE_SIZE,
};
use crate::error::{Result, StatterError};

/// Outcome of filling a buffer that may start at end of stream.
enum Fill {
    Full,
    Eof,
}

/// Fill `buf` completely, or report a clean EOF if no byte was available.
///
/// EOF after a partial fill is an `UnexpectedEof` I/O error.
async fn fill_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<Fill>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;

    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(Fill::Eof);
            }
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }

    Ok(Fill::Full)
}

/// Read one path request.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new request.
/// A header or path cut short by EOF is a [`StatterError::ShortBuffer`].
pub async fn read_request<R>(reader: &mut R) -> Result<Option<PathRequest>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; REQUEST_HEADER_SIZE];
    match fill_or_eof(reader, &mut header_buf).await {
        Ok(Fill::Eof) => return Ok(None),
        Ok(Fill::Full) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(StatterError::ShortBuffer)
        }
        Err(e) => return Err(StatterError::Io(e)),
    }

    let header = RequestHeader::decode(&header_buf)?;

    let mut path = vec![0u8; header.path_len as usize];
    reader.read_exact(&mut path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            StatterError::ShortBuffer
        } else {
            StatterError::Io(e)
        }
    })?;

    Ok(Some(PathRequest {
        kind: header.kind,
        path,
    }))
}

/// Read one 44-byte stat response.
pub async fn read_stat_response<R>(reader: &mut R) -> Result<StatResponse>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; STAT_RESPONSE_SIZE];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(StatterError::from_transport)?;

    Ok(StatResponse::decode(&buf))
}

/// Read one 5-byte head response.
pub async fn read_head_response<R>(reader: &mut R) -> Result<HeadResponse>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEAD_RESPONSE_SIZE];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(StatterError::from_transport)?;

    Ok(HeadResponse::decode(&buf))
}

/// Read the next walk frame.
///
/// Returns `Ok(None)` when the stream ends at a frame boundary, which marks
/// a completed walk.
pub async fn read_walk_frame<R>(reader: &mut R) -> Result<Option<WalkFrame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; PATH_LEN_SIZE];
    match fill_or_eof(reader, &mut len_buf)
        .await
        .map_err(StatterError::from_transport)?
    {
        Fill::Eof => return Ok(None),
        Fill::Full => {}
    }

    let path_len = decode_path_len(&len_buf);

    if path_len == 0 {
        let mut msg_len_buf = [0u8; PATH_LEN_SIZE];
        reader
            .read_exact(&mut msg_len_buf)
            .await
            .map_err(StatterError::from_transport)?;

        let mut message = vec![0u8; decode_message_len(&msg_len_buf) as usize];
        reader
            .read_exact(&mut message)
            .await
            .map_err(StatterError::from_transport)?;

        return Ok(Some(WalkFrame::Terminal(
            String::from_utf8_lossy(&message).into_owned(),
        )));
    }

    let mut rest = [0u8; ENTRY_HEADER_SIZE - PATH_LEN_SIZE];
    reader
        .read_exact(&mut rest)
        .await
        .map_err(StatterError::from_transport)?;
    let header = EntryHeader::decode(path_len, &rest);

    let mut path = vec![0u8; path_len as usize];
    reader
        .read_exact(&mut path)
        .await
        .map_err(StatterError::from_transport)?;

    Ok(Some(header.into_frame(path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{build_entry_frame, build_terminal_frame, DirEntry};
    use crate::protocol::wire_format::{RequestKind, StatRecord};
    use std::path::PathBuf;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_request() {
        let bytes = PathRequest::new(RequestKind::Head, b"/etc/hosts".to_vec()).encode();
        let mut reader = &bytes[..];

        let request = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(request.kind, RequestKind::Head);
        assert_eq!(request.path, b"/etc/hosts");
        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_request_clean_eof() {
        let mut reader: &[u8] = &[];
        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_request_truncated_header() {
        let mut reader: &[u8] = &[0, 5];
        assert!(matches!(
            read_request(&mut reader).await,
            Err(StatterError::ShortBuffer)
        ));
    }

    #[tokio::test]
    async fn test_read_request_truncated_path() {
        let mut reader: &[u8] = &[0, 5, 0, b'/', b'a'];
        assert!(matches!(
            read_request(&mut reader).await,
            Err(StatterError::ShortBuffer)
        ));
    }

    #[tokio::test]
    async fn test_read_request_zero_length() {
        let mut reader: &[u8] = &[0, 0, 0];
        assert!(matches!(
            read_request(&mut reader).await,
            Err(StatterError::ShortBuffer)
        ));
    }

    #[tokio::test]
    async fn test_read_stat_response_split_across_writes() {
        let (mut client, mut server) = tokio::io::duplex(8);
        let record = StatRecord {
            inode: 11,
            mode: 0o100600,
            nlink: 1,
            uid: 1,
            gid: 2,
            size: 3,
            mtime: 4,
        };
        let bytes = StatResponse::Found(record).encode();

        let write = tokio::spawn(async move {
            server.write_all(&bytes).await.unwrap();
        });

        let response = read_stat_response(&mut client).await.unwrap();
        write.await.unwrap();
        assert_eq!(response, StatResponse::Found(record));
    }

    #[tokio::test]
    async fn test_read_stat_response_eof_is_connection_closed() {
        let mut reader: &[u8] = &[1, 2, 3];
        assert!(matches!(
            read_stat_response(&mut reader).await,
            Err(StatterError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_head_response() {
        let bytes = HeadResponse::Byte(b'#').encode();
        let mut reader = &bytes[..];
        assert_eq!(
            read_head_response(&mut reader).await.unwrap(),
            HeadResponse::Byte(b'#')
        );
    }

    #[tokio::test]
    async fn test_read_walk_stream() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&build_entry_frame(b"/r/", 2, 0o040000));
        stream.extend_from_slice(&build_entry_frame(b"/r/locked/", 0, 13));
        stream.extend_from_slice(&build_terminal_frame("walk failed"));
        let mut reader = &stream[..];

        assert_eq!(
            read_walk_frame(&mut reader).await.unwrap(),
            Some(WalkFrame::Entry(DirEntry::new("/r/", 0o040000, 2)))
        );
        assert_eq!(
            read_walk_frame(&mut reader).await.unwrap(),
            Some(WalkFrame::EntryError {
                path: PathBuf::from("/r/locked/"),
                errno: 13
            })
        );
        assert_eq!(
            read_walk_frame(&mut reader).await.unwrap(),
            Some(WalkFrame::Terminal("walk failed".to_string()))
        );
        assert_eq!(read_walk_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_walk_frame_truncated() {
        let frame = build_entry_frame(b"/r/file", 5, 0o100000);
        let mut reader = &frame[..frame.len() - 2];
        assert!(matches!(
            read_walk_frame(&mut reader).await,
            Err(StatterError::ConnectionClosed)
        ));
    }
}
