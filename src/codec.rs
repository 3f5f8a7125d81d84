//! Line framing and deadline-bounded stream I/O
//!
//! Commands, headers and status replies are `\n`-terminated lines; payloads
//! are raw byte runs whose length was announced in the preceding line.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{SessionError, SessionResult};
use crate::protocol::MAX_LINE_LEN;

/// Read one line, without its terminator.
///
/// Returns `Ok(None)` when the peer closes the stream before a `\n` arrives.
/// Lines longer than [`MAX_LINE_LEN`] are cut at the cap; the remaining
/// bytes are left in the stream and surface as the next line. A trailing
/// `\r` is stripped. Invalid UTF-8 is replaced rather than rejected.
///
/// Reads one byte at a time so nothing past the `\n` is consumed; wrap the
/// transport in a `BufReader` to keep that cheap.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(128);
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        if byte == b'\n' {
            break;
        }
        buf.push(byte);
        if buf.len() >= MAX_LINE_LEN {
            break;
        }
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Write `line` followed by `\n` and flush.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(line.len() + 1);
    out.extend_from_slice(line.as_bytes());
    out.push(b'\n');
    writer.write_all(&out).await?;
    writer.flush().await
}

/// Run an I/O future under a deadline, mapping expiry to [`SessionError::Timeout`].
#[inline]
pub async fn timed<T, F>(op: &'static str, limit: Duration, fut: F) -> SessionResult<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(res) => res.map_err(SessionError::from),
        Err(_) => Err(SessionError::Timeout { op, after: limit }),
    }
}

#[inline]
pub async fn write_line_timed<W>(writer: &mut W, line: &str, limit: Duration) -> SessionResult<()>
where
    W: AsyncWrite + Unpin,
{
    timed("write line", limit, write_line(writer, line)).await
}

#[inline]
pub async fn write_all_timed<W>(writer: &mut W, buf: &[u8], limit: Duration) -> SessionResult<()>
where
    W: AsyncWrite + Unpin,
{
    timed("write", limit, writer.write_all(buf)).await
}

/// Read at most `buf.len()` bytes; `Ok(0)` means the peer closed.
#[inline]
pub async fn read_some_timed<R>(reader: &mut R, buf: &mut [u8], limit: Duration) -> SessionResult<usize>
where
    R: AsyncRead + Unpin,
{
    timed("read", limit, reader.read(buf)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn reads_lines_and_strips_cr() {
        let (mut tx, rx) = duplex(256);
        tx.write_all(b"LIST\r\nDOWNLOAD a.txt\n").await.unwrap();
        drop(tx);
        let mut rx = BufReader::new(rx);
        assert_eq!(read_line(&mut rx).await.unwrap().as_deref(), Some("LIST"));
        assert_eq!(
            read_line(&mut rx).await.unwrap().as_deref(),
            Some("DOWNLOAD a.txt")
        );
        assert_eq!(read_line(&mut rx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn partial_line_then_eof_is_disconnect() {
        let (mut tx, rx) = duplex(64);
        tx.write_all(b"LIS").await.unwrap();
        drop(tx);
        let mut rx = BufReader::new(rx);
        assert_eq!(read_line(&mut rx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn overlong_line_is_truncated_not_rejected() {
        let (mut tx, rx) = duplex(64 * 1024);
        let mut long = vec![b'a'; MAX_LINE_LEN + 10];
        long.push(b'\n');
        tx.write_all(&long).await.unwrap();
        drop(tx);
        let mut rx = BufReader::new(rx);
        let first = read_line(&mut rx).await.unwrap().unwrap();
        assert_eq!(first.len(), MAX_LINE_LEN);
        let rest = read_line(&mut rx).await.unwrap().unwrap();
        assert_eq!(rest, "a".repeat(10));
    }

    #[tokio::test]
    async fn line_reader_leaves_payload_bytes_in_stream() {
        let (mut tx, rx) = duplex(64);
        tx.write_all(b"UPLOAD f 3\nxyz").await.unwrap();
        drop(tx);
        let mut rx = BufReader::new(rx);
        assert_eq!(read_line(&mut rx).await.unwrap().as_deref(), Some("UPLOAD f 3"));
        let mut body = [0u8; 3];
        rx.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"xyz");
    }

    #[tokio::test]
    async fn timed_read_expires() {
        let (_tx, mut rx) = duplex(64);
        let mut buf = [0u8; 4];
        let err = read_some_timed(&mut rx, &mut buf, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { op: "read", .. }));
    }
}
