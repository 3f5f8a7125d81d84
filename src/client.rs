//! Client side of the ferry protocol.
//!
//! One [`Client`] owns one connection and issues commands sequentially,
//! mirroring the server's one-command-at-a-time loop.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{read_line, write_line};
use crate::progress;
use crate::protocol::{self, header, reply, timeouts, verb, EMPTY_LIST};
use crate::store::validate_name;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server: {0}")]
    Server(String),

    #[error("unexpected reply from server: {0:?}")]
    Unexpected(String),

    #[error("connection closed by server")]
    Closed,

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("invalid remote filename: {0:?}")]
    InvalidName(String),

    #[error("{0}")]
    Local(String),

    /// The transfer stopped after its header was sent; the server is still
    /// expecting body bytes, so the connection has been shut down.
    #[error("transfer aborted, connection closed: {0}")]
    Aborted(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Whether the connection is out of step with the server and cannot
    /// carry another command.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Closed | ClientError::Io(_) | ClientError::Timeout { .. } | ClientError::Aborted(_)
        )
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

async fn deadline<T, F>(op: &'static str, after: Duration, fut: F) -> ClientResult<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(after, fut).await {
        Ok(res) => res.map_err(ClientError::from),
        Err(_) => Err(ClientError::Timeout { op, after }),
    }
}

/// Parse `<PREFIX> <n>` into `n`, surfacing `ERROR ...` lines as server errors.
fn parse_sized(line: &str, prefix: &str) -> ClientResult<u64> {
    if line.starts_with(reply::ERROR_PREFIX) {
        return Err(ClientError::Server(line.to_string()));
    }
    line.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(' '))
        .and_then(|n| n.trim().parse().ok())
        .ok_or_else(|| ClientError::Unexpected(line.to_string()))
}

// Largest LIST body the client will buffer
const MAX_LIST_LEN: u64 = 64 * 1024 * 1024;

/// Body length announced by a `LISTSIZE` header, bounded by [`MAX_LIST_LEN`].
fn list_len(line: &str) -> ClientResult<usize> {
    let len = parse_sized(line, header::LISTSIZE)?;
    if len > MAX_LIST_LEN {
        return Err(ClientError::Unexpected(line.to_string()));
    }
    Ok(len as usize)
}

fn parse_list_body(body: &str) -> Vec<String> {
    if body == EMPTY_LIST {
        return Vec::new();
    }
    body.lines().filter(|l| !l.is_empty()).map(str::to_string).collect()
}

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    io_timeout: Duration,
    legacy_list: bool,
    show_progress: bool,
}

impl Client {
    pub async fn connect(addr: &str) -> ClientResult<Self> {
        let after = Duration::from_millis(timeouts::CONNECT_MS);
        let stream = deadline("connect", after, TcpStream::connect(addr)).await?;
        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();
        info!(server = addr, "connected");
        Ok(Self {
            reader: BufReader::new(rd),
            writer: wr,
            io_timeout: Duration::from_secs(timeouts::IO_SECS),
            legacy_list: false,
            show_progress: false,
        })
    }

    /// Expect unframed LIST bodies from a server running `--legacy-list`.
    pub fn legacy_list(mut self, on: bool) -> Self {
        self.legacy_list = on;
        self
    }

    pub fn show_progress(mut self, on: bool) -> Self {
        self.show_progress = on;
        self
    }

    pub fn io_timeout(mut self, after: Duration) -> Self {
        self.io_timeout = after;
        self
    }

    async fn send_line(&mut self, line: &str) -> ClientResult<()> {
        deadline("send", self.io_timeout, write_line(&mut self.writer, line)).await
    }

    async fn recv_line(&mut self) -> ClientResult<String> {
        deadline("receive", self.io_timeout, read_line(&mut self.reader))
            .await?
            .ok_or(ClientError::Closed)
    }

    /// Send an arbitrary line and return the single reply line.
    pub async fn raw(&mut self, line: &str) -> ClientResult<String> {
        self.send_line(line).await?;
        self.recv_line().await
    }

    /// Names of the files on the server.
    pub async fn list(&mut self) -> ClientResult<Vec<String>> {
        self.send_line(verb::LIST).await?;
        let body = if self.legacy_list {
            self.recv_unframed().await?
        } else {
            let first = self.recv_line().await?;
            let len = list_len(&first)?;
            let mut buf = vec![0u8; len];
            deadline("receive list", self.io_timeout, self.reader.read_exact(&mut buf)).await?;
            String::from_utf8_lossy(&buf).into_owned()
        };
        if body.starts_with(reply::ERROR_PREFIX) {
            return Err(ClientError::Server(body.trim_end().to_string()));
        }
        Ok(parse_list_body(&body))
    }

    /// Legacy LIST replies have no length: take whatever arrives until the
    /// stream goes quiet.
    async fn recv_unframed(&mut self) -> ClientResult<String> {
        const QUIET: Duration = Duration::from_millis(200);
        let mut out = Vec::new();
        let mut buf = vec![0u8; protocol::CHUNK_SIZE];
        let n = deadline("receive list", self.io_timeout, self.reader.read(&mut buf)).await?;
        if n == 0 {
            return Err(ClientError::Closed);
        }
        out.extend_from_slice(&buf[..n]);
        while let Ok(res) = timeout(QUIET, self.reader.read(&mut buf)).await {
            match res? {
                0 => break,
                n => out.extend_from_slice(&buf[..n]),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Fetch `name` into `dest_dir`, staging it as `.<name>.part` until the
    /// last byte arrives. Returns the byte count.
    pub async fn download(&mut self, name: &str, dest_dir: &Path) -> ClientResult<u64> {
        self.send_line(&format!("{} {}", verb::DOWNLOAD, name)).await?;
        let first = self.recv_line().await?;
        let size = parse_sized(&first, header::FILESIZE)?;
        debug!(file = name, size, "download started");

        let local_name = Path::new(name)
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| ClientError::InvalidName(name.to_string()))?;
        let final_path = dest_dir.join(&local_name);
        let temp_path = dest_dir.join(protocol::part_name(&local_name.to_string_lossy()));

        let mut out = match File::create(&temp_path).await {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(path = %temp_path.display(), error = %e, "cannot open local file, discarding download");
                None
            }
        };

        let bar = progress::transfer_bar(size, name, self.show_progress);
        let mut buf = vec![0u8; protocol::CHUNK_SIZE];
        let mut received = 0u64;
        let mut local_err: Option<io::Error> = None;
        while received < size {
            let want = buf.len().min((size - received) as usize);
            let n = match deadline("receive file", self.io_timeout, self.reader.read(&mut buf[..want])).await {
                Ok(0) => Err(ClientError::Closed),
                other => other,
            };
            let n = match n {
                Ok(n) => n,
                Err(e) => {
                    progress::finish(&bar, false);
                    drop(out);
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(e);
                }
            };
            if let Some(f) = out.as_mut() {
                if let Err(e) = f.write_all(&buf[..n]).await {
                    local_err = Some(e);
                    out = None;
                }
            }
            received += n as u64;
            bar.inc(n as u64);
        }

        let Some(mut f) = out else {
            progress::finish(&bar, false);
            let _ = fs::remove_file(&temp_path).await;
            let why = local_err.map(|e| e.to_string()).unwrap_or_else(|| "cannot create local file".to_string());
            return Err(ClientError::Local(format!("{}: {}", final_path.display(), why)));
        };
        f.flush().await?;
        drop(f);
        fs::rename(&temp_path, &final_path).await?;
        progress::finish(&bar, true);
        info!(file = name, bytes = size, "download finished");
        Ok(size)
    }

    /// Send the local file at `path` under `remote_name`.
    pub async fn upload(&mut self, path: &Path, remote_name: &str) -> ClientResult<u64> {
        // The server answers a bad name without reading the body, so catch
        // it here before any bytes are sent.
        if validate_name(remote_name).is_err() {
            return Err(ClientError::InvalidName(remote_name.to_string()));
        }
        let mut file = File::open(path)
            .await
            .map_err(|e| ClientError::Local(format!("local file not found: {}: {e}", path.display())))?;
        let size = file.metadata().await?.len();
        if size == 0 {
            return Err(ClientError::Local(format!("{} is empty; the protocol cannot carry empty uploads", path.display())));
        }

        self.send_line(&format!("{} {} {}", verb::UPLOAD, remote_name, size)).await?;
        let bar = progress::transfer_bar(size, remote_name, self.show_progress);
        let mut buf = vec![0u8; protocol::CHUNK_SIZE];
        let mut sent = 0u64;
        while sent < size {
            let n = match file.read(&mut buf).await {
                Ok(0) => Err(format!("{} shrank during upload", path.display())),
                Ok(n) => Ok(n),
                Err(e) => Err(format!("read {}: {e}", path.display())),
            };
            let n = match n {
                Ok(n) => n,
                Err(why) => {
                    progress::finish(&bar, false);
                    let _ = self.writer.shutdown().await;
                    return Err(ClientError::Aborted(why));
                }
            };
            let n = n.min((size - sent) as usize);
            deadline("send file", self.io_timeout, self.writer.write_all(&buf[..n])).await?;
            sent += n as u64;
            bar.inc(n as u64);
        }
        deadline("send file", self.io_timeout, self.writer.flush()).await?;

        let resp = self.recv_line().await?;
        if resp == reply::UPLOADED {
            progress::finish(&bar, true);
            info!(file = remote_name, bytes = size, "upload finished");
            Ok(size)
        } else if resp.starts_with(reply::ERROR_PREFIX) {
            progress::finish(&bar, false);
            Err(ClientError::Server(resp))
        } else {
            progress::finish(&bar, false);
            Err(ClientError::Unexpected(resp))
        }
    }

    /// Tell the server we are done and close our side.
    pub async fn exit(mut self) -> ClientResult<()> {
        self.send_line(verb::EXIT).await?;
        let _ = self.writer.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sized_headers() {
        assert_eq!(parse_sized("FILESIZE 42", header::FILESIZE).unwrap(), 42);
        assert_eq!(parse_sized("LISTSIZE 0", header::LISTSIZE).unwrap(), 0);
        assert!(matches!(
            parse_sized("ERROR File not found", header::FILESIZE),
            Err(ClientError::Server(m)) if m == "ERROR File not found"
        ));
        assert!(matches!(
            parse_sized("FILESIZE x", header::FILESIZE),
            Err(ClientError::Unexpected(_))
        ));
    }

    #[test]
    fn oversized_list_header_is_refused() {
        assert_eq!(list_len("LISTSIZE 11").unwrap(), 11);
        assert!(list_len(&format!("LISTSIZE {MAX_LIST_LEN}")).is_ok());
        assert!(matches!(
            list_len(&format!("LISTSIZE {}", MAX_LIST_LEN + 1)),
            Err(ClientError::Unexpected(_))
        ));
        assert!(matches!(
            list_len("LISTSIZE 18446744073709551615"),
            Err(ClientError::Unexpected(_))
        ));
    }

    #[test]
    fn desync_errors_are_fatal() {
        assert!(ClientError::Closed.is_fatal());
        assert!(ClientError::Aborted("gone".into()).is_fatal());
        assert!(ClientError::Timeout {
            op: "send",
            after: Duration::from_secs(1)
        }
        .is_fatal());
        assert!(!ClientError::Server("ERROR File not found".into()).is_fatal());
        assert!(!ClientError::Local("missing".into()).is_fatal());
        assert!(!ClientError::InvalidName("../x".into()).is_fatal());
    }

    #[tokio::test]
    async fn source_shrinking_mid_upload_closes_connection() {
        use tokio::net::TcpListener;

        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("big.bin");
        let declared = 64 * 1024 * 1024u64;
        std::fs::File::create(&src).unwrap().set_len(declared).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let truncate = src.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let header = read_line(&mut reader).await.unwrap().unwrap();
            std::fs::OpenOptions::new()
                .write(true)
                .open(&truncate)
                .unwrap()
                .set_len(0)
                .unwrap();
            // drain until the client gives up on the body
            let received = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await.unwrap();
            (header, received)
        });

        let mut client = Client::connect(&addr).await.unwrap();
        let err = client.upload(&src, "big.bin").await.unwrap_err();
        assert!(matches!(err, ClientError::Aborted(_)), "{err:?}");
        assert!(err.is_fatal());

        let (header, received) = server.await.unwrap();
        assert_eq!(header, format!("UPLOAD big.bin {declared}"));
        assert!(received < declared);
    }

    #[test]
    fn list_bodies() {
        assert!(parse_list_body("(no files)\n").is_empty());
        assert_eq!(parse_list_body("a\nb c\n"), vec!["a".to_string(), "b c".to_string()]);
    }
}
