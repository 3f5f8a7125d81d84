//! Command dispatcher
//!
//! Executes one parsed command against the [`FileStore`] and the
//! [`LockRegistry`] and writes its response. Command-level failures become
//! `ERROR ...` lines and leave the connection usable; only a broken or
//! stalled stream is returned as a [`SessionError`].

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::audit::{TransferLog, TransferLogEntry, TransferOp, TransferStatus};
use crate::codec::{read_some_timed, timed, write_all_timed, write_line_timed};
use crate::command::Command;
use crate::config::ServerConfig;
use crate::error::{SessionError, SessionResult, StoreError};
use crate::locks::LockRegistry;
use crate::protocol::{header, reply, EMPTY_LIST};
use crate::store::{validate_name, FileRecord, FileStore};

/// What the connection loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Identity of the connection a command arrived on, for logs and audit.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub conn: String,
    pub addr: String,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub io_timeout: Duration,
    pub chunk_size: usize,
    pub legacy_list: bool,
}

impl From<&ServerConfig> for DispatchSettings {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            io_timeout: cfg.io_timeout(),
            chunk_size: cfg.chunk_size.max(1),
            legacy_list: cfg.legacy_list,
        }
    }
}

/// Shared by every connection handler.
pub struct Dispatcher {
    store: FileStore,
    locks: Arc<LockRegistry>,
    audit: Option<Arc<TransferLog>>,
    settings: DispatchSettings,
}

/// LIST body: one name per line, or the empty marker.
pub fn render_list(records: &[FileRecord]) -> String {
    if records.is_empty() {
        return EMPTY_LIST.to_string();
    }
    let mut out = String::new();
    for r in records {
        out.push_str(&r.name);
        out.push('\n');
    }
    out
}

impl Dispatcher {
    pub fn new(store: FileStore, locks: Arc<LockRegistry>, settings: DispatchSettings) -> Self {
        Self {
            store,
            locks,
            audit: None,
            settings,
        }
    }

    pub fn with_audit(mut self, log: Arc<TransferLog>) -> Self {
        self.audit = Some(log);
        self
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Parse and execute one command line.
    pub async fn execute<R, W>(
        &self,
        line: &str,
        reader: &mut R,
        writer: &mut W,
        peer: &PeerInfo,
    ) -> SessionResult<Flow>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let cmd = match Command::parse(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                debug!(error = %e, "rejected command");
                self.reply(writer, e.reply()).await?;
                return Ok(Flow::Continue);
            }
        };
        debug!(verb = cmd.verb(), "command");
        match cmd {
            Command::List => self.list(writer).await?,
            Command::Download { filename } => self.download(&filename, writer, peer).await?,
            Command::Upload { filename, size } => {
                self.upload(&filename, size, reader, writer, peer).await?
            }
            Command::Exit => {
                info!("client requested EXIT");
                return Ok(Flow::Close);
            }
            Command::Unknown { raw } => {
                debug!(raw = %raw, "unknown command");
                self.reply(writer, reply::ERR_UNKNOWN).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn reply<W>(&self, writer: &mut W, line: &str) -> SessionResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        write_line_timed(writer, line, self.settings.io_timeout).await
    }

    async fn list<W>(&self, writer: &mut W) -> SessionResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let body = match self.store.list().await {
            Ok(records) => render_list(&records),
            Err(e) => {
                warn!(error = %e, "LIST failed");
                return self.reply(writer, e.reply()).await;
            }
        };
        let mut out = Vec::with_capacity(body.len() + 24);
        if !self.settings.legacy_list {
            out.extend_from_slice(format!("{} {}\n", header::LISTSIZE, body.len()).as_bytes());
        }
        out.extend_from_slice(body.as_bytes());
        write_all_timed(writer, &out, self.settings.io_timeout).await?;
        timed("flush", self.settings.io_timeout, writer.flush()).await
    }

    async fn download<W>(&self, name: &str, writer: &mut W, peer: &PeerInfo) -> SessionResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        if let Err(e) = validate_name(name) {
            warn!(file = name, "rejected download name");
            return self.reply(writer, e.reply()).await;
        }
        // No lock: an upload renaming over the name swaps the directory
        // entry, not this handle, and the size comes from the handle.
        let opened = match self.store.stat(name).await {
            Ok(_) => self.store.open_read(name).await,
            Err(e) => Err(e),
        };
        let (file, record) = match opened {
            Ok(v) => v,
            Err(e) => {
                if !matches!(e, StoreError::NotFound { .. }) {
                    warn!(file = name, error = %e, "download open failed");
                }
                return self.reply(writer, e.reply()).await;
            }
        };

        let hdr = format!("{} {}", header::FILESIZE, record.size);
        self.reply(writer, &hdr).await?;

        match self.stream_file(file, record.size, writer).await {
            Ok(()) => {
                info!(file = name, bytes = record.size, "sent");
                self.record(peer, TransferOp::Download, name, record.size, TransferStatus::Completed, None).await;
                Ok(())
            }
            Err((sent, e)) => {
                warn!(file = name, sent, expected = record.size, error = %e, "download interrupted");
                self.record(peer, TransferOp::Download, name, sent, TransferStatus::Interrupted, Some(&e)).await;
                Err(e)
            }
        }
    }

    /// Copy exactly `size` bytes of `file` to the peer. Any failure leaves
    /// the peer mid-body, so it is reported as a session error along with
    /// the count already sent.
    async fn stream_file<W>(
        &self,
        file: tokio::fs::File,
        size: u64,
        writer: &mut W,
    ) -> Result<(), (u64, SessionError)>
    where
        W: AsyncWrite + Unpin,
    {
        let io_timeout = self.settings.io_timeout;
        let mut src = file.take(size);
        let mut buf = vec![0u8; self.settings.chunk_size];
        let mut sent = 0u64;
        while sent < size {
            let n = match src.read(&mut buf).await {
                Ok(0) => {
                    let short = std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("file shrank to {sent} of {size} bytes while sending"),
                    );
                    return Err((sent, short.into()));
                }
                Ok(n) => n,
                Err(e) => return Err((sent, e.into())),
            };
            write_all_timed(writer, &buf[..n], io_timeout)
                .await
                .map_err(|e| (sent, e))?;
            sent += n as u64;
        }
        timed("flush", io_timeout, writer.flush())
            .await
            .map_err(|e| (sent, e))
    }

    async fn upload<R, W>(
        &self,
        name: &str,
        size: u64,
        reader: &mut R,
        writer: &mut W,
        peer: &PeerInfo,
    ) -> SessionResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if let Err(e) = validate_name(name) {
            warn!(file = name, "rejected upload name");
            return self.reply(writer, e.reply()).await;
        }

        // Held until the reply is written, across every return below
        let _lock = self.locks.acquire(name).await;

        let mut session = match self.store.begin_upload(name, size).await {
            Ok(s) => s,
            Err(e) => {
                warn!(file = name, error = %e, "cannot stage upload");
                self.record(peer, TransferOp::Upload, name, 0, TransferStatus::Failed, Some(&e)).await;
                return self.reply(writer, e.reply()).await;
            }
        };

        let io_timeout = self.settings.io_timeout;
        let mut buf = vec![0u8; self.settings.chunk_size.min(size as usize).max(1)];
        let mut received = 0u64;
        // After a disk error the rest of the body is still consumed so the
        // stream stays in step, but nothing more is written.
        let mut disk_error: Option<StoreError> = None;
        while received < size {
            let want = buf.len().min((size - received) as usize);
            let n = match read_some_timed(reader, &mut buf[..want], io_timeout).await {
                Ok(0) => {
                    session.abort().await;
                    let err = SessionError::ShortUpload {
                        expected: size,
                        received,
                    };
                    warn!(file = name, received, expected = size, "upload failed or connection lost");
                    self.record(peer, TransferOp::Upload, name, received, TransferStatus::Interrupted, Some(&err)).await;
                    return Err(err);
                }
                Ok(n) => n,
                Err(err) => {
                    session.abort().await;
                    warn!(file = name, received, expected = size, error = %err, "upload interrupted");
                    self.record(peer, TransferOp::Upload, name, received, TransferStatus::Interrupted, Some(&err)).await;
                    return Err(err);
                }
            };
            received += n as u64;
            if disk_error.is_none() {
                if let Err(e) = session.write_chunk(&buf[..n]).await {
                    disk_error = Some(e);
                }
            }
        }

        if let Some(e) = disk_error {
            session.abort().await;
            warn!(file = name, error = %e, "upload write failed");
            self.record(peer, TransferOp::Upload, name, received, TransferStatus::Failed, Some(&e)).await;
            return self.reply(writer, e.reply()).await;
        }

        match session.commit().await {
            Ok(record) => {
                info!(file = name, bytes = record.size, "received upload");
                self.record(peer, TransferOp::Upload, name, record.size, TransferStatus::Completed, None).await;
                self.reply(writer, reply::UPLOADED).await
            }
            Err(e) => {
                warn!(file = name, error = %e, "commit failed");
                self.record(peer, TransferOp::Upload, name, received, TransferStatus::Failed, Some(&e)).await;
                self.reply(writer, e.reply()).await
            }
        }
    }

    /// Append an audit entry; the file write runs on the blocking pool.
    async fn record(
        &self,
        peer: &PeerInfo,
        op: TransferOp,
        file: &str,
        bytes: u64,
        status: TransferStatus,
        error: Option<&(dyn std::fmt::Display + Sync)>,
    ) {
        let Some(log) = &self.audit else {
            return;
        };
        let mut entry = TransferLogEntry::now(&peer.conn, &peer.addr, op, file, bytes, status);
        if let Some(e) = error {
            entry = entry.with_error(e);
        }
        let writer = Arc::clone(log);
        match tokio::task::spawn_blocking(move || writer.add_entry(&entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, path = %log.path().display(), "audit log write failed"),
            Err(e) => warn!(error = %e, "audit log task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_line;
    use tempfile::TempDir;
    use tokio::io::{duplex, split, BufReader, DuplexStream, ReadHalf, WriteHalf};

    struct Harness {
        _tmp: TempDir,
        root: std::path::PathBuf,
        dispatcher: Dispatcher,
        peer: PeerInfo,
        client: BufReader<DuplexStream>,
        server_r: BufReader<ReadHalf<DuplexStream>>,
        server_w: WriteHalf<DuplexStream>,
    }

    fn settings(legacy_list: bool) -> DispatchSettings {
        DispatchSettings {
            io_timeout: Duration::from_millis(500),
            chunk_size: 4,
            legacy_list,
        }
    }

    fn harness(legacy_list: bool) -> Harness {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let dispatcher = Dispatcher::new(
            FileStore::new(&root),
            Arc::new(LockRegistry::new()),
            settings(legacy_list),
        );
        let (client, server) = duplex(64 * 1024);
        let (r, w) = split(server);
        Harness {
            _tmp: tmp,
            root,
            dispatcher,
            peer: PeerInfo {
                conn: "test".into(),
                addr: "memory".into(),
            },
            client: BufReader::new(client),
            server_r: BufReader::new(r),
            server_w: w,
        }
    }

    impl Harness {
        async fn run(&mut self, line: &str) -> SessionResult<Flow> {
            self.dispatcher
                .execute(line, &mut self.server_r, &mut self.server_w, &self.peer)
                .await
        }

        async fn line(&mut self) -> String {
            read_line(&mut self.client).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn list_framed_and_empty() {
        let mut h = harness(false);
        assert_eq!(h.run("LIST").await.unwrap(), Flow::Continue);
        assert_eq!(h.line().await, "LISTSIZE 11");
        assert_eq!(h.line().await, "(no files)");

        std::fs::write(h.root.join("b"), b"2").unwrap();
        std::fs::write(h.root.join("a"), b"1").unwrap();
        std::fs::write(h.root.join(".b.part"), b"x").unwrap();
        h.run("LIST").await.unwrap();
        assert_eq!(h.line().await, "LISTSIZE 4");
        assert_eq!(h.line().await, "a");
        assert_eq!(h.line().await, "b");
    }

    #[tokio::test]
    async fn list_legacy_has_no_header() {
        let mut h = harness(true);
        std::fs::write(h.root.join("only.txt"), b"1").unwrap();
        h.run("LIST").await.unwrap();
        assert_eq!(h.line().await, "only.txt");
    }

    #[tokio::test]
    async fn download_sends_header_then_exact_bytes() {
        let mut h = harness(false);
        std::fs::write(h.root.join("data.bin"), b"0123456789").unwrap();
        h.run("DOWNLOAD data.bin").await.unwrap();
        assert_eq!(h.line().await, "FILESIZE 10");
        let mut body = [0u8; 10];
        h.client.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"0123456789");

        // stream is back in line mode
        h.run("FOO").await.unwrap();
        assert_eq!(h.line().await, "ERROR Unknown command");
    }

    #[tokio::test]
    async fn download_errors() {
        let mut h = harness(false);
        h.run("DOWNLOAD ../../etc/passwd").await.unwrap();
        assert_eq!(h.line().await, "ERROR Invalid filename");
        h.run("DOWNLOAD missing").await.unwrap();
        assert_eq!(h.line().await, "ERROR File not found");
        std::fs::create_dir(h.root.join("dir")).unwrap();
        h.run("DOWNLOAD dir").await.unwrap();
        assert_eq!(h.line().await, "ERROR File not found");
    }

    #[tokio::test]
    async fn upload_commits_and_replies_ok() {
        let mut h = harness(false);
        h.client.write_all(b"hello world").await.unwrap();
        h.run("UPLOAD greet.txt 11").await.unwrap();
        assert_eq!(h.line().await, "OK Uploaded");
        assert_eq!(std::fs::read(h.root.join("greet.txt")).unwrap(), b"hello world");
        assert!(!h.root.join(".greet.txt.part").exists());
        assert!(h.dispatcher.locks().is_empty());
    }

    #[tokio::test]
    async fn upload_header_and_name_errors() {
        let mut h = harness(false);
        h.run("UPLOAD x 0").await.unwrap();
        assert_eq!(h.line().await, "ERROR Invalid UPLOAD header");
        h.run("UPLOAD ../x 10").await.unwrap();
        assert_eq!(h.line().await, "ERROR Invalid filename");
        assert!(!h.root.join("../x").exists());
    }

    #[tokio::test]
    async fn rename_failure_keeps_temp_and_connection() {
        let mut h = harness(false);
        // a non-empty directory cannot be replaced by a file
        std::fs::create_dir(h.root.join("d")).unwrap();
        std::fs::write(h.root.join("d").join("inner"), b"x").unwrap();

        h.client.write_all(b"abc").await.unwrap();
        assert_eq!(h.run("UPLOAD d 3").await.unwrap(), Flow::Continue);
        assert_eq!(h.line().await, "ERROR Server rename failed");
        assert_eq!(std::fs::read(h.root.join(".d.part")).unwrap(), b"abc");
        assert!(h.root.join("d").is_dir());
        assert!(h.dispatcher.locks().is_empty());

        h.run("FOO").await.unwrap();
        assert_eq!(h.line().await, "ERROR Unknown command");
    }

    #[tokio::test]
    async fn create_failure_replies_and_continues() {
        let mut h = harness(false);
        std::fs::create_dir(h.root.join(".x.part")).unwrap();

        assert_eq!(h.run("UPLOAD x 5").await.unwrap(), Flow::Continue);
        assert_eq!(h.line().await, "ERROR Cannot create file");
        assert!(!h.root.join("x").exists());
        assert!(h.root.join(".x.part").is_dir());
        assert!(h.dispatcher.locks().is_empty());

        h.run("FOO").await.unwrap();
        assert_eq!(h.line().await, "ERROR Unknown command");
    }

    #[tokio::test]
    async fn short_upload_aborts_without_reply() {
        let mut h = harness(false);
        h.client.write_all(&[7u8; 5]).await.unwrap();
        // close the client's write side by dropping the whole client half
        let Harness {
            _tmp,
            root,
            dispatcher,
            peer,
            client,
            mut server_r,
            mut server_w,
        } = h;
        drop(client);
        let err = dispatcher
            .execute("UPLOAD f 100", &mut server_r, &mut server_w, &peer)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::ShortUpload {
                expected: 100,
                received: 5
            }
        ));
        assert!(!root.join("f").exists());
        assert!(!root.join(".f.part").exists());
        assert!(dispatcher.locks().is_empty());
    }

    #[tokio::test]
    async fn stalled_upload_times_out() {
        let mut h = harness(false);
        h.client.write_all(b"ab").await.unwrap();
        let err = h.run("UPLOAD slow 10").await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout { .. }));
        assert!(!h.root.join(".slow.part").exists());
    }

    #[tokio::test]
    async fn exit_closes_without_reply() {
        let mut h = harness(false);
        assert_eq!(h.run("EXIT").await.unwrap(), Flow::Close);
    }

    #[tokio::test]
    async fn audit_records_transfers() {
        let mut h = harness(false);
        let log_path = h.root.join("audit").join("log.jsonl");
        let log = Arc::new(TransferLog::open(&log_path).unwrap());
        h.dispatcher = Dispatcher::new(
            FileStore::new(&h.root),
            Arc::new(LockRegistry::new()),
            settings(false),
        )
        .with_audit(log);

        h.client.write_all(b"xyz").await.unwrap();
        h.run("UPLOAD a 3").await.unwrap();
        assert_eq!(h.line().await, "OK Uploaded");
        h.run("DOWNLOAD a").await.unwrap();
        assert_eq!(h.line().await, "FILESIZE 3");

        let entries = TransferLog::read_log(&log_path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].op, TransferOp::Upload);
        assert_eq!(entries[1].op, TransferOp::Download);
        assert!(entries.iter().all(|e| e.status == TransferStatus::Completed && e.bytes == 3));
    }

    #[test]
    fn render_list_forms() {
        assert_eq!(render_list(&[]), "(no files)\n");
        let recs = vec![
            FileRecord { name: "x".into(), size: 1 },
            FileRecord { name: "y".into(), size: 2 },
        ];
        assert_eq!(render_list(&recs), "x\ny\n");
    }
}
