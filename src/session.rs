//! Per-connection command loop

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::codec::{read_line, timed};
use crate::dispatch::{Dispatcher, Flow, PeerInfo};
use crate::error::SessionResult;

/// Serve one connection until the peer sends EXIT, disconnects, idles past
/// `idle_timeout`, or the stream breaks mid-command.
///
/// Commands are handled strictly in arrival order. The read side is
/// buffered once here and handed to the dispatcher, so upload bodies are
/// read from the same buffer as the header line that announced them.
pub async fn handle_connection<S>(
    stream: S,
    peer: PeerInfo,
    dispatcher: Arc<Dispatcher>,
    idle_timeout: Duration,
) -> SessionResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (rd, mut writer) = split(stream);
    let mut reader = BufReader::new(rd);
    info!("client connected");

    loop {
        let line = match timed("read command", idle_timeout, read_line(&mut reader)).await? {
            Some(line) => line,
            None => {
                info!("client disconnected");
                break;
            }
        };
        debug!(cmd = %line, "CMD");
        if dispatcher.execute(&line, &mut reader, &mut writer, &peer).await? == Flow::Close {
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "shutdown after close");
    }
    info!("handler closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchSettings;
    use crate::error::SessionError;
    use crate::locks::LockRegistry;
    use crate::store::FileStore;
    use tempfile::TempDir;
    use tokio::io::{duplex, AsyncReadExt};

    fn dispatcher(root: &std::path::Path) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            FileStore::new(root),
            Arc::new(LockRegistry::new()),
            DispatchSettings {
                io_timeout: Duration::from_millis(500),
                chunk_size: 8192,
                legacy_list: false,
            },
        ))
    }

    fn peer() -> PeerInfo {
        PeerInfo {
            conn: "t".into(),
            addr: "memory".into(),
        }
    }

    #[tokio::test]
    async fn runs_commands_in_order_until_exit() {
        let tmp = TempDir::new().unwrap();
        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(handle_connection(
            server,
            peer(),
            dispatcher(tmp.path()),
            Duration::from_secs(5),
        ));

        // upload header and body in one write, pipelined with later commands
        client
            .write_all(b"FOO\r\nUPLOAD a.txt 3\nabcDOWNLOAD a.txt\nEXIT\n")
            .await
            .unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "ERROR Unknown command\nOK Uploaded\nFILESIZE 3\nabc"
        );
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn peer_close_ends_loop_cleanly() {
        let tmp = TempDir::new().unwrap();
        let (client, server) = duplex(1024);
        drop(client);
        handle_connection(server, peer(), dispatcher(tmp.path()), Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn idle_peer_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let (_client, server) = duplex(1024);
        let err = handle_connection(server, peer(), dispatcher(tmp.path()), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { op: "read command", .. }));
    }
}
