//! TCP listener: admission control and per-connection tasks.

use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::select;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::audit::TransferLog;
use crate::codec::write_line_timed;
use crate::config::ServerConfig;
use crate::dispatch::{DispatchSettings, Dispatcher, PeerInfo};
use crate::locks::LockRegistry;
use crate::protocol::reply;
use crate::session::handle_connection;
use crate::store::FileStore;

pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    limiter: Arc<Semaphore>,
    idle_timeout: Duration,
    io_timeout: Duration,
}

/// Bind `addr` with an explicit listen backlog.
async fn listen(addr: &str, backlog: u32) -> Result<TcpListener> {
    let sock_addr = lookup_host(addr)
        .await
        .with_context(|| format!("resolve {}", addr))?
        .next()
        .ok_or_else(|| anyhow!("no address for {}", addr))?;
    let socket = if sock_addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket
        .bind(sock_addr)
        .with_context(|| format!("bind {}", sock_addr))?;
    socket
        .listen(backlog)
        .with_context(|| format!("listen on {}", sock_addr))
}

impl Server {
    /// Validate the root, open the audit log and bind the listener.
    pub async fn bind(cfg: &ServerConfig) -> Result<Self> {
        cfg.validate()?;
        let root = cfg.canonical_root()?;
        let mut dispatcher = Dispatcher::new(
            FileStore::new(&root),
            Arc::new(LockRegistry::new()),
            DispatchSettings::from(cfg),
        );
        if let Some(path) = &cfg.audit_log {
            dispatcher = dispatcher.with_audit(Arc::new(TransferLog::open(path)?));
        }
        let listener = listen(&cfg.bind, cfg.backlog).await?;
        info!(
            addr = %listener.local_addr()?,
            root = %root.display(),
            max_connections = cfg.max_connections,
            "ferryd listening"
        );
        Ok(Self {
            listener,
            dispatcher: Arc::new(dispatcher),
            limiter: Arc::new(Semaphore::new(cfg.max_connections)),
            idle_timeout: cfg.idle_timeout(),
            io_timeout: cfg.io_timeout(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Accept connections until `shutdown` resolves. Handlers already
    /// running are left to the runtime.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        loop {
            select! {
                _ = &mut shutdown => {
                    info!("shutting down listener");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.admit(stream, addr),
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        match Arc::clone(&self.limiter).try_acquire_owned() {
            Ok(permit) => self.spawn_handler(stream, addr, permit),
            Err(_) => {
                warn!(peer = %addr, "connection limit reached, rejecting");
                let io_timeout = self.io_timeout;
                tokio::spawn(async move {
                    let mut stream = stream;
                    let _ = write_line_timed(&mut stream, reply::ERR_BUSY, io_timeout).await;
                    let _ = stream.shutdown().await;
                });
            }
        }
    }

    fn spawn_handler(&self, stream: TcpStream, addr: SocketAddr, permit: OwnedSemaphorePermit) {
        let peer = PeerInfo {
            conn: Uuid::new_v4().simple().to_string(),
            addr: addr.to_string(),
        };
        let span = info_span!("conn", peer = %peer.addr, id = %peer.conn);
        let dispatcher = Arc::clone(&self.dispatcher);
        let idle_timeout = self.idle_timeout;
        tokio::spawn(
            async move {
                let _permit = permit;
                if let Err(e) = handle_connection(stream, peer, dispatcher, idle_timeout).await {
                    warn!(error = %e, "connection closed with error");
                }
            }
            .instrument(span),
        );
    }
}
