//! Listener lifecycle and the state shared by every connection.

use crate::blocklist::Blocklist;
use crate::cache::ResponseCache;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::handler;
use crate::request_log::RequestLog;
use crate::stats::{Stats, StatsSnapshot};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const LISTEN_BACKLOG: i32 = 1024;

/// State shared by the listener and every connection task.
///
/// Each structure guards its own operations; nothing here is locked across
/// more than one call, so concurrent requests to the same URL may still
/// interleave around the cache.
pub struct ServerContext {
    pub config: ProxyConfig,
    pub blocklist: Blocklist,
    pub cache: ResponseCache,
    pub log: RequestLog,
    pub stats: Stats,
}

impl ServerContext {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            blocklist: Blocklist::new(),
            cache: ResponseCache::new(),
            log: RequestLog::new(),
            stats: Stats::new(),
        }
    }

    /// Open an outbound connection, bounded by `connect_timeout` when set.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let target = format!("{}:{}", host, port);
        let connect_future = TcpStream::connect((host, port));

        let connected = match self.config.connect_timeout {
            Some(timeout_duration) => match timeout(timeout_duration, connect_future).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("Upstream timeout {}", target);
                    return Err(ProxyError::OriginTimeout { target });
                }
            },
            None => connect_future.await,
        };

        connected.map_err(|source| {
            debug!("Upstream connect failed {}: {}", target, source);
            ProxyError::OriginUnreachable { target, source }
        })
    }
}

/// Forwarding proxy with start/stop control.
///
/// All methods take `&self` and may be called from any thread or task while
/// the accept loop runs.
pub struct ProxyServer {
    ctx: Arc<ServerContext>,
    running: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            ctx: Arc::new(ServerContext::new(config)),
            running,
            accept_task: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Bind the listening socket and start accepting connections.
    ///
    /// Returns the bound address, which resolves a configured port 0.
    ///
    /// # Errors
    /// * `ProxyError::AlreadyRunning` - the accept loop is active
    /// * `ProxyError::Bind` - the socket could not be created or bound
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut accept_task = self.accept_task.lock().await;
        if self.is_running() {
            return Err(ProxyError::AlreadyRunning);
        }

        // A previous loop may still hold the port after stop().
        if let Some(previous) = accept_task.take() {
            let _ = previous.await;
        }

        let listener = bind_listener(self.ctx.config.listen_addr)?;
        let local_addr = listener.local_addr()?;

        self.running.send_replace(true);
        info!("Proxy server started on {}", local_addr);

        *accept_task = Some(tokio::spawn(accept_loop(
            Arc::clone(&self.ctx),
            listener,
            self.running.subscribe(),
        )));

        Ok(local_addr)
    }

    /// Stop accepting new connections. Connections already accepted run to
    /// completion.
    pub fn stop(&self) {
        if self.running.send_replace(false) {
            info!("Proxy server stopped.");
        }
    }

    /// Write the request log to the configured report path, replacing it.
    pub async fn generate_report(&self) -> Result<PathBuf> {
        let path = self.ctx.config.report_path.clone();
        let records = self.ctx.log.write_report(&path).await?;
        info!("Report generated: {} ({} records)", path.display(), records);
        Ok(path)
    }

    /// Returns `false` if the host was already blocked.
    pub fn add_blocked_host(&self, host: impl Into<String>) -> bool {
        let host = host.into();
        let added = self.ctx.blocklist.add(host.clone());
        if added {
            info!("Blocking host {}", host);
        }
        added
    }

    pub fn list_blocked_hosts(&self) -> BTreeSet<String> {
        self.ctx.blocklist.list()
    }

    pub fn log_records(&self) -> Vec<String> {
        self.ctx.log.export()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let bind_err = |source| ProxyError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

    TcpListener::from_std(socket.into()).map_err(bind_err)
}

async fn accept_loop(ctx: Arc<ServerContext>, listener: TcpListener, mut running: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;

            _ = running.wait_for(|r| !*r) => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => spawn_connection(&ctx, stream, peer),
                Err(e) => warn!(error = %e, "Accept error"),
            },
        }
    }

    if let Ok(addr) = listener.local_addr() {
        debug!("Listener on {} closed", addr);
    }
}

fn spawn_connection(ctx: &Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    ctx.stats.connection_start();

    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        if let Err(e) = handler::handle_connection(&ctx, stream, peer).await {
            debug!(%peer, error = %e, "Connection error");
            Stats::incr(&ctx.stats.failed);
        }
        ctx.stats.connection_end();
    });
}
