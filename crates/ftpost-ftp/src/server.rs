//! Listener, connection limits and the per-connection task spawn.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ftpost_auth::Authenticator;
use ftpost_core::config::ServerConfig;
use ftpost_core::{FtpostError, FtpostResult};
use ftpost_fs::FilesystemProvider;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::observer::SessionObserver;
use crate::session::Session;

const TOO_MANY: &str = "421 Too many connections. Service temporarily unavailable.\r\n";
const TOO_MANY_PER_IP: &str = "421 Too many connections from the same IP address.\r\n";

/// Protocol-level knobs, resolved from `[server]`.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub banner: String,
    pub idle_timeout: Duration,
    pub data_timeout: Duration,
    pub passive_ports: Option<(u16, u16)>,
    pub masquerade_address: Option<Ipv4Addr>,
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
}

impl ServerOptions {
    pub fn from_config(config: &ServerConfig) -> FtpostResult<Self> {
        let masquerade_address = config
            .masquerade_address
            .as_deref()
            .map(|addr| {
                addr.parse::<Ipv4Addr>().map_err(|_| {
                    FtpostError::Config(format!(
                        "masquerade_address is not an IPv4 address: {addr}"
                    ))
                })
            })
            .transpose()?;
        Ok(ServerOptions {
            banner: config.banner.clone(),
            idle_timeout: config.idle_timeout(),
            data_timeout: config.data_timeout(),
            passive_ports: config.passive_ports(),
            masquerade_address,
            max_connections: config.max_connections,
            max_connections_per_ip: config.max_connections_per_ip,
        })
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        let config = ServerConfig::default();
        ServerOptions {
            banner: config.banner.clone(),
            idle_timeout: config.idle_timeout(),
            data_timeout: config.data_timeout(),
            passive_ports: config.passive_ports(),
            masquerade_address: None,
            max_connections: config.max_connections,
            max_connections_per_ip: config.max_connections_per_ip,
        }
    }
}

/// Everything a session needs, shared read-only between sessions.
pub struct ServerContext {
    pub authenticator: Arc<dyn Authenticator>,
    pub filesystems: Arc<dyn FilesystemProvider>,
    pub observer: Arc<dyn SessionObserver>,
    /// Present when FTPS is configured. TLS is then mandatory.
    pub tls: Option<TlsAcceptor>,
    pub options: ServerOptions,
}

pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    limiter: Arc<ConnectionLimiter>,
}

impl Server {
    pub async fn bind(addr: impl ToSocketAddrs, ctx: ServerContext) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let limiter = Arc::new(ConnectionLimiter::new(
            ctx.options.max_connections,
            ctx.options.max_connections_per_ip,
        ));
        Ok(Server {
            listener,
            ctx: Arc::new(ctx),
            limiter,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires, then wait for open
    /// sessions to finish. Sessions are asked to close at their next idle
    /// point; an upload in progress is allowed to complete its relay.
    pub async fn serve(self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        info!(
            addr = ?self.listener.local_addr().ok(),
            tls = self.ctx.tls.is_some(),
            "ftp: listening"
        );

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                },
            };

            let guard = match self.limiter.try_acquire(peer.ip()) {
                Ok(guard) => guard,
                Err(limit) => {
                    tracker.spawn(refuse(stream, peer, limit));
                    continue;
                }
            };

            let ctx = self.ctx.clone();
            let token = shutdown.child_token();
            let span = info_span!("session", id = %Uuid::new_v4(), %peer);
            tracker.spawn(
                async move {
                    let _guard = guard;
                    ctx.observer.session_opened();
                    match stream.local_addr() {
                        Ok(local) => {
                            Session::new(peer, local, ctx.clone(), token)
                                .run(stream)
                                .await
                        }
                        Err(e) => debug!("session setup failed: {e}"),
                    }
                    ctx.observer.session_closed();
                }
                .instrument(span),
            );
        }

        tracker.close();
        info!(open = tracker.len(), "ftp: waiting for sessions to finish");
        tracker.wait().await;
        info!("ftp: stopped");
    }
}

async fn refuse(mut stream: TcpStream, peer: SocketAddr, limit: LimitExceeded) {
    let line = match limit {
        LimitExceeded::Total => TOO_MANY,
        LimitExceeded::PerIp => TOO_MANY_PER_IP,
    };
    warn!(%peer, ?limit, "connection refused");
    let _ = stream.write_all(line.as_bytes()).await;
    let _ = stream.shutdown().await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitExceeded {
    Total,
    PerIp,
}

/// Counts open sessions overall and per peer address.
pub struct ConnectionLimiter {
    max_total: usize,
    max_per_ip: usize,
    state: Mutex<LimiterState>,
}

#[derive(Default)]
struct LimiterState {
    total: usize,
    per_ip: HashMap<IpAddr, usize>,
}

impl ConnectionLimiter {
    pub fn new(max_total: usize, max_per_ip: usize) -> Self {
        ConnectionLimiter {
            max_total,
            max_per_ip,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn try_acquire(self: &Arc<Self>, ip: IpAddr) -> Result<ConnectionGuard, LimitExceeded> {
        let ip = ip.to_canonical();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.total >= self.max_total {
            return Err(LimitExceeded::Total);
        }
        let count = state.per_ip.entry(ip).or_insert(0);
        if *count >= self.max_per_ip {
            return Err(LimitExceeded::PerIp);
        }
        *count += 1;
        state.total += 1;
        Ok(ConnectionGuard {
            limiter: self.clone(),
            ip,
        })
    }

    pub fn open(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).total
    }

    fn release(&self, ip: IpAddr) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.total = state.total.saturating_sub(1);
        if let Some(count) = state.per_ip.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                state.per_ip.remove(&ip);
            }
        }
    }
}

/// Releases its slot on drop.
pub struct ConnectionGuard {
    limiter: Arc<ConnectionLimiter>,
    ip: IpAddr,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.limiter.release(self.ip);
    }
}
