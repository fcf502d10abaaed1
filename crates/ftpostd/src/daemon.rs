//! Daemon lifecycle: startup checks, listener, systemd notify, shutdown

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ftpost_auth::CredentialStore;
use ftpost_core::config::{FtpostConfig, TlsConfig};
use ftpost_ftp::{load_acceptor, Server, ServerContext, ServerOptions, TlsSetupError};
use ftpost_upload::{HttpUpstream, Relay};
use prometheus_client::registry::Registry;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::{HealthState, RelayMetrics};

const STARTUP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fatal startup conditions. Each maps to its own process exit code.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("config file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("TLS file not found: {}", .0.display())]
    TlsFileNotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unusable TLS material: {0}")]
    UnusableTls(TlsSetupError),

    #[error("binding FTP listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

impl StartupError {
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::ConfigNotFound(_) => 1,
            StartupError::TlsFileNotFound(_) => 2,
            StartupError::InvalidConfig(_) => 3,
            StartupError::UnusableTls(_) => 4,
            StartupError::Bind { .. } => 5,
        }
    }
}

impl From<TlsSetupError> for StartupError {
    fn from(err: TlsSetupError) -> Self {
        match err {
            TlsSetupError::NotFound(path) => StartupError::TlsFileNotFound(path),
            other => StartupError::UnusableTls(other),
        }
    }
}

fn invalid(err: impl std::fmt::Display) -> StartupError {
    StartupError::InvalidConfig(err.to_string())
}

/// Load the FTPS acceptor if a certificate is configured.
fn load_tls(tls: &TlsConfig) -> Result<Option<TlsAcceptor>, StartupError> {
    let (Some(cert), Some(key)) = (tls.cert_path.as_ref(), tls.key_file()) else {
        return Ok(None);
    };
    let acceptor = load_acceptor(cert, key)?;
    info!(cert = %cert.display(), "FTPS enabled; TLS required on control and data channels");
    Ok(Some(acceptor))
}

pub async fn run(config: FtpostConfig, check_only: bool) -> Result<(), StartupError> {
    let accounts = CredentialStore::load(&config.accounts).map_err(invalid)?;
    if accounts.is_empty() {
        warn!("no accounts configured; every login will fail");
    }
    let upstream = HttpUpstream::from_config(&config.relay).map_err(invalid)?;
    let relay_endpoint = upstream.endpoint().clone();
    let options = ServerOptions::from_config(&config.server).map_err(invalid)?;
    let tls = load_tls(&config.tls)?;

    if check_only {
        info!(
            accounts = accounts.len(),
            relay = %relay_endpoint,
            tls = tls.is_some(),
            "configuration ok"
        );
        return Ok(());
    }

    match ftpost_upload::check_reachable(&relay_endpoint, STARTUP_PROBE_TIMEOUT).await {
        Ok(()) => info!(relay = %relay_endpoint, "relay endpoint: reachable"),
        Err(e) => warn!(relay = %relay_endpoint, "relay endpoint: {e:#} (continuing)"),
    }

    let mut registry = Registry::default();
    let metrics = RelayMetrics::new(&mut registry);
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let state = HealthState {
            registry: Arc::new(registry),
            relay: relay_endpoint.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    let ctx = ServerContext {
        authenticator: Arc::new(accounts),
        filesystems: Arc::new(Relay::new(
            Arc::new(upstream),
            config.relay.spool_threshold_bytes,
        )),
        observer: Arc::new(metrics),
        tls,
        options,
    };

    let listen = format!("{}:{}", config.server.listen_host, config.server.listen_port);
    let server = Server::bind(listen.as_str(), ctx)
        .await
        .map_err(|source| StartupError::Bind {
            addr: listen.clone(),
            source,
        })?;

    let shutdown = CancellationToken::new();
    let signals = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!("signal handler failed: {e:#}");
        }
        signals.cancel();
    });

    notify_ready();
    server.serve(shutdown).await;
    info!("ftpostd stopped");
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("waiting for ctrl-c")?;
        info!("received ctrl-c");
    }
    Ok(())
}

fn notify_ready() {
    // Send sd_notify(READY=1) to systemd if running as a service
    // Uses $NOTIFY_SOCKET env var; no-op if not set
    #[cfg(unix)]
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
