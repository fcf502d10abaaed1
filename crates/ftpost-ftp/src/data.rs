//! Data connections: passive listeners, active connects, optional TLS.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Anything a control or data connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// A data connection that has been negotiated but not yet established.
pub enum DataChannel {
    Passive {
        listener: TcpListener,
        peer_ip: IpAddr,
    },
    Active {
        target: SocketAddr,
    },
}

impl DataChannel {
    /// Listen on `local_ip`, inside `ports` if a range is configured.
    pub async fn bind_passive(
        local_ip: IpAddr,
        ports: Option<(u16, u16)>,
        peer_ip: IpAddr,
    ) -> io::Result<Self> {
        let listener = match ports {
            None => TcpListener::bind((local_ip, 0)).await?,
            Some((lo, hi)) => bind_in_range(local_ip, lo, hi).await?,
        };
        Ok(DataChannel::Passive { listener, peer_ip })
    }

    pub fn active(target: SocketAddr) -> Self {
        DataChannel::Active { target }
    }

    pub fn local_port(&self) -> Option<u16> {
        match self {
            DataChannel::Passive { listener, .. } => {
                listener.local_addr().ok().map(|addr| addr.port())
            }
            DataChannel::Active { .. } => None,
        }
    }

    /// Establish the connection, wrapping it in TLS when `tls` is given.
    /// Passive connections from any host other than the control peer are
    /// refused and the wait continues.
    pub async fn establish(
        self,
        timeout: Duration,
        tls: Option<&TlsAcceptor>,
    ) -> io::Result<BoxedStream> {
        let tcp = tokio::time::timeout(timeout, self.connect())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "data connection timed out"))??;
        let _ = tcp.set_nodelay(true);

        match tls {
            None => Ok(Box::new(tcp)),
            Some(acceptor) => {
                let stream = tokio::time::timeout(timeout, acceptor.accept(tcp))
                    .await
                    .map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::TimedOut,
                            "data channel TLS handshake timed out",
                        )
                    })??;
                Ok(Box::new(stream))
            }
        }
    }

    async fn connect(self) -> io::Result<TcpStream> {
        match self {
            DataChannel::Active { target } => {
                debug!(%target, "opening active data connection");
                TcpStream::connect(target).await
            }
            DataChannel::Passive { listener, peer_ip } => loop {
                let (stream, addr) = listener.accept().await?;
                if same_host(addr.ip(), peer_ip) {
                    debug!(%addr, "passive data connection accepted");
                    return Ok(stream);
                }
                warn!(%addr, expected = %peer_ip, "rejected foreign data connection");
            },
        }
    }
}

async fn bind_in_range(ip: IpAddr, lo: u16, hi: u16) -> io::Result<TcpListener> {
    for port in lo..=hi {
        match TcpListener::bind((ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("no free passive port in {lo}-{hi}"),
    ))
}

pub fn same_host(a: IpAddr, b: IpAddr) -> bool {
    a.to_canonical() == b.to_canonical()
}

/// Why an active-mode target was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveRejection {
    ForeignAddress,
    PrivilegedPort,
}

impl ActiveRejection {
    pub fn message(self) -> &'static str {
        match self {
            ActiveRejection::ForeignAddress => "Rejected data connection to foreign address.",
            ActiveRejection::PrivilegedPort => "Rejected data connection to privileged port.",
        }
    }
}

/// Active connections may only go back to the control peer, on an
/// unprivileged port.
pub fn validate_active(target: SocketAddr, peer_ip: IpAddr) -> Result<(), ActiveRejection> {
    if !same_host(target.ip(), peer_ip) {
        return Err(ActiveRejection::ForeignAddress);
    }
    if target.port() < 1024 {
        return Err(ActiveRejection::PrivilegedPort);
    }
    Ok(())
}

/// `PORT h1,h2,h3,h4,p1,p2`
pub fn parse_port_arg(arg: &str) -> Option<SocketAddr> {
    let fields: Vec<u8> = arg
        .trim()
        .split(',')
        .map(|f| f.trim().parse::<u8>())
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(fields[0], fields[1], fields[2], fields[3]);
    let port = u16::from(fields[4]) << 8 | u16::from(fields[5]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// `EPRT |proto|addr|port|`, any delimiter character.
pub fn parse_eprt_arg(arg: &str) -> Option<SocketAddr> {
    let arg = arg.trim();
    let delim = arg.chars().next()?;
    let parts: Vec<&str> = arg.split(delim).collect();
    // "", proto, addr, port, ""
    if parts.len() != 5 || !parts[0].is_empty() || !parts[4].is_empty() {
        return None;
    }
    let ip: IpAddr = parts[2].parse().ok()?;
    match (parts[1], ip) {
        ("1", IpAddr::V4(_)) | ("2", IpAddr::V6(_)) => {}
        _ => return None,
    }
    let port: u16 = parts[3].parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

/// Text of a 227 reply.
pub fn pasv_reply_text(ip: Ipv4Addr, port: u16) -> String {
    let [a, b, c, d] = ip.octets();
    format!(
        "Entering passive mode ({a},{b},{c},{d},{},{}).",
        port >> 8,
        port & 0xff
    )
}

/// Text of a 229 reply.
pub fn epsv_reply_text(port: u16) -> String {
    format!("Entering extended passive mode (|||{port}|).")
}
