//! Integration test: FTP client → ftpost-ftp server → local HTTP endpoint
//!
//! Each test starts a real server on 127.0.0.1 backed by a throwaway axum
//! endpoint and drives it with a minimal line-oriented FTP client.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use rustls::pki_types::ServerName;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

use ftpost_auth::{CredentialStore, PasswordRecord};
use ftpost_ftp::{load_acceptor, NoopObserver, Server, ServerContext, ServerOptions};
use ftpost_upload::{multipart, Endpoint, HttpUpstream, Relay};

#[derive(Clone)]
struct Intake {
    status: StatusCode,
    posts: Arc<Mutex<Vec<Bytes>>>,
}

async fn record(State(ep): State<Intake>, body: Bytes) -> StatusCode {
    ep.posts.lock().unwrap().push(body);
    ep.status
}

struct Harness {
    addr: SocketAddr,
    posts: Arc<Mutex<Vec<Bytes>>>,
    shutdown: CancellationToken,
}

impl Harness {
    fn posts(&self) -> Vec<Bytes> {
        self.posts.lock().unwrap().clone()
    }

    async fn connect(&self) -> Client<TcpStream> {
        let mut client = Client::new(TcpStream::connect(self.addr).await.unwrap());
        let (code, _) = client.reply().await;
        assert_eq!(code, 220);
        client
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn test_options() -> ServerOptions {
    ServerOptions {
        data_timeout: Duration::from_secs(5),
        ..ServerOptions::default()
    }
}

async fn start(status: StatusCode, options: ServerOptions, tls: Option<TlsAcceptor>) -> Harness {
    let ep = Intake {
        status,
        posts: Arc::default(),
    };
    let app = Router::new()
        .route("/upload/", post(record))
        .with_state(ep.clone());
    let http = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/upload/", http.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(http, app).await.unwrap();
    });

    let upstream = HttpUpstream::new(Endpoint::parse(&url).unwrap(), Some(Duration::from_secs(5)))
        .unwrap();
    let relay = Relay::new(Arc::new(upstream), 1024);

    let mut accounts = CredentialStore::new();
    accounts
        .add_account("alice", PasswordRecord::new("plain:secret"))
        .unwrap();

    let ctx = ServerContext {
        authenticator: Arc::new(accounts),
        filesystems: Arc::new(relay),
        observer: Arc::new(NoopObserver),
        tls,
        options,
    };
    let server = Server::bind("127.0.0.1:0", ctx).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.serve(shutdown.clone()));

    Harness {
        addr,
        posts: ep.posts,
        shutdown,
    }
}

struct Client<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    fn new(stream: S) -> Self {
        Client {
            stream: BufReader::new(stream),
        }
    }

    /// Read one complete (possibly multi-line) reply.
    async fn reply(&mut self) -> (u16, String) {
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await.unwrap();
            assert!(n > 0, "server closed the control connection");
            let line = line.trim_end().to_string();
            let bytes = line.as_bytes();
            if bytes.len() >= 4 && bytes[..3].iter().all(u8::is_ascii_digit) && bytes[3] == b' ' {
                return (line[..3].parse().unwrap(), line[4..].to_string());
            }
        }
    }

    async fn send(&mut self, line: &str) {
        let stream = self.stream.get_mut();
        stream.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.stream.get_mut();
        stream.write_all(bytes).await.unwrap();
        stream.flush().await.unwrap();
    }

    async fn cmd(&mut self, line: &str) -> (u16, String) {
        self.send(line).await;
        self.reply().await
    }

    async fn login(&mut self) {
        assert_eq!(self.cmd("USER alice").await.0, 331);
        assert_eq!(self.cmd("PASS secret").await, (230, "Login successful.".into()));
    }

    /// Enter passive mode and connect to the advertised port.
    async fn pasv(&mut self) -> TcpStream {
        let (code, text) = self.cmd("PASV").await;
        assert_eq!(code, 227, "{text}");
        let inner = &text[text.find('(').unwrap() + 1..text.find(')').unwrap()];
        let nums: Vec<u16> = inner.split(',').map(|n| n.parse().unwrap()).collect();
        let port = nums[4] * 256 + nums[5];
        TcpStream::connect(("127.0.0.1", port)).await.unwrap()
    }

    fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

fn expected_body(account: &str, filename: &str, payload: &[u8]) -> Vec<u8> {
    [
        multipart::preamble(account, filename),
        payload.to_vec(),
        multipart::closing(),
    ]
    .concat()
}

#[tokio::test]
async fn upload_is_relayed_as_one_post() {
    let h = start(StatusCode::OK, test_options(), None).await;
    let mut client = h.connect().await;
    client.login().await;
    assert_eq!(client.cmd("TYPE I").await.0, 200);

    let mut data = client.pasv().await;
    assert_eq!(client.cmd("STOR report.csv").await.0, 150);
    data.write_all(b"a,b,c\n1,2,3\n").await.unwrap();
    drop(data);
    assert_eq!(client.reply().await, (226, "Transfer complete.".into()));

    let posts = h.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(
        posts[0].as_ref(),
        expected_body("alice", "report.csv", b"a,b,c\n1,2,3\n").as_slice()
    );
    assert_eq!(client.cmd("QUIT").await, (221, "Goodbye.".into()));
}

#[tokio::test]
async fn large_upload_spills_and_relays_intact() {
    let h = start(StatusCode::OK, test_options(), None).await;
    let mut client = h.connect().await;
    client.login().await;

    let payload: Vec<u8> = (0u32..300_000).map(|i| (i % 253) as u8).collect();
    let mut data = client.pasv().await;
    assert_eq!(client.cmd("STOR /big.bin").await.0, 150);
    data.write_all(&payload).await.unwrap();
    drop(data);
    assert_eq!(client.reply().await.0, 226);

    let posts = h.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].as_ref(), expected_body("alice", "big.bin", &payload).as_slice());
}

#[tokio::test]
async fn upstream_error_becomes_550() {
    let h = start(StatusCode::INTERNAL_SERVER_ERROR, test_options(), None).await;
    let mut client = h.connect().await;
    client.login().await;

    let mut data = client.pasv().await;
    assert_eq!(client.cmd("STOR x.txt").await.0, 150);
    data.write_all(b"payload").await.unwrap();
    drop(data);
    assert_eq!(
        client.reply().await,
        (
            550,
            "Error transferring to HTTP - 500: Internal Server Error".into()
        )
    );
    assert_eq!(h.posts().len(), 1);

    // The session stays usable after a failed relay.
    assert_eq!(client.cmd("NOOP").await.0, 200);
}

#[tokio::test]
async fn anonymous_and_bad_passwords_are_refused() {
    let h = start(StatusCode::OK, test_options(), None).await;
    let mut client = h.connect().await;

    assert_eq!(client.cmd("USER anonymous").await.0, 331);
    assert_eq!(
        client.cmd("PASS guest@example.com").await,
        (530, "Anonymous access not allowed.".into())
    );
    assert_eq!(client.cmd("USER alice").await.0, 331);
    assert_eq!(
        client.cmd("PASS wrong").await,
        (530, "Authentication failed.".into())
    );
    assert_eq!(client.cmd("USER alice").await.0, 331);
    assert_eq!(
        client.cmd("PASS wrong").await,
        (530, "Maximum login attempts. Disconnecting.".into())
    );
}

#[tokio::test]
async fn commands_before_login_are_refused() {
    let h = start(StatusCode::OK, test_options(), None).await;
    let mut client = h.connect().await;

    assert_eq!(client.cmd("SYST").await, (215, "UNIX Type: L8".into()));
    assert_eq!(client.cmd("PWD").await.0, 530);
    assert_eq!(client.cmd("STOR x").await.0, 530);
    assert!(h.posts().is_empty());
}

#[tokio::test]
async fn filesystem_operations_are_disabled() {
    let h = start(StatusCode::OK, test_options(), None).await;
    let mut client = h.connect().await;
    client.login().await;

    let (code, text) = client.cmd("MKD newdir").await;
    assert_eq!(code, 550);
    assert!(text.contains("mkdir: filesystem operations are disabled."), "{text}");
    assert_eq!(client.cmd("DELE report.csv").await.0, 550);
    assert_eq!(client.cmd("RMD /").await.0, 550);
    assert_eq!(client.cmd("SIZE report.csv").await.0, 550);
    assert_eq!(client.cmd("MDTM report.csv").await.0, 550);
    assert_eq!(client.cmd("RNFR a.txt").await.0, 350);
    assert_eq!(client.cmd("RNTO b.txt").await.0, 550);
    assert_eq!(client.cmd("SITE CHMOD 644 a.txt").await.0, 550);

    let (code, text) = client.cmd("RETR report.csv").await;
    assert_eq!(code, 550);
    assert!(text.contains("disabled"), "{text}");

    // Paths are confined to the account, so this names a subdirectory of it.
    let (code, text) = client.cmd("STOR ../bob/evil.txt").await;
    assert_eq!(code, 550);
    assert!(text.contains("open /alice/bob/evil.txt"), "{text}");
    assert!(h.posts().is_empty());
}

#[tokio::test]
async fn directory_navigation_stays_at_root() {
    let h = start(StatusCode::OK, test_options(), None).await;
    let mut client = h.connect().await;
    client.login().await;

    assert_eq!(
        client.cmd("PWD").await,
        (257, "\"/\" is the current directory.".into())
    );
    assert_eq!(client.cmd("CWD /sub").await.0, 550);
    assert_eq!(client.cmd("CWD /").await.0, 250);
    assert_eq!(client.cmd("CDUP").await.0, 250);
    assert_eq!(client.cmd("PWD").await.0, 257);
}

#[tokio::test]
async fn listing_root_is_empty() {
    let h = start(StatusCode::OK, test_options(), None).await;
    let mut client = h.connect().await;
    client.login().await;

    let mut data = client.pasv().await;
    assert_eq!(client.cmd("LIST -la").await.0, 150);
    let mut listing = Vec::new();
    data.read_to_end(&mut listing).await.unwrap();
    assert!(listing.is_empty());
    assert_eq!(client.reply().await.0, 226);
}

#[tokio::test]
async fn stor_without_data_connection_times_out() {
    let options = ServerOptions {
        data_timeout: Duration::from_millis(300),
        ..ServerOptions::default()
    };
    let h = start(StatusCode::OK, options, None).await;
    let mut client = h.connect().await;
    client.login().await;

    assert_eq!(client.cmd("STOR early.txt").await.0, 425);

    let (code, _) = client.cmd("PASV").await;
    assert_eq!(code, 227);
    assert_eq!(client.cmd("STOR never.txt").await.0, 150);
    assert_eq!(
        client.reply().await,
        (425, "Can't open data connection.".into())
    );
    assert!(h.posts().is_empty());
}

#[tokio::test]
async fn per_ip_limit_refuses_extra_connection() {
    let options = ServerOptions {
        max_connections_per_ip: 1,
        ..test_options()
    };
    let h = start(StatusCode::OK, options, None).await;
    let _first = h.connect().await;

    let mut second = Client::new(TcpStream::connect(h.addr).await.unwrap());
    assert_eq!(
        second.reply().await,
        (421, "Too many connections from the same IP address.".into())
    );
}

#[tokio::test]
async fn overlong_command_line_is_rejected() {
    let h = start(StatusCode::OK, test_options(), None).await;
    let mut client = h.connect().await;

    let long = format!("NOOP {}", "x".repeat(3000));
    assert_eq!(
        client.cmd(&long).await,
        (500, "Command line too long.".into())
    );
    assert_eq!(client.cmd("NOOP").await.0, 200);
}

#[tokio::test]
async fn non_utf8_command_is_not_dispatched() {
    let h = start(StatusCode::OK, test_options(), None).await;
    let mut client = h.connect().await;
    client.login().await;

    let _data = client.pasv().await;
    client.send_raw(b"STOR caf\xe9.txt\r\n").await;
    assert_eq!(client.reply().await, (501, "Can't decode command.".into()));
    assert_eq!(client.cmd("NOOP").await.0, 200);
    assert!(h.posts().is_empty());
}

#[tokio::test]
async fn idle_control_connection_is_closed() {
    let options = ServerOptions {
        idle_timeout: Duration::from_millis(300),
        ..test_options()
    };
    let h = start(StatusCode::OK, options, None).await;
    let mut client = h.connect().await;
    assert_eq!(
        client.reply().await,
        (421, "Control connection timed out.".into())
    );
}

#[tokio::test]
async fn shutdown_notifies_idle_sessions() {
    let h = start(StatusCode::OK, test_options(), None).await;
    let mut client = h.connect().await;
    client.login().await;

    h.shutdown.cancel();
    assert_eq!(client.reply().await, (421, "Server shutting down.".into()));
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn client_tls() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    let mut pem = std::io::BufReader::new(std::fs::File::open(fixture("ca.pem")).unwrap());
    for cert in rustls_pemfile::certs(&mut pem) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn ftps_requires_tls_and_relays_protected_upload() {
    let acceptor = load_acceptor(&fixture("cert.pem"), &fixture("key.pem")).unwrap();
    let h = start(StatusCode::OK, test_options(), Some(acceptor)).await;
    let mut client = h.connect().await;

    assert_eq!(
        client.cmd("USER alice").await,
        (550, "SSL/TLS required on the control channel.".into())
    );
    assert_eq!(client.cmd("AUTH TLS").await.0, 234);

    let connector = client_tls();
    let name = ServerName::try_from("localhost").unwrap();
    let tls = connector
        .connect(name.clone(), client.into_inner())
        .await
        .unwrap();
    let mut client = Client::new(tls);
    client.login().await;

    let _unprotected = client.pasv().await;
    assert_eq!(
        client.cmd("STOR clear.txt").await,
        (522, "SSL/TLS required on the data channel.".into())
    );

    assert_eq!(client.cmd("PBSZ 0").await.0, 200);
    assert_eq!(client.cmd("PROT P").await.0, 200);

    let data = client.pasv().await;
    assert_eq!(client.cmd("STOR secret.txt").await.0, 150);
    let mut data = connector.connect(name, data).await.unwrap();
    data.write_all(b"top secret").await.unwrap();
    data.shutdown().await.unwrap();
    drop(data);
    assert_eq!(client.reply().await, (226, "Transfer complete.".into()));

    let posts = h.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(
        posts[0].as_ref(),
        expected_body("alice", "secret.txt", b"top secret").as_slice()
    );
}
