//! One control connection: login, command dispatch and transfers.
//!
//! A session owns its control stream, at most one pending data channel and,
//! after login, the account's filesystem adapter. Nothing here is shared
//! with other sessions except the read-only `ServerContext`.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use ftpost_core::{FtpostError, Permissions, Reply};
use ftpost_fs::{FilesystemAdapter, OpenMode, TransferCompletionHook};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::{listing_path, Command, MAX_LINE_LEN};
use crate::data::{self, BoxedStream, DataChannel};
use crate::facts;
use crate::observer::UploadFailure;
use crate::server::ServerContext;

const MAX_LOGIN_ATTEMPTS: u32 = 3;
const CHUNK_SIZE: usize = 64 * 1024;

const TLS_CONTROL_REQUIRED: &str = "SSL/TLS required on the control channel.";
const TLS_DATA_REQUIRED: &str = "SSL/TLS required on the data channel.";
const NOT_LOGGED_IN: &str = "Log in with USER and PASS first.";
const NO_PRIVILEGES: &str = "Not enough privileges.";
const NEEDS_ARG: &str = "Syntax error: command needs an argument.";
const NO_DATA_CHANNEL: &str = "Use PORT or PASV first.";
const CANT_OPEN_DATA: &str = "Can't open data connection.";

const HELP_VERBS: &[&str] = &[
    "ABOR ALLO APPE AUTH CDUP CWD  DELE EPRT EPSV FEAT HELP LIST MDTM MKD",
    "MLSD MLST MODE NLST NOOP OPTS PASS PASV PBSZ PORT PROT PWD  QUIT REST",
    "RETR RMD  RNFR RNTO SITE SIZE STAT STOR STOU STRU SYST TYPE USER XCWD",
    "XPWD",
];

/// Control stream plus line framing.
struct Control {
    stream: BufReader<BoxedStream>,
}

enum Line {
    Command(String),
    TooLong,
    /// Not valid UTF-8; never dispatched.
    Undecodable,
    Closed,
}

impl Control {
    fn new(stream: BoxedStream) -> Self {
        Control {
            stream: BufReader::new(stream),
        }
    }

    async fn send(&mut self, reply: &Reply) -> io::Result<()> {
        debug!(code = reply.code, "-> {}", reply.text);
        self.stream
            .write_all(format!("{reply}\r\n").as_bytes())
            .await?;
        self.stream.flush().await
    }

    /// `code-first`, indented body lines, `code last`.
    async fn send_multi(
        &mut self,
        code: u16,
        first: &str,
        body: &[String],
        last: &str,
    ) -> io::Result<()> {
        let mut text = format!("{code}-{first}\r\n");
        for line in body {
            text.push(' ');
            text.push_str(line);
            text.push_str("\r\n");
        }
        text.push_str(&format!("{code} {last}\r\n"));
        self.stream.write_all(text.as_bytes()).await?;
        self.stream.flush().await
    }

    async fn read_line(&mut self) -> io::Result<Line> {
        let limit = (MAX_LINE_LEN + 2) as u64;
        let mut buf = Vec::with_capacity(128);
        let n = (&mut self.stream)
            .take(limit)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Ok(Line::Closed);
        }
        if !buf.ends_with(b"\n") && buf.len() as u64 == limit {
            // Swallow the rest of the oversized line.
            loop {
                buf.clear();
                let n = (&mut self.stream)
                    .take(limit)
                    .read_until(b'\n', &mut buf)
                    .await?;
                if n == 0 || buf.ends_with(b"\n") {
                    break;
                }
            }
            return Ok(Line::TooLong);
        }
        match String::from_utf8(buf) {
            Ok(text) => Ok(Line::Command(text.trim_end_matches(['\r', '\n']).to_string())),
            Err(_) => Ok(Line::Undecodable),
        }
    }

    fn into_inner(self) -> BoxedStream {
        self.stream.into_inner()
    }
}

enum Flow {
    Continue,
    UpgradeTls,
    Quit,
}

struct LoggedIn {
    username: String,
    permissions: Permissions,
    fs: Box<dyn FilesystemAdapter>,
}

pub struct Session {
    ctx: Arc<ServerContext>,
    peer: SocketAddr,
    local: SocketAddr,
    shutdown: CancellationToken,
    tls_active: bool,
    pbsz: bool,
    protect_data: bool,
    epsv_all: bool,
    pending_user: Option<String>,
    user: Option<LoggedIn>,
    failed_logins: u32,
    data: Option<DataChannel>,
    rename_from: Option<String>,
}

async fn respond(control: &mut Control, code: u16, text: impl Into<String>) -> io::Result<Flow> {
    control.send(&Reply::new(code, text)).await?;
    Ok(Flow::Continue)
}

/// Map an FTP path argument into the account's namespace, refusing paths
/// that escape it.
fn resolve(user: &mut LoggedIn, ftp_path: &str) -> Result<String, Reply> {
    let fs_path = user.fs.ftp_to_fs(ftp_path);
    if user.fs.path_is_valid(&fs_path) {
        Ok(fs_path)
    } else {
        Err(Reply::new(
            550,
            format!("\"{ftp_path}\" points to a path which is outside the user's root directory."),
        ))
    }
}

impl Session {
    pub fn new(
        peer: SocketAddr,
        local: SocketAddr,
        ctx: Arc<ServerContext>,
        shutdown: CancellationToken,
    ) -> Self {
        Session {
            ctx,
            peer,
            local,
            shutdown,
            tls_active: false,
            pbsz: false,
            protect_data: false,
            epsv_all: false,
            pending_user: None,
            user: None,
            failed_logins: 0,
            data: None,
            rename_from: None,
        }
    }

    pub async fn run(mut self, stream: TcpStream) {
        let mut control = Control::new(Box::new(stream));
        let banner = Reply::new(220, self.ctx.options.banner.clone());
        if let Err(e) = control.send(&banner).await {
            debug!("sending banner failed: {e}");
            return;
        }
        info!("session opened");

        loop {
            let idle = self.ctx.options.idle_timeout;
            let line = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = control.send(&Reply::new(421, "Server shutting down.")).await;
                    break;
                }
                read = tokio::time::timeout(idle, control.read_line()) => match read {
                    Err(_) => {
                        info!("control connection idle timeout");
                        let _ = control
                            .send(&Reply::new(421, "Control connection timed out."))
                            .await;
                        break;
                    }
                    Ok(Err(e)) => {
                        debug!("control read failed: {e}");
                        break;
                    }
                    Ok(Ok(line)) => line,
                },
            };

            let cmd = match line {
                Line::Closed => {
                    debug!("client closed control connection");
                    break;
                }
                Line::TooLong => {
                    if control
                        .send(&Reply::new(500, "Command line too long."))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
                Line::Undecodable => {
                    debug!("<- undecodable command line");
                    if control
                        .send(&Reply::new(501, "Can't decode command."))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
                Line::Command(text) => Command::parse(&text),
            };
            if cmd.verb == "PASS" {
                debug!("<- PASS ******");
            } else {
                debug!("<- {} {}", cmd.verb, cmd.arg);
            }

            match self.handle(&mut control, cmd).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Ok(Flow::UpgradeTls) => match self.upgrade(control).await {
                    Ok(secured) => control = secured,
                    Err(e) => {
                        warn!("control channel TLS handshake failed: {e}");
                        return;
                    }
                },
                Err(e) => {
                    debug!("control write failed: {e}");
                    break;
                }
            }
        }

        let user = self.user.as_ref().map(|u| u.username.as_str());
        info!(user = ?user, "session closed");
    }

    async fn upgrade(&mut self, control: Control) -> io::Result<Control> {
        let acceptor = self
            .ctx
            .tls
            .clone()
            .ok_or_else(|| io::Error::other("TLS is not configured"))?;
        let handshake = acceptor.accept(control.into_inner());
        let stream = tokio::time::timeout(self.ctx.options.idle_timeout, handshake)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??;
        self.tls_active = true;
        debug!("control channel secured");
        Ok(Control::new(Box::new(stream)))
    }

    fn tls_required(&self) -> bool {
        self.ctx.tls.is_some()
    }

    async fn handle(&mut self, control: &mut Control, cmd: Command) -> io::Result<Flow> {
        if self.tls_required() && !self.tls_active && matches!(cmd.verb.as_str(), "USER" | "PASS")
        {
            return respond(control, 550, TLS_CONTROL_REQUIRED).await;
        }
        if self.user.is_none() && !cmd.allowed_before_login() {
            return respond(control, 530, NOT_LOGGED_IN).await;
        }
        if self.tls_required() && !self.protect_data && cmd.uses_data_channel() {
            self.data = None;
            return respond(control, 522, TLS_DATA_REQUIRED).await;
        }
        if cmd.verb != "RNTO" {
            self.rename_from = None;
        }

        match cmd.verb.as_str() {
            "USER" => self.user_cmd(control, &cmd.arg).await,
            "PASS" => self.pass_cmd(control, &cmd.arg).await,
            "QUIT" => {
                control.send(&Reply::new(221, "Goodbye.")).await?;
                Ok(Flow::Quit)
            }
            "NOOP" => respond(control, 200, "NOOP command successful.").await,
            "SYST" => respond(control, 215, "UNIX Type: L8").await,
            "FEAT" => self.feat(control).await,
            "HELP" => {
                let body: Vec<String> = HELP_VERBS.iter().map(|s| s.to_string()).collect();
                control
                    .send_multi(
                        214,
                        "The following commands are recognized:",
                        &body,
                        "Help command successful.",
                    )
                    .await?;
                Ok(Flow::Continue)
            }
            "OPTS" => self.opts(control, &cmd.arg).await,
            "AUTH" => self.auth(control, &cmd.arg).await,
            "PBSZ" => self.pbsz_cmd(control).await,
            "PROT" => self.prot(control, &cmd.arg).await,
            "TYPE" => self.type_cmd(control, &cmd.arg).await,
            "MODE" => match cmd.arg.trim().to_ascii_uppercase().as_str() {
                "S" => respond(control, 200, "Transfer mode set to: S").await,
                "B" | "C" => respond(control, 504, "Unimplemented MODE type.").await,
                _ => respond(control, 501, "Unrecognized MODE type.").await,
            },
            "STRU" => match cmd.arg.trim().to_ascii_uppercase().as_str() {
                "F" => respond(control, 200, "File transfer structure set to: F.").await,
                "P" | "R" => respond(control, 504, "Unimplemented STRU type.").await,
                _ => respond(control, 501, "Unrecognized STRU type.").await,
            },
            "ALLO" => respond(control, 202, "No storage allocation necessary.").await,
            "REST" => respond(control, 504, "Resuming transfers is not supported.").await,
            "ABOR" => {
                if self.data.take().is_some() {
                    respond(control, 225, "ABOR command successful; data channel closed.").await
                } else {
                    respond(control, 225, "No transfer to abort.").await
                }
            }
            "PWD" | "XPWD" => self.pwd(control).await,
            "CWD" | "XCWD" => self.cwd(control, &cmd.arg).await,
            "CDUP" | "XCUP" => self.cwd(control, "..").await,
            "PASV" => self.pasv(control).await,
            "EPSV" => self.epsv(control, &cmd.arg).await,
            "PORT" => {
                let target = data::parse_port_arg(&cmd.arg);
                self.active(control, target, "Invalid PORT format.").await
            }
            "EPRT" => {
                let target = data::parse_eprt_arg(&cmd.arg);
                self.active(control, target, "Invalid EPRT format.").await
            }
            "STOR" => self.store(control, &cmd.arg, OpenMode::Write).await,
            "APPE" => self.store(control, &cmd.arg, OpenMode::Append).await,
            "STOU" => self.store_unique(control).await,
            "RETR" => self.retrieve(control, &cmd.arg).await,
            "LIST" | "NLST" => {
                let path = listing_path(&cmd.arg).to_string();
                self.list(control, &path).await
            }
            "MLSD" => self.list(control, cmd.arg.trim()).await,
            "DELE" => {
                self.path_op(control, &cmd, |fs, p| {
                    fs.remove(p).map(|_| Reply::new(250, "File removed."))
                })
                .await
            }
            "RMD" | "XRMD" => {
                self.path_op(control, &cmd, |fs, p| {
                    fs.rmdir(p).map(|_| Reply::new(250, "Directory removed."))
                })
                .await
            }
            "MKD" | "XMKD" => {
                self.path_op(control, &cmd, |fs, p| {
                    fs.mkdir(p).map(|_| {
                        Reply::new(257, format!("\"{}\" directory created.", fs.fs_to_ftp(p)))
                    })
                })
                .await
            }
            "SIZE" => {
                self.path_op(control, &cmd, |fs, p| {
                    fs.get_size(p).map(|n| Reply::new(213, n.to_string()))
                })
                .await
            }
            "MDTM" => {
                self.path_op(control, &cmd, |fs, p| {
                    fs.get_modified_time(p)
                        .map(|t| Reply::new(213, facts::format_timeval(t)))
                })
                .await
            }
            "RNFR" => self.rename_from_cmd(control, &cmd.arg).await,
            "RNTO" => self.rename_to_cmd(control, &cmd.arg).await,
            "SITE" => self.site(control, &cmd.arg).await,
            "STAT" => self.stat_cmd(control, &cmd.arg).await,
            "MLST" => self.mlst(control, &cmd.arg).await,
            "" => respond(control, 500, "Command \"\" not understood.").await,
            other => respond(control, 500, format!("Command \"{other}\" not understood.")).await,
        }
    }

    async fn user_cmd(&mut self, control: &mut Control, arg: &str) -> io::Result<Flow> {
        if self.user.is_some() {
            return respond(control, 503, "User already authenticated.").await;
        }
        if arg.is_empty() {
            return respond(control, 501, NEEDS_ARG).await;
        }
        self.pending_user = Some(arg.to_string());
        respond(control, 331, "Username ok, send password.").await
    }

    async fn pass_cmd(&mut self, control: &mut Control, password: &str) -> io::Result<Flow> {
        if self.user.is_some() {
            return respond(control, 503, "User already authenticated.").await;
        }
        let Some(username) = self.pending_user.take() else {
            return respond(control, 503, "Login with USER first.").await;
        };

        let ctx = self.ctx.clone();
        let outcome = ctx
            .authenticator
            .verify(&username, password)
            .map(|account| (account.home.clone(), account.permissions.clone()));

        match outcome {
            Ok((home, permissions)) => {
                info!(user = %username, home = %home, "login successful");
                self.user = Some(LoggedIn {
                    username,
                    permissions,
                    fs: ctx.filesystems.for_account(&home),
                });
                respond(control, 230, "Login successful.").await
            }
            Err(e) => {
                match &e {
                    FtpostError::MisconfiguredCredential(_) => {
                        error!(user = %username, "stored password record is unusable: {e}")
                    }
                    _ => warn!(user = %username, "login failed: {e}"),
                }
                ctx.observer.login_failed();
                self.failed_logins += 1;
                if self.failed_logins >= MAX_LOGIN_ATTEMPTS {
                    control
                        .send(&Reply::new(530, "Maximum login attempts. Disconnecting."))
                        .await?;
                    return Ok(Flow::Quit);
                }
                respond(control, 530, e.to_string()).await
            }
        }
    }

    async fn feat(&mut self, control: &mut Control) -> io::Result<Flow> {
        let mut body: Vec<String> = [
            "EPRT",
            "EPSV",
            "MDTM",
            "MLST type*;size*;modify*;",
            "SIZE",
            "TVFS",
            "UTF8",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if self.tls_required() {
            body.extend(["AUTH TLS".into(), "AUTH SSL".into(), "PBSZ".into(), "PROT".into()]);
        }
        control
            .send_multi(211, "Features supported:", &body, "End FEAT.")
            .await?;
        Ok(Flow::Continue)
    }

    async fn opts(&mut self, control: &mut Control, arg: &str) -> io::Result<Flow> {
        let upper = arg.trim().to_ascii_uppercase();
        if upper == "UTF8 ON" || upper == "UTF-8 ON" {
            respond(control, 200, "Always in UTF8 mode.").await
        } else if upper.starts_with("MLST") {
            respond(control, 200, "MLST OPTS type;size;modify;").await
        } else {
            respond(control, 501, "Invalid OPTS argument.").await
        }
    }

    async fn auth(&mut self, control: &mut Control, arg: &str) -> io::Result<Flow> {
        if !self.tls_required() {
            return respond(control, 502, "AUTH not supported: TLS is not configured.").await;
        }
        if self.tls_active {
            return respond(control, 503, "Already using TLS.").await;
        }
        let kind = arg.trim().to_ascii_uppercase();
        match kind.as_str() {
            "TLS" | "TLS-C" | "SSL" | "TLS-P" => {
                control
                    .send(&Reply::new(234, format!("AUTH {kind} successful.")))
                    .await?;
                Ok(Flow::UpgradeTls)
            }
            _ => respond(control, 504, format!("Unrecognized AUTH type {kind:?}.")).await,
        }
    }

    async fn pbsz_cmd(&mut self, control: &mut Control) -> io::Result<Flow> {
        if !self.tls_active {
            return respond(control, 503, "PBSZ not allowed on insecure control connection.").await;
        }
        self.pbsz = true;
        respond(control, 200, "PBSZ=0 successful.").await
    }

    async fn prot(&mut self, control: &mut Control, arg: &str) -> io::Result<Flow> {
        if !self.tls_active {
            return respond(control, 503, "PROT not allowed on insecure control connection.").await;
        }
        if !self.pbsz {
            return respond(control, 503, "You must issue the PBSZ command prior to PROT.").await;
        }
        match arg.trim().to_ascii_uppercase().as_str() {
            "C" => {
                self.protect_data = false;
                respond(control, 200, "Protection set to Clear").await
            }
            "P" => {
                self.protect_data = true;
                respond(control, 200, "Protection set to Private").await
            }
            other @ ("S" | "E") => {
                respond(control, 521, format!("PROT {other} unsupported (use C or P).")).await
            }
            _ => respond(control, 502, "Unrecognized PROT type (use C or P).").await,
        }
    }

    async fn type_cmd(&mut self, control: &mut Control, arg: &str) -> io::Result<Flow> {
        match arg.trim().to_ascii_uppercase().replace(' ', "").as_str() {
            "A" | "AN" => respond(control, 200, "Type set to: ASCII.").await,
            "I" | "L8" => respond(control, 200, "Type set to: Binary.").await,
            _ => respond(control, 504, format!("Unsupported type \"{}\".", arg.trim())).await,
        }
    }

    async fn pwd(&mut self, control: &mut Control) -> io::Result<Flow> {
        let Some(user) = self.user.as_mut() else {
            return respond(control, 530, NOT_LOGGED_IN).await;
        };
        let cwd = user.fs.cwd().to_string();
        respond(control, 257, format!("\"{cwd}\" is the current directory.")).await
    }

    async fn cwd(&mut self, control: &mut Control, arg: &str) -> io::Result<Flow> {
        let Some(user) = self.user.as_mut() else {
            return respond(control, 530, NOT_LOGGED_IN).await;
        };
        if !user.permissions.can_change_dir() {
            return respond(control, 550, NO_PRIVILEGES).await;
        }
        let target = if arg.is_empty() { "/" } else { arg };
        let path = match resolve(user, target) {
            Ok(path) => path,
            Err(reply) => return respond(control, reply.code, reply.text).await,
        };
        if !user.fs.is_directory(&path) {
            return respond(control, 550, "No such file or directory.").await;
        }
        if let Err(e) = user.fs.chdir(&path) {
            return respond(control, 550, e.to_string()).await;
        }
        let cwd = user.fs.cwd().to_string();
        respond(control, 250, format!("\"{cwd}\" is the current directory.")).await
    }

    async fn pasv(&mut self, control: &mut Control) -> io::Result<Flow> {
        if self.epsv_all {
            return respond(control, 501, "PASV not allowed after EPSV ALL.").await;
        }
        let local_ip = match self.local.ip().to_canonical() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => {
                return respond(control, 501, "PASV not supported on IPv6; use EPSV.").await
            }
        };
        let channel = match self.open_passive().await {
            Ok(channel) => channel,
            Err(reply) => return respond(control, reply.code, reply.text).await,
        };
        let Some(port) = channel.local_port() else {
            return respond(control, 425, "Can't open passive connection.").await;
        };
        self.data = Some(channel);
        let advertised = self.ctx.options.masquerade_address.unwrap_or(local_ip);
        respond(control, 227, data::pasv_reply_text(advertised, port)).await
    }

    async fn epsv(&mut self, control: &mut Control, arg: &str) -> io::Result<Flow> {
        let arg = arg.trim().to_ascii_uppercase();
        if arg == "ALL" {
            self.epsv_all = true;
            return respond(control, 200, "EPSV ALL command successful.").await;
        }
        let family_ok = match arg.as_str() {
            "" => true,
            "1" => self.local.ip().to_canonical().is_ipv4(),
            "2" => self.local.ip().to_canonical().is_ipv6(),
            _ => false,
        };
        if !family_ok {
            return respond(control, 522, "Network protocol not supported.").await;
        }
        let channel = match self.open_passive().await {
            Ok(channel) => channel,
            Err(reply) => return respond(control, reply.code, reply.text).await,
        };
        let Some(port) = channel.local_port() else {
            return respond(control, 425, "Can't open passive connection.").await;
        };
        self.data = Some(channel);
        respond(control, 229, data::epsv_reply_text(port)).await
    }

    async fn open_passive(&mut self) -> Result<DataChannel, Reply> {
        // A new PASV replaces any earlier, unused data channel.
        self.data = None;
        DataChannel::bind_passive(
            self.local.ip(),
            self.ctx.options.passive_ports,
            self.peer.ip(),
        )
        .await
        .map_err(|e| {
            warn!("passive listener failed: {e}");
            Reply::new(425, "Can't open passive connection.")
        })
    }

    async fn active(
        &mut self,
        control: &mut Control,
        target: Option<SocketAddr>,
        malformed: &str,
    ) -> io::Result<Flow> {
        if self.epsv_all {
            return respond(control, 501, "Active mode not allowed after EPSV ALL.").await;
        }
        let Some(target) = target else {
            return respond(control, 501, malformed).await;
        };
        if let Err(rejection) = data::validate_active(target, self.peer.ip()) {
            warn!(%target, "active data connection refused");
            return respond(control, 501, rejection.message()).await;
        }
        self.data = Some(DataChannel::active(target));
        respond(control, 200, "Active data connection established.").await
    }

    /// Wait for the negotiated data connection. `None` means the reply has
    /// already been sent.
    async fn open_data(
        &mut self,
        control: &mut Control,
        channel: DataChannel,
        preliminary: &str,
    ) -> io::Result<Option<BoxedStream>> {
        control.send(&Reply::new(150, preliminary)).await?;
        let tls = if self.protect_data {
            self.ctx.tls.as_ref()
        } else {
            None
        };
        match channel.establish(self.ctx.options.data_timeout, tls).await {
            Ok(stream) => Ok(Some(stream)),
            Err(e) => {
                warn!("data connection failed: {e}");
                control.send(&Reply::new(425, CANT_OPEN_DATA)).await?;
                Ok(None)
            }
        }
    }

    async fn store(
        &mut self,
        control: &mut Control,
        arg: &str,
        mode: OpenMode,
    ) -> io::Result<Flow> {
        let Some(user) = self.user.as_mut() else {
            return respond(control, 530, NOT_LOGGED_IN).await;
        };
        if !user.permissions.can_store() {
            self.data = None;
            return respond(control, 550, NO_PRIVILEGES).await;
        }
        if arg.is_empty() {
            return respond(control, 501, NEEDS_ARG).await;
        }
        let path = match resolve(user, arg) {
            Ok(path) => path,
            Err(reply) => {
                self.data = None;
                return respond(control, reply.code, reply.text).await;
            }
        };
        let sink = match user.fs.open(&path, mode) {
            Ok(sink) => sink,
            Err(e) => {
                self.data = None;
                info!(user = %user.username, path = %path, "{e}");
                return respond(control, 550, e.to_string()).await;
            }
        };
        let username = user.username.clone();
        let Some(channel) = self.data.take() else {
            return respond(control, 425, NO_DATA_CHANNEL).await;
        };

        let preliminary = "File status okay. About to open data connection.";
        let Some(stream) = self.open_data(control, channel, preliminary).await? else {
            self.ctx.observer.upload_failed(UploadFailure::Local);
            return Ok(Flow::Continue);
        };

        let reply = self
            .receive_upload(stream, TransferCompletionHook::new(sink), &username, &path)
            .await;
        control.send(&reply).await?;
        Ok(Flow::Continue)
    }

    /// Pump the data connection into the completion hook, then let the hook
    /// decide the final reply.
    async fn receive_upload(
        &mut self,
        mut stream: BoxedStream,
        mut hook: TransferCompletionHook,
        username: &str,
        path: &str,
    ) -> Reply {
        let data_timeout = self.ctx.options.data_timeout;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let received = loop {
            match tokio::time::timeout(data_timeout, stream.read(&mut buf)).await {
                Err(_) => {
                    break Err(Reply::new(426, "Data connection timed out; transfer aborted."))
                }
                Ok(Ok(0)) => break Ok(()),
                Ok(Ok(n)) => {
                    if let Err(e) = hook.receive(&buf[..n]).await {
                        error!(user = %username, path = %path, "staging upload failed: {e}");
                        break Err(Reply::new(451, format!("Local error: {e}")));
                    }
                }
                // TLS peers that close without close_notify.
                Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("data channel closed without TLS close_notify");
                    break Ok(());
                }
                Ok(Err(e)) => {
                    warn!(user = %username, path = %path, "data connection failed: {e}");
                    break Err(Reply::new(426, "Connection closed; transfer aborted."));
                }
            }
        };
        drop(stream);

        if let Err(reply) = received {
            hook.abort();
            self.ctx.observer.upload_failed(UploadFailure::Local);
            return reply;
        }

        let started = Instant::now();
        let reply = hook.transfer_finished().await;
        let elapsed = started.elapsed();
        match hook.captured_error() {
            None => {
                info!(
                    user = %username,
                    path = %path,
                    bytes = hook.bytes_received(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "upload complete"
                );
                self.ctx
                    .observer
                    .upload_relayed(hook.bytes_received(), elapsed);
            }
            Some(e) => self.ctx.observer.upload_failed(UploadFailure::classify(e)),
        }
        reply
    }

    async fn store_unique(&mut self, control: &mut Control) -> io::Result<Flow> {
        let Some(user) = self.user.as_mut() else {
            return respond(control, 530, NOT_LOGGED_IN).await;
        };
        let sink = match user.fs.create_temp_file() {
            Ok(sink) => sink,
            Err(e) => {
                self.data = None;
                return respond(control, 550, e.to_string()).await;
            }
        };
        let username = user.username.clone();
        let Some(channel) = self.data.take() else {
            return respond(control, 425, NO_DATA_CHANNEL).await;
        };
        let preliminary = format!("FILE: {}", sink.filename());
        let path = sink.filename().to_string();
        let Some(stream) = self.open_data(control, channel, &preliminary).await? else {
            self.ctx.observer.upload_failed(UploadFailure::Local);
            return Ok(Flow::Continue);
        };
        let reply = self
            .receive_upload(stream, TransferCompletionHook::new(sink), &username, &path)
            .await;
        control.send(&reply).await?;
        Ok(Flow::Continue)
    }

    async fn retrieve(&mut self, control: &mut Control, arg: &str) -> io::Result<Flow> {
        self.data = None;
        let Some(user) = self.user.as_mut() else {
            return respond(control, 530, NOT_LOGGED_IN).await;
        };
        if arg.is_empty() {
            return respond(control, 501, NEEDS_ARG).await;
        }
        let path = match resolve(user, arg) {
            Ok(path) => path,
            Err(reply) => return respond(control, reply.code, reply.text).await,
        };
        match user.fs.open(&path, OpenMode::Read) {
            Err(e) => respond(control, 550, e.to_string()).await,
            // An adapter handing out a sink for reading has nothing to send.
            Ok(_) => respond(control, 550, "File not available for download.").await,
        }
    }

    async fn list(&mut self, control: &mut Control, arg: &str) -> io::Result<Flow> {
        let Some(user) = self.user.as_mut() else {
            return respond(control, 530, NOT_LOGGED_IN).await;
        };
        if !user.permissions.can_list() {
            self.data = None;
            return respond(control, 550, NO_PRIVILEGES).await;
        }
        let target = if arg.is_empty() {
            user.fs.cwd().to_string()
        } else {
            arg.to_string()
        };
        let path = match resolve(user, &target) {
            Ok(path) => path,
            Err(reply) => {
                self.data = None;
                return respond(control, reply.code, reply.text).await;
            }
        };
        if !user.fs.is_directory(&path) {
            self.data = None;
            let text = match user.fs.stat(&path) {
                Err(e) => e.to_string(),
                Ok(_) => "Not a directory.".to_string(),
            };
            return respond(control, 550, text).await;
        }
        let entries = match user.fs.list_directory(&path) {
            Ok(entries) => entries,
            Err(e) => {
                self.data = None;
                return respond(control, 550, e.to_string()).await;
            }
        };
        let Some(channel) = self.data.take() else {
            return respond(control, 425, NO_DATA_CHANNEL).await;
        };
        let preliminary = "File status okay. About to open data connection.";
        let Some(mut stream) = self.open_data(control, channel, preliminary).await? else {
            return Ok(Flow::Continue);
        };
        let mut listing = String::new();
        for entry in entries {
            listing.push_str(&entry);
            listing.push_str("\r\n");
        }
        let sent = async {
            stream.write_all(listing.as_bytes()).await?;
            stream.shutdown().await
        }
        .await;
        match sent {
            Ok(()) => respond(control, 226, "Transfer complete.").await,
            Err(e) => {
                debug!("listing transfer failed: {e}");
                respond(control, 426, "Connection closed; transfer aborted.").await
            }
        }
    }

    /// Commands that map one path argument onto one adapter call.
    async fn path_op<F>(&mut self, control: &mut Control, cmd: &Command, op: F) -> io::Result<Flow>
    where
        F: FnOnce(&dyn FilesystemAdapter, &str) -> ftpost_core::FtpostResult<Reply>,
    {
        let Some(user) = self.user.as_mut() else {
            return respond(control, 530, NOT_LOGGED_IN).await;
        };
        if !cmd.has_arg() {
            return respond(control, 501, NEEDS_ARG).await;
        }
        let path = match resolve(user, &cmd.arg) {
            Ok(path) => path,
            Err(reply) => return respond(control, reply.code, reply.text).await,
        };
        let reply = match op(user.fs.as_ref(), &path) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(verb = %cmd.verb, path = %path, "{e}");
                Reply::new(550, e.to_string())
            }
        };
        control.send(&reply).await?;
        Ok(Flow::Continue)
    }

    async fn rename_from_cmd(&mut self, control: &mut Control, arg: &str) -> io::Result<Flow> {
        let Some(user) = self.user.as_mut() else {
            return respond(control, 530, NOT_LOGGED_IN).await;
        };
        if arg.is_empty() {
            return respond(control, 501, NEEDS_ARG).await;
        }
        match resolve(user, arg) {
            Ok(path) => {
                self.rename_from = Some(path);
                respond(control, 350, "Ready for destination name.").await
            }
            Err(reply) => respond(control, reply.code, reply.text).await,
        }
    }

    async fn rename_to_cmd(&mut self, control: &mut Control, arg: &str) -> io::Result<Flow> {
        let Some(source) = self.rename_from.take() else {
            return respond(control, 503, "Bad sequence of commands: use RNFR first.").await;
        };
        let Some(user) = self.user.as_mut() else {
            return respond(control, 530, NOT_LOGGED_IN).await;
        };
        if arg.is_empty() {
            return respond(control, 501, NEEDS_ARG).await;
        }
        let dest = match resolve(user, arg) {
            Ok(path) => path,
            Err(reply) => return respond(control, reply.code, reply.text).await,
        };
        match user.fs.rename(&source, &dest) {
            Ok(()) => respond(control, 250, "Renaming ok.").await,
            Err(e) => respond(control, 550, e.to_string()).await,
        }
    }

    async fn site(&mut self, control: &mut Control, arg: &str) -> io::Result<Flow> {
        let Some(user) = self.user.as_mut() else {
            return respond(control, 530, NOT_LOGGED_IN).await;
        };
        let mut parts = arg.trim().splitn(3, ' ');
        let sub = parts.next().unwrap_or_default().to_ascii_uppercase();
        match sub.as_str() {
            "CHMOD" => {
                let (Some(mode), Some(target)) = (parts.next(), parts.next()) else {
                    return respond(control, 501, "Syntax: SITE CHMOD <mode> <path>").await;
                };
                let Ok(mode) = u32::from_str_radix(mode, 8) else {
                    return respond(control, 501, "Invalid SITE CHMOD format.").await;
                };
                let path = match resolve(user, target) {
                    Ok(path) => path,
                    Err(reply) => return respond(control, reply.code, reply.text).await,
                };
                match user.fs.chmod(&path, mode) {
                    Ok(()) => respond(control, 200, "SITE CHMOD successful.").await,
                    Err(e) => respond(control, 550, e.to_string()).await,
                }
            }
            "HELP" => {
                let body = vec!["CHMOD <mode> <path>".to_string(), "HELP".to_string()];
                control
                    .send_multi(
                        214,
                        "The following SITE commands are recognized:",
                        &body,
                        "Help SITE command successful.",
                    )
                    .await?;
                Ok(Flow::Continue)
            }
            _ => respond(control, 501, "Unrecognized SITE command.").await,
        }
    }

    async fn stat_cmd(&mut self, control: &mut Control, arg: &str) -> io::Result<Flow> {
        if arg.trim().is_empty() {
            let mut body = vec![format!("Connected to: {}", self.local)];
            body.push(format!("Client: {}", self.peer));
            if let Some(user) = &self.user {
                body.push(format!("Logged in as: {}", user.username));
            }
            body.push(format!(
                "Control channel: {}",
                if self.tls_active { "TLS" } else { "clear" }
            ));
            control
                .send_multi(211, "FTP server status:", &body, "End of status.")
                .await?;
            return Ok(Flow::Continue);
        }
        let Some(user) = self.user.as_mut() else {
            return respond(control, 530, NOT_LOGGED_IN).await;
        };
        let path = match resolve(user, listing_path(arg)) {
            Ok(path) => path,
            Err(reply) => return respond(control, reply.code, reply.text).await,
        };
        match user.fs.stat(&path) {
            Ok(stat) => {
                let body = vec![facts::mlst_line(&stat, &user.fs.fs_to_ftp(&path))];
                control
                    .send_multi(213, "Status of path:", &body, "End of status.")
                    .await?;
                Ok(Flow::Continue)
            }
            Err(e) => respond(control, 550, e.to_string()).await,
        }
    }

    async fn mlst(&mut self, control: &mut Control, arg: &str) -> io::Result<Flow> {
        let Some(user) = self.user.as_mut() else {
            return respond(control, 530, NOT_LOGGED_IN).await;
        };
        let target = if arg.trim().is_empty() {
            user.fs.cwd().to_string()
        } else {
            arg.trim().to_string()
        };
        let path = match resolve(user, &target) {
            Ok(path) => path,
            Err(reply) => return respond(control, reply.code, reply.text).await,
        };
        match user.fs.stat(&path) {
            Ok(stat) => {
                let body = vec![facts::mlst_line(&stat, &user.fs.fs_to_ftp(&path))];
                control
                    .send_multi(250, &format!("Listing {target}"), &body, "End MLST.")
                    .await?;
                Ok(Flow::Continue)
            }
            Err(e) => respond(control, 550, e.to_string()).await,
        }
    }
}
