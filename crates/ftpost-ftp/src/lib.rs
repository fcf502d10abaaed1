//! ftpost-ftp: the FTP/FTPS protocol engine
//!
//! `Server` accepts control connections and runs one `Session` task per
//! client. Sessions authenticate against an `Authenticator`, resolve paths
//! through the account's `FilesystemAdapter` and report outcomes to a
//! `SessionObserver`.

pub mod command;
pub mod data;
pub mod facts;
pub mod observer;
pub mod server;
pub mod session;
pub mod tls;

pub use observer::{NoopObserver, SessionObserver, UploadFailure};
pub use server::{ConnectionLimiter, LimitExceeded, Server, ServerContext, ServerOptions};
pub use session::Session;
pub use tls::{load_acceptor, TlsSetupError};
