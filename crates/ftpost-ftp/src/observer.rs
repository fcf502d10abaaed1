//! Session event hooks. The daemon plugs metrics in here; the engine itself
//! has no opinion on what is recorded.

use std::time::Duration;

use ftpost_core::FtpostError;

/// Why an upload did not reach the relay endpoint successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadFailure {
    /// The endpoint answered outside 2xx.
    UpstreamStatus,
    /// The endpoint could not be reached or did not answer in time.
    UpstreamUnreachable,
    /// Staging, data channel or other local failure.
    Local,
}

impl UploadFailure {
    pub fn classify(err: &FtpostError) -> Self {
        match err {
            FtpostError::UnexpectedUpstreamResponse { .. } => UploadFailure::UpstreamStatus,
            FtpostError::UpstreamUnreachable(_) => UploadFailure::UpstreamUnreachable,
            _ => UploadFailure::Local,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadFailure::UpstreamStatus => "upstream_status",
            UploadFailure::UpstreamUnreachable => "upstream_unreachable",
            UploadFailure::Local => "local",
        }
    }
}

pub trait SessionObserver: Send + Sync {
    fn session_opened(&self) {}
    fn session_closed(&self) {}
    fn login_failed(&self) {}
    fn upload_relayed(&self, _bytes: u64, _elapsed: Duration) {}
    fn upload_failed(&self, _reason: UploadFailure) {}
}

/// Observer that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}
