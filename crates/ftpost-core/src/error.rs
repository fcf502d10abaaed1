use thiserror::Error;

pub type FtpostResult<T> = Result<T, FtpostError>;

#[derive(Debug, Error)]
pub enum FtpostError {
    /// Any filesystem call other than open-for-write. The payload names the
    /// attempted operation, e.g. `mkdir` or `open mode r`.
    #[error("{0}: filesystem operations are disabled.")]
    OperationDisabled(String),

    #[error("{0}")]
    AuthenticationFailed(String),

    #[error("{0}")]
    MisconfiguredCredential(String),

    #[error("{status}: {reason}")]
    UnexpectedUpstreamResponse { status: u16, reason: String },

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("user {0:?} already exists")]
    DuplicateAccount(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FtpostError {
    pub fn disabled(operation: impl Into<String>) -> Self {
        FtpostError::OperationDisabled(operation.into())
    }

    /// True for failures that come from the HTTP relay rather than from a
    /// local policy decision.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            FtpostError::UnexpectedUpstreamResponse { .. } | FtpostError::UpstreamUnreachable(_)
        )
    }
}
