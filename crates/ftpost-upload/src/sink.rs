//! `UploadSink`: one client upload, relayed as one POST on finalize.

use std::sync::Arc;
use std::time::Instant;

use ftpost_core::{FtpostError, FtpostResult};
use tracing::{debug, info};

use crate::multipart;
use crate::staging::StagingBuffer;
use crate::upstream::{RelayRequest, Upstream};

/// Immutable relay settings shared by every sink the server creates.
#[derive(Clone)]
pub struct Relay {
    upstream: Arc<dyn Upstream>,
    spool_threshold: usize,
}

impl Relay {
    pub fn new(upstream: Arc<dyn Upstream>, spool_threshold: usize) -> Self {
        Relay {
            upstream,
            spool_threshold,
        }
    }

    /// A fresh sink for `filename`, filed under form field `account`.
    pub fn sink(&self, account: &str, filename: &str) -> UploadSink {
        UploadSink::new(
            account,
            filename,
            self.upstream.clone(),
            self.spool_threshold,
        )
    }
}

/// Sequential byte sink bound to one (account, filename) pair.
///
/// `write` only buffers. `finalize` appends the closing boundary, measures
/// the body and performs the single POST. After `finalize` (successful or
/// not) the sink is closed and further calls do nothing. Dropping an
/// unfinalized sink discards the staged bytes without any network traffic.
pub struct UploadSink {
    account: String,
    filename: String,
    upstream: Arc<dyn Upstream>,
    spool_threshold: usize,
    staging: Option<StagingBuffer>,
    payload_bytes: u64,
    closed: bool,
}

impl std::fmt::Debug for UploadSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSink")
            .field("account", &self.account)
            .field("filename", &self.filename)
            .field("payload_bytes", &self.payload_bytes)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl UploadSink {
    pub fn new(
        account: &str,
        filename: &str,
        upstream: Arc<dyn Upstream>,
        spool_threshold: usize,
    ) -> Self {
        UploadSink {
            account: account.to_string(),
            filename: filename.to_string(),
            upstream,
            spool_threshold,
            staging: None,
            payload_bytes: 0,
            closed: false,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Payload bytes accepted so far (envelope excluded).
    pub fn bytes_written(&self) -> u64 {
        self.payload_bytes
    }

    async fn open_staging(&self) -> FtpostResult<StagingBuffer> {
        let mut staging = StagingBuffer::new(self.spool_threshold);
        staging
            .write(&multipart::preamble(&self.account, &self.filename))
            .await?;
        Ok(staging)
    }

    pub async fn write(&mut self, chunk: &[u8]) -> FtpostResult<()> {
        if self.closed {
            debug!(file = %self.filename, "write after finalize ignored");
            return Ok(());
        }
        let staging = match self.staging.take() {
            Some(staging) => staging,
            None => self.open_staging().await?,
        };
        let staging = self.staging.insert(staging);
        staging.write(chunk).await?;
        self.payload_bytes += chunk.len() as u64;
        Ok(())
    }

    pub async fn finalize(&mut self) -> FtpostResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut staging = match self.staging.take() {
            Some(staging) => staging,
            None => self.open_staging().await?,
        };
        staging.write(&multipart::closing()).await?;
        let spilled = staging.is_spilled();
        let request = RelayRequest {
            content_type: multipart::content_type(),
            body: staging.into_body().await?,
        };
        let content_length = request.content_length();

        let start = Instant::now();
        let response = self.upstream.post(request).await?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if !response.is_success() {
            return Err(FtpostError::UnexpectedUpstreamResponse {
                status: response.status,
                reason: response.reason,
            });
        }

        info!(
            user = %self.account,
            file = %self.filename,
            bytes = self.payload_bytes,
            content_length,
            spilled,
            status = response.status,
            elapsed_ms,
            "upload relayed"
        );
        Ok(())
    }
}
