//! Transfer completion: the point where an upload turns into an HTTP relay.
//!
//! The engine feeds received chunks through the hook and signals
//! `transfer_finished` once the data connection reaches EOF. Only then is the
//! sink finalized, and the reply the engine sends is the one returned here,
//! so the client never sees "226" before the relay has actually succeeded.

use ftpost_core::{FtpostError, FtpostResult, Reply};
use ftpost_upload::UploadSink;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Sink created, no bytes yet.
    Open,
    Receiving,
    /// EOF seen on the data channel; finalize in progress.
    TransferFinished,
    Finalized,
    /// Abandoned before EOF. The sink was dropped unfinalized.
    Discarded,
}

pub struct TransferCompletionHook {
    sink: Option<UploadSink>,
    state: TransferState,
    bytes_received: u64,
    reply: Option<Reply>,
    captured: Option<FtpostError>,
}

impl TransferCompletionHook {
    pub fn new(sink: UploadSink) -> Self {
        TransferCompletionHook {
            sink: Some(sink),
            state: TransferState::Open,
            bytes_received: 0,
            reply: None,
            captured: None,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// The relay failure, if finalize failed.
    pub fn captured_error(&self) -> Option<&FtpostError> {
        self.captured.as_ref()
    }

    /// Hand one chunk from the data channel to the sink. Chunks arriving
    /// after EOF or after an abort are dropped.
    pub async fn receive(&mut self, chunk: &[u8]) -> FtpostResult<()> {
        match self.state {
            TransferState::Open => self.state = TransferState::Receiving,
            TransferState::Receiving => {}
            _ => {
                debug!(state = ?self.state, len = chunk.len(), "chunk after transfer end dropped");
                return Ok(());
            }
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.write(chunk).await?;
            self.bytes_received += chunk.len() as u64;
        }
        Ok(())
    }

    /// Finalize the sink inline and return the reply for the client.
    /// Repeated calls return the first outcome without relaying again.
    pub async fn transfer_finished(&mut self) -> Reply {
        if let Some(reply) = &self.reply {
            return reply.clone();
        }
        if self.state == TransferState::Discarded {
            let reply = Reply::new(426, "Connection closed; transfer aborted.");
            self.reply = Some(reply.clone());
            return reply;
        }
        self.state = TransferState::TransferFinished;

        let outcome = match self.sink.as_mut() {
            Some(sink) if !sink.is_closed() => sink.finalize().await,
            _ => Ok(()),
        };
        // Release the staging buffer and temp file whatever the outcome.
        self.sink = None;
        self.state = TransferState::Finalized;

        let reply = match outcome {
            Ok(()) => Reply::new(226, "Transfer complete."),
            Err(e) => {
                let reply = Reply::new(550, format!("Error transferring to HTTP - {e}"));
                error!(code = reply.code, "{}", reply.text);
                self.captured = Some(e);
                reply
            }
        };
        self.reply = Some(reply.clone());
        reply
    }

    /// Drop the sink without relaying. Used when the client disconnects or
    /// the data channel fails before EOF.
    pub fn abort(&mut self) {
        if matches!(self.state, TransferState::Open | TransferState::Receiving) {
            if let Some(sink) = self.sink.take() {
                debug!(
                    file = %sink.filename(),
                    bytes = sink.bytes_written(),
                    "upload discarded before completion"
                );
            }
            self.state = TransferState::Discarded;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ftpost_upload::{Relay, RelayRequest, RelayResponse, Upstream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedStatus {
        status: u16,
        reason: &'static str,
        posts: AtomicUsize,
    }

    impl FixedStatus {
        fn new(status: u16, reason: &'static str) -> Arc<Self> {
            Arc::new(FixedStatus {
                status,
                reason,
                posts: AtomicUsize::new(0),
            })
        }

        fn posts(&self) -> usize {
            self.posts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for FixedStatus {
        async fn post(&self, _request: RelayRequest) -> FtpostResult<RelayResponse> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            Ok(RelayResponse {
                status: self.status,
                reason: self.reason.into(),
            })
        }
    }

    fn hook_for(upstream: Arc<FixedStatus>) -> TransferCompletionHook {
        let relay = Relay::new(upstream, 1024);
        TransferCompletionHook::new(relay.sink("alice", "x.bin"))
    }

    #[tokio::test]
    async fn test_no_relay_before_transfer_finished() {
        let upstream = FixedStatus::new(200, "OK");
        let mut hook = hook_for(upstream.clone());
        assert_eq!(hook.state(), TransferState::Open);

        hook.receive(b"part one").await.unwrap();
        hook.receive(b"part two").await.unwrap();
        assert_eq!(hook.state(), TransferState::Receiving);
        assert_eq!(hook.bytes_received(), 16);
        assert_eq!(upstream.posts(), 0);

        let reply = hook.transfer_finished().await;
        assert_eq!(reply.code, 226);
        assert_eq!(hook.state(), TransferState::Finalized);
        assert_eq!(upstream.posts(), 1);
        assert!(hook.captured_error().is_none());
    }

    #[tokio::test]
    async fn test_204_is_success() {
        let upstream = FixedStatus::new(204, "No Content");
        let mut hook = hook_for(upstream);
        hook.receive(b"x").await.unwrap();
        assert!(hook.transfer_finished().await.is_positive());
    }

    #[tokio::test]
    async fn test_500_becomes_550_reply() {
        let upstream = FixedStatus::new(500, "Internal Server Error");
        let mut hook = hook_for(upstream.clone());
        hook.receive(b"x").await.unwrap();

        let reply = hook.transfer_finished().await;
        assert_eq!(reply.code, 550);
        assert_eq!(
            reply.text,
            "Error transferring to HTTP - 500: Internal Server Error"
        );
        assert!(reply.text.contains("500"));
        assert!(matches!(
            hook.captured_error(),
            Some(FtpostError::UnexpectedUpstreamResponse { status: 500, .. })
        ));
        assert_eq!(hook.state(), TransferState::Finalized);
    }

    #[tokio::test]
    async fn test_repeated_finish_relays_once() {
        let upstream = FixedStatus::new(500, "Internal Server Error");
        let mut hook = hook_for(upstream.clone());
        hook.receive(b"x").await.unwrap();

        let first = hook.transfer_finished().await;
        let second = hook.transfer_finished().await;
        assert_eq!(first, second);
        assert_eq!(upstream.posts(), 1);
    }

    #[tokio::test]
    async fn test_abort_before_finish_never_relays() {
        let upstream = FixedStatus::new(200, "OK");
        let mut hook = hook_for(upstream.clone());
        hook.receive(b"half an upload").await.unwrap();
        hook.abort();
        assert_eq!(hook.state(), TransferState::Discarded);

        hook.receive(b"late bytes").await.unwrap();
        let reply = hook.transfer_finished().await;
        assert_eq!(reply.code, 426);
        assert_eq!(upstream.posts(), 0);
    }

    #[tokio::test]
    async fn test_abort_after_finalize_is_noop() {
        let upstream = FixedStatus::new(200, "OK");
        let mut hook = hook_for(upstream.clone());
        hook.transfer_finished().await;
        hook.abort();
        assert_eq!(hook.state(), TransferState::Finalized);
        assert_eq!(upstream.posts(), 1);
    }

    #[tokio::test]
    async fn test_empty_transfer_still_relays() {
        let upstream = FixedStatus::new(200, "OK");
        let mut hook = hook_for(upstream.clone());
        assert_eq!(hook.transfer_finished().await.code, 226);
        assert_eq!(upstream.posts(), 1);
    }
}
