//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  Prometheus text format
//!   GET /healthz  Liveness probe (always 200 if process is running)
//!   GET /readyz   Readiness probe (200 if the relay endpoint accepts TCP)

use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use ftpost_ftp::{SessionObserver, UploadFailure};
use ftpost_upload::Endpoint;
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

type Labels = Vec<(String, String)>;

/// Counters fed by the FTP engine through `SessionObserver`.
#[derive(Clone)]
pub struct RelayMetrics {
    uploads_relayed: Counter,
    uploads_failed: Family<Labels, Counter>,
    relayed_bytes: Counter,
    relay_duration: Histogram,
    logins_failed: Counter,
    sessions_active: Gauge<i64, AtomicI64>,
}

impl RelayMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = RelayMetrics {
            uploads_relayed: Counter::default(),
            uploads_failed: Family::default(),
            relayed_bytes: Counter::default(),
            relay_duration: Histogram::new([
                0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0,
            ]),
            logins_failed: Counter::default(),
            sessions_active: Gauge::default(),
        };

        // Counters get their `_total` suffix from the encoder.
        registry.register(
            "ftpost_uploads_relayed",
            "Uploads accepted by the relay endpoint",
            metrics.uploads_relayed.clone(),
        );
        registry.register(
            "ftpost_uploads_failed",
            "Uploads that were not relayed, by reason",
            metrics.uploads_failed.clone(),
        );
        registry.register(
            "ftpost_relayed_bytes",
            "Payload bytes accepted by the relay endpoint",
            metrics.relayed_bytes.clone(),
        );
        registry.register(
            "ftpost_relay_duration_seconds",
            "Time spent delivering one upload to the relay endpoint",
            metrics.relay_duration.clone(),
        );
        registry.register(
            "ftpost_logins_failed",
            "Rejected login attempts",
            metrics.logins_failed.clone(),
        );
        registry.register(
            "ftpost_sessions_active",
            "Open control connections",
            metrics.sessions_active.clone(),
        );
        metrics
    }

    fn failure_labels(reason: UploadFailure) -> Labels {
        vec![("reason".to_string(), reason.as_str().to_string())]
    }
}

impl SessionObserver for RelayMetrics {
    fn session_opened(&self) {
        self.sessions_active.inc();
    }

    fn session_closed(&self) {
        self.sessions_active.dec();
    }

    fn login_failed(&self) {
        self.logins_failed.inc();
    }

    fn upload_relayed(&self, bytes: u64, elapsed: Duration) {
        self.uploads_relayed.inc();
        self.relayed_bytes.inc_by(bytes);
        self.relay_duration.observe(elapsed.as_secs_f64());
    }

    fn upload_failed(&self, reason: UploadFailure) {
        self.uploads_failed
            .get_or_create(&Self::failure_labels(reason))
            .inc();
    }
}

/// State shared by the HTTP handlers
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub relay: Endpoint,
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9102")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

fn router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match ftpost_upload::check_reachable(&state.relay, READY_PROBE_TIMEOUT).await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(e) => {
            tracing::debug!("readiness probe: {e:#}");
            (StatusCode::SERVICE_UNAVAILABLE, "relay endpoint unreachable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(registry: &Registry) -> String {
        let mut body = String::new();
        encode(&mut body, registry).unwrap();
        body
    }

    #[test]
    fn test_observer_updates_metrics() {
        let mut registry = Registry::default();
        let metrics = RelayMetrics::new(&mut registry);

        metrics.session_opened();
        metrics.session_opened();
        metrics.session_closed();
        metrics.login_failed();
        metrics.upload_relayed(1024, Duration::from_millis(20));
        metrics.upload_failed(UploadFailure::UpstreamStatus);
        metrics.upload_failed(UploadFailure::UpstreamStatus);

        let text = encoded(&registry);
        assert!(text.contains("ftpost_uploads_relayed_total 1"), "{text}");
        assert!(text.contains("ftpost_relayed_bytes_total 1024"), "{text}");
        assert!(text.contains("ftpost_logins_failed_total 1"), "{text}");
        assert!(text.contains("ftpost_sessions_active 1"), "{text}");
        assert!(
            text.contains("ftpost_uploads_failed_total{reason=\"upstream_status\"} 2"),
            "{text}"
        );
        assert!(text.contains("ftpost_relay_duration_seconds_count 1"), "{text}");
    }

    async fn spawn(state: HealthState) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        addr
    }

    async fn get_status(addr: std::net::SocketAddr, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response.lines().next().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_readyz_follows_relay_reachability() {
        let relay_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay_listener.local_addr().unwrap();
        let state = HealthState {
            registry: Arc::new(Registry::default()),
            relay: Endpoint::parse(&format!("http://{relay_addr}/upload/")).unwrap(),
        };
        let addr = spawn(state).await;

        assert!(get_status(addr, "/healthz").await.contains("200"));
        assert!(get_status(addr, "/readyz").await.contains("200"));

        drop(relay_listener);
        assert!(get_status(addr, "/readyz").await.contains("503"));
        assert!(get_status(addr, "/metrics").await.contains("200"));
    }
}
