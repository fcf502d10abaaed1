//! Relay endpoint health check

use anyhow::Result;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::upstream::Endpoint;

/// Verify the relay endpoint accepts TCP connections. No request is sent.
pub async fn check_reachable(endpoint: &Endpoint, timeout: Duration) -> Result<()> {
    let connect = TcpStream::connect((endpoint.host(), endpoint.port()));
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(anyhow::anyhow!("relay health check failed: {endpoint}: {e}")),
        Err(_) => Err(anyhow::anyhow!(
            "relay health check failed: {endpoint}: connect timed out"
        )),
    }
}

/// Returns true if the endpoint is reachable, false otherwise (non-panicking)
pub async fn is_reachable(endpoint: &Endpoint, timeout: Duration) -> bool {
    check_reachable(endpoint, timeout).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reachable_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let ep = Endpoint::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        assert!(is_reachable(&ep, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let ep = Endpoint::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        let err = check_reachable(&ep, Duration::from_secs(2)).await.unwrap_err();
        assert!(err.to_string().contains("health check failed"));
    }
}
