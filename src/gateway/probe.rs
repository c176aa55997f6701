//! Cheap TCP liveness probe against the configured gateway endpoint, with a
//! short TTL cache so every strategy run does not reopen a socket.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

pub struct GatewayProbe {
    host: String,
    port: u16,
    timeout: Duration,
    ttl: Duration,
    cached: Mutex<Option<(Instant, bool)>>,
}

impl GatewayProbe {
    pub fn new(host: &str, port: u16, timeout_seconds: u64) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout: Duration::from_secs(timeout_seconds.clamp(1, 5)),
            ttl: Duration::from_secs(2),
            cached: Mutex::new(None),
        }
    }

    /// Whether the gateway endpoint currently accepts connections.
    pub async fn is_reachable(&self) -> bool {
        if let Ok(guard) = self.cached.lock() {
            if let Some((probed_at, healthy)) = *guard {
                if probed_at.elapsed() <= self.ttl {
                    return healthy;
                }
            }
        }

        let address = format!("{}:{}", self.host, self.port);
        let healthy = matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(&address)).await,
            Ok(Ok(_))
        );
        debug!(address, healthy, "gateway probe");

        if let Ok(mut guard) = self.cached.lock() {
            *guard = Some((Instant::now(), healthy));
        }
        healthy
    }

    /// Drop the cached result (tests and reconnect paths).
    pub fn reset(&self) {
        if let Ok(mut guard) = self.cached.lock() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_false() {
        // reserved TEST-NET address, nothing listens there
        let probe = GatewayProbe::new("192.0.2.1", 4002, 1);
        assert!(!probe.is_reachable().await);
    }

    #[tokio::test]
    async fn test_probe_caches_within_ttl() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = GatewayProbe::new("127.0.0.1", port, 1);
        assert!(probe.is_reachable().await);

        // endpoint goes away but the cached result survives inside the TTL
        drop(listener);
        assert!(probe.is_reachable().await);

        probe.reset();
        assert!(!probe.is_reachable().await);
    }
}
