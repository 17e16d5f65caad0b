//! Upstream liveness probing
//!
//! A TCP connect is the whole check: the upstream is "ready" when something
//! accepts on its port. Used once at startup (bounded wait) and on every
//! proxied request to short-circuit when the upstream is down.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Check whether the upstream accepts TCP connections within `timeout`
pub async fn is_upstream_ready(host: &str, port: u16, timeout: Duration) -> bool {
    let addr = format!("{}:{}", host, port);

    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => {
            debug!(host, port, "Liveness probe passed");
            true
        }
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "Liveness probe failed (connection error)");
            false
        }
        Err(_) => {
            debug!(host, port, "Liveness probe failed (timeout)");
            false
        }
    }
}

/// Source of upstream readiness for the forwarder
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_ready(&self) -> bool;
}

/// Production probe: TCP connect to a fixed host and port
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl LivenessProbe for TcpProbe {
    async fn is_ready(&self) -> bool {
        is_upstream_ready(&self.host, self.port, self.timeout).await
    }
}

/// Poll the probe until it reports ready, `max_wait` elapses, or shutdown is signalled.
///
/// Returns whether the upstream became ready. Callers treat a `false`
/// result as a warning only; the proxy keeps serving and gates per request.
pub async fn wait_for_upstream(
    probe: &dyn LivenessProbe,
    max_wait: Duration,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> bool {
    let started = Instant::now();
    let deadline = started + max_wait;

    loop {
        if probe.is_ready().await {
            info!(
                waited_ms = started.elapsed().as_millis() as u64,
                "Upstream is ready"
            );
            return true;
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(
                max_wait_secs = max_wait.as_secs(),
                "Upstream did not become ready in time; continuing and gating per request"
            );
            return false;
        }

        let sleep_for = interval.min(deadline - now);
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("Startup wait interrupted by shutdown");
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    struct FlakyProbe {
        calls: AtomicUsize,
        ready_after: usize,
    }

    #[async_trait]
    impl LivenessProbe for FlakyProbe {
        async fn is_ready(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_after
        }
    }

    #[tokio::test]
    async fn test_ready_when_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(is_upstream_ready("127.0.0.1", port, Duration::from_secs(1)).await);

        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_secs(1));
        assert!(probe.is_ready().await);
    }

    #[tokio::test]
    async fn test_not_ready_when_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!is_upstream_ready("127.0.0.1", port, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_not_ready_on_unresolvable_host() {
        assert!(!is_upstream_ready("invalid.host.invalid", 80, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_wait_for_upstream_becomes_ready() {
        let probe = FlakyProbe {
            calls: AtomicUsize::new(0),
            ready_after: 3,
        };
        let (_tx, rx) = watch::channel(false);

        let ready = wait_for_upstream(
            &probe,
            Duration::from_secs(5),
            Duration::from_millis(10),
            rx,
        )
        .await;

        assert!(ready);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_for_upstream_gives_up() {
        let probe = FlakyProbe {
            calls: AtomicUsize::new(0),
            ready_after: usize::MAX,
        };
        let (_tx, rx) = watch::channel(false);

        let started = std::time::Instant::now();
        let ready = wait_for_upstream(
            &probe,
            Duration::from_millis(100),
            Duration::from_millis(20),
            rx,
        )
        .await;

        assert!(!ready);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(probe.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_wait_for_upstream_stops_on_shutdown() {
        let probe = FlakyProbe {
            calls: AtomicUsize::new(0),
            ready_after: usize::MAX,
        };
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            wait_for_upstream(&probe, Duration::from_secs(60), Duration::from_secs(2), rx).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let ready = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!ready);
    }
}
