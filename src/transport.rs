//! Pooled HTTP transport to the upstream
//!
//! The forwarder talks to the upstream only through the [`Transport`] trait so
//! tests can substitute a transport that records calls.

use async_trait::async_trait;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::header::{HeaderValue, AUTHORIZATION};
use hyper::{HeaderMap, Method, Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, Sleep};
use tracing::{debug, warn};
use url::Url;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type ResponseBody = BoxBody<Bytes, BoxError>;

/// A single hop sent to the upstream
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// Nothing accepted the connection
    #[error("connection failed: {0}")]
    Connect(String),
    /// The transport gave up waiting
    #[error("timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, req: UpstreamRequest) -> Result<Response<ResponseBody>, TransportError>;
}

/// Counters for upstream traffic
#[derive(Debug, Default)]
pub struct TransportStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl TransportStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Bearer token added to every upstream request
    pub bearer_token: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            bearer_token: None,
        }
    }
}

/// Production transport over a pooled hyper client
pub struct HyperTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    authorization: Option<HeaderValue>,
    stats: Arc<TransportStats>,
}

impl HyperTransport {
    pub fn new(config: PoolConfig) -> anyhow::Result<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        let authorization = match config.bearer_token {
            Some(ref token) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|_| anyhow::anyhow!("Upstream token contains invalid header characters"))?;
                value.set_sensitive(true);
                Some(value)
            }
            None => None,
        };

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            token = authorization.is_some(),
            "Upstream transport initialized"
        );

        Ok(Self {
            client,
            authorization,
            stats: Arc::new(TransportStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }

    fn build_request(&self, req: UpstreamRequest) -> Result<Request<Full<Bytes>>, TransportError> {
        let mut builder = Request::builder().method(req.method).uri(req.url.as_str());

        if let Some(headers) = builder.headers_mut() {
            *headers = req.headers;
            if let Some(ref auth) = self.authorization {
                headers.insert(AUTHORIZATION, auth.clone());
            }
        }

        builder
            .body(Full::new(req.body))
            .map_err(|e| TransportError::Other(format!("request build error: {}", e)))
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, req: UpstreamRequest) -> Result<Response<ResponseBody>, TransportError> {
        let upstream_req = self.build_request(req)?;
        self.stats.record_request();

        let response = self.client.request(upstream_req).await.map_err(|e| {
            self.stats.record_failure();
            if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Other(e.to_string())
            }
        })?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(
            parts,
            body.map_err(|e| Box::new(e) as BoxError).boxed(),
        ))
    }
}

/// A response body that fails once no frame has arrived for `idle`
///
/// Headers are bounded by the request timeout; this bounds the rest of the
/// stream, so an upstream that stalls mid-body cannot hold the connection.
pub struct IdleTimeoutBody {
    inner: ResponseBody,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl IdleTimeoutBody {
    pub fn new(inner: ResponseBody, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            deadline: Box::pin(tokio::time::sleep(idle)),
        }
    }
}

impl Body for IdleTimeoutBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();

        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            let next = Instant::now() + this.idle;
            this.deadline.as_mut().reset(next);
            return Poll::Ready(frame);
        }

        match this.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                warn!(idle_secs = this.idle.as_secs(), "Upstream body stalled; aborting response");
                Poll::Ready(Some(Err(Box::new(TransportError::Timeout) as BoxError)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert!(config.bearer_token.is_none());
    }

    #[test]
    fn test_transport_stats() {
        let stats = TransportStats::default();
        stats.record_request();
        stats.record_request();
        stats.record_failure();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
    }

    #[test]
    fn test_invalid_token_rejected() {
        let config = PoolConfig {
            bearer_token: Some("bad\ntoken".to_string()),
            ..Default::default()
        };
        assert!(HyperTransport::new(config).is_err());
    }

    #[test]
    fn test_build_request_adds_token() {
        let transport = HyperTransport::new(PoolConfig {
            bearer_token: Some("s3cret".to_string()),
            ..Default::default()
        })
        .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-custom", HeaderValue::from_static("1"));
        let req = transport
            .build_request(UpstreamRequest {
                method: Method::POST,
                url: Url::parse("http://127.0.0.1:7860/api?x=1").unwrap(),
                headers,
                body: Bytes::from_static(b"{}"),
            })
            .unwrap();

        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri().path_and_query().unwrap().as_str(), "/api?x=1");
        assert_eq!(req.headers().get("x-custom").unwrap(), "1");
        assert_eq!(req.headers().get(AUTHORIZATION).unwrap(), "Bearer s3cret");
    }

    #[tokio::test]
    async fn test_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HyperTransport::new(PoolConfig::default()).unwrap();
        let result = transport
            .send(UpstreamRequest {
                method: Method::GET,
                url: Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap(),
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
            .await;

        assert!(matches!(result, Err(TransportError::Connect(_))));
        assert_eq!(transport.stats().get_failed_requests(), 1);
    }

    #[tokio::test]
    async fn test_send_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(request.starts_with("GET /hello HTTP/1.1"));
            stream
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        let transport = HyperTransport::new(PoolConfig::default()).unwrap();
        let response = transport
            .send(UpstreamRequest {
                method: Method::GET,
                url: Url::parse(&format!("http://127.0.0.1:{}/hello", port)).unwrap(),
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");
        assert_eq!(transport.stats().get_total_requests(), 1);
    }

    /// Sends one frame, then never another
    struct StalledBody {
        sent: bool,
    }

    impl Body for StalledBody {
        type Data = Bytes;
        type Error = BoxError;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
            if self.sent {
                Poll::Pending
            } else {
                self.sent = true;
                Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(b"hello")))))
            }
        }
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_stalled_body() {
        let body = IdleTimeoutBody::new(
            StalledBody { sent: false }.boxed(),
            Duration::from_millis(100),
        );

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(5), body.collect())
            .await
            .expect("stalled body should be cut off");
        let err = result.err().expect("stalled body should fail");
        assert_eq!(err.to_string(), "timed out");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_idle_timeout_passes_steady_body() {
        let body = IdleTimeoutBody::new(
            Full::new(Bytes::from_static(b"complete"))
                .map_err(|never| match never {})
                .boxed(),
            Duration::from_millis(100),
        );

        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"complete");
    }
}
