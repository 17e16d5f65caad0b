use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::cors::CorsLayer;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::forward::{ForwardPolicy, ForwardRequest, Forwarder, ProxyTarget};
use crate::origin::AllowedOrigins;
use crate::probe::TcpProbe;
use crate::rate_limit::SlidingWindowLimiter;
use crate::transport::{HyperTransport, PoolConfig, ResponseBody, TransportStats};

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// How often idle rate limit entries are purged
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

type ProxyResponse = Response<ResponseBody>;

/// Everything a request handler needs, shared across connections
pub struct ProxyState {
    pub app_name: String,
    pub forwarder: Forwarder,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub cors: CorsLayer,
    pub max_body_bytes: usize,
    pub trust_forwarded_for: bool,
    pub transport_stats: Option<Arc<TransportStats>>,
}

impl ProxyState {
    /// Wire up the production transport, probe, limiter and CORS layer
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let origins = Arc::new(
            AllowedOrigins::new(&config.access.allowed_origins)
                .allow_missing(config.access.allow_missing_origin),
        );
        if origins.is_empty() {
            warn!("No allowed origins configured; every proxied request will be denied");
        }

        let transport = HyperTransport::new(PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
            bearer_token: config.upstream.token.clone(),
        })?;
        let transport_stats = transport.stats();

        let probe = TcpProbe::new(
            config.upstream.host.clone(),
            config.upstream.port,
            config.upstream.probe_timeout(),
        );

        let forwarder = Forwarder::new(
            ProxyTarget::new(config.upstream.host.clone(), config.upstream.port),
            Arc::clone(&origins),
            Arc::new(probe),
            Arc::new(transport),
            ForwardPolicy::from(&config.upstream),
        );

        Ok(Self {
            app_name: config.app.name.clone(),
            forwarder,
            limiter: Arc::new(SlidingWindowLimiter::from_config(&config.rate_limit)),
            cors: CorsLayer::new(config.cors.clone(), origins),
            max_body_bytes: config.server.max_body_bytes,
            trust_forwarded_for: config.server.trust_forwarded_for,
            transport_stats: Some(transport_stats),
        })
    }
}

/// The public-facing reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: Arc<ProxyState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(
            addr = %self.bind_addr,
            app = %self.state.app_name,
            upstream_port = self.state.forwarder.target().port,
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut purge = tokio::time::interval(PURGE_INTERVAL);
        purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = purge.tick() => {
                    self.state.limiter.purge_idle();
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ProxyState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> Result<ProxyResponse, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, request_id, client = %client_addr, "Incoming request");

    let mut response = match (&method, path.as_str()) {
        (&Method::GET, "/") => root_response(&state),
        (&Method::GET, "/status") => status_response(&state).await,
        (&Method::GET | &Method::POST | &Method::OPTIONS, _) => {
            proxy_request(req, &state, client_addr, &request_id).await
        }
        _ => json_error_response(
            ProxyErrorCode::MethodNotAllowed,
            format!("Method {} is not supported", method),
        ),
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }

    Ok(response)
}

/// Forward a request and add CORS headers to whatever comes back
async fn proxy_request(
    req: Request<Incoming>,
    state: &ProxyState,
    client_addr: SocketAddr,
    request_id: &str,
) -> ProxyResponse {
    let method = req.method().clone();
    let request_headers = req.headers().clone();

    let mut response = forward_request(req, state, client_addr, request_id).await;
    state.cors.apply(&method, &request_headers, &mut response);
    response
}

/// Rate limit, read the body, then hand the request to the forwarder
async fn forward_request(
    req: Request<Incoming>,
    state: &ProxyState,
    client_addr: SocketAddr,
    request_id: &str,
) -> ProxyResponse {
    let client_ip = client_ip(req.headers(), client_addr, state.trust_forwarded_for);
    let client_id = client_ip.to_string();

    if !state.limiter.allow(&client_id) {
        return json_error_response(
            ProxyErrorCode::RateLimited,
            format!(
                "Rate limit exceeded: {} requests per {} seconds",
                state.limiter.limit(),
                state.limiter.window().as_secs()
            ),
        );
    }

    let (parts, body) = req.into_parts();

    let body = match Limited::new(body, state.max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(request_id, error = %e, "Failed to read request body");
            return json_error_response(
                ProxyErrorCode::ConfigurationError,
                format!("Request body could not be read: {}", e),
            );
        }
    };

    // Overwrite X-Forwarded-* rather than append; this proxy is the first trusted hop
    let mut headers = parts.headers;
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_ip.to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let forward = ForwardRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(String::from),
        headers,
        body,
    };

    match state.forwarder.forward(forward).await {
        Ok(response) => response,
        Err(e) => {
            debug!(request_id, error = %e, "Request refused");
            e.into_response()
        }
    }
}

/// Client identity for rate limiting
fn client_ip(headers: &HeaderMap, addr: SocketAddr, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    addr.ip()
}

fn json_response(status: StatusCode, value: serde_json::Value) -> ProxyResponse {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(
            Full::new(Bytes::from(value.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static header")
}

fn root_response(state: &ProxyState) -> ProxyResponse {
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "ok",
            "message": format!(
                "{} proxy is running. Use /status for upstream health.",
                state.app_name
            ),
        }),
    )
}

async fn status_response(state: &ProxyState) -> ProxyResponse {
    let target = state.forwarder.target();
    let ready = state.forwarder.probe().is_ready().await;

    let mut body = serde_json::json!({
        "status": "ok",
        "app_name": state.app_name,
        "upstream": {
            "host": target.host,
            "port": target.port,
            "ready": ready,
        },
        "rate_limit": {
            "enabled": state.limiter.is_enabled(),
            "limit": state.limiter.limit(),
            "window_secs": state.limiter.window().as_secs(),
            "tracked_clients": state.limiter.tracked_clients(),
        },
        "allowed_origins": state.forwarder.origins().len(),
    });

    if let Some(ref stats) = state.transport_stats {
        body["upstream"]["requests_forwarded"] = stats.get_total_requests().into();
        body["upstream"]["requests_failed"] = stats.get_failed_requests().into();
    }

    json_response(StatusCode::OK, body)
}
