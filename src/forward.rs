//! Origin-validated, liveness-gated forwarding to the fixed upstream

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{
    HeaderName, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION, ORIGIN, REFERER, TRANSFER_ENCODING,
};
use hyper::{HeaderMap, Method, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::UpstreamConfig;
use crate::error::ProxyError;
use crate::origin::AllowedOrigins;
use crate::probe::LivenessProbe;
use crate::transport::{IdleTimeoutBody, ResponseBody, Transport, TransportError, UpstreamRequest};

/// An inbound request, already read off the wire
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub path: String,
    /// Raw query string, forwarded as received
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// The fixed upstream address
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
}

impl ProxyTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Build the upstream URL for a path and raw query string
    pub fn url_for(&self, path: &str, query: Option<&str>) -> Result<Url, ProxyError> {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let mut url = Url::parse(&format!("http://{}:{}", host, self.port))
            .map_err(|e| ProxyError::UpstreamError(format!("invalid upstream address: {}", e)))?;
        url.set_path(path);
        url.set_query(query);
        Ok(url)
    }

    /// Whether a URL points at this upstream (plain http, same host and port)
    pub fn serves(&self, url: &Url) -> bool {
        let same_host = url.host_str().is_some_and(|host| {
            host.trim_start_matches('[')
                .trim_end_matches(']')
                .eq_ignore_ascii_case(&self.host)
        });
        url.scheme() == "http" && same_host && url.port_or_known_default() == Some(self.port)
    }
}

/// Per-method timeouts and redirect budget
#[derive(Debug, Clone)]
pub struct ForwardPolicy {
    pub get_timeout: Duration,
    pub post_timeout: Duration,
    pub max_redirects: usize,
}

impl Default for ForwardPolicy {
    fn default() -> Self {
        Self {
            get_timeout: Duration::from_secs(30),
            post_timeout: Duration::from_secs(60),
            max_redirects: 10,
        }
    }
}

impl From<&UpstreamConfig> for ForwardPolicy {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            get_timeout: config.get_timeout(),
            post_timeout: config.post_timeout(),
            max_redirects: config.max_redirects,
        }
    }
}

impl ForwardPolicy {
    pub fn timeout_for(&self, method: &Method) -> Duration {
        if *method == Method::POST {
            self.post_timeout
        } else {
            self.get_timeout
        }
    }
}

pub struct Forwarder {
    target: ProxyTarget,
    origins: Arc<AllowedOrigins>,
    probe: Arc<dyn LivenessProbe>,
    transport: Arc<dyn Transport>,
    policy: ForwardPolicy,
}

impl Forwarder {
    pub fn new(
        target: ProxyTarget,
        origins: Arc<AllowedOrigins>,
        probe: Arc<dyn LivenessProbe>,
        transport: Arc<dyn Transport>,
        policy: ForwardPolicy,
    ) -> Self {
        Self {
            target,
            origins,
            probe,
            transport,
            policy,
        }
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    pub fn origins(&self) -> &Arc<AllowedOrigins> {
        &self.origins
    }

    pub fn probe(&self) -> &Arc<dyn LivenessProbe> {
        &self.probe
    }

    /// Forward a request, or explain why it was refused
    pub async fn forward(&self, req: ForwardRequest) -> Result<Response<ResponseBody>, ProxyError> {
        if !self.origins.is_allowed(req.header(&ORIGIN), req.header(&REFERER)) {
            return Err(ProxyError::AccessDenied);
        }

        if req.method == Method::OPTIONS {
            debug!(path = %req.path, "Answering preflight locally");
            return Ok(empty_response(StatusCode::OK));
        }

        if !self.probe.is_ready().await {
            warn!(
                host = %self.target.host,
                port = self.target.port,
                "Upstream not ready; refusing request"
            );
            return Err(ProxyError::UpstreamUnavailable);
        }

        let timeout = self.policy.timeout_for(&req.method);
        let url = self.target.url_for(&req.path, req.query.as_deref())?;

        let mut headers = req.headers;
        headers.remove(HOST);

        let first_hop = UpstreamRequest {
            method: req.method,
            url,
            headers,
            body: req.body,
        };

        match tokio::time::timeout(timeout, self.follow_redirects(first_hop)).await {
            Ok(result) => {
                result.map(|response| response.map(|body| IdleTimeoutBody::new(body, timeout).boxed()))
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Upstream request timed out");
                Err(ProxyError::UpstreamTimeout(timeout.as_secs()))
            }
        }
    }

    async fn follow_redirects(
        &self,
        mut hop: UpstreamRequest,
    ) -> Result<Response<ResponseBody>, ProxyError> {
        for redirects in 0..=self.policy.max_redirects {
            let method = hop.method.clone();
            let url = hop.url.clone();
            debug!(%method, %url, redirects, "Sending upstream request");

            let response = self
                .transport
                .send(hop.clone())
                .await
                .map_err(|e| match e {
                    TransportError::Connect(msg) => {
                        warn!(error = %msg, "Upstream connection failed");
                        ProxyError::UpstreamUnavailable
                    }
                    TransportError::Timeout => {
                        ProxyError::UpstreamTimeout(self.policy.timeout_for(&method).as_secs())
                    }
                    TransportError::Other(msg) => ProxyError::UpstreamError(msg),
                })?;

            let status = response.status();
            let Some(next_url) = redirect_target(&url, status, response.headers()) else {
                info!(%method, path = url.path(), status = status.as_u16(), "Upstream responded");
                return Ok(response);
            };

            // Only the upstream gets the caller's cookies and the bearer token;
            // anything else goes back to the caller to follow itself
            if !self.target.serves(&next_url) {
                info!(status = status.as_u16(), location = %next_url, "Returning off-upstream redirect to caller");
                return Ok(response);
            }

            if redirects == self.policy.max_redirects {
                break;
            }

            debug!(status = status.as_u16(), location = %next_url, "Following upstream redirect");
            hop = redirected(hop, status, next_url);
        }

        warn!(limit = self.policy.max_redirects, "Too many upstream redirects");
        Err(ProxyError::TooManyRedirects(self.policy.max_redirects))
    }
}

/// Resolve the Location of a redirect response against the URL that produced it
fn redirect_target(current: &Url, status: StatusCode, headers: &HeaderMap) -> Option<Url> {
    if !matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308) {
        return None;
    }
    let location = headers.get(LOCATION)?.to_str().ok()?;
    current.join(location).ok()
}

/// Rewrite a hop for the next redirect
///
/// 303 always becomes GET; 301 and 302 turn POST into GET. 307 and 308 keep
/// method and body.
fn redirected(mut hop: UpstreamRequest, status: StatusCode, next: Url) -> UpstreamRequest {
    let to_get = match status {
        StatusCode::SEE_OTHER => hop.method != Method::HEAD,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => hop.method == Method::POST,
        _ => false,
    };

    if to_get {
        hop.method = Method::GET;
        hop.body = Bytes::new();
        hop.headers.remove(CONTENT_LENGTH);
        hop.headers.remove(CONTENT_TYPE);
        hop.headers.remove(TRANSFER_ENCODING);
    }

    hop.url = next;
    hop
}

pub fn empty_response(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
}
