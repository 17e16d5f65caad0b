//! Control plane API
//!
//! JSON endpoints that drive the deployment invoker:
//!
//! - `POST /api/deploy` `{"repoUrl": "...", "appName": "..."}`
//! - `POST /api/status` `{"appName": "..."}`
//! - `POST /api/undeploy` `{"appName": "..."}`
//! - `GET /health`, `GET /version`

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::is_valid_app_name;
use crate::deploy::{DeploymentInvoker, DeploymentRecord, DeploymentStatus, Operation};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::transport::ResponseBody;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted control request body
const MAX_BODY_BYTES: usize = 64 * 1024;

type ControlResponse = Response<ResponseBody>;

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> ControlResponse {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployRequest {
    repo_url: String,
    app_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppRequest {
    app_name: String,
}

pub struct ControlServer {
    bind_addr: SocketAddr,
    invoker: Arc<DeploymentInvoker>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlServer {
    pub fn new(
        bind_addr: SocketAddr,
        invoker: Arc<DeploymentInvoker>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            invoker,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Control API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let invoker = Arc::clone(&self.invoker);
                            tokio::spawn(async move {
                                if let Err(e) = serve_control_connection(stream, invoker).await {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_control_connection(
    stream: TcpStream,
    invoker: Arc<DeploymentInvoker>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let invoker = Arc::clone(&invoker);
        async move { handle_control_request(req, invoker).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Control connection error: {}", e))?;

    Ok(())
}

async fn handle_control_request(
    req: Request<Incoming>,
    invoker: Arc<DeploymentInvoker>,
) -> Result<ControlResponse, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(%path, error = %e, "Failed to read control request body");
            return Ok(json_error_response(
                ProxyErrorCode::ConfigurationError,
                format!("Invalid request body: {}", e),
            ));
        }
    };

    Ok(route(&method, &path, &body, &invoker).await)
}

/// Dispatch one control request with an already-read body
pub async fn route(
    method: &Method,
    path: &str,
    body: &[u8],
    invoker: &Arc<DeploymentInvoker>,
) -> ControlResponse {
    debug!(%method, path, "Control API request");

    match (method, path) {
        (&Method::GET, "/health") => json_response(StatusCode::OK, r#"{"status":"ok"}"#),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::POST, "/api/deploy") => {
            let req: DeployRequest = match parse_body(body) {
                Ok(req) => req,
                Err(resp) => return resp,
            };
            if let Err(resp) = check_app_name(&req.app_name) {
                return resp;
            }
            if req.repo_url.trim().is_empty() || req.repo_url.starts_with('-') {
                return json_error_response(
                    ProxyErrorCode::ConfigurationError,
                    "repoUrl must be a repository location",
                );
            }
            let invoker = Arc::clone(invoker);
            let app_name = req.app_name.clone();
            let repo_url = req.repo_url.trim().to_string();
            let record = detached(&req.app_name, Operation::Deploy, async move {
                invoker.deploy(&repo_url, &app_name).await
            })
            .await;
            record_response(&record, false)
        }

        (&Method::POST, "/api/status") => {
            let req: AppRequest = match parse_body(body) {
                Ok(req) => req,
                Err(resp) => return resp,
            };
            if let Err(resp) = check_app_name(&req.app_name) {
                return resp;
            }
            let record = invoker.get_status(&req.app_name).await;
            record_response(&record, true)
        }

        (&Method::POST, "/api/undeploy") => {
            let req: AppRequest = match parse_body(body) {
                Ok(req) => req,
                Err(resp) => return resp,
            };
            if let Err(resp) = check_app_name(&req.app_name) {
                return resp;
            }
            let invoker = Arc::clone(invoker);
            let app_name = req.app_name.clone();
            let record = detached(&req.app_name, Operation::Undeploy, async move {
                invoker.undeploy(&app_name).await
            })
            .await;
            record_response(&record, false)
        }

        (_, "/health" | "/version" | "/api/deploy" | "/api/status" | "/api/undeploy") => {
            json_error_response(
                ProxyErrorCode::MethodNotAllowed,
                format!("Method {} not allowed on {}", method, path),
            )
        }

        _ => json_error_response(ProxyErrorCode::NotFound, format!("No route for {}", path)),
    }
}

/// Run an invoker operation on its own task so it finishes and is recorded
/// even if the client disconnects
async fn detached<F>(app_name: &str, operation: Operation, operation_fut: F) -> DeploymentRecord
where
    F: Future<Output = DeploymentRecord> + Send + 'static,
{
    match tokio::spawn(operation_fut).await {
        Ok(record) => record,
        Err(e) => {
            error!(app = app_name, ?operation, error = %e, "Control operation task failed");
            DeploymentRecord::new(
                app_name,
                operation,
                DeploymentStatus::Error,
                format!("Operation aborted: {}", e),
            )
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ControlResponse> {
    serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "Rejected control request body");
        json_error_response(
            ProxyErrorCode::ConfigurationError,
            format!("Invalid request body: {}", e),
        )
    })
}

fn check_app_name(name: &str) -> Result<(), ControlResponse> {
    if is_valid_app_name(name) {
        Ok(())
    } else {
        Err(json_error_response(
            ProxyErrorCode::ConfigurationError,
            "appName must be 1-64 characters of letters, digits, '-' or '_'",
        ))
    }
}

/// The record is always the body; failures only change the status code.
///
/// For a status lookup any answer other than `error` is a success, since
/// "failed" or "undeployed" is exactly what the caller asked about.
fn record_response(record: &DeploymentRecord, lookup: bool) -> ControlResponse {
    let body = serde_json::to_string(record).unwrap_or_else(|e| {
        format!(r#"{{"status":"error","details":"failed to encode record: {}"}}"#, e)
    });

    let ok = if lookup {
        record.status != DeploymentStatus::Error
    } else {
        record.status.is_success()
    };

    if ok {
        json_response(StatusCode::OK, body)
    } else {
        let code = ProxyErrorCode::DeploymentFailure;
        let mut response = json_response(code.status_code(), body);
        response.headers_mut().insert(
            "X-Proxy-Error",
            hyper::header::HeaderValue::from_static(code.as_header_value()),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeployConfig;
    use crate::deploy::DeploymentStore;

    fn invoker(cli: &str) -> Arc<DeploymentInvoker> {
        let config = DeployConfig {
            cli: cli.to_string(),
            ..Default::default()
        };
        Arc::new(DeploymentInvoker::new(config, Arc::new(DeploymentStore::new())))
    }

    async fn body_json(response: ControlResponse) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_version() {
        let invoker = invoker("modal");

        let response = route(&Method::GET, "/health", b"", &invoker).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");

        let response = route(&Method::GET, "/version", b"", &invoker).await;
        let json = body_json(response).await;
        assert_eq!(json["name"], "deploygate");
        assert_eq!(json["version"], VERSION);
    }

    #[tokio::test]
    async fn test_malformed_body_rejected() {
        let invoker = invoker("modal");

        for (path, body) in [
            ("/api/deploy", &b"not json"[..]),
            ("/api/deploy", &br#"{"appName":"x"}"#[..]),
            ("/api/status", &br#"{}"#[..]),
            ("/api/undeploy", &br#"{"appName": 5}"#[..]),
        ] {
            let response = route(&Method::POST, path, body, &invoker).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", path);
            assert_eq!(
                response.headers().get("X-Proxy-Error").unwrap(),
                "CONFIGURATION_ERROR"
            );
            let json = body_json(response).await;
            assert_eq!(json["status"], "error");
        }
        assert!(invoker.store().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_app_name_rejected() {
        let invoker = invoker("modal");

        let response = route(
            &Method::POST,
            "/api/deploy",
            br#"{"repoUrl":"https://example.com/r.git","appName":"../../etc"}"#,
            &invoker,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = route(
            &Method::POST,
            "/api/deploy",
            br#"{"repoUrl":"--upload-pack=evil","appName":"ok"}"#,
            &invoker,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(invoker.store().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_route_and_method() {
        let invoker = invoker("modal");

        let response = route(&Method::GET, "/nope", b"", &invoker).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = route(&Method::GET, "/api/deploy", b"", &invoker).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_cli_failure_returns_record_with_500() {
        let invoker = invoker("/nonexistent/deploy-cli");

        let response = route(
            &Method::POST,
            "/api/undeploy",
            br#"{"appName":"galaxy"}"#,
            &invoker,
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "DEPLOYMENT_FAILURE"
        );
        let json = body_json(response).await;
        assert_eq!(json["status"], "error");
        assert_eq!(json["app_name"], "galaxy");
        assert_eq!(json["operation"], "undeploy");
    }

    #[test]
    fn test_record_response_status_codes() {
        let deployed = DeploymentRecord::new("a", Operation::Deploy, DeploymentStatus::Deployed, "");
        assert_eq!(record_response(&deployed, false).status(), StatusCode::OK);

        let failed = DeploymentRecord::new("a", Operation::Deploy, DeploymentStatus::Failed, "");
        assert_eq!(
            record_response(&failed, false).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        // Looking up a failed deployment is still a successful lookup
        assert_eq!(record_response(&failed, true).status(), StatusCode::OK);

        let unknown = DeploymentRecord::new("a", Operation::Status, DeploymentStatus::Undeployed, "");
        assert_eq!(record_response(&unknown, true).status(), StatusCode::OK);

        let broken = DeploymentRecord::new("a", Operation::Status, DeploymentStatus::Error, "");
        assert_eq!(
            record_response(&broken, true).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let stop_failed =
            DeploymentRecord::new("a", Operation::Undeploy, DeploymentStatus::UndeployFailed, "");
        assert_eq!(
            record_response(&stop_failed, false).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_undeploy_completes_after_client_goes_away() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let cli = dir.path().join("slow-cli");
        std::fs::write(&cli, "#!/bin/sh\nsleep 1\necho stopped\n").unwrap();
        std::fs::set_permissions(&cli, std::fs::Permissions::from_mode(0o755)).unwrap();
        let invoker = invoker(&cli.to_string_lossy());

        let dropped = tokio::time::timeout(
            Duration::from_millis(200),
            route(&Method::POST, "/api/undeploy", br#"{"appName":"galaxy"}"#, &invoker),
        )
        .await;
        assert!(dropped.is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        let record = invoker.store().get("galaxy").expect("undeploy should still be recorded");
        assert_eq!(record.status, DeploymentStatus::Undeployed);
        assert_eq!(record.stdout.as_deref().map(str::trim), Some("stopped"));
    }
}
