//! CORS header injection for allow-listed origins

use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
    ACCESS_CONTROL_REQUEST_HEADERS, ORIGIN, VARY,
};
use hyper::{Method, Response};
use std::sync::Arc;
use tracing::debug;

use crate::config::CorsConfig;
use crate::origin::AllowedOrigins;

pub struct CorsLayer {
    config: CorsConfig,
    origins: Arc<AllowedOrigins>,
}

impl CorsLayer {
    pub fn new(config: CorsConfig, origins: Arc<AllowedOrigins>) -> Self {
        Self { config, origins }
    }

    /// Add CORS headers to `response` when the request's Origin is allowed.
    ///
    /// Returns whether headers were added. Preflight headers are only added
    /// for OPTIONS requests.
    pub fn apply<B>(&self, method: &Method, request_headers: &HeaderMap, response: &mut Response<B>) -> bool {
        if !self.config.enabled {
            return false;
        }

        let Some(origin) = request_headers.get(ORIGIN) else {
            return false;
        };
        let Ok(origin_str) = origin.to_str() else {
            return false;
        };
        if !self.origins.is_origin_allowed(origin_str) {
            return false;
        }

        let headers = response.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        add_vary_origin(headers);

        if self.config.allow_credentials {
            headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }

        if *method == Method::OPTIONS {
            if let Ok(value) = HeaderValue::from_str(&self.config.allow_methods) {
                headers.insert(ACCESS_CONTROL_ALLOW_METHODS, value);
            }

            let allow_headers = if self.config.allow_headers.is_empty() {
                request_headers.get(ACCESS_CONTROL_REQUEST_HEADERS).cloned()
            } else {
                HeaderValue::from_str(&self.config.allow_headers).ok()
            };
            if let Some(value) = allow_headers {
                headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, value);
            }

            headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(self.config.max_age_secs));
        }

        debug!(origin = origin_str, preflight = *method == Method::OPTIONS, "CORS headers added");
        true
    }
}

fn add_vary_origin(headers: &mut HeaderMap) {
    let already = headers.get_all(VARY).iter().any(|v| {
        v.to_str()
            .map(|s| s.split(',').any(|part| part.trim().eq_ignore_ascii_case("origin") || part.trim() == "*"))
            .unwrap_or(false)
    });
    if !already {
        headers.append(VARY, HeaderValue::from_static("Origin"));
    }
}
