//! Origin/Referer allow-listing
//!
//! Requests are admitted when the domain of their `Origin` header, or failing
//! that their `Referer` header, is an allow-listed domain or a subdomain of
//! one. Matching is done on whole DNS labels, never on substrings, so
//! `evil-example.com` and `example.com.attacker.com` do not match `example.com`.

use std::collections::HashSet;
use tracing::{debug, warn};
use url::Url;

/// Extract the bare, lowercase domain from an Origin or Referer value.
///
/// Accepts full URLs (`https://user@Sub.Example.com:8443/path?q`) as well as
/// bare hosts (`example.com:80`). Returns `None` for anything that does not
/// yield a plausible host name. Applying it to its own output is a no-op.
pub fn extract_domain(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let host = if value.contains("://") {
        let url = Url::parse(value).ok()?;
        url.host_str()?.to_string()
    } else {
        bare_host(value)?.to_string()
    };

    normalize_domain(&host)
}

/// Strip path, userinfo, and port from a scheme-less value
fn bare_host(value: &str) -> Option<&str> {
    let authority = value.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit('@').next()?;

    match host_port.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => Some(host),
        Some(_) => None,
        None => Some(host_port),
    }
}

/// Normalize a configured or extracted domain: lowercase, no trailing dot.
///
/// Returns `None` when the value is not a bare domain (contains a scheme,
/// path, port, or characters that cannot appear in a host name).
pub fn normalize_domain(value: &str) -> Option<String> {
    let domain = value.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() || domain.starts_with('.') || domain.contains("..") {
        return None;
    }
    let valid = domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    valid.then_some(domain)
}

/// Immutable set of allowed bare domains
#[derive(Debug, Clone, Default)]
pub struct AllowedOrigins {
    domains: HashSet<String>,
    allow_missing: bool,
}

impl AllowedOrigins {
    /// Build the set, skipping entries that are not bare domains
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .filter_map(|d| {
                let normalized = normalize_domain(d.as_ref());
                if normalized.is_none() {
                    warn!(entry = d.as_ref(), "Ignoring invalid allowed origin");
                }
                normalized
            })
            .collect();

        Self {
            domains,
            allow_missing: false,
        }
    }

    /// Admit requests that carry neither Origin nor Referer
    pub fn allow_missing(mut self, allow: bool) -> Self {
        self.allow_missing = allow;
        self
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Exact or label-boundary subdomain membership
    pub fn contains(&self, domain: &str) -> bool {
        if self.domains.contains(domain) {
            return true;
        }
        // Walk parent domains: a.b.example.com -> b.example.com -> example.com
        let mut rest = domain;
        while let Some((_, parent)) = rest.split_once('.') {
            if self.domains.contains(parent) {
                return true;
            }
            rest = parent;
        }
        false
    }

    /// Whether a single header value (Origin or Referer) is allowed
    pub fn is_origin_allowed(&self, value: &str) -> bool {
        extract_domain(value).is_some_and(|d| self.contains(&d))
    }

    /// Decide whether a request with these headers may be forwarded
    pub fn is_allowed(&self, origin: Option<&str>, referer: Option<&str>) -> bool {
        let origin = origin.map(str::trim).filter(|s| !s.is_empty());
        let referer = referer.map(str::trim).filter(|s| !s.is_empty());

        if let Some(origin) = origin {
            if self.is_origin_allowed(origin) {
                debug!(origin, "Origin allowed");
                return true;
            }
        }

        if let Some(referer) = referer {
            if self.is_origin_allowed(referer) {
                debug!(referer, "Referer allowed");
                return true;
            }
        }

        if origin.is_none() && referer.is_none() {
            if self.allow_missing {
                debug!("No Origin or Referer; allowed by configuration");
            } else {
                warn!("Request denied: no Origin or Referer header");
            }
            return self.allow_missing;
        }

        warn!(
            origin = origin.unwrap_or("-"),
            referer = referer.unwrap_or("-"),
            "Request denied: origin not allowed"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> AllowedOrigins {
        AllowedOrigins::new(["galaxykicklock.web.app", "example.com"])
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("https://Sub.Example.COM:8443/path?q=1#frag").as_deref(),
            Some("sub.example.com")
        );
        assert_eq!(
            extract_domain("http://user:pw@example.com/").as_deref(),
            Some("example.com")
        );
        assert_eq!(extract_domain("example.com").as_deref(), Some("example.com"));
        assert_eq!(extract_domain("example.com:80").as_deref(), Some("example.com"));
        assert_eq!(extract_domain("example.com./x").as_deref(), Some("example.com"));
        assert_eq!(extract_domain(""), None);
        assert_eq!(extract_domain("   "), None);
        assert_eq!(extract_domain("http://"), None);
        assert_eq!(extract_domain("exa mple.com"), None);
        assert_eq!(extract_domain("example.com:abc"), None);
    }

    #[test]
    fn test_extract_domain_idempotent() {
        for input in [
            "https://Sub.Example.COM:8443/path",
            "example.com",
            "http://a.b.c.example.org./",
            "localhost:3000",
        ] {
            let once = extract_domain(input).unwrap();
            let twice = extract_domain(&once).unwrap();
            assert_eq!(once, twice, "not idempotent for {}", input);
        }
    }

    #[test]
    fn test_exact_and_subdomain_match() {
        let origins = allowed();
        assert!(origins.is_allowed(Some("https://galaxykicklock.web.app"), None));
        assert!(origins.is_allowed(Some("https://example.com"), None));
        assert!(origins.is_allowed(Some("https://www.example.com"), None));
        assert!(origins.is_allowed(Some("https://a.b.example.com:8443"), None));
    }

    #[test]
    fn test_lookalikes_denied() {
        let origins = allowed();
        for origin in [
            "https://evil-example.com",
            "https://notexample.com",
            "https://example.com.attacker.com",
            "https://evil-galaxykicklock.web.app.attacker.com",
            "https://web.app",
            "https://example.co",
        ] {
            assert!(!origins.is_allowed(Some(origin), None), "{} allowed", origin);
        }
    }

    #[test]
    fn test_referer_fallback() {
        let origins = allowed();
        assert!(origins.is_allowed(None, Some("https://example.com/page?x=1")));
        assert!(origins.is_allowed(
            Some("https://attacker.com"),
            Some("https://example.com/page")
        ));
        assert!(!origins.is_allowed(None, Some("https://attacker.com/example.com")));
    }

    #[test]
    fn test_malformed_headers_denied() {
        let origins = allowed();
        assert!(!origins.is_allowed(Some("null"), None));
        assert!(!origins.is_allowed(Some("::::"), Some("not a url")));
    }

    #[test]
    fn test_missing_headers_policy() {
        assert!(!allowed().is_allowed(None, None));
        assert!(!allowed().is_allowed(Some(""), Some("  ")));
        assert!(allowed().allow_missing(true).is_allowed(None, None));

        // A present but disallowed header is never rescued by the knob
        assert!(!allowed()
            .allow_missing(true)
            .is_allowed(Some("https://attacker.com"), None));
    }

    #[test]
    fn test_empty_allow_list_denies_everything() {
        let origins = AllowedOrigins::new(Vec::<String>::new());
        assert!(origins.is_empty());
        assert!(!origins.is_allowed(Some("https://example.com"), None));
    }

    #[test]
    fn test_invalid_entries_skipped() {
        let origins = AllowedOrigins::new(["Example.COM.", "https://bad.com/x", ""]);
        assert_eq!(origins.len(), 1);
        assert!(origins.contains("example.com"));
    }
}
