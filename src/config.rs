use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "DEPLOYGATE_";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration for the proxy and the control plane
    #[serde(default)]
    pub server: ServerConfig,

    /// Application identity
    #[serde(default)]
    pub app: AppConfig,

    /// The fixed upstream the proxy forwards to
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Origin/Referer allow-listing
    #[serde(default)]
    pub access: AccessConfig,

    /// Per-client sliding window rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// CORS header injection
    #[serde(default)]
    pub cors: CorsConfig,

    /// Deployment CLI settings
    #[serde(default)]
    pub deploy: DeployConfig,

    /// Optional supervised upstream process
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Proxy port (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Proxy bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Control plane port (default: 5000, set to 0 to disable)
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Control plane bind address (default: 127.0.0.1)
    #[serde(default = "default_control_bind")]
    pub control_bind: String,

    /// Maximum idle connections kept to the upstream (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Maximum accepted request body in bytes (default: 10 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Use the first X-Forwarded-For entry as the client identity
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            control_port: default_control_port(),
            control_bind: default_control_bind(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            max_body_bytes: default_max_body_bytes(),
            trust_forwarded_for: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Application name used for deployment identity and status output
    #[serde(default = "default_app_name")]
    pub name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Upstream host (default: 127.0.0.1)
    #[serde(default = "default_upstream_host")]
    pub host: String,

    /// Upstream port (default: 7860)
    #[serde(default = "default_upstream_port")]
    pub port: u16,

    /// TCP connect timeout for liveness probes in milliseconds (default: 1000)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Maximum time to wait for the upstream at startup (default: 60)
    #[serde(default = "default_startup_wait")]
    pub startup_wait_secs: u64,

    /// Interval between startup liveness checks (default: 2)
    #[serde(default = "default_startup_check_interval")]
    pub startup_check_interval_secs: u64,

    /// Timeout for GET and other non-POST requests (default: 30)
    #[serde(default = "default_get_timeout")]
    pub get_timeout_secs: u64,

    /// Timeout for POST requests (default: 60)
    #[serde(default = "default_post_timeout")]
    pub post_timeout_secs: u64,

    /// Maximum redirects followed per request (default: 10)
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Bearer token attached to forwarded requests
    pub token: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            port: default_upstream_port(),
            probe_timeout_ms: default_probe_timeout(),
            startup_wait_secs: default_startup_wait(),
            startup_check_interval_secs: default_startup_check_interval(),
            get_timeout_secs: default_get_timeout(),
            post_timeout_secs: default_post_timeout(),
            max_redirects: default_max_redirects(),
            token: None,
        }
    }
}

impl UpstreamConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn startup_wait(&self) -> Duration {
        Duration::from_secs(self.startup_wait_secs)
    }

    pub fn startup_check_interval(&self) -> Duration {
        Duration::from_secs(self.startup_check_interval_secs)
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_secs(self.get_timeout_secs)
    }

    pub fn post_timeout(&self) -> Duration {
        Duration::from_secs(self.post_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AccessConfig {
    /// Bare domains allowed to call the proxy; subdomains are included
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Allow requests that carry neither Origin nor Referer (default: false)
    #[serde(default)]
    pub allow_missing_origin: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    /// Enable rate limiting (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests allowed per client per window (default: 30)
    #[serde(default = "default_rate_limit_count")]
    pub count: usize,

    /// Window length in seconds (default: 60)
    #[serde(default = "default_rate_limit_window")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            count: default_rate_limit_count(),
            window_secs: default_rate_limit_window(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    /// Inject CORS headers on responses to allowed origins (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Value for Access-Control-Allow-Methods on preflight
    #[serde(default = "default_cors_methods")]
    pub allow_methods: String,

    /// Value for Access-Control-Allow-Headers on preflight.
    /// Empty means echo the Access-Control-Request-Headers of the preflight.
    #[serde(default)]
    pub allow_headers: String,

    /// Send Access-Control-Allow-Credentials: true (default: true)
    #[serde(default = "default_true")]
    pub allow_credentials: bool,

    /// Preflight cache lifetime in seconds (default: 600)
    #[serde(default = "default_cors_max_age")]
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_methods: default_cors_methods(),
            allow_headers: String::new(),
            allow_credentials: true,
            max_age_secs: default_cors_max_age(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeployConfig {
    /// Deployment CLI executable (default: modal)
    #[serde(default = "default_cli")]
    pub cli: String,

    /// Manifest passed to `<cli> deploy` (default: modal_container.py)
    #[serde(default = "default_manifest")]
    pub manifest: String,

    /// Environment variable the app name is injected through (default: MODAL_APP_NAME)
    #[serde(default = "default_app_name_env")]
    pub app_name_env: String,

    /// Program used to fetch sources (default: git)
    #[serde(default = "default_git_program")]
    pub git_program: String,

    /// Parent directory for scratch workspaces (default: system temp dir)
    pub scratch_dir: Option<String>,

    /// Upper bound on any single CLI invocation (default: 600)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Extra environment variables for every CLI invocation (e.g. tokens)
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            cli: default_cli(),
            manifest: default_manifest(),
            app_name_env: default_app_name_env(),
            git_program: default_git_program(),
            scratch_dir: None,
            command_timeout_secs: default_command_timeout(),
            env: HashMap::new(),
        }
    }
}

impl DeployConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Configuration for the supervised upstream process
///
/// # Security Warning
///
/// `command` is executed directly with the permissions of the gateway.
/// Configuration files must be protected accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Command line that starts the upstream (split with shell-words)
    pub command: Option<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Delay before restarting an exited upstream (default: 5)
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,

    /// Grace period between SIGTERM and SIGKILL on shutdown (default: 10)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: None,
            working_dir: None,
            env: HashMap::new(),
            restart_delay_secs: default_restart_delay(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl SupervisorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Split the configured command into program and arguments
    pub fn argv(&self) -> anyhow::Result<Option<Vec<String>>> {
        let Some(ref command) = self.command else {
            return Ok(None);
        };
        let argv = shell_words::split(command)
            .map_err(|e| anyhow::anyhow!("Invalid supervisor command '{}': {}", command, e))?;
        if argv.is_empty() {
            anyhow::bail!("Supervisor command is empty");
        }
        Ok(Some(argv))
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_listen_port() -> u16 {
    8000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_control_port() -> u16 {
    5000
}

fn default_control_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_app_name() -> String {
    "deploygate-app".to_string()
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_upstream_port() -> u16 {
    7860
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_startup_wait() -> u64 {
    60
}

fn default_startup_check_interval() -> u64 {
    2
}

fn default_get_timeout() -> u64 {
    30
}

fn default_post_timeout() -> u64 {
    60
}

fn default_max_redirects() -> usize {
    10
}

fn default_rate_limit_count() -> usize {
    30
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_cors_methods() -> String {
    "GET, POST, OPTIONS".to_string()
}

fn default_cors_max_age() -> u64 {
    600
}

fn default_cli() -> String {
    "modal".to_string()
}

fn default_manifest() -> String {
    "modal_container.py".to_string()
}

fn default_app_name_env() -> String {
    "MODAL_APP_NAME".to_string()
}

fn default_git_program() -> String {
    "git".to_string()
}

fn default_command_timeout() -> u64 {
    600
}

fn default_restart_delay() -> u64 {
    5
}

fn default_shutdown_grace_period() -> u64 {
    10
}

/// Check that an application name is safe to pass to the CLI and use as a key
pub fn is_valid_app_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DEPLOYGATE_*` overrides using the given variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("APP_NAME") {
            self.app.name = v;
        }
        if let Some(v) = var("UPSTREAM_HOST") {
            self.upstream.host = v;
        }
        if let Some(v) = var("UPSTREAM_PORT") {
            self.upstream.port = parse_env("UPSTREAM_PORT", &v)?;
        }
        if let Some(v) = var("UPSTREAM_TOKEN") {
            self.upstream.token = Some(v);
        }
        if let Some(v) = var("ALLOWED_ORIGINS") {
            self.access.allowed_origins = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = var("RATE_LIMIT_COUNT") {
            self.rate_limit.count = parse_env("RATE_LIMIT_COUNT", &v)?;
        }
        if let Some(v) = var("RATE_LIMIT_WINDOW_SECS") {
            self.rate_limit.window_secs = parse_env("RATE_LIMIT_WINDOW_SECS", &v)?;
        }
        if let Some(v) = var("PORT") {
            self.server.port = parse_env("PORT", &v)?;
        }
        if let Some(v) = var("CONTROL_PORT") {
            self.server.control_port = parse_env("CONTROL_PORT", &v)?;
        }
        if let Some(v) = var("CLI") {
            self.deploy.cli = v;
        }

        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !is_valid_app_name(&self.app.name) {
            errors.push(format!(
                "app.name '{}' must be 1-64 characters of [A-Za-z0-9_-]",
                self.app.name
            ));
        }

        if self.upstream.port == 0 {
            errors.push("upstream.port must be greater than 0".to_string());
        }
        if self.upstream.host.is_empty() {
            errors.push("upstream.host must not be empty".to_string());
        }
        if self.upstream.probe_timeout_ms == 0 {
            errors.push("upstream.probe_timeout_ms must be greater than 0".to_string());
        }
        if self.upstream.startup_check_interval_secs == 0 {
            errors.push("upstream.startup_check_interval_secs must be greater than 0".to_string());
        }
        if self.upstream.get_timeout_secs == 0 || self.upstream.post_timeout_secs == 0 {
            errors.push("upstream request timeouts must be greater than 0".to_string());
        }

        for origin in &self.access.allowed_origins {
            if crate::origin::normalize_domain(origin).is_none() {
                errors.push(format!(
                    "access.allowed_origins entry '{}' is not a bare domain",
                    origin
                ));
            }
        }

        if self.rate_limit.enabled && self.rate_limit.window_secs == 0 {
            errors.push("rate_limit.window_secs must be greater than 0".to_string());
        }

        if self.deploy.cli.is_empty() {
            errors.push("deploy.cli must not be empty".to_string());
        }
        if self.deploy.app_name_env.is_empty() {
            errors.push("deploy.app_name_env must not be empty".to_string());
        }

        if let Err(e) = self.supervisor.argv() {
            errors.push(e.to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{}{}: invalid value '{}'", ENV_PREFIX, name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.control_port, 5000);
        assert_eq!(config.server.control_bind, "127.0.0.1");
        assert_eq!(config.upstream.port, 7860);
        assert_eq!(config.upstream.probe_timeout(), Duration::from_secs(1));
        assert_eq!(config.upstream.startup_wait(), Duration::from_secs(60));
        assert_eq!(config.upstream.startup_check_interval(), Duration::from_secs(2));
        assert_eq!(config.upstream.get_timeout(), Duration::from_secs(30));
        assert_eq!(config.upstream.post_timeout(), Duration::from_secs(60));
        assert_eq!(config.rate_limit.count, 30);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
        assert!(config.access.allowed_origins.is_empty());
        assert!(!config.access.allow_missing_origin);
        assert_eq!(config.deploy.cli, "modal");
        assert_eq!(config.deploy.app_name_env, "MODAL_APP_NAME");
        assert_eq!(config.supervisor.restart_delay(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
control_port = 0
trust_forwarded_for = true

[app]
name = "galaxy"

[upstream]
port = 9000
get_timeout_secs = 5
token = "secret"

[access]
allowed_origins = ["example.com", "web.app"]
allow_missing_origin = true

[rate_limit]
count = 5
window_secs = 10

[deploy]
cli = "/usr/local/bin/modal"
manifest = "app.py"

[deploy.env]
MODAL_TOKEN_ID = "abc"

[supervisor]
command = "python3 /app/server.py --port 9000"
restart_delay_secs = 1
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.control_port, 0);
        assert!(config.server.trust_forwarded_for);
        assert_eq!(config.app.name, "galaxy");
        assert_eq!(config.upstream.port, 9000);
        assert_eq!(config.upstream.get_timeout(), Duration::from_secs(5));
        assert_eq!(config.upstream.post_timeout(), Duration::from_secs(60));
        assert_eq!(config.upstream.token.as_deref(), Some("secret"));
        assert_eq!(config.access.allowed_origins, vec!["example.com", "web.app"]);
        assert!(config.access.allow_missing_origin);
        assert_eq!(config.rate_limit.count, 5);
        assert_eq!(config.deploy.manifest, "app.py");
        assert_eq!(config.deploy.env.get("MODAL_TOKEN_ID"), Some(&"abc".to_string()));
        assert_eq!(
            config.supervisor.argv().unwrap(),
            Some(vec![
                "python3".to_string(),
                "/app/server.py".to_string(),
                "--port".to_string(),
                "9000".to_string()
            ])
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        let vars: HashMap<&str, &str> = [
            ("DEPLOYGATE_APP_NAME", "bharani"),
            ("DEPLOYGATE_UPSTREAM_PORT", "7861"),
            ("DEPLOYGATE_ALLOWED_ORIGINS", "example.com, web.app ,,"),
            ("DEPLOYGATE_RATE_LIMIT_COUNT", "100"),
            ("DEPLOYGATE_RATE_LIMIT_WINDOW_SECS", "30"),
        ]
        .into_iter()
        .collect();

        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.app.name, "bharani");
        assert_eq!(config.upstream.port, 7861);
        assert_eq!(config.access.allowed_origins, vec!["example.com", "web.app"]);
        assert_eq!(config.rate_limit.count, 100);
        assert_eq!(config.rate_limit.window_secs, 30);
    }

    #[test]
    fn test_env_override_invalid_number() {
        let mut config = Config::default();
        let result = config.apply_overrides(|k| {
            (k == "DEPLOYGATE_UPSTREAM_PORT").then(|| "not-a-port".to_string())
        });

        let err = result.unwrap_err().to_string();
        assert!(err.contains("DEPLOYGATE_UPSTREAM_PORT"), "{}", err);
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = Config::default();
        config.app.name = "bad name!".to_string();
        config.upstream.port = 0;
        config.access.allowed_origins = vec!["https://example.com/path".to_string()];
        config.rate_limit.window_secs = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("app.name"), "{}", err);
        assert!(err.contains("upstream.port"), "{}", err);
        assert!(err.contains("allowed_origins"), "{}", err);
        assert!(err.contains("window_secs"), "{}", err);
    }

    #[test]
    fn test_invalid_supervisor_command() {
        let mut config = Config::default();
        config.supervisor.command = Some("python3 'unterminated".to_string());
        assert!(config.validate().is_err());

        config.supervisor.command = Some("   ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_app_name_validation() {
        assert!(is_valid_app_name("galaxykick-app"));
        assert!(is_valid_app_name("user_01"));
        assert!(!is_valid_app_name(""));
        assert!(!is_valid_app_name("../etc"));
        assert!(!is_valid_app_name("a b"));
        assert!(!is_valid_app_name(&"x".repeat(65)));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploygate.toml");
        std::fs::write(&path, "[upstream]\nport = 7000\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.upstream.port, 7000);
    }
}
