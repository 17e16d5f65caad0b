use deploygate::config::Config;
use deploygate::control::{ControlServer, PKG_NAME, VERSION};
use deploygate::deploy::{DeploymentInvoker, DeploymentStore};
use deploygate::probe::{wait_for_upstream, TcpProbe};
use deploygate::proxy::{ProxyServer, ProxyState};
use deploygate::supervisor::{self, UpstreamSupervisor};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("deploygate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("deploygate.toml"));

    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        path = %config_path.display(),
        exists = config_path.exists(),
        "Configuration loaded"
    );
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Supervised upstream, if configured
    let supervisor_handle = match UpstreamSupervisor::from_config(&config.supervisor, shutdown_rx.clone())? {
        Some(supervisor) => Some(tokio::spawn(supervisor.run())),
        None => None,
    };

    // Wait for the upstream in the background; the proxy serves /status meanwhile
    let startup_probe = TcpProbe::new(
        config.upstream.host.clone(),
        config.upstream.port,
        config.upstream.probe_timeout(),
    );
    let max_wait = config.upstream.startup_wait();
    let interval = config.upstream.startup_check_interval();
    let startup_shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        wait_for_upstream(&startup_probe, max_wait, interval, startup_shutdown_rx).await;
    });

    // Proxy server
    let proxy_addr = bind_addr(&config.server.bind, config.server.port).map_err(|e| {
        error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid proxy bind address");
        e
    })?;

    let proxy_state = Arc::new(ProxyState::from_config(&config)?);
    let proxy = ProxyServer::new(proxy_addr, proxy_state, shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Control plane (if port > 0)
    let control_handle = if config.server.control_port > 0 {
        let control_addr = bind_addr(&config.server.control_bind, config.server.control_port)
            .map_err(|e| {
                error!(bind = %config.server.control_bind, port = config.server.control_port, error = %e, "Invalid control bind address");
                e
            })?;

        let invoker = Arc::new(DeploymentInvoker::new(
            config.deploy.clone(),
            Arc::new(DeploymentStore::new()),
        ));
        let control = ControlServer::new(control_addr, invoker, shutdown_rx.clone());

        Some(tokio::spawn(async move {
            if let Err(e) = control.run().await {
                error!(error = %e, "Control server error");
            }
        }))
    } else {
        info!("Control API disabled");
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // The supervisor may need the whole grace period to stop the upstream
    if let Some(handle) = supervisor_handle {
        let budget = config.supervisor.shutdown_grace_period() + Duration::from_secs(2);
        supervisor::join_with_timeout(handle, budget).await;
    }

    // Wait for servers to stop (with timeout)
    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        if let Some(handle) = control_handle {
            let _ = handle.await;
        }
    })
    .await;
    if stopped.is_err() {
        warn!("Servers did not stop within 5 seconds");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Listener address from a bare IPv4 or IPv6 address and a port
fn bind_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = bind
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", bind, e))?;
    Ok(SocketAddr::new(ip, port))
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, app = %config.app.name, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        control_bind = %config.server.control_bind,
        control_port = config.server.control_port,
        "Server configuration"
    );
    info!(
        host = %config.upstream.host,
        port = config.upstream.port,
        get_timeout_secs = config.upstream.get_timeout_secs,
        post_timeout_secs = config.upstream.post_timeout_secs,
        token = config.upstream.token.is_some(),
        "Upstream settings"
    );
    info!(
        allowed_origins = ?config.access.allowed_origins,
        allow_missing_origin = config.access.allow_missing_origin,
        rate_limit_enabled = config.rate_limit.enabled,
        rate_limit = config.rate_limit.count,
        window_secs = config.rate_limit.window_secs,
        "Access settings"
    );
    info!(
        cli = %config.deploy.cli,
        manifest = %config.deploy.manifest,
        supervised = config.supervisor.command.is_some(),
        "Deployment settings"
    );
}
