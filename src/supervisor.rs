//! Supervised upstream process
//!
//! When `supervisor.command` is configured the gateway launches the upstream
//! itself and restarts it whenever it exits. The rest of the gateway learns
//! about it only through the liveness probe.

use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;

pub struct UpstreamSupervisor {
    argv: Vec<String>,
    config: SupervisorConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl UpstreamSupervisor {
    /// Build a supervisor if a command is configured
    pub fn from_config(
        config: &SupervisorConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Option<Self>> {
        Ok(config.argv()?.map(|argv| Self {
            argv,
            config: config.clone(),
            shutdown_rx,
        }))
    }

    /// Keep the upstream running until shutdown. Returns the number of launches.
    pub async fn run(mut self) -> u32 {
        let mut launches = 0u32;

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            match self.spawn() {
                Ok(mut child) => {
                    launches += 1;
                    let pid = child.id().unwrap_or(0);
                    info!(pid, launches, command = %self.argv.join(" "), "Upstream process started");

                    tokio::select! {
                        status = child.wait() => {
                            match status {
                                Ok(status) => warn!(pid, ?status, "Upstream process exited"),
                                Err(e) => error!(pid, error = %e, "Failed waiting for upstream process"),
                            }
                        }
                        changed = self.shutdown_rx.changed() => {
                            if changed.is_err() || *self.shutdown_rx.borrow() {
                                self.stop_child(&mut child).await;
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, command = %self.argv.join(" "), "Failed to start upstream process");
                }
            }

            let delay = self.config.restart_delay();
            debug!(delay_secs = delay.as_secs(), "Restarting upstream after delay");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(launches, "Upstream supervisor stopped");
        launches
    }

    fn spawn(&self) -> anyhow::Result<Child> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("Supervisor command is empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }
        Ok(child)
    }

    /// SIGTERM, then SIGKILL once the grace period runs out
    async fn stop_child(&self, child: &mut Child) {
        let grace_period = self.config.shutdown_grace_period();

        if let Some(pid) = child.id() {
            info!(pid, "Sending SIGTERM to upstream process");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => info!(?status, "Upstream process exited gracefully"),
            Ok(Err(e)) => warn!(error = %e, "Error waiting for upstream process to exit"),
            Err(_) => {
                warn!(
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }
}

async fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "deploygate::upstream", stream, "{}", line);
    }
}

/// Give a supervisor at most `timeout` to stop after shutdown was signalled
pub async fn join_with_timeout(handle: tokio::task::JoinHandle<u32>, timeout: Duration) {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(launches)) => debug!(launches, "Supervisor task finished"),
        Ok(Err(e)) => error!(error = %e, "Supervisor task panicked"),
        Err(_) => warn!("Supervisor did not stop in time"),
    }
}
