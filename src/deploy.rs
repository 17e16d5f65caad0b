//! Deployment invoker
//!
//! Drives the external deployment CLI:
//!
//! - `deploy`: clone the source into a scratch workspace and run
//!   `<cli> deploy <manifest>` there with the app name in the environment
//! - `undeploy`: `<cli> app stop <name>`
//! - `get_status`: the last recorded result, or `<cli> app show <name>`
//!
//! None of these return errors. Every failure ends up in the returned
//! [`DeploymentRecord`], which is also kept in the [`DeploymentStore`].

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::Arc;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::DeployConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    InProgress,
    Deployed,
    Failed,
    Undeployed,
    UndeployFailed,
    Error,
}

impl DeploymentStatus {
    /// Whether the operation that produced this status succeeded
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::InProgress | DeploymentStatus::Deployed | DeploymentStatus::Undeployed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Deploy,
    Undeploy,
    Status,
}

/// Outcome of the latest operation for one application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub app_name: String,
    pub operation: Operation,
    pub status: DeploymentStatus,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// RFC 3339
    pub timestamp: String,
}

impl DeploymentRecord {
    pub fn new(
        app_name: &str,
        operation: Operation,
        status: DeploymentStatus,
        details: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.to_string(),
            operation,
            status,
            details: details.into(),
            stdout: None,
            stderr: None,
            exit_code: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    fn with_output(mut self, output: &Output) -> Self {
        self.stdout = Some(String::from_utf8_lossy(&output.stdout).into_owned());
        self.stderr = Some(String::from_utf8_lossy(&output.stderr).into_owned());
        self.exit_code = output.status.code();
        self
    }
}

/// Process-lifetime store of deployment records, keyed by app name
#[derive(Debug, Default)]
pub struct DeploymentStore {
    records: RwLock<HashMap<String, DeploymentRecord>>,
}

impl DeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, app_name: &str) -> Option<DeploymentRecord> {
        self.records.read().get(app_name).cloned()
    }

    /// Insert or overwrite the record for its app
    pub fn put(&self, record: DeploymentRecord) {
        self.records.write().insert(record.app_name.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' did not finish within {secs} seconds")]
    Timeout { program: String, secs: u64 },

    #[error("failed to create scratch workspace: {0}")]
    Workspace(#[source] std::io::Error),
}

pub struct DeploymentInvoker {
    config: DeployConfig,
    store: Arc<DeploymentStore>,
}

impl DeploymentInvoker {
    pub fn new(config: DeployConfig, store: Arc<DeploymentStore>) -> Self {
        Self { config, store }
    }

    pub fn store(&self) -> &Arc<DeploymentStore> {
        &self.store
    }

    /// Clone `source_location` and deploy it under `app_name`
    pub async fn deploy(&self, source_location: &str, app_name: &str) -> DeploymentRecord {
        info!(app = app_name, source = source_location, "Starting deployment");
        self.store.put(DeploymentRecord::new(
            app_name,
            Operation::Deploy,
            DeploymentStatus::InProgress,
            format!("Deploying {}", source_location),
        ));
        let mut pending = PendingDeploy {
            store: &self.store,
            app_name,
            finished: false,
        };

        let record = match self.create_workspace() {
            Ok(workspace) => {
                let record = self.deploy_in(&workspace, source_location, app_name).await;
                let path = workspace.path().to_path_buf();
                if let Err(e) = workspace.close() {
                    warn!(path = %path.display(), error = %e, "Failed to remove scratch workspace");
                }
                record
            }
            Err(e) => {
                error!(app = app_name, error = %e, "Deployment aborted");
                DeploymentRecord::new(app_name, Operation::Deploy, DeploymentStatus::Error, e.to_string())
            }
        };

        pending.finished = true;
        self.store.put(record.clone());
        record
    }

    async fn deploy_in(&self, workspace: &TempDir, source_location: &str, app_name: &str) -> DeploymentRecord {
        let checkout = workspace.path().join("source");

        let clone = self
            .run(
                &self.config.git_program,
                &["clone", "--depth", "1", "--", source_location, &path_arg(&checkout)],
                workspace.path(),
                app_name,
            )
            .await;

        match clone {
            Ok(output) if output.status.success() => {
                debug!(app = app_name, path = %checkout.display(), "Source cloned");
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                warn!(app = app_name, exit_code = ?output.status.code(), "Clone failed");
                return DeploymentRecord::new(
                    app_name,
                    Operation::Deploy,
                    DeploymentStatus::Error,
                    format!("Failed to clone {}: {}", source_location, stderr),
                )
                .with_output(&output);
            }
            Err(e) => {
                error!(app = app_name, error = %e, "Clone could not run");
                return DeploymentRecord::new(app_name, Operation::Deploy, DeploymentStatus::Error, e.to_string());
            }
        }

        let deploy = self
            .run(
                &self.config.cli,
                &["deploy", &self.config.manifest],
                &checkout,
                app_name,
            )
            .await;

        match deploy {
            Ok(output) if output.status.success() => {
                info!(app = app_name, "Deployment succeeded");
                DeploymentRecord::new(
                    app_name,
                    Operation::Deploy,
                    DeploymentStatus::Deployed,
                    "Deployment completed successfully",
                )
                .with_output(&output)
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                warn!(app = app_name, exit_code = ?output.status.code(), "Deployment failed");
                DeploymentRecord::new(app_name, Operation::Deploy, DeploymentStatus::Failed, stderr)
                    .with_output(&output)
            }
            Err(e) => {
                error!(app = app_name, error = %e, "Deployment CLI could not run");
                DeploymentRecord::new(app_name, Operation::Deploy, DeploymentStatus::Error, e.to_string())
            }
        }
    }

    /// Stop a deployed application
    pub async fn undeploy(&self, app_name: &str) -> DeploymentRecord {
        info!(app = app_name, "Stopping application");

        let cwd = std::env::temp_dir();
        let record = match self.run(&self.config.cli, &["app", "stop", app_name], &cwd, app_name).await {
            Ok(output) if output.status.success() => DeploymentRecord::new(
                app_name,
                Operation::Undeploy,
                DeploymentStatus::Undeployed,
                "Application stopped",
            )
            .with_output(&output),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                warn!(app = app_name, exit_code = ?output.status.code(), "Undeploy failed");
                DeploymentRecord::new(app_name, Operation::Undeploy, DeploymentStatus::UndeployFailed, stderr)
                    .with_output(&output)
            }
            Err(e) => {
                error!(app = app_name, error = %e, "Undeploy CLI could not run");
                DeploymentRecord::new(app_name, Operation::Undeploy, DeploymentStatus::Error, e.to_string())
            }
        };

        self.store.put(record.clone());
        record
    }

    /// The last recorded result, or a fresh answer from the CLI
    ///
    /// CLI answers are not cached; the CLI stays authoritative for apps this
    /// process has not touched.
    pub async fn get_status(&self, app_name: &str) -> DeploymentRecord {
        if let Some(record) = self.store.get(app_name) {
            debug!(app = app_name, status = ?record.status, "Returning recorded status");
            return record;
        }

        let cwd = std::env::temp_dir();
        match self.run(&self.config.cli, &["app", "show", app_name], &cwd, app_name).await {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                DeploymentRecord::new(app_name, Operation::Status, DeploymentStatus::Deployed, stdout)
                    .with_output(&output)
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                DeploymentRecord::new(app_name, Operation::Status, DeploymentStatus::Undeployed, stderr)
                    .with_output(&output)
            }
            Err(e) => {
                error!(app = app_name, error = %e, "Status CLI could not run");
                DeploymentRecord::new(app_name, Operation::Status, DeploymentStatus::Error, e.to_string())
            }
        }
    }

    fn create_workspace(&self) -> Result<TempDir, InvokeError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("deploygate-");

        let workspace = match self.config.scratch_dir {
            Some(ref root) => {
                std::fs::create_dir_all(root).map_err(InvokeError::Workspace)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(InvokeError::Workspace)?;

        debug!(path = %workspace.path().display(), "Created scratch workspace");
        Ok(workspace)
    }

    /// Run one CLI invocation with the app name injected and a hard timeout
    async fn run(&self, program: &str, args: &[&str], cwd: &Path, app_name: &str) -> Result<Output, InvokeError> {
        debug!(program, ?args, cwd = %cwd.display(), "Running command");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        cmd.env(&self.config.app_name_env, app_name);

        let timeout = self.config.command_timeout();
        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                debug!(program, exit_code = ?output.status.code(), "Command finished");
                Ok(output)
            }
            Ok(Err(source)) => Err(InvokeError::Spawn {
                program: program.to_string(),
                source,
            }),
            Err(_) => Err(InvokeError::Timeout {
                program: program.to_string(),
                secs: timeout.as_secs(),
            }),
        }
    }
}

/// Replaces the `in_progress` record if a deploy is dropped before it finishes
struct PendingDeploy<'a> {
    store: &'a DeploymentStore,
    app_name: &'a str,
    finished: bool,
}

impl Drop for PendingDeploy<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(app = self.app_name, "Deployment cancelled before completion");
            self.store.put(DeploymentRecord::new(
                self.app_name,
                Operation::Deploy,
                DeploymentStatus::Error,
                "Deployment was cancelled before it completed",
            ));
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
