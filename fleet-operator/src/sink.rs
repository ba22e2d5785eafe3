//! The configuration sink of a unit: the configuration file and the daemon consuming it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;

use crate::config::Config;
use crate::relations::write_atomic;
use fleet_core::apply::DaemonAction;
use fleet_core::composer::ClusterConfigDocument;

const SERVICE_PLACEHOLDER: &str = "{service}";
/// The time limit of daemon commands unless configured otherwise.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

const METRIC_DOCUMENTS_WRITTEN: &str = "fleet_sink_documents_written";
const METRIC_DAEMON_ACTIONS: &str = "fleet_sink_daemon_actions";
const METRIC_DAEMON_ACTION_FAILURES: &str = "fleet_sink_daemon_action_failures";

/// Writes configuration documents to disk and drives the local daemon.
#[derive(Clone, Debug)]
pub struct CommandSink {
    config_path: PathBuf,
    service: String,
    reload_command: String,
    restart_command: String,
    command_timeout: Duration,
}

impl CommandSink {
    /// Create a new instance.
    pub fn new(config_path: impl Into<PathBuf>, service: impl Into<String>, reload_command: impl Into<String>, restart_command: impl Into<String>) -> Self {
        metrics::register_counter!(METRIC_DOCUMENTS_WRITTEN, metrics::Unit::Count, "configuration documents written to disk");
        metrics::register_counter!(METRIC_DAEMON_ACTIONS, metrics::Unit::Count, "daemon reloads and restarts performed");
        metrics::register_counter!(METRIC_DAEMON_ACTION_FAILURES, metrics::Unit::Count, "daemon reloads and restarts which failed");
        Self {
            config_path: config_path.into(),
            service: service.into(),
            reload_command: reload_command.into(),
            restart_command: restart_command.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Set the time limit of daemon commands.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Create a new instance from the given config.
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.config_path, config.service(), &config.reload_command, &config.restart_command).with_command_timeout(config.command_timeout())
    }

    /// The document body currently on disk, if any.
    pub async fn current(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.config_path).await {
            Ok(body) => Ok(Some(body)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("error reading {}", self.config_path.display())),
        }
    }

    /// Write the given document body. Returns `false` if the file already held the same body.
    pub async fn write(&self, body: &str) -> Result<bool> {
        if self.current().await?.as_deref() == Some(body) {
            return Ok(false);
        }
        if let Some(parent) = self.config_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("error creating configuration directory {}", parent.display()))?;
        }
        write_atomic(&self.config_path, body.as_bytes()).await?;
        metrics::increment_counter!(METRIC_DOCUMENTS_WRITTEN);
        Ok(true)
    }

    /// Reload or restart the daemon.
    #[tracing::instrument(level = "debug", skip(self), fields(service = %self.service))]
    pub async fn perform(&self, action: DaemonAction) -> Result<()> {
        let template = match action {
            DaemonAction::Reload => &self.reload_command,
            DaemonAction::Restart => &self.restart_command,
        };
        let rendered = template.replace(SERVICE_PLACEHOLDER, &self.service);
        metrics::increment_counter!(METRIC_DAEMON_ACTIONS, "action" => action.to_string());
        if let Err(err) = run_command(&rendered, self.command_timeout).await {
            metrics::increment_counter!(METRIC_DAEMON_ACTION_FAILURES, "action" => action.to_string());
            return Err(err.context(format!("error performing {} of {}", action, self.service)));
        }
        tracing::info!(%action, "daemon action performed");
        Ok(())
    }

    /// Write the given document and perform the given daemon action.
    ///
    /// The action is performed even when the document on disk was already current, as an earlier
    /// attempt may have written it but failed to act on it.
    pub async fn apply(&self, document: &ClusterConfigDocument, action: Option<DaemonAction>) -> Result<()> {
        let written = self.write(document.body()).await?;
        tracing::debug!(generation = document.generation(), written, "configuration document stored");
        if let Some(action) = action {
            self.perform(action).await?;
        }
        Ok(())
    }
}

/// Run the given whitespace separated command line, returning its stdout.
///
/// The command is killed if it has not exited within the given timeout.
pub async fn run_command(command_line: &str, timeout: Duration) -> Result<String> {
    let mut parts = command_line.split_whitespace();
    let program = match parts.next() {
        Some(program) => program,
        None => bail!("empty command"),
    };
    let mut command = Command::new(program);
    command.args(parts).kill_on_drop(true);
    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(output) => output.with_context(|| format!("error spawning command {:?}", command_line))?,
        Err(_) => bail!("command {:?} timed out after {:?}", command_line, timeout),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("command {:?} failed with {}: {}", command_line, output.status, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
