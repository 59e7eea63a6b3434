//! Writing the proxy configuration and reloading the proxy in place

use crate::error::{DeployError, DeployResult};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Reload command for the bundled Caddy container
pub const DEFAULT_RELOAD_COMMAND: &str =
    "docker exec caddy caddy reload --config /etc/caddy/Caddyfile --adapter caddyfile";

/// Applies a synthesized configuration to the running proxy
#[derive(Debug, Clone)]
pub struct ProxyReloader {
    config_path: PathBuf,
    command: Vec<String>,
}

impl ProxyReloader {
    /// `command` is split with shell quoting rules and must not be empty
    pub fn new(config_path: impl Into<PathBuf>, command: &str) -> anyhow::Result<Self> {
        let command = shell_words::split(command)
            .map_err(|e| anyhow::anyhow!("Invalid reload command '{}': {}", command, e))?;
        if command.is_empty() {
            anyhow::bail!("Reload command is empty");
        }

        Ok(Self {
            config_path: config_path.into(),
            command,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Write `config` to the config path and run the reload command.
    ///
    /// The file is replaced whole on every call.
    pub async fn apply(&self, config: &str) -> DeployResult<()> {
        tokio::fs::write(&self.config_path, config)
            .await
            .map_err(|e| DeployError::Reload {
                reason: format!("failed to write {}: {}", self.config_path.display(), e),
            })?;
        debug!(path = %self.config_path.display(), bytes = config.len(), "Wrote proxy config");

        let display = self.command.join(" ");
        let output = Command::new(&self.command[0])
            .args(&self.command[1..])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DeployError::Reload {
                reason: format!("failed to run '{}': {}", display, e),
            })?;

        if !output.status.success() {
            let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
            captured.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(DeployError::Reload {
                reason: format!(
                    "'{}' exited with {}: {}",
                    display,
                    output.status.code().unwrap_or(-1),
                    captured.trim()
                ),
            });
        }

        info!("Proxy reloaded");
        Ok(())
    }
}
