//! Error taxonomy for a single deployment
//!
//! Every failure a deploy can hit maps to one [`DeployError`] variant. The
//! variants are ordered by how far the deploy got before failing, which also
//! decides how much of the running state was touched.

use std::path::PathBuf;
use thiserror::Error;

/// Failure of an external command (git, docker) with its captured output
#[derive(Debug, Clone, Error)]
#[error("{command} failed: {output}")]
pub struct CommandFailure {
    /// Human-readable form of the command that failed
    pub command: String,
    /// Captured stdout/stderr, or the spawn/API error message
    pub output: String,
}

impl CommandFailure {
    pub fn new(command: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            output: output.into(),
        }
    }
}

/// Errors that abort (or degrade) a deployment
#[derive(Debug, Error)]
pub enum DeployError {
    /// Site name is unusable as a path, container name or hostname label
    #[error("invalid site name '{name}': {reason}")]
    InvalidSite { name: String, reason: String },

    /// Clone or pull of the working tree failed
    #[error("source sync failed for '{site}': {source}")]
    Source {
        site: String,
        #[source]
        source: CommandFailure,
    },

    /// Build descriptor could not be written or the image build failed.
    /// Running containers are untouched.
    #[error("image build failed for '{site}': {reason}")]
    Build { site: String, reason: String },

    /// The transitional container could not be started.
    /// Running containers are untouched.
    #[error("transitional container for '{site}' failed to start: {source}")]
    Stage {
        site: String,
        #[source]
        source: CommandFailure,
    },

    /// The transitional container was not running after the settle delay.
    /// It has been removed and the canonical container is unchanged.
    #[error("health check failed for '{site}': {reason}")]
    HealthCheck { site: String, reason: String },

    /// The canonical container could not be started after the previous one
    /// was removed. Nothing is serving the site until an operator intervenes.
    #[error("canonical container for '{site}' failed to start after the previous one was removed: {source}")]
    FatalSwap {
        site: String,
        #[source]
        source: CommandFailure,
    },

    /// Reading or appending the site registry failed
    #[error("site registry I/O failed at {path:?}: {source}")]
    RegistryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing the proxy config or reloading the proxy failed
    #[error("proxy reload failed: {reason}")]
    Reload { reason: String },
}

impl DeployError {
    /// Short machine-readable name of the failure kind
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::InvalidSite { .. } => "invalid_site",
            DeployError::Source { .. } => "source",
            DeployError::Build { .. } => "build",
            DeployError::Stage { .. } => "stage",
            DeployError::HealthCheck { .. } => "health_check",
            DeployError::FatalSwap { .. } => "fatal_swap",
            DeployError::RegistryIo { .. } => "registry_io",
            DeployError::Reload { .. } => "reload",
        }
    }

    /// Whether the site may have been left without a serving container
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeployError::FatalSwap { .. })
    }

    /// Whether the previously serving container is known to be untouched
    pub fn preserved_running_state(&self) -> bool {
        matches!(
            self,
            DeployError::InvalidSite { .. }
                | DeployError::Source { .. }
                | DeployError::Build { .. }
                | DeployError::Stage { .. }
                | DeployError::HealthCheck { .. }
        )
    }
}

pub type DeployResult<T> = Result<T, DeployError>;
