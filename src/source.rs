//! Source synchronization
//!
//! Clones a site's repository on first deploy and pulls it in place
//! afterwards. Git is reached through the [`SourceControl`] capability so the
//! deploy flow can run against a fake in tests.

use crate::error::{CommandFailure, DeployError, DeployResult};
use crate::site::Site;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tracing::info;

/// Source-control operations a deploy relies on
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Clone `url` into `dest`, which must not exist yet
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), CommandFailure>;

    /// Fast-forward the working tree at `dir` to the remote's latest state
    async fn pull(&self, dir: &Path) -> Result<(), CommandFailure>;
}

/// Git backend driving the `git` CLI
pub struct GitCli {
    program: String,
}

impl GitCli {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    async fn run(&self, cmd: &mut Command, display: String) -> Result<(), CommandFailure> {
        let output = cmd
            .output()
            .await
            .map_err(|e| CommandFailure::new(&display, e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }

        let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
        captured.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(CommandFailure::new(display, captured.trim().to_string()))
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), CommandFailure> {
        let display = format!("{} clone {} {}", self.program, url, dest.display());
        let mut cmd = Command::new(&self.program);
        cmd.arg("clone").arg(url).arg(dest);
        self.run(&mut cmd, display).await
    }

    async fn pull(&self, dir: &Path) -> Result<(), CommandFailure> {
        let display = format!("{} -C {} pull", self.program, dir.display());
        let mut cmd = Command::new(&self.program);
        cmd.arg("-C").arg(dir).arg("pull");
        self.run(&mut cmd, display).await
    }
}

/// How the working tree was brought up to date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Cloned,
    Pulled,
}

/// Brings a site's working tree up to date with its remote
pub struct SourceSynchronizer {
    vcs: Arc<dyn SourceControl>,
}

impl SourceSynchronizer {
    pub fn new(vcs: Arc<dyn SourceControl>) -> Self {
        Self { vcs }
    }

    /// Clone when the working tree is missing, pull otherwise.
    ///
    /// A failed clone may leave a partial directory behind; the next attempt
    /// will then try to pull it.
    pub async fn sync(&self, site: &Site) -> DeployResult<SyncOutcome> {
        let exists = tokio::fs::try_exists(&site.work_dir).await.unwrap_or(false);

        if exists {
            info!(site = %site.name, path = %site.work_dir.display(), "Pulling latest changes");
            self.vcs
                .pull(&site.work_dir)
                .await
                .map_err(|source| DeployError::Source {
                    site: site.name.clone(),
                    source,
                })?;
            return Ok(SyncOutcome::Pulled);
        }

        if let Some(parent) = site.work_dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DeployError::Source {
                    site: site.name.clone(),
                    source: CommandFailure::new(
                        format!("mkdir -p {}", parent.display()),
                        e.to_string(),
                    ),
                })?;
        }

        info!(site = %site.name, url = %site.clone_url, "Cloning repository");
        self.vcs
            .clone_repo(&site.clone_url, &site.work_dir)
            .await
            .map_err(|source| DeployError::Source {
                site: site.name.clone(),
                source,
            })?;

        Ok(SyncOutcome::Cloned)
    }
}
