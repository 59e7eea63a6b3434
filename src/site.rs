//! Site identity and the naming rules derived from it
//!
//! A site name is the single key for everything a deploy touches: the
//! working directory, the canonical container, the transitional container,
//! the image tag and the hostname.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Suffix of the container that runs a new version while it is verified
pub const TRANSITIONAL_SUFFIX: &str = "-new";

/// Runtime category inferred from a working tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Static,
    Node,
    Go,
    Python,
}

impl Classification {
    /// Port the application listens on inside its container
    pub fn port(&self) -> u16 {
        match self {
            Classification::Node => 3000,
            Classification::Go => 8080,
            Classification::Python => 8000,
            Classification::Static => 80,
        }
    }

    /// Static sites are served straight from the working tree, no image build
    pub fn is_static(&self) -> bool {
        matches!(self, Classification::Static)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Static => "static",
            Classification::Node => "node",
            Classification::Go => "go",
            Classification::Python => "python",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Classification {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "static" => Ok(Classification::Static),
            "node" => Ok(Classification::Node),
            "go" => Ok(Classification::Go),
            "python" => Ok(Classification::Python),
            _ => anyhow::bail!("Unknown classification: {}", s),
        }
    }
}

/// A deployable unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    /// Site name (repository name)
    pub name: String,
    /// Remote URL the working tree is cloned from
    pub clone_url: String,
    /// Working directory holding the checked-out source
    pub work_dir: PathBuf,
}

impl Site {
    /// Build a site rooted under `deployments_dir`.
    ///
    /// The name must already have passed [`validate_site_name`].
    pub fn new(name: &str, clone_url: &str, deployments_dir: &Path) -> Self {
        Self {
            name: name.to_string(),
            clone_url: clone_url.to_string(),
            work_dir: deployments_dir.join(name),
        }
    }

    /// Name of the container serving production traffic
    pub fn canonical_container(&self) -> &str {
        &self.name
    }

    /// Name of the container used while verifying a new build
    pub fn transitional_container(&self) -> String {
        format!("{}{}", self.name, TRANSITIONAL_SUFFIX)
    }

    /// Image tag for this site. Every deploy overwrites the same tag.
    ///
    /// Image repositories must be lowercase, so `MyBlog` builds
    /// `{prefix}-myblog:latest`.
    pub fn image_tag(&self, prefix: &str) -> String {
        format!("{}-{}:latest", prefix, self.name).to_ascii_lowercase()
    }

    /// Public hostname under the base domain
    pub fn hostname(&self, domain: &str) -> String {
        format!("{}.{}", self.name, domain)
    }
}

/// Check that a name is usable as directory, container name and DNS label
pub fn validate_site_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_string());
    }
    if name.len() > 63 {
        return Err("name is longer than 63 characters".to_string());
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err("name must not start with '.' or '-'".to_string());
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(format!("character '{}' is not allowed", c));
    }
    Ok(())
}
