//! Persistent site registry
//!
//! The registry is an append-only, YAML-shaped text file mapping hostnames to
//! the container and port that serve them:
//!
//! ```text
//! sites:
//!
//!   blog.example.com:
//!     container: blog
//!     port: 80
//!     type: static
//! ```
//!
//! Records are only ever appended. A hostname that already appears anywhere
//! in the file is never written again, even if its container or port changed.

use crate::error::{DeployError, DeployResult};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Root key written to a fresh registry
pub const REGISTRY_HEADER: &str = "sites:\n";

/// Indentation of a record header line
const RECORD_INDENT: usize = 2;

/// One hostname routing record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryRecord {
    pub hostname: String,
    pub container: String,
    /// Kept as text, the registry does not type-check ports
    pub port: String,
    pub classification: Option<String>,
}

impl RegistryRecord {
    pub fn new(hostname: &str, container: &str, port: impl ToString, classification: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            container: container.to_string(),
            port: port.to_string(),
            classification: Some(classification.to_string()),
        }
    }

    /// Whether the record carries everything needed to route to it
    pub fn is_complete(&self) -> bool {
        !self.hostname.is_empty() && !self.container.is_empty() && !self.port.is_empty()
    }

    /// Text appended to the registry for this record
    pub fn to_entry(&self) -> String {
        format!(
            "\n  {}:\n    container: {}\n    port: {}\n    type: {}\n",
            self.hostname,
            self.container,
            self.port,
            self.classification.as_deref().unwrap_or_default()
        )
    }
}

/// Parse registry text into records, in file order.
///
/// A line indented by exactly two spaces whose text ends in `:` opens a
/// record. Deeper `container:`, `port:` and `type:` lines fill it in. Other
/// lines are ignored. Records missing a container or port are kept here and
/// filtered by callers that need complete ones.
pub fn parse_records(text: &str) -> Vec<RegistryRecord> {
    let mut records = Vec::new();
    let mut current: Option<RegistryRecord> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = line.len() - line.trim_start().len();

        if indent == RECORD_INDENT && trimmed.ends_with(':') {
            if let Some(record) = current.take() {
                records.push(record);
            }
            current = Some(RegistryRecord {
                hostname: trimmed.trim_end_matches(':').trim().to_string(),
                ..Default::default()
            });
            continue;
        }

        if indent <= RECORD_INDENT {
            continue;
        }

        let Some(record) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "container" => record.container = value,
            "port" => record.port = value,
            "type" => record.classification = Some(value),
            _ => {}
        }
    }

    if let Some(record) = current {
        records.push(record);
    }
    records
}

/// Result of [`SiteRegistry::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// The hostname was already present, nothing was written
    Unchanged,
}

/// File-backed registry with a single writer
pub struct SiteRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SiteRegistry {
    /// Open the registry at `path`, creating it with a `sites:` header if
    /// it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> DeployResult<Self> {
        let path = path.into();
        let io_err = |source| DeployError::RegistryIo {
            path: path.clone(),
            source,
        };

        if !tokio::fs::try_exists(&path).await.map_err(io_err)? {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
            tokio::fs::write(&path, REGISTRY_HEADER).await.map_err(io_err)?;
            info!(path = %path.display(), "Created site registry");
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current persisted text
    pub async fn read_text(&self) -> DeployResult<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| DeployError::RegistryIo {
                path: self.path.clone(),
                source,
            })
    }

    pub async fn records(&self) -> DeployResult<Vec<RegistryRecord>> {
        Ok(parse_records(&self.read_text().await?))
    }

    /// Append `record` unless its hostname already occurs in the registry.
    ///
    /// The check is a plain substring match over the whole file, so a new
    /// hostname that is contained in an existing one (`a.example.com` inside
    /// `data.example.com`) is treated as present.
    pub async fn upsert(&self, record: &RegistryRecord) -> DeployResult<UpsertOutcome> {
        let _guard = self.write_lock.lock().await;

        let text = self.read_text().await?;
        if text.contains(&record.hostname) {
            debug!(hostname = %record.hostname, "Hostname already registered");
            return Ok(UpsertOutcome::Unchanged);
        }

        let io_err = |source| DeployError::RegistryIo {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(record.to_entry().as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;

        info!(
            hostname = %record.hostname,
            container = %record.container,
            port = %record.port,
            "Registered site"
        );
        Ok(UpsertOutcome::Inserted)
    }
}
