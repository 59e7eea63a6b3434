//! Container engine capability and its Docker implementation
//!
//! The lifecycle manager only talks to [`ContainerEngine`]. [`DockerEngine`]
//! is the production backend: container operations go through the Docker API
//! (bollard) and image builds go through the docker CLI, which handles build
//! contexts and BuildKit for us.

use crate::error::CommandFailure;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Lines of build output kept for error reporting
const BUILD_OUTPUT_TAIL: usize = 40;

/// Seconds docker waits for a container to stop before killing it
const STOP_TIMEOUT_SECS: i64 = 10;

/// Bind mount of a host directory into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl VolumeMount {
    pub fn read_only(host_path: impl Into<PathBuf>, container_path: &str) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.to_string(),
            read_only: true,
        }
    }

    /// `host:container[:ro]` form used by both the CLI and the API
    pub fn to_bind(&self) -> String {
        let mut bind = format!("{}:{}", self.host_path.display(), self.container_path);
        if self.read_only {
            bind.push_str(":ro");
        }
        bind
    }
}

/// Everything needed to start a detached container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub volume: Option<VolumeMount>,
}

impl RunSpec {
    pub fn new(name: &str, image: &str, network: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            network: network.to_string(),
            volume: None,
        }
    }

    pub fn with_volume(mut self, volume: VolumeMount) -> Self {
        self.volume = Some(volume);
        self
    }
}

/// Container engine operations a deploy relies on
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Build `context/Dockerfile` and tag the result
    async fn build_image(&self, tag: &str, context: &Path) -> Result<(), CommandFailure>;

    /// Create and start a detached container, returning its id
    async fn run_container(&self, spec: &RunSpec) -> Result<String, CommandFailure>;

    /// Stop and remove a container by name. A missing container is not an
    /// error and other failures are only logged.
    async fn remove_container(&self, name: &str);

    /// Whether the named container is currently running
    async fn is_running(&self, name: &str) -> Result<bool, CommandFailure>;

    /// Whether a container with this name exists in any state
    async fn container_exists(&self, name: &str) -> bool;
}

/// Docker backend: API for containers, CLI for builds
pub struct DockerEngine {
    client: Docker,
    docker_cli: String,
}

impl DockerEngine {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Local socket defaults
    pub async fn connect(docker_host: Option<&str>, docker_cli: &str) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)?
        } else {
            Docker::connect_with_socket_defaults().map_err(|e| {
                anyhow::anyhow!(
                    "Cannot connect to Docker daemon: {}. \
                     Start dockerd or set DOCKER_HOST / deploy.docker_host.",
                    e
                )
            })?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            docker_cli: docker_cli.to_string(),
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    /// Pull an image unless it is already present locally
    async fn ensure_image(&self, image: &str) -> Result<(), CommandFailure> {
        if self.client.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        return Err(CommandFailure::new(format!("docker pull {}", image), error));
                    }
                    if let Some(status) = progress.status {
                        debug!(image, status, "Pull progress");
                    }
                }
                Err(e) => {
                    return Err(CommandFailure::new(format!("docker pull {}", image), e.to_string()));
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build_image(&self, tag: &str, context: &Path) -> Result<(), CommandFailure> {
        let command = format!("{} build -t {} {}", self.docker_cli, tag, context.display());
        info!(image = tag, context = %context.display(), "Building Docker image");

        let mut cmd = Command::new(&self.docker_cli);
        cmd.arg("build").arg("-t").arg(tag).arg(context);
        run_streaming(cmd, command).await?;

        info!(image = tag, "Docker build completed");
        Ok(())
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<String, CommandFailure> {
        let command = format!("docker run -d --name {} {}", spec.name, spec.image);

        self.ensure_image(&spec.image).await?;

        let host_config = HostConfig {
            network_mode: Some(spec.network.clone()),
            binds: spec.volume.as_ref().map(|v| vec![v.to_bind()]),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| CommandFailure::new(&command, e.to_string()))?;

        let container_id = response.id;
        debug!(container = %spec.name, container_id, image = %spec.image, "Created container");

        self.client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| CommandFailure::new(&command, e.to_string()))?;

        info!(container = %spec.name, container_id, network = %spec.network, "Started container");
        Ok(container_id)
    }

    async fn remove_container(&self, name: &str) {
        let options = StopContainerOptions { t: STOP_TIMEOUT_SECS };

        match self.client.stop_container(name, Some(options)).await {
            Ok(_) => debug!(container = name, "Stopped container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {}
            Err(e) => warn!(container = name, error = %e, "Failed to stop container"),
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(name, Some(options)).await {
            Ok(_) => debug!(container = name, "Removed container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => warn!(container = name, error = %e, "Failed to remove container"),
        }
    }

    async fn is_running(&self, name: &str) -> Result<bool, CommandFailure> {
        let info = self
            .client
            .inspect_container(name, None)
            .await
            .map_err(|e| CommandFailure::new(format!("docker inspect {}", name), e.to_string()))?;

        Ok(info.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn container_exists(&self, name: &str) -> bool {
        self.client.inspect_container(name, None).await.is_ok()
    }
}

/// Read one line, replacing invalid UTF-8. `Ok(None)` at end of stream.
///
/// Partial lines stay in `buf` if the future is dropped, so this is safe to
/// use as a `select!` branch.
async fn next_lossy_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let read = reader.read_until(b'\n', buf).await?;
    if read == 0 && buf.is_empty() {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&buf[..])
        .trim_end_matches(|c: char| c == '\n' || c == '\r')
        .to_string();
    buf.clear();
    Ok(Some(line))
}

/// Run `cmd` to completion, streaming both pipes into the log.
///
/// Both pipes are drained until end of stream so the child never blocks on a
/// full pipe. On failure the last [`BUILD_OUTPUT_TAIL`] lines are returned.
async fn run_streaming(mut cmd: Command, command: String) -> Result<(), CommandFailure> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| CommandFailure::new(&command, e.to_string()))?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(CommandFailure::new(&command, "output was not captured"));
    };

    let mut stdout_reader = BufReader::new(stdout);
    let mut stderr_reader = BufReader::new(stderr);
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut tail: VecDeque<String> = VecDeque::with_capacity(BUILD_OUTPUT_TAIL);

    while stdout_open || stderr_open {
        let line = tokio::select! {
            line = next_lossy_line(&mut stdout_reader, &mut stdout_buf), if stdout_open => match line {
                Ok(Some(line)) => Some(line),
                Ok(None) => { stdout_open = false; None }
                Err(e) => {
                    warn!(error = %e, "Failed to read build stdout");
                    stdout_open = false;
                    None
                }
            },
            line = next_lossy_line(&mut stderr_reader, &mut stderr_buf), if stderr_open => match line {
                Ok(Some(line)) => Some(line),
                Ok(None) => { stderr_open = false; None }
                Err(e) => {
                    warn!(error = %e, "Failed to read build stderr");
                    stderr_open = false;
                    None
                }
            },
        };

        if let Some(line) = line {
            info!(target: "docker", "{}", line);
            if tail.len() == BUILD_OUTPUT_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| CommandFailure::new(&command, e.to_string()))?;

    if status.success() {
        Ok(())
    } else {
        let output: Vec<String> = tail.into_iter().collect();
        Err(CommandFailure::new(
            command,
            format!("exit code {}\n{}", status.code().unwrap_or(-1), output.join("\n")),
        ))
    }
}
