use crate::caddyfile::DEFAULT_ACCESS_LOG;
use crate::reload::DEFAULT_RELOAD_COMMAND;
use anyhow::Context;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `deploy.domain`
pub const DOMAIN_ENV: &str = "DOMAIN";

/// Global configuration for the deploy service
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Webhook server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Build and container settings
    #[serde(default)]
    pub deploy: DeployConfig,

    /// Site registry and reverse proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Webhook port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Shared secret for `X-Hub-Signature-256` verification.
    /// Unsigned requests are accepted when unset.
    pub webhook_secret: Option<String>,

    /// Branches whose pushes trigger a deploy (default: main, master)
    #[serde(default = "default_deploy_branches")]
    pub deploy_branches: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            webhook_secret: None,
            deploy_branches: default_deploy_branches(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", self.bind))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeployConfig {
    /// Directory holding one working tree per site
    #[serde(default = "default_deployments_dir")]
    pub deployments_dir: PathBuf,

    /// Same directory as seen by the Docker host, for static site mounts
    /// when this service runs in a container
    pub host_deployments_dir: Option<PathBuf>,

    /// Docker network shared with the reverse proxy
    #[serde(default = "default_network")]
    pub network: String,

    /// Base domain; sites are served at `{site}.{domain}`
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Prefix of built image tags
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,

    /// Image serving static sites
    #[serde(default = "default_static_image")]
    pub static_image: String,

    /// Wait before checking a freshly started container (default: 2000)
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Docker daemon address (unix:// or tcp://). Falls back to DOCKER_HOST
    /// and then the local socket.
    pub docker_host: Option<String>,

    /// docker CLI used for image builds
    #[serde(default = "default_docker_cli")]
    pub docker_cli: String,

    /// git CLI used for clone and pull
    #[serde(default = "default_git_cli")]
    pub git_cli: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            deployments_dir: default_deployments_dir(),
            host_deployments_dir: None,
            network: default_network(),
            domain: default_domain(),
            image_prefix: default_image_prefix(),
            static_image: default_static_image(),
            settle_delay_ms: default_settle_delay(),
            docker_host: None,
            docker_cli: default_docker_cli(),
            git_cli: default_git_cli(),
        }
    }
}

impl DeployConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Append-only site registry
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,

    /// Where the generated Caddyfile is written
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Command reloading the proxy, split with shell quoting rules
    #[serde(default = "default_reload_command")]
    pub reload_command: String,

    /// Access log path written into the generated config
    #[serde(default = "default_access_log")]
    pub access_log: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            registry_path: default_registry_path(),
            config_path: default_config_path(),
            reload_command: default_reload_command(),
            access_log: default_access_log(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_deploy_branches() -> Vec<String> {
    vec!["main".to_string(), "master".to_string()]
}

fn default_deployments_dir() -> PathBuf {
    PathBuf::from("/deployments")
}

fn default_network() -> String {
    "vibe-deploy_web".to_string()
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_image_prefix() -> String {
    "vibe-deploy".to_string()
}

fn default_static_image() -> String {
    "nginx:alpine".to_string()
}

fn default_settle_delay() -> u64 {
    2000
}

fn default_docker_cli() -> String {
    "docker".to_string()
}

fn default_git_cli() -> String {
    "git".to_string()
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("/app/sites.yaml")
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/app/Caddyfile")
}

fn default_reload_command() -> String {
    DEFAULT_RELOAD_COMMAND.to_string()
}

fn default_access_log() -> String {
    DEFAULT_ACCESS_LOG.to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or use defaults when it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Apply environment overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(domain) = lookup(DOMAIN_ENV).filter(|d| !d.trim().is_empty()) {
            self.deploy.domain = domain.trim().to_string();
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.socket_addr() {
            errors.push(e.to_string());
        }
        if self.server.deploy_branches.is_empty() {
            errors.push("server.deploy_branches must not be empty".to_string());
        }
        if matches!(&self.server.webhook_secret, Some(s) if s.is_empty()) {
            errors.push("server.webhook_secret must not be empty when set".to_string());
        }

        let domain = self.deploy.domain.trim();
        if domain.is_empty() {
            errors.push("deploy.domain must not be empty".to_string());
        } else if domain.contains(char::is_whitespace) || domain.contains('/') {
            errors.push(format!("deploy.domain '{}' is not a valid domain", domain));
        }
        if self.deploy.network.is_empty() {
            errors.push("deploy.network must not be empty".to_string());
        }
        if self.deploy.image_prefix.is_empty() {
            errors.push("deploy.image_prefix must not be empty".to_string());
        }
        if self.deploy.deployments_dir.as_os_str().is_empty() {
            errors.push("deploy.deployments_dir must not be empty".to_string());
        }

        match shell_words::split(&self.proxy.reload_command) {
            Ok(argv) if argv.is_empty() => {
                errors.push("proxy.reload_command must not be empty".to_string())
            }
            Ok(_) => {}
            Err(e) => errors.push(format!("proxy.reload_command is malformed: {}", e)),
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
