use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use vibedeploy::config::Config;
use vibedeploy::deployer::Deployer;
use vibedeploy::docker::DockerEngine;
use vibedeploy::server::{WebhookServer, WebhookState, PKG_NAME, VERSION};
use vibedeploy::source::GitCli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vibedeploy=debug".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let mut config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    config.apply_env_overrides();
    config.validate()?;

    if config_path.exists() {
        info!(path = %config_path.display(), "Configuration loaded");
    } else {
        info!(path = %config_path.display(), "No configuration file, using defaults");
    }

    print_startup_banner(&config);

    let engine = DockerEngine::connect(config.deploy.docker_host.as_deref(), &config.deploy.docker_cli).await?;
    let vcs = GitCli::new(&config.deploy.git_cli);
    let deployer = Deployer::from_config(&config, Arc::new(engine), Arc::new(vcs)).await?;
    info!(path = %deployer.registry().path().display(), "Site registry ready");

    if config.server.webhook_secret.is_none() {
        warn!("No webhook secret configured, accepting unsigned webhooks");
    }

    let state = Arc::new(WebhookState {
        deployer: Arc::new(deployer),
        secret: config.server.webhook_secret.clone(),
        deploy_branches: config.server.deploy_branches.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = WebhookServer::new(config.server.socket_addr()?, state, shutdown_rx);
    let mut server_handle = tokio::spawn(server.run());

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            result = &mut server_handle => {
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(e.into()),
                };
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
            }
            result = &mut server_handle => {
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(e.into()),
                };
            }
        }
    }

    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(Duration::from_secs(5), server_handle).await.is_err() {
        warn!("Webhook server did not stop within 5s");
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!("{} v{}", PKG_NAME, VERSION);
    info!(
        addr = %format!("{}:{}", config.server.bind, config.server.port),
        branches = %config.server.deploy_branches.join(","),
        "Webhook endpoint: POST /webhook"
    );
    info!(
        domain = %config.deploy.domain,
        network = %config.deploy.network,
        deployments = %config.deploy.deployments_dir.display(),
        "Sites are served at <site>.{}",
        config.deploy.domain
    );
    info!(
        registry = %config.proxy.registry_path.display(),
        caddyfile = %config.proxy.config_path.display(),
        "Proxy configuration"
    );
}
