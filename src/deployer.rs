//! Deployment orchestration
//!
//! A deploy runs these stages in order: validate name, sync source, classify,
//! roll out containers, register hostname, synthesize and reload proxy. Any
//! error up to and including registration aborts the deploy. A proxy reload
//! failure only leaves routing stale, so the deploy still succeeds.
//!
//! Deploys of the same site are serialized by a per-site lock. The routing
//! stage is serialized across all sites so the proxy config always reflects
//! the registry it was generated from.

use crate::caddyfile::ProxyConfigSynthesizer;
use crate::classify::classify;
use crate::config::Config;
use crate::docker::ContainerEngine;
use crate::error::{DeployError, DeployResult};
use crate::lifecycle::{ContainerLifecycleManager, LifecycleConfig, Strategy};
use crate::registry::{RegistryRecord, SiteRegistry, UpsertOutcome};
use crate::reload::ProxyReloader;
use crate::site::{validate_site_name, Classification, Site};
use crate::source::{SourceControl, SourceSynchronizer};
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};

/// State of the proxy after a deploy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum RoutingStatus {
    /// Config rewritten and proxy reloaded
    Updated,
    /// The proxy may still be serving an older config
    Stale(String),
}

/// Summary of a successful deploy
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub deploy_id: String,
    pub site: String,
    pub hostname: String,
    pub classification: Classification,
    pub port: u16,
    /// Built image, `None` for static sites
    pub image: Option<String>,
    pub strategy: Strategy,
    pub registry_inserted: bool,
    pub routing: RoutingStatus,
    pub elapsed: Duration,
}

/// Everything the deployer needs besides its backends
#[derive(Debug, Clone)]
pub struct DeployerSettings {
    pub deployments_dir: PathBuf,
    pub domain: String,
    pub lifecycle: LifecycleConfig,
}

/// Runs deployments end to end
pub struct Deployer {
    settings: DeployerSettings,
    synchronizer: SourceSynchronizer,
    lifecycle: ContainerLifecycleManager,
    registry: Arc<SiteRegistry>,
    synthesizer: ProxyConfigSynthesizer,
    routing: Mutex<ProxyReloader>,
    site_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Deployer {
    pub fn new(
        settings: DeployerSettings,
        engine: Arc<dyn ContainerEngine>,
        vcs: Arc<dyn SourceControl>,
        registry: Arc<SiteRegistry>,
        synthesizer: ProxyConfigSynthesizer,
        reloader: ProxyReloader,
    ) -> Self {
        Self {
            synchronizer: SourceSynchronizer::new(vcs),
            lifecycle: ContainerLifecycleManager::new(engine, settings.lifecycle.clone()),
            settings,
            registry,
            synthesizer,
            routing: Mutex::new(reloader),
            site_locks: DashMap::new(),
        }
    }

    /// Build a deployer from configuration, opening the registry
    pub async fn from_config(
        config: &Config,
        engine: Arc<dyn ContainerEngine>,
        vcs: Arc<dyn SourceControl>,
    ) -> anyhow::Result<Self> {
        let registry = SiteRegistry::open(&config.proxy.registry_path).await?;
        let reloader = ProxyReloader::new(&config.proxy.config_path, &config.proxy.reload_command)?;
        let synthesizer = ProxyConfigSynthesizer::new(&config.proxy.access_log);

        let settings = DeployerSettings {
            deployments_dir: config.deploy.deployments_dir.clone(),
            domain: config.deploy.domain.clone(),
            lifecycle: LifecycleConfig {
                network: config.deploy.network.clone(),
                static_image: config.deploy.static_image.clone(),
                image_prefix: config.deploy.image_prefix.clone(),
                settle_delay: config.deploy.settle_delay(),
                host_deployments_dir: config.deploy.host_deployments_dir.clone(),
            },
        };

        Ok(Self::new(
            settings,
            engine,
            vcs,
            Arc::new(registry),
            synthesizer,
            reloader,
        ))
    }

    pub fn registry(&self) -> &SiteRegistry {
        &self.registry
    }

    fn site_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.site_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the lock for `name` once no deploy holds or waits on it
    fn release_site_lock(&self, name: &str) {
        self.site_locks.remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Deploy `name` from `clone_url`
    pub async fn deploy(&self, name: &str, clone_url: &str) -> DeployResult<DeployReport> {
        validate_site_name(name).map_err(|reason| DeployError::InvalidSite {
            name: name.to_string(),
            reason,
        })?;

        let deploy_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("deploy", site = %name, deploy_id = %deploy_id);

        async {
            let lock = self.site_lock(name);
            let guard = lock.lock().await;

            let result = self.run(name, clone_url, &deploy_id).await;

            drop(guard);
            drop(lock);
            self.release_site_lock(name);

            match &result {
                Ok(report) => info!(
                    hostname = %report.hostname,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Deployment completed"
                ),
                Err(e) if e.is_fatal() => error!(
                    error = %e,
                    "Deployment left the site without a running container; \
                     redeploy or start the container manually"
                ),
                Err(e) => warn!(kind = e.kind(), error = %e, "Deployment failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, name: &str, clone_url: &str, deploy_id: &str) -> DeployResult<DeployReport> {
        let started = Instant::now();
        let site = Site::new(name, clone_url, &self.settings.deployments_dir);

        self.synchronizer.sync(&site).await?;

        let classification = classify(&site.work_dir);
        info!(%classification, port = classification.port(), "Detected application type");

        let rollout = self.lifecycle.deploy(&site, classification).await?;

        let hostname = site.hostname(&self.settings.domain);
        let record = RegistryRecord::new(
            &hostname,
            site.canonical_container(),
            classification.port(),
            classification.as_str(),
        );
        let (registry_inserted, routing) = self.update_routing(&record).await?;

        Ok(DeployReport {
            deploy_id: deploy_id.to_string(),
            site: site.name.clone(),
            hostname,
            classification,
            port: classification.port(),
            image: match rollout.strategy {
                Strategy::Swap => Some(rollout.image),
                Strategy::Static => None,
            },
            strategy: rollout.strategy,
            registry_inserted,
            routing,
            elapsed: started.elapsed(),
        })
    }

    /// Register `record` and push the resulting config to the proxy.
    ///
    /// Registry errors are returned; reload errors become [`RoutingStatus::Stale`].
    pub async fn update_routing(&self, record: &RegistryRecord) -> DeployResult<(bool, RoutingStatus)> {
        let reloader = self.routing.lock().await;

        let inserted = self.registry.upsert(record).await? == UpsertOutcome::Inserted;
        let text = self.registry.read_text().await?;
        let config = self.synthesizer.synthesize(&text);

        let status = match reloader.apply(&config).await {
            Ok(()) => RoutingStatus::Updated,
            Err(e) => {
                warn!(error = %e, "Proxy reload failed, routing may be stale");
                RoutingStatus::Stale(e.to_string())
            }
        };

        Ok((inserted, status))
    }
}
