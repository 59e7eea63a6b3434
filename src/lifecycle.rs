//! Container lifecycle for a site
//!
//! Static sites are replaced in place: the canonical container is removed and
//! a fresh static server is started over the working tree.
//!
//! Dynamic sites go through build, stage, verify and cutover:
//!
//! 1. Prepare: make sure the working tree has a Dockerfile.
//! 2. Build: build the image under the site's fixed tag.
//! 3. Stage: start the new image as `{site}-new`, which is not routed to.
//! 4. Verify: after a settle delay, require `{site}-new` to be running.
//!    Otherwise it is removed and the canonical container is left alone.
//! 5. Cutover: remove the canonical and transitional containers, then start
//!    the image again under the canonical name.
//!
//! Between the removal and the final start in step 5 no canonical container
//! is running. A failure of that final start is reported as
//! [`DeployError::FatalSwap`].

use crate::buildpacks::ImageBuilder;
use crate::docker::{ContainerEngine, RunSpec, VolumeMount};
use crate::error::{DeployError, DeployResult};
use crate::site::{Classification, Site};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Document root of the static server image
pub const STATIC_DOCUMENT_ROOT: &str = "/usr/share/nginx/html";

/// Settings shared by every rollout
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Network every site container joins so the proxy can reach it by name
    pub network: String,
    /// Image serving static sites
    pub static_image: String,
    /// Prefix of built image tags
    pub image_prefix: String,
    /// Wait between staging the new container and checking it
    pub settle_delay: Duration,
    /// Host-side deployments directory, when it differs from the one this
    /// process sees (e.g. when running inside a container)
    pub host_deployments_dir: Option<PathBuf>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            network: "vibe-deploy_web".to_string(),
            static_image: "nginx:alpine".to_string(),
            image_prefix: "vibe-deploy".to_string(),
            settle_delay: Duration::from_secs(2),
            host_deployments_dir: None,
        }
    }
}

/// Which rollout path was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Static,
    Swap,
}

/// Result of a completed rollout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rollout {
    pub strategy: Strategy,
    /// Image now backing the canonical container
    pub image: String,
    /// Id of the new canonical container
    pub container_id: String,
    /// Whether a canonical container existed before
    pub replaced_existing: bool,
}

/// Drives a site's containers to the freshly synced source
pub struct ContainerLifecycleManager {
    engine: Arc<dyn ContainerEngine>,
    config: LifecycleConfig,
}

impl ContainerLifecycleManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: LifecycleConfig) -> Self {
        Self { engine, config }
    }

    /// Roll out `site` according to its classification
    pub async fn deploy(&self, site: &Site, classification: Classification) -> DeployResult<Rollout> {
        if classification.is_static() {
            self.deploy_static(site).await
        } else {
            self.deploy_swap(site, classification).await
        }
    }

    async fn deploy_static(&self, site: &Site) -> DeployResult<Rollout> {
        let canonical = site.canonical_container();
        let replaced_existing = self.engine.container_exists(canonical).await;
        if replaced_existing {
            info!(site = %site.name, container = canonical, "Replacing existing static container");
        }

        self.engine.remove_container(canonical).await;

        let mount_source = match &self.config.host_deployments_dir {
            Some(dir) => dir.join(&site.name),
            None => site.work_dir.clone(),
        };
        let spec = RunSpec::new(canonical, &self.config.static_image, &self.config.network)
            .with_volume(VolumeMount::read_only(mount_source, STATIC_DOCUMENT_ROOT));

        let container_id = self.engine.run_container(&spec).await.map_err(|source| {
            error!(
                site = %site.name,
                error = %source,
                "Static container failed to start after the previous one was removed, site is down"
            );
            DeployError::FatalSwap {
                site: site.name.clone(),
                source,
            }
        })?;

        info!(site = %site.name, container = canonical, "Static site is live");
        Ok(Rollout {
            strategy: Strategy::Static,
            image: self.config.static_image.clone(),
            container_id,
            replaced_existing,
        })
    }

    async fn deploy_swap(&self, site: &Site, classification: Classification) -> DeployResult<Rollout> {
        let canonical = site.canonical_container();
        let transitional = site.transitional_container();
        let image = site.image_tag(&self.config.image_prefix);

        // Prepare
        ImageBuilder::ensure_dockerfile(&site.work_dir, classification)
            .await
            .map_err(|e| DeployError::Build {
                site: site.name.clone(),
                reason: format!("failed to write Dockerfile: {}", e),
            })?;

        // Build
        if let Err(e) = self.engine.build_image(&image, &site.work_dir).await {
            warn!(site = %site.name, image = %image, "Build failed, keeping current container running");
            return Err(DeployError::Build {
                site: site.name.clone(),
                reason: e.to_string(),
            });
        }

        // Stage
        self.engine.remove_container(&transitional).await;
        let staged = RunSpec::new(&transitional, &image, &self.config.network);
        if let Err(source) = self.engine.run_container(&staged).await {
            warn!(site = %site.name, container = %transitional, "New container failed to start");
            self.engine.remove_container(&transitional).await;
            return Err(DeployError::Stage {
                site: site.name.clone(),
                source,
            });
        }

        // Verify
        tokio::time::sleep(self.config.settle_delay).await;
        let check = self.engine.is_running(&transitional).await;
        let failure = match check {
            Ok(true) => None,
            Ok(false) => Some("container is not running after settle delay".to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            warn!(site = %site.name, container = %transitional, reason = %reason, "New container failed health check, rolling back");
            self.engine.remove_container(&transitional).await;
            return Err(DeployError::HealthCheck {
                site: site.name.clone(),
                reason,
            });
        }

        info!(site = %site.name, "New container healthy, swapping");

        // Cutover
        let replaced_existing = self.engine.container_exists(canonical).await;
        if replaced_existing {
            self.engine.remove_container(canonical).await;
        }
        self.engine.remove_container(&transitional).await;

        let container_id = self
            .engine
            .run_container(&RunSpec::new(canonical, &image, &self.config.network))
            .await
            .map_err(|source| {
                error!(
                    site = %site.name,
                    image = %image,
                    error = %source,
                    "Cutover failed after removing the previous container, site is down until redeployed"
                );
                DeployError::FatalSwap {
                    site: site.name.clone(),
                    source,
                }
            })?;

        info!(site = %site.name, container = canonical, image = %image, "Container swapped");
        Ok(Rollout {
            strategy: Strategy::Swap,
            image,
            container_id,
            replaced_existing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EngineCall, FakeEngine};
    use std::path::Path;

    fn config() -> LifecycleConfig {
        LifecycleConfig {
            network: "web".to_string(),
            settle_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    fn site(root: &Path) -> Site {
        let site = Site::new("app", "https://example.com/app.git", root);
        std::fs::create_dir_all(&site.work_dir).unwrap();
        site
    }

    #[tokio::test]
    async fn test_swap_replaces_canonical_container() {
        let root = tempfile::tempdir().unwrap();
        let site = site(root.path());
        let engine = Arc::new(FakeEngine::new().with_running("app", "vibe-deploy-app:old"));
        let manager = ContainerLifecycleManager::new(engine.clone(), config());

        let rollout = manager.deploy(&site, Classification::Node).await.unwrap();

        assert_eq!(rollout.strategy, Strategy::Swap);
        assert_eq!(rollout.image, "vibe-deploy-app:latest");
        assert!(rollout.replaced_existing);

        let canonical = engine.container("app").unwrap();
        assert_eq!(canonical.image, "vibe-deploy-app:latest");
        assert_eq!(canonical.network, "web");
        assert!(canonical.running);
        assert_eq!(canonical.id, rollout.container_id);
        assert_eq!(engine.container_names(), vec!["app".to_string()]);
        assert!(site.work_dir.join("Dockerfile").exists());
    }

    #[tokio::test]
    async fn test_swap_call_order() {
        let root = tempfile::tempdir().unwrap();
        let site = site(root.path());
        let engine = Arc::new(FakeEngine::new().with_running("app", "old"));
        let manager = ContainerLifecycleManager::new(engine.clone(), config());

        manager.deploy(&site, Classification::Go).await.unwrap();

        let image = "vibe-deploy-app:latest".to_string();
        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::Build { tag: image.clone(), context: site.work_dir.clone() },
                EngineCall::Remove("app-new".to_string()),
                EngineCall::Run(RunSpec::new("app-new", &image, "web")),
                EngineCall::Inspect("app-new".to_string()),
                EngineCall::Exists("app".to_string()),
                EngineCall::Remove("app".to_string()),
                EngineCall::Remove("app-new".to_string()),
                EngineCall::Run(RunSpec::new("app", &image, "web")),
            ]
        );
    }

    #[tokio::test]
    async fn test_first_deploy_has_nothing_to_replace() {
        let root = tempfile::tempdir().unwrap();
        let site = site(root.path());
        let engine = Arc::new(FakeEngine::new());
        let manager = ContainerLifecycleManager::new(engine.clone(), config());

        let rollout = manager.deploy(&site, Classification::Python).await.unwrap();

        assert!(!rollout.replaced_existing);
        assert!(engine.container("app").unwrap().running);
        assert!(engine.container("app-new").is_none());
    }

    #[tokio::test]
    async fn test_build_failure_leaves_canonical_untouched() {
        let root = tempfile::tempdir().unwrap();
        let site = site(root.path());
        let engine = Arc::new(
            FakeEngine::new()
                .with_running("app", "old")
                .failing_build("npm ERR! missing script: start"),
        );
        let before = engine.container("app").unwrap();
        let manager = ContainerLifecycleManager::new(engine.clone(), config());

        let err = manager.deploy(&site, Classification::Node).await.unwrap_err();

        assert!(matches!(err, DeployError::Build { ref reason, .. } if reason.contains("missing script")));
        assert_eq!(engine.container("app").unwrap(), before);
        assert!(engine.runs().is_empty());
    }

    #[tokio::test]
    async fn test_stage_failure_leaves_canonical_untouched() {
        let root = tempfile::tempdir().unwrap();
        let site = site(root.path());
        let engine = Arc::new(FakeEngine::new().with_running("app", "old").failing_run("app-new"));
        let before = engine.container("app").unwrap();
        let manager = ContainerLifecycleManager::new(engine.clone(), config());

        let err = manager.deploy(&site, Classification::Go).await.unwrap_err();

        assert!(matches!(err, DeployError::Stage { .. }));
        assert_eq!(engine.container("app").unwrap(), before);
        assert!(engine.container("app-new").is_none());
    }

    #[tokio::test]
    async fn test_unhealthy_container_rolls_back() {
        let root = tempfile::tempdir().unwrap();
        let site = site(root.path());
        let engine = Arc::new(FakeEngine::new().with_running("app", "old").exiting_on_start("app-new"));
        let before = engine.container("app").unwrap();
        let manager = ContainerLifecycleManager::new(engine.clone(), config());

        let err = manager.deploy(&site, Classification::Python).await.unwrap_err();

        assert!(matches!(err, DeployError::HealthCheck { .. }));
        assert_eq!(engine.container("app").unwrap(), before);
        assert!(engine.container("app-new").is_none());
        assert!(!engine.calls().contains(&EngineCall::Remove("app".to_string())));
    }

    #[tokio::test]
    async fn test_inspect_error_rolls_back() {
        let root = tempfile::tempdir().unwrap();
        let site = site(root.path());
        let engine = Arc::new(FakeEngine::new().with_running("app", "old").failing_inspect("app-new"));
        let before = engine.container("app").unwrap();
        let manager = ContainerLifecycleManager::new(engine.clone(), config());

        let err = manager.deploy(&site, Classification::Node).await.unwrap_err();

        assert!(matches!(err, DeployError::HealthCheck { .. }));
        assert_eq!(engine.container("app").unwrap(), before);
        assert!(engine.container("app-new").is_none());
    }

    #[tokio::test]
    async fn test_cutover_failure_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let site = site(root.path());
        let engine = Arc::new(FakeEngine::new().with_running("app", "old").failing_run("app"));
        let manager = ContainerLifecycleManager::new(engine.clone(), config());

        let err = manager.deploy(&site, Classification::Node).await.unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(err, DeployError::FatalSwap { .. }));
        assert!(engine.container("app").is_none());
        assert!(engine.container("app-new").is_none());
    }

    #[tokio::test]
    async fn test_stale_transitional_container_is_cleared() {
        let root = tempfile::tempdir().unwrap();
        let site = site(root.path());
        let engine = Arc::new(FakeEngine::new().with_running("app-new", "crashed-run"));
        let manager = ContainerLifecycleManager::new(engine.clone(), config());

        manager.deploy(&site, Classification::Node).await.unwrap();

        assert_eq!(engine.container_names(), vec!["app".to_string()]);
    }

    #[tokio::test]
    async fn test_static_never_builds() {
        let root = tempfile::tempdir().unwrap();
        let site = site(root.path());
        let engine = Arc::new(FakeEngine::new().with_running("app", "nginx:alpine"));
        let manager = ContainerLifecycleManager::new(engine.clone(), config());

        let rollout = manager.deploy(&site, Classification::Static).await.unwrap();

        assert_eq!(rollout.strategy, Strategy::Static);
        assert!(rollout.replaced_existing);
        assert!(engine.builds().is_empty());
        assert!(!engine.calls().iter().any(|c| matches!(c, EngineCall::Inspect(_))));
        assert!(!site.work_dir.join("Dockerfile").exists());

        let canonical = engine.container("app").unwrap();
        assert_eq!(canonical.image, "nginx:alpine");
        assert_eq!(
            canonical.volume,
            Some(format!("{}:{}:ro", site.work_dir.display(), STATIC_DOCUMENT_ROOT))
        );
    }

    #[tokio::test]
    async fn test_static_mounts_host_directory() {
        let root = tempfile::tempdir().unwrap();
        let site = site(root.path());
        let engine = Arc::new(FakeEngine::new());
        let manager = ContainerLifecycleManager::new(
            engine.clone(),
            LifecycleConfig {
                host_deployments_dir: Some(PathBuf::from("/srv/vibe/deployments")),
                ..config()
            },
        );

        manager.deploy(&site, Classification::Static).await.unwrap();

        assert_eq!(
            engine.container("app").unwrap().volume,
            Some("/srv/vibe/deployments/app:/usr/share/nginx/html:ro".to_string())
        );
    }

    #[tokio::test]
    async fn test_dynamic_classifications_always_build() {
        for classification in [Classification::Node, Classification::Go, Classification::Python] {
            let root = tempfile::tempdir().unwrap();
            let site = site(root.path());
            let engine = Arc::new(FakeEngine::new());
            let manager = ContainerLifecycleManager::new(engine.clone(), config());

            manager.deploy(&site, classification).await.unwrap();

            assert_eq!(engine.builds(), vec!["vibe-deploy-app:latest".to_string()]);
        }
    }
}
