//! vibedeploy - push-to-deploy orchestrator
//!
//! Turns a push to a repository into a running, routed site:
//! - Clones or pulls the repository into a per-site working tree
//! - Classifies it as static, Node, Go or Python from marker files
//! - Serves static sites from an nginx container, builds everything else
//!   into an image and swaps it in after a running-state check
//! - Records each hostname in an append-only registry
//! - Regenerates the Caddyfile from the registry and reloads Caddy
//!
//! Deploys are triggered by GitHub push webhooks (see [`server`]).

pub mod buildpacks;
pub mod caddyfile;
pub mod classify;
pub mod config;
pub mod deployer;
pub mod docker;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod reload;
pub mod server;
pub mod site;
pub mod source;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod webhooks;
