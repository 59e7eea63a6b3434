//! Deterministic in-memory backends for exercising the deploy flow
//!
//! [`FakeEngine`] models containers as a name-keyed table and records every
//! call, so tests can assert both the final container state and the order of
//! operations. [`FakeSource`] materializes a working tree from seed files.

use crate::docker::{ContainerEngine, RunSpec};
use crate::error::CommandFailure;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One recorded engine call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Build { tag: String, context: PathBuf },
    Run(RunSpec),
    Remove(String),
    Inspect(String),
    Exists(String),
}

/// A container known to the fake engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeContainer {
    pub id: String,
    pub image: String,
    pub network: String,
    pub running: bool,
    pub volume: Option<String>,
}

#[derive(Default)]
struct EngineState {
    containers: BTreeMap<String, FakeContainer>,
    calls: Vec<EngineCall>,
    next_id: u64,
    build_error: Option<String>,
    run_failures: HashSet<String>,
    exit_on_start: HashSet<String>,
    inspect_failures: HashSet<String>,
    run_delays: HashMap<String, Duration>,
}

/// In-memory container engine
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a running container, as left by an earlier deploy
    pub fn with_running(self, name: &str, image: &str) -> Self {
        {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = format!("fake-{}", state.next_id);
            state.containers.insert(
                name.to_string(),
                FakeContainer {
                    id,
                    image: image.to_string(),
                    network: String::new(),
                    running: true,
                    volume: None,
                },
            );
        }
        self
    }

    /// Make every image build fail with this output
    pub fn failing_build(self, output: &str) -> Self {
        self.state.lock().build_error = Some(output.to_string());
        self
    }

    /// Make starting a container with this name fail
    pub fn failing_run(self, name: &str) -> Self {
        self.state.lock().run_failures.insert(name.to_string());
        self
    }

    /// Containers with this name start but have exited by the time they are inspected
    pub fn exiting_on_start(self, name: &str) -> Self {
        self.state.lock().exit_on_start.insert(name.to_string());
        self
    }

    /// Make inspecting a container with this name fail
    pub fn failing_inspect(self, name: &str) -> Self {
        self.state.lock().inspect_failures.insert(name.to_string());
        self
    }

    /// Starting a container with this name takes `delay` before it is created
    pub fn slow_run(self, name: &str, delay: Duration) -> Self {
        self.state.lock().run_delays.insert(name.to_string(), delay);
        self
    }

    /// Allow starting a container with this name again
    pub fn clear_run_failure(&self, name: &str) {
        self.state.lock().run_failures.remove(name);
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().containers.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().containers.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    pub fn builds(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Build { tag, .. } => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub fn runs(&self) -> Vec<RunSpec> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Run(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn build_image(&self, tag: &str, context: &Path) -> Result<(), CommandFailure> {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::Build {
            tag: tag.to_string(),
            context: context.to_path_buf(),
        });
        match &state.build_error {
            Some(output) => Err(CommandFailure::new(format!("docker build -t {}", tag), output.clone())),
            None => Ok(()),
        }
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<String, CommandFailure> {
        let delay = self.state.lock().run_delays.get(&spec.name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.calls.push(EngineCall::Run(spec.clone()));

        let command = format!("docker run -d --name {} {}", spec.name, spec.image);
        if state.run_failures.contains(&spec.name) {
            return Err(CommandFailure::new(command, "OCI runtime create failed"));
        }
        if state.containers.contains_key(&spec.name) {
            return Err(CommandFailure::new(
                command,
                format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            ));
        }

        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        let running = !state.exit_on_start.contains(&spec.name);
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                id: id.clone(),
                image: spec.image.clone(),
                network: spec.network.clone(),
                running,
                volume: spec.volume.as_ref().map(|v| v.to_bind()),
            },
        );
        Ok(id)
    }

    async fn remove_container(&self, name: &str) {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::Remove(name.to_string()));
        state.containers.remove(name);
    }

    async fn is_running(&self, name: &str) -> Result<bool, CommandFailure> {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::Inspect(name.to_string()));

        let command = format!("docker inspect {}", name);
        if state.inspect_failures.contains(name) {
            return Err(CommandFailure::new(command, "inspect failed"));
        }
        state
            .containers
            .get(name)
            .map(|c| c.running)
            .ok_or_else(|| CommandFailure::new(command, format!("No such container: {}", name)))
    }

    async fn container_exists(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::Exists(name.to_string()));
        state.containers.contains_key(name)
    }
}

#[derive(Default)]
struct SourceState {
    clones: Vec<String>,
    pulls: usize,
}

/// In-memory source control that writes seed files on clone
#[derive(Default)]
pub struct FakeSource {
    files: Vec<(String, String)>,
    error: Option<String>,
    state: Mutex<SourceState>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// File written into the working tree on clone
    pub fn with_file(mut self, name: &str, content: &str) -> Self {
        self.files.push((name.to_string(), content.to_string()));
        self
    }

    /// Fail every clone and pull with this output
    pub fn failing(mut self, output: &str) -> Self {
        self.error = Some(output.to_string());
        self
    }

    pub fn clones(&self) -> Vec<String> {
        self.state.lock().clones.clone()
    }

    pub fn pull_count(&self) -> usize {
        self.state.lock().pulls
    }
}

#[async_trait]
impl crate::source::SourceControl for FakeSource {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), CommandFailure> {
        let command = format!("git clone {} {}", url, dest.display());
        if let Some(output) = &self.error {
            return Err(CommandFailure::new(command, output.clone()));
        }

        std::fs::create_dir_all(dest).map_err(|e| CommandFailure::new(&command, e.to_string()))?;
        for (name, content) in &self.files {
            std::fs::write(dest.join(name), content)
                .map_err(|e| CommandFailure::new(&command, e.to_string()))?;
        }

        self.state.lock().clones.push(url.to_string());
        Ok(())
    }

    async fn pull(&self, dir: &Path) -> Result<(), CommandFailure> {
        if let Some(output) = &self.error {
            return Err(CommandFailure::new(
                format!("git -C {} pull", dir.display()),
                output.clone(),
            ));
        }
        self.state.lock().pulls += 1;
        Ok(())
    }
}
