//! Shared helpers for integration tests
//!
//! `FakeRunner` stands in for podman, git, unzip, tar and the proxy reload so
//! the orchestrator can be exercised end to end without any of them installed.

#![allow(dead_code)]

use async_trait::async_trait;
use siteforge::config::Config;
use siteforge::error::ActionResponse;
use siteforge::exec::{CommandError, CommandOutput, CommandRunner, CommandSpec};
use siteforge::fallback::FallbackStore;
use siteforge::orchestrator::{Orchestrator, Payload};
use siteforge::sitelog;
use siteforge::store::{SiteRecord, SiteStore};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;

// ============================================================================
// Fake command runner
// ============================================================================

#[derive(Default)]
struct FakeState {
    images: HashSet<String>,
    /// container name -> running
    containers: HashMap<String, bool>,
    calls: Vec<CommandSpec>,
    /// (program, subcommand) pairs that fail
    failures: HashSet<(String, String)>,
    /// files a `git clone` writes into the target directory
    clone_files: Vec<(String, String)>,
    /// how long each image build takes
    build_delay: Option<Duration>,
}

#[derive(Default)]
pub struct FakeRunner {
    state: Mutex<FakeState>,
}

fn failed(spec: &CommandSpec, stderr: impl Into<String>) -> CommandError {
    CommandError::Failed {
        command: spec.to_string(),
        code: 1,
        stderr: stderr.into(),
    }
}

fn ok(stdout: impl Into<String>) -> Result<CommandOutput, CommandError> {
    Ok(CommandOutput {
        stdout: stdout.into(),
        stderr: String::new(),
    })
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every `<program> <subcommand> ...` call fail
    pub fn fail_on(&self, program: &str, subcommand: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((program.to_string(), subcommand.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    /// Files written by a successful clone
    pub fn set_clone_files(&self, files: &[(&str, &str)]) {
        self.state.lock().unwrap().clone_files = files
            .iter()
            .map(|(name, body)| (name.to_string(), body.to_string()))
            .collect();
    }

    /// Make every image build take `delay`
    pub fn set_build_delay(&self, delay: Duration) {
        self.state.lock().unwrap().build_delay = Some(delay);
    }

    pub fn is_running(&self, container: &str) -> Option<bool> {
        self.state.lock().unwrap().containers.get(container).copied()
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state.lock().unwrap().images.contains(image)
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls whose program and first argument match
    pub fn count(&self, program: &str, subcommand: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.program == program && c.subcommand() == Some(subcommand))
            .count()
    }

    fn podman(&self, state: &mut FakeState, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["build", "-t", tag, "-f", manifest, _context] => {
                if !Path::new(manifest).is_file() {
                    return Err(failed(spec, "Error: no Dockerfile found"));
                }
                state.images.insert(tag.to_string());
                ok("STEP 1/3: FROM base\nCOMMIT\n")
            }
            ["rm", "-f", name] => match state.containers.remove(*name) {
                Some(_) => ok(format!("{}\n", name)),
                None => Err(failed(spec, format!("Error: no such container {}", name))),
            },
            ["run", "-d", "-p", _publish, "--name", name, "--restart", "always", image] => {
                if !state.images.contains(*image) {
                    return Err(failed(spec, format!("Error: {}: image not known", image)));
                }
                if state.containers.contains_key(*name) {
                    return Err(failed(spec, format!("Error: the container name \"{}\" is already in use", name)));
                }
                state.containers.insert(name.to_string(), true);
                ok(format!("id-{}\n", name))
            }
            ["start", name] | ["stop", name] => match state.containers.get_mut(*name) {
                Some(running) => {
                    *running = args[0] == "start";
                    ok(format!("{}\n", name))
                }
                None => Err(failed(spec, format!("Error: no such container {}", name))),
            },
            ["rmi", "-f", name] => {
                if state.images.remove(*name) {
                    ok(format!("Untagged: {}\n", name))
                } else {
                    Err(failed(spec, format!("Error: {}: image not known", name)))
                }
            }
            ["inspect", "--format", _format, name] => match state.containers.get(*name) {
                Some(running) => ok(format!("{}\n", running)),
                None => Err(failed(spec, format!("Error: no such object: {}", name))),
            },
            ["logs", "--tail", _lines, name] => match state.containers.get(*name) {
                Some(_) => ok(format!("{} listening\n", name)),
                None => Err(failed(spec, format!("Error: no such container {}", name))),
            },
            _ => Err(failed(spec, "unexpected podman invocation")),
        }
    }

    fn git(&self, state: &mut FakeState, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["clone", "--depth", "1", "--", url, dir] => {
                if url.contains("missing") {
                    return Err(failed(spec, "fatal: repository not found"));
                }
                let dir = PathBuf::from(dir);
                std::fs::create_dir_all(&dir).map_err(|e| failed(spec, e.to_string()))?;
                for (name, body) in &state.clone_files {
                    std::fs::write(dir.join(name), body).map_err(|e| failed(spec, e.to_string()))?;
                }
                ok("")
            }
            _ => Err(failed(spec, "unexpected git invocation")),
        }
    }

    /// Pretend to unpack an archive containing a single index.html
    fn extract(&self, spec: &CommandSpec, target: &str) -> Result<CommandOutput, CommandError> {
        let dir = PathBuf::from(target);
        std::fs::create_dir_all(&dir).map_err(|e| failed(spec, e.to_string()))?;
        std::fs::write(dir.join("index.html"), "<h1>uploaded</h1>")
            .map_err(|e| failed(spec, e.to_string()))?;
        ok("")
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let is_build = spec.program == "podman" && spec.subcommand() == Some("build");
        let delay = self.state.lock().unwrap().build_delay.filter(|_| is_build);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.calls.push(spec.clone());

        let key = (
            spec.program.clone(),
            spec.subcommand().unwrap_or_default().to_string(),
        );
        if state.failures.contains(&key) {
            return Err(failed(spec, "injected failure"));
        }

        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        match spec.program.as_str() {
            "podman" => self.podman(&mut state, spec),
            "git" => self.git(&mut state, spec),
            "unzip" => match args.as_slice() {
                ["-o", "-q", _archive, "-d", target] => self.extract(spec, target),
                _ => Err(failed(spec, "unexpected unzip invocation")),
            },
            "tar" => match args.as_slice() {
                [_flags, _archive, "-C", target] => self.extract(spec, target),
                _ => Err(failed(spec, "unexpected tar invocation")),
            },
            _ => ok(""),
        }
    }
}

// ============================================================================
// Test environment
// ============================================================================

pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
    pub runner: Arc<FakeRunner>,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.workspace_dir = dir.path().join("containers");
        config.paths.data_dir = dir.path().join("data");
        config.paths.upload_dir = dir.path().join("uploads");
        config.proxy.map_path = dir.path().join("nginx-proxy/proxy_map.conf");
        config.runtime.port_range_start = 41000;
        config.runtime.port_range_end = 41100;
        config.runtime.lock_timeout_secs = 5;
        config.execution.production = true;

        Self {
            dir,
            config,
            runner: FakeRunner::new(),
        }
    }

    /// Use a SQLite primary store inside the test directory
    pub fn with_sqlite_primary(mut self) -> Self {
        self.config.store.database_url = Some(format!(
            "sqlite:{}",
            self.primary_db_path().display()
        ));
        self
    }

    pub fn primary_db_path(&self) -> PathBuf {
        self.dir.path().join("primary/sites.db")
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.config.clone(), self.runner.clone())
    }

    pub async fn run(&self, action: &str, payload: &str) -> ActionResponse {
        self.orchestrator()
            .dispatch(action.parse().unwrap(), Payload::parse(Some(payload)).unwrap())
            .await
    }

    /// Run an action with a site log layer installed, as the binary does
    /// for mutating actions
    pub async fn run_logged(&self, action: &str, payload: &str, slug: &str) -> ActionResponse {
        let (writer, guard) = sitelog::writer(&self.config.paths.data_dir, slug).unwrap();
        let subscriber =
            tracing_subscriber::registry().with(fmt::layer().with_ansi(false).with_writer(writer));

        let response = {
            let _default = tracing::subscriber::set_default(subscriber);
            self.run(action, payload).await
        };
        drop(guard);
        response
    }

    /// Place an uploaded file in the upload directory
    pub fn upload(&self, file_name: &str, contents: &[u8]) -> PathBuf {
        std::fs::create_dir_all(&self.config.paths.upload_dir).unwrap();
        let path = self.config.paths.upload_dir.join(file_name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub fn site_log(&self, slug: &str) -> Option<String> {
        sitelog::read(&self.config.paths.data_dir, slug).unwrap()
    }

    pub fn workspace(&self, slug: &str) -> PathBuf {
        self.config.paths.workspace_dir.join(slug)
    }

    pub fn proxy_map(&self) -> String {
        std::fs::read_to_string(&self.config.proxy.map_path).unwrap_or_default()
    }

    pub async fn fallback_records(&self) -> Vec<SiteRecord> {
        FallbackStore::new(&self.config.paths.data_dir)
            .list()
            .await
            .unwrap()
    }

    pub async fn fallback_record(&self, subdomain: &str) -> Option<SiteRecord> {
        FallbackStore::new(&self.config.paths.data_dir)
            .get(subdomain)
            .await
            .unwrap()
    }
}

/// `data.port` of a create response
pub fn response_port(response: &ActionResponse) -> u16 {
    response.data.as_ref().unwrap()["port"].as_u64().unwrap() as u16
}
