//! Container runtime commands
//!
//! Wraps the `podman`/`docker` CLI. Every method builds an argument vector
//! from already-normalized names and numeric ports and hands it to the
//! shared [`CommandRunner`].

use crate::exec::{CommandError, CommandOutput, CommandRunner, CommandSpec};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Observed state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    NotFound,
}

/// CLI-driven container runtime
#[derive(Clone)]
pub struct ContainerRuntime {
    binary: String,
    runner: Arc<dyn CommandRunner>,
}

impl ContainerRuntime {
    pub fn new(binary: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            binary: binary.into(),
            runner,
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.binary)
    }

    /// Build an image tagged `tag` from the manifest in `context`
    pub async fn build_image(&self, tag: &str, context: &Path) -> Result<CommandOutput, CommandError> {
        let context_arg = context.to_string_lossy().into_owned();
        let manifest = context.join("Dockerfile").to_string_lossy().into_owned();
        let spec = self
            .command()
            .args(["build", "-t", tag, "-f", &manifest, &context_arg])
            .current_dir(context);
        self.runner.run(&spec).await
    }

    /// Force-remove a container; returns false if there was none
    pub async fn force_remove(&self, name: &str) -> Result<bool, CommandError> {
        let spec = self.command().args(["rm", "-f", name]);
        match self.runner.run(&spec).await {
            Ok(_) => Ok(true),
            Err(e) if is_missing(&e) => {
                debug!(container = %name, "No existing container to remove");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Run a detached, always-restarting container publishing `host_port`
    pub async fn run_container(
        &self,
        name: &str,
        image: &str,
        host_port: u16,
        internal_port: u16,
    ) -> Result<String, CommandError> {
        let publish = format!("{}:{}", host_port, internal_port);
        let spec = self.command().args([
            "run",
            "-d",
            "-p",
            &publish,
            "--name",
            name,
            "--restart",
            "always",
            image,
        ]);
        let output = self.runner.run(&spec).await?;
        let container_id = output.stdout.trim().to_string();
        info!(container = %name, id = %container_id, port = host_port, "Container started");
        Ok(container_id)
    }

    pub async fn start(&self, name: &str) -> Result<(), CommandError> {
        self.runner
            .run(&self.command().args(["start", name]))
            .await
            .map(|_| ())
    }

    pub async fn stop(&self, name: &str) -> Result<(), CommandError> {
        self.runner
            .run(&self.command().args(["stop", name]))
            .await
            .map(|_| ())
    }

    /// Remove an image; returns false if it did not exist
    pub async fn remove_image(&self, name: &str) -> Result<bool, CommandError> {
        match self.runner.run(&self.command().args(["rmi", "-f", name])).await {
            Ok(_) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Inspect whether a container is running.
    ///
    /// Any inspect failure other than a spawn error means the runtime does
    /// not know the container.
    pub async fn state(&self, name: &str) -> Result<ContainerState, CommandError> {
        let spec = self
            .command()
            .args(["inspect", "--format", "{{.State.Running}}", name]);
        match self.runner.run(&spec).await {
            Ok(output) if output.stdout.trim() == "true" => Ok(ContainerState::Running),
            Ok(_) => Ok(ContainerState::Stopped),
            Err(CommandError::Failed { .. }) => Ok(ContainerState::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Last `lines` lines of the container's output
    pub async fn logs(&self, name: &str, lines: usize) -> Result<String, CommandError> {
        let tail = lines.to_string();
        let output = self
            .runner
            .run(&self.command().args(["logs", "--tail", &tail, name]))
            .await?;
        let mut text = output.stdout;
        text.push_str(&output.stderr);
        Ok(text)
    }
}

/// Whether a failure only says the object does not exist
fn is_missing(err: &CommandError) -> bool {
    let stderr = err.stderr().to_ascii_lowercase();
    stderr.contains("no such") || stderr.contains("not known") || stderr.contains("not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies to every command with a fixed result and records the calls
    struct ScriptedRunner {
        reply: Result<CommandOutput, (i32, String)>,
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        fn new(reply: Result<&str, &str>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply
                    .map(|out| CommandOutput {
                        stdout: out.to_string(),
                        stderr: String::new(),
                    })
                    .map_err(|err| (1, err.to_string())),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
            self.calls.lock().unwrap().push(spec.clone());
            match &self.reply {
                Ok(output) => Ok(output.clone()),
                Err((code, stderr)) => Err(CommandError::Failed {
                    command: spec.to_string(),
                    code: *code,
                    stderr: stderr.clone(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_run_container_arguments() {
        let runner = ScriptedRunner::new(Ok("abc123\n"));
        let runtime = ContainerRuntime::new("podman", runner.clone());

        let id = runtime
            .run_container("website-demo", "website-demo", 12000, 80)
            .await
            .unwrap();

        assert_eq!(id, "abc123");
        let calls = runner.calls.lock().unwrap();
        assert_eq!(
            calls[0].args,
            vec![
                "run", "-d", "-p", "12000:80", "--name", "website-demo", "--restart", "always",
                "website-demo"
            ]
        );
    }

    #[tokio::test]
    async fn test_force_remove_tolerates_missing_container() {
        let runner = ScriptedRunner::new(Err("Error: no such container website-demo"));
        let runtime = ContainerRuntime::new("podman", runner);
        assert!(!runtime.force_remove("website-demo").await.unwrap());
    }

    #[tokio::test]
    async fn test_force_remove_surfaces_other_errors() {
        let runner = ScriptedRunner::new(Err("permission denied"));
        let runtime = ContainerRuntime::new("podman", runner);
        assert!(runtime.force_remove("website-demo").await.is_err());
    }

    #[tokio::test]
    async fn test_state_parsing() {
        let running = ContainerRuntime::new("podman", ScriptedRunner::new(Ok("true\n")));
        assert_eq!(running.state("c").await.unwrap(), ContainerState::Running);

        let stopped = ContainerRuntime::new("podman", ScriptedRunner::new(Ok("false\n")));
        assert_eq!(stopped.state("c").await.unwrap(), ContainerState::Stopped);

        let missing = ContainerRuntime::new("podman", ScriptedRunner::new(Err("no such object")));
        assert_eq!(missing.state("c").await.unwrap(), ContainerState::NotFound);
    }

    #[tokio::test]
    async fn test_build_uses_generated_manifest() {
        let runner = ScriptedRunner::new(Ok(""));
        let runtime = ContainerRuntime::new("docker", runner.clone());
        runtime
            .build_image("website-demo", Path::new("/srv/sites/demo"))
            .await
            .unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].program, "docker");
        assert_eq!(
            calls[0].args,
            vec![
                "build",
                "-t",
                "website-demo",
                "-f",
                "/srv/sites/demo/Dockerfile",
                "/srv/sites/demo"
            ]
        );
    }
}
