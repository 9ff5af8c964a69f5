//! Action dispatcher
//!
//! Validates a request, takes the per-site lock for mutating actions, and
//! drives source acquisition, stack detection, the builder, the stores and
//! the proxy map in order. Every invocation ends with exactly one
//! [`ActionResponse`] and with the store connection closed.

use crate::builder::{self, Builder, DeployRequest};
use crate::config::Config;
use crate::error::{ActionResponse, OrchestratorError};
use crate::exec::{CommandRunner, DryRunRunner, SystemRunner};
use crate::lock::{port_lock_path, site_lock_path, FileLock, LockError};
use crate::persistence::Persistence;
use crate::proxy_map::ProxyMap;
use crate::runtime::{ContainerRuntime, ContainerState};
use crate::sitelog;
use crate::slug::Slug;
use crate::source::{self, SourceSpec};
use crate::stack::{self, StackHint};
use crate::store::{SiteDraft, SiteRecord, SiteStatus};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Most lines a logs query may ask for
const MAX_LOG_LINES: usize = 10_000;

/// Actions accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Start,
    Stop,
    Delete,
    Status,
    Logs,
    DeployLog,
    List,
    Stats,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Delete => "delete",
            Action::Status => "status",
            Action::Logs => "logs",
            Action::DeployLog => "deploy-log",
            Action::List => "list",
            Action::Stats => "stats",
        }
    }

    /// Whether the action changes containers, files or records
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Action::Create | Action::Start | Action::Stop | Action::Delete
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Action::Create),
            "start" => Ok(Action::Start),
            "stop" => Ok(Action::Stop),
            "delete" => Ok(Action::Delete),
            "status" => Ok(Action::Status),
            "logs" => Ok(Action::Logs),
            "deploy-log" | "creation-logs" => Ok(Action::DeployLog),
            "list" => Ok(Action::List),
            "stats" => Ok(Action::Stats),
            other => Err(OrchestratorError::validation(format!(
                "unknown action '{}'",
                other
            ))),
        }
    }
}

/// Request body passed as the second command-line argument
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub name: Option<String>,
    #[serde(alias = "template")]
    pub stack: Option<String>,
    pub source_type: Option<String>,
    pub repo_url: Option<String>,
    pub archive_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub lines: Option<usize>,
}

impl Payload {
    /// Parse the JSON payload; a missing or blank payload is empty
    pub fn parse(text: Option<&str>) -> Result<Self, OrchestratorError> {
        match text.map(str::trim) {
            None | Some("") => Ok(Payload::default()),
            Some(text) => serde_json::from_str(text)
                .map_err(|e| OrchestratorError::validation(format!("payload is not valid JSON: {}", e))),
        }
    }

    fn slug(&self) -> Result<Slug, OrchestratorError> {
        let name = self
            .name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| OrchestratorError::validation("name is required"))?;
        Slug::parse(name)
    }

    /// Slug of the named site, if the name is usable
    pub fn site_slug(&self) -> Option<Slug> {
        self.slug().ok()
    }
}

struct CreateRequest {
    name: String,
    slug: Slug,
    hint: StackHint,
    source: SourceSpec,
    port: Option<u16>,
}

/// A validated request
enum Request {
    Create(Box<CreateRequest>),
    Start(Slug),
    Stop(Slug),
    Delete(Slug),
    Status(Slug),
    Logs(Slug, usize),
    DeployLog(Slug),
    List,
    Stats,
}

impl Request {
    fn slug(&self) -> Option<&Slug> {
        match self {
            Request::Create(req) => Some(&req.slug),
            Request::Start(slug)
            | Request::Stop(slug)
            | Request::Delete(slug)
            | Request::Status(slug)
            | Request::Logs(slug, _)
            | Request::DeployLog(slug) => Some(slug),
            Request::List | Request::Stats => None,
        }
    }
}

pub struct Orchestrator {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    runtime: ContainerRuntime,
    builder: Builder,
    proxy: ProxyMap,
}

impl Orchestrator {
    pub fn new(config: Config, runner: Arc<dyn CommandRunner>) -> Self {
        let runtime = ContainerRuntime::new(config.runtime.binary.clone(), Arc::clone(&runner));
        let builder = Builder::new(runtime.clone());
        let proxy = ProxyMap::new(
            config.proxy.map_path.clone(),
            config.proxy.reload_command.clone(),
            Arc::clone(&runner),
        );
        Self {
            config,
            runner,
            runtime,
            builder,
            proxy,
        }
    }

    /// Executes commands in strict mode, otherwise only logs them
    pub fn from_config(config: Config) -> Self {
        let runner: Arc<dyn CommandRunner> = if config.execution.is_strict() {
            Arc::new(SystemRunner)
        } else {
            info!("Safe mode: external commands will be logged, not executed");
            Arc::new(DryRunRunner)
        };
        Self::new(config, runner)
    }

    fn is_dry_run(&self) -> bool {
        self.runner.is_dry_run()
    }

    /// Run one action to completion
    pub async fn dispatch(&self, action: Action, payload: Payload) -> ActionResponse {
        let request = match self.parse_request(action, payload) {
            Ok(request) => request,
            Err(e) => return self.fail(action, e),
        };

        info!(action = %action, site = ?request.slug().map(Slug::as_str), "Starting action");

        let persistence = Persistence::open(&self.config).await;
        let result = self.execute(request, &persistence).await;
        persistence.close().await;

        match result {
            Ok(response) => {
                info!(action = %action, "{}", response.message);
                response
            }
            Err(e) => self.fail(action, e),
        }
    }

    fn fail(&self, action: Action, err: OrchestratorError) -> ActionResponse {
        error!(action = %action, code = err.code().as_str(), error = %err, "Action failed");
        ActionResponse::failure(&err)
    }

    fn parse_request(&self, action: Action, payload: Payload) -> Result<Request, OrchestratorError> {
        match action {
            Action::Create => {
                // Claim the upload first so it is removed whatever fails below
                let archive = payload
                    .archive_path
                    .as_deref()
                    .map(|path| source::claim_upload(path, &self.config.paths.upload_dir))
                    .transpose()?;
                let slug = payload.slug()?;
                let hint = StackHint::parse(payload.stack.as_deref())?;
                if payload.port == Some(0) {
                    return Err(OrchestratorError::validation("port must be greater than 0"));
                }
                let source = SourceSpec::from_request(
                    payload.source_type.as_deref(),
                    payload.repo_url.clone(),
                    archive,
                )?;
                Ok(Request::Create(Box::new(CreateRequest {
                    name: payload.name.clone().unwrap_or_default().trim().to_string(),
                    slug,
                    hint,
                    source,
                    port: payload.port,
                })))
            }
            Action::Start => Ok(Request::Start(payload.slug()?)),
            Action::Stop => Ok(Request::Stop(payload.slug()?)),
            Action::Delete => Ok(Request::Delete(payload.slug()?)),
            Action::Status => Ok(Request::Status(payload.slug()?)),
            Action::Logs => {
                let lines = payload
                    .lines
                    .unwrap_or(self.config.runtime.log_tail_lines)
                    .clamp(1, MAX_LOG_LINES);
                Ok(Request::Logs(payload.slug()?, lines))
            }
            Action::DeployLog => Ok(Request::DeployLog(payload.slug()?)),
            Action::List => Ok(Request::List),
            Action::Stats => Ok(Request::Stats),
        }
    }

    async fn execute(
        &self,
        request: Request,
        store: &Persistence,
    ) -> Result<ActionResponse, OrchestratorError> {
        match request {
            Request::Create(req) => {
                let _lock = self.lock_site(&req.slug).await?;
                self.create(*req, store).await
            }
            Request::Start(slug) => {
                let _lock = self.lock_site(&slug).await?;
                self.set_running(&slug, true, store).await
            }
            Request::Stop(slug) => {
                let _lock = self.lock_site(&slug).await?;
                self.set_running(&slug, false, store).await
            }
            Request::Delete(slug) => {
                let _lock = self.lock_site(&slug).await?;
                self.delete(&slug, store).await
            }
            Request::Status(slug) => self.status(&slug, store).await,
            Request::Logs(slug, lines) => self.logs(&slug, lines).await,
            Request::DeployLog(slug) => self.deploy_log(&slug),
            Request::List => {
                let roster = store.list().await?;
                Ok(ActionResponse::ok_with(
                    format!("{} website(s)", roster.len()),
                    json!(roster),
                ))
            }
            Request::Stats => {
                let stats = store.stats().await?;
                Ok(ActionResponse::ok_with("Website statistics", json!(stats)))
            }
        }
    }

    async fn lock_site(&self, slug: &Slug) -> Result<FileLock, OrchestratorError> {
        let path = site_lock_path(&self.config.paths.data_dir, slug.as_str());
        self.lock(&path, slug).await
    }

    /// Serializes port assignment across sites until the new record is stored
    async fn lock_ports(&self, slug: &Slug) -> Result<FileLock, OrchestratorError> {
        let path = port_lock_path(&self.config.paths.data_dir);
        self.lock(&path, slug).await
    }

    async fn lock(&self, path: &Path, slug: &Slug) -> Result<FileLock, OrchestratorError> {
        FileLock::acquire(path, self.config.runtime.lock_timeout())
            .await
            .map_err(|e| match e {
                LockError::Timeout(_) => OrchestratorError::Busy(slug.to_string()),
                LockError::Io(io) => OrchestratorError::Io(io),
            })
    }

    // ==== Create ====

    async fn create(
        &self,
        req: CreateRequest,
        store: &Persistence,
    ) -> Result<ActionResponse, OrchestratorError> {
        let slug = req.slug.as_str();
        let container_name = req.slug.container_name();
        info!(site = %slug, name = %req.name, source = req.source.kind(), "Creating website");

        let existing = store.get(slug).await?;
        let hint = match (&existing, req.hint) {
            (Some(record), StackHint::Fixed(stack)) if stack != record.stack => {
                return Err(OrchestratorError::validation(format!(
                    "site '{}' was created as {} and cannot change to {}",
                    slug, record.stack, stack
                )));
            }
            (Some(record), StackHint::Auto) => StackHint::Fixed(record.stack),
            (_, hint) => hint,
        };

        let _ports = self.lock_ports(&req.slug).await?;
        let port = self.assign_port(slug, req.port, existing.as_ref(), store).await?;

        let workspace = self.config.workspace_for(slug);
        source::prepare_workspace(&workspace)?;
        source::acquire(self.runner.as_ref(), &req.source, &workspace).await?;

        let stack = stack::detect(&workspace, hint);
        if req.source.is_template() {
            let written = builder::write_starter_assets(&workspace, stack, &req.name, slug)?;
            if !written.is_empty() {
                info!(site = %slug, files = ?written, "Generated starter files");
            }
        }
        drop(req.source);

        let deployed = self
            .builder
            .deploy(&DeployRequest {
                workspace: workspace.clone(),
                container_name: container_name.clone(),
                stack,
                host_port: port,
            })
            .await?;

        let record = store
            .upsert(&SiteDraft {
                name: req.name.clone(),
                subdomain: slug.to_string(),
                stack,
                port,
                status: SiteStatus::Running,
            })
            .await?;

        self.refresh_proxy(store).await?;

        info!(site = %slug, port, stack = %stack, "Website created");
        Ok(ActionResponse::ok_with(
            "Website created successfully",
            json!({
                "id": record.id,
                "name": record.name,
                "subdomain": record.subdomain,
                "stack": record.stack,
                "port": record.port,
                "status": record.status,
                "container": container_name,
                "containerId": deployed.container_id,
                "image": deployed.image,
                "internalPort": deployed.internal_port,
                "deploySeconds": deployed.duration_secs,
            }),
        ))
    }

    /// Pick the host port for a site.
    ///
    /// A requested port must not belong to another site. Otherwise an existing
    /// site keeps its port and a new one gets the lowest free port in range.
    async fn assign_port(
        &self,
        slug: &str,
        requested: Option<u16>,
        existing: Option<&SiteRecord>,
        store: &Persistence,
    ) -> Result<u16, OrchestratorError> {
        let roster = store.list().await?;
        let taken: HashSet<u16> = roster
            .iter()
            .filter(|r| r.subdomain != slug)
            .map(|r| r.port)
            .collect();

        if let Some(port) = requested {
            if taken.contains(&port) {
                return Err(OrchestratorError::validation(format!(
                    "port {} is already assigned to another site",
                    port
                )));
            }
            return Ok(port);
        }

        if let Some(record) = existing {
            if !taken.contains(&record.port) {
                return Ok(record.port);
            }
        }

        let range = self.config.runtime.port_range_start..self.config.runtime.port_range_end;
        for port in range {
            if taken.contains(&port) {
                continue;
            }
            if !self.is_dry_run() && !is_port_available(port) {
                continue;
            }
            return Ok(port);
        }

        Err(OrchestratorError::Runtime(format!(
            "no free host port between {} and {}",
            self.config.runtime.port_range_start, self.config.runtime.port_range_end
        )))
    }

    // ==== Start / stop ====

    async fn set_running(
        &self,
        slug: &Slug,
        running: bool,
        store: &Persistence,
    ) -> Result<ActionResponse, OrchestratorError> {
        let container = slug.container_name();
        let requested = if running {
            SiteStatus::Running
        } else {
            SiteStatus::Stopped
        };
        info!(site = %slug, target = %requested, "Changing container state");

        let result = if running {
            self.runtime.start(&container).await
        } else {
            self.runtime.stop(&container).await
        };
        result.map_err(|e| OrchestratorError::Runtime(e.to_string()))?;

        let status = if self.is_dry_run() {
            requested
        } else {
            match self.runtime.state(&container).await {
                Ok(state) => status_from_state(state),
                Err(e) => {
                    warn!(site = %slug, error = %e, "Could not inspect container, recording requested state");
                    requested
                }
            }
        };
        if status != requested {
            warn!(site = %slug, requested = %requested, observed = %status, "Container state differs from request");
        }

        if !store.set_status(slug.as_str(), status).await? {
            warn!(site = %slug, "No stored record for site");
        }
        self.refresh_proxy(store).await?;

        let message = if running {
            "Website started"
        } else {
            "Website stopped"
        };
        Ok(ActionResponse::ok_with(
            message,
            json!({ "subdomain": slug.as_str(), "status": status }),
        ))
    }

    // ==== Delete ====

    async fn delete(&self, slug: &Slug, store: &Persistence) -> Result<ActionResponse, OrchestratorError> {
        let container = slug.container_name();
        let mut incomplete = 0usize;
        info!(site = %slug, "Deleting website");

        if let Err(e) = self.runtime.force_remove(&container).await {
            warn!(site = %slug, error = %e, "Failed to remove container");
            incomplete += 1;
        }
        if let Err(e) = self.runtime.remove_image(&container).await {
            warn!(site = %slug, error = %e, "Failed to remove image");
            incomplete += 1;
        }

        let workspace = self.config.workspace_for(slug.as_str());
        if workspace.exists() {
            if let Err(e) = std::fs::remove_dir_all(&workspace) {
                warn!(path = %workspace.display(), error = %e, "Failed to remove workspace");
                incomplete += 1;
            }
        }

        let existed = store.delete(slug.as_str()).await?;
        if !existed {
            warn!(site = %slug, "No stored record for site");
        }
        self.refresh_proxy(store).await?;

        Ok(ActionResponse::ok_with(
            "Website deleted",
            json!({ "subdomain": slug.as_str(), "incompleteSteps": incomplete }),
        ))
    }

    // ==== Queries ====

    async fn status(&self, slug: &Slug, store: &Persistence) -> Result<ActionResponse, OrchestratorError> {
        let status = if self.is_dry_run() {
            store
                .get(slug.as_str())
                .await?
                .map(|record| record.status)
                .unwrap_or(SiteStatus::NotFound)
        } else {
            let state = self
                .runtime
                .state(&slug.container_name())
                .await
                .map_err(|e| OrchestratorError::Runtime(e.to_string()))?;
            status_from_state(state)
        };

        Ok(ActionResponse::ok_with(
            status.as_str(),
            json!({ "subdomain": slug.as_str(), "status": status }),
        ))
    }

    async fn logs(&self, slug: &Slug, lines: usize) -> Result<ActionResponse, OrchestratorError> {
        let logs = self
            .runtime
            .logs(&slug.container_name(), lines)
            .await
            .map_err(|e| OrchestratorError::Runtime(e.to_string()))?;
        Ok(ActionResponse::ok_with(
            "Container logs",
            json!({ "subdomain": slug.as_str(), "logs": logs }),
        ))
    }

    /// The site's deployment log, or a placeholder before the first action
    fn deploy_log(&self, slug: &Slug) -> Result<ActionResponse, OrchestratorError> {
        let logs = sitelog::read(&self.config.paths.data_dir, slug.as_str())?
            .unwrap_or_else(|| sitelog::WAITING_FOR_DEPLOY.to_string());
        Ok(ActionResponse::ok_with(
            "Deployment log",
            json!({ "subdomain": slug.as_str(), "logs": logs }),
        ))
    }

    /// Rebuild the proxy map from the stored roster.
    ///
    /// Only a failure to read the roster is an error; the map write and the
    /// reload are logged and skipped so a committed change is never reported
    /// as failed.
    async fn refresh_proxy(&self, store: &Persistence) -> Result<(), OrchestratorError> {
        let roster = store.list().await?;
        match self.proxy.regenerate(&roster).await {
            Ok(update) => {
                info!(entries = update.entries, reloaded = update.reloaded, "Proxy map refreshed");
            }
            Err(e) => {
                error!(path = %self.proxy.path().display(), error = %e, "Failed to write proxy map");
            }
        }
        Ok(())
    }
}

fn status_from_state(state: ContainerState) -> SiteStatus {
    match state {
        ContainerState::Running => SiteStatus::Running,
        ContainerState::Stopped => SiteStatus::Stopped,
        ContainerState::NotFound => SiteStatus::NotFound,
    }
}

/// Check if a host port can be bound
fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}
