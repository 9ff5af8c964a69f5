//! Source acquisition
//!
//! Populates a site's workspace from a template, a git clone or an uploaded
//! archive.

use crate::error::OrchestratorError;
use crate::exec::{CommandRunner, CommandSpec};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// An uploaded archive that is deleted when dropped
#[derive(Debug)]
pub struct TempArchive {
    path: PathBuf,
}

impl TempArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Take ownership of an upload, which must be a file inside `upload_dir`.
///
/// Anything else is rejected and left where it is.
pub fn claim_upload(path: &Path, upload_dir: &Path) -> Result<TempArchive, OrchestratorError> {
    let rejected = || OrchestratorError::validation("archivePath must name a file in the upload directory");

    let root = upload_dir.canonicalize().map_err(|_| rejected())?;
    let file = path.canonicalize().map_err(|_| rejected())?;
    if !file.starts_with(&root) || !file.is_file() {
        return Err(rejected());
    }
    Ok(TempArchive::new(file))
}

impl Drop for TempArchive {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed uploaded archive"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove uploaded archive"),
        }
    }
}

/// Where a site's files come from
#[derive(Debug)]
pub enum SourceSpec {
    /// Starter files generated by the builder
    Template,
    /// Shallow clone of a remote repository
    Git { repo_url: String },
    /// Extraction of an uploaded archive
    Archive(TempArchive),
}

impl SourceSpec {
    /// Build a source from the request fields.
    ///
    /// Without an explicit type a repository URL selects git and an archive
    /// selects extraction. An unused archive is still dropped, and so removed.
    pub fn from_request(
        source_type: Option<&str>,
        repo_url: Option<String>,
        archive: Option<TempArchive>,
    ) -> Result<Self, OrchestratorError> {
        let kind = match source_type.map(str::trim).filter(|s| !s.is_empty()) {
            Some(kind) => kind.to_ascii_lowercase(),
            None if repo_url.is_some() => "git".to_string(),
            None if archive.is_some() => "archive".to_string(),
            None => "template".to_string(),
        };

        match kind.as_str() {
            "template" => Ok(SourceSpec::Template),
            "git" => {
                let repo_url = repo_url
                    .ok_or_else(|| OrchestratorError::validation("repoUrl is required for git sources"))?;
                validate_repo_url(&repo_url)?;
                Ok(SourceSpec::Git { repo_url })
            }
            "archive" | "zip" | "upload" => archive
                .map(SourceSpec::Archive)
                .ok_or_else(|| OrchestratorError::validation("archivePath is required for archive sources")),
            other => Err(OrchestratorError::validation(format!(
                "unknown sourceType '{}'",
                other
            ))),
        }
    }

    pub fn is_template(&self) -> bool {
        matches!(self, SourceSpec::Template)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceSpec::Template => "template",
            SourceSpec::Git { .. } => "git",
            SourceSpec::Archive(_) => "archive",
        }
    }
}

/// Reject URLs git could read as options or local paths
fn validate_repo_url(url: &str) -> Result<(), OrchestratorError> {
    const SCHEMES: [&str; 4] = ["https://", "http://", "ssh://", "git://"];

    if url.starts_with('-') || url.chars().any(char::is_whitespace) {
        return Err(OrchestratorError::validation("repoUrl is not a valid repository URL"));
    }
    if SCHEMES
        .iter()
        .any(|s| url.strip_prefix(s).is_some_and(|rest| !rest.is_empty()))
    {
        return Ok(());
    }
    if let Some((user_host, path)) = url.split_once(':') {
        if user_host.contains('@') && !user_host.contains('/') && !path.is_empty() {
            return Ok(());
        }
    }
    Err(OrchestratorError::validation(
        "repoUrl must be an https, http, ssh or git URL",
    ))
}

/// Create the workspace directory if it does not exist
pub fn prepare_workspace(workspace: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(workspace)?;
    debug!(path = %workspace.display(), "Workspace ready");
    Ok(())
}

/// Archive formats we know how to unpack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveFormat {
    fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }
}

/// Populate `workspace` from `source`
pub async fn acquire(
    runner: &dyn CommandRunner,
    source: &SourceSpec,
    workspace: &Path,
) -> Result<(), OrchestratorError> {
    match source {
        SourceSpec::Template => {
            debug!("Template source, nothing to fetch");
            Ok(())
        }
        SourceSpec::Git { repo_url } => clone_repo(runner, repo_url, workspace).await,
        SourceSpec::Archive(archive) => extract_archive(runner, archive.path(), workspace).await,
    }
}

async fn clone_repo(
    runner: &dyn CommandRunner,
    repo_url: &str,
    workspace: &Path,
) -> Result<(), OrchestratorError> {
    // git refuses to clone into a non-empty directory
    if !runner.is_dry_run() && dir_has_entries(workspace) {
        info!(path = %workspace.display(), "Clearing workspace before clone");
        std::fs::remove_dir_all(workspace)?;
        prepare_workspace(workspace)?;
    }

    info!(repo = %repo_url, "Cloning repository");
    let spec = CommandSpec::new("git").args([
        "clone".to_string(),
        "--depth".to_string(),
        "1".to_string(),
        "--".to_string(),
        repo_url.to_string(),
        workspace.to_string_lossy().into_owned(),
    ]);
    runner
        .run(&spec)
        .await
        .map(|_| ())
        .map_err(|e| OrchestratorError::Acquisition(e.to_string()))
}

async fn extract_archive(
    runner: &dyn CommandRunner,
    archive: &Path,
    workspace: &Path,
) -> Result<(), OrchestratorError> {
    if !archive.is_file() {
        return Err(OrchestratorError::Acquisition(format!(
            "archive {} does not exist",
            archive.display()
        )));
    }
    let format = ArchiveFormat::from_path(archive).ok_or_else(|| {
        OrchestratorError::Acquisition(format!(
            "unsupported archive type: {}",
            archive.display()
        ))
    })?;

    let archive_arg = archive.to_string_lossy().into_owned();
    let workspace_arg = workspace.to_string_lossy().into_owned();
    let spec = match format {
        ArchiveFormat::Zip => {
            CommandSpec::new("unzip").args(["-o", "-q", &archive_arg, "-d", &workspace_arg])
        }
        ArchiveFormat::TarGz => {
            CommandSpec::new("tar").args(["-xzf", &archive_arg, "-C", &workspace_arg])
        }
        ArchiveFormat::Tar => {
            CommandSpec::new("tar").args(["-xf", &archive_arg, "-C", &workspace_arg])
        }
    };

    info!(archive = %archive.display(), format = ?format, "Extracting archive");
    runner
        .run(&spec)
        .await
        .map(|_| ())
        .map_err(|e| OrchestratorError::Acquisition(e.to_string()))
}

fn dir_has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
