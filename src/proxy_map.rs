//! nginx subdomain map generation
//!
//! The map file is always rebuilt from the full roster and swapped into place
//! atomically, then the proxy is asked to reload.

use crate::exec::{CommandRunner, CommandSpec};
use crate::store::SiteRecord;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Render the map file for `roster`, one line per subdomain in sorted order
pub fn render(roster: &[SiteRecord], generated_at: DateTime<Utc>) -> String {
    let entries: BTreeMap<&str, u16> = roster
        .iter()
        .map(|site| (site.subdomain.as_str(), site.port))
        .collect();

    let mut content = format!(
        "# Auto-generated by siteforge, do not edit\n# Last updated: {}\n\nmap $subdomain $target_port {{\n    default 0;\n",
        generated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    for (subdomain, port) in entries {
        content.push_str(&format!("    {} {};\n", subdomain, port));
    }
    content.push_str("}\n");
    content
}

/// Replace `path` with `content` without exposing a partial file
fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Result of a regeneration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyUpdate {
    pub entries: usize,
    pub reloaded: bool,
}

/// Writes the map file and reloads the proxy
pub struct ProxyMap {
    path: PathBuf,
    reload_command: Vec<String>,
    runner: Arc<dyn CommandRunner>,
}

impl ProxyMap {
    pub fn new(path: impl Into<PathBuf>, reload_command: Vec<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            path: path.into(),
            reload_command,
            runner,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the map for `roster` and reload the proxy.
    ///
    /// A failed write is an error; a failed reload is only logged.
    pub async fn regenerate(&self, roster: &[SiteRecord]) -> std::io::Result<ProxyUpdate> {
        let content = render(roster, Utc::now());
        write_atomic(&self.path, &content)?;
        info!(path = %self.path.display(), entries = roster.len(), "Proxy map updated");

        let reloaded = self.reload().await;
        Ok(ProxyUpdate {
            entries: roster.len(),
            reloaded,
        })
    }

    async fn reload(&self) -> bool {
        if self.runner.is_dry_run() {
            info!("Safe mode, skipping proxy reload");
            return false;
        }
        let Some((program, args)) = self.reload_command.split_first() else {
            warn!("No proxy reload command configured");
            return false;
        };

        let spec = CommandSpec::new(program).args(args.iter().cloned());
        match self.runner.run(&spec).await {
            Ok(_) => {
                info!("Proxy reloaded");
                true
            }
            Err(e) => {
                warn!(error = %e, "Proxy reload failed, map file is updated but not live");
                false
            }
        }
    }
}
