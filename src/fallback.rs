//! Local JSON site store
//!
//! `sites.json` holds the whole roster as one JSON array. It is written on
//! every mutation whether or not a primary store is reachable, and serves
//! reads when the primary is not. Every read-modify-write runs under an
//! advisory lock and replaces the file atomically.

use crate::lock::FileLock;
use crate::store::{sort_newest_first, SiteDraft, SiteRecord, SiteStatus, SiteStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// File name of the fallback roster inside the data directory
pub const FALLBACK_FILE: &str = "sites.json";

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FallbackStore {
    path: PathBuf,
}

impl FallbackStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(FALLBACK_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }

    /// Read the roster; a missing or unreadable file reads as empty
    fn read(&self) -> Result<Vec<SiteRecord>, StoreError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn read_or_empty(&self) -> Result<Vec<SiteRecord>, StoreError> {
        match self.read() {
            Err(StoreError::Serialisation(e)) => {
                warn!(path = %self.path.display(), error = %e, "Fallback store is corrupt, reading as empty");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Move a corrupt file aside so the next write starts clean
    fn quarantine(&self) -> Result<(), StoreError> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let aside = self
            .path
            .with_extension(format!("json.corrupt-{}", stamp));
        std::fs::rename(&self.path, &aside)?;
        warn!(
            path = %self.path.display(),
            moved_to = %aside.display(),
            "Fallback store was corrupt, starting from an empty roster"
        );
        Ok(())
    }

    fn write(&self, records: &[SiteRecord]) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let json = serde_json::to_string_pretty(records)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        debug!(path = %self.path.display(), count = records.len(), "Fallback store written");
        Ok(())
    }

    /// Locked read-modify-write of the whole roster
    async fn modify<T>(
        &self,
        apply: impl FnOnce(&mut Vec<SiteRecord>) -> T,
    ) -> Result<T, StoreError> {
        let _lock = FileLock::acquire(self.lock_path(), LOCK_TIMEOUT)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut records = match self.read() {
            Ok(records) => records,
            Err(StoreError::Serialisation(_)) => {
                self.quarantine()?;
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let result = apply(&mut records);
        sort_newest_first(&mut records);
        self.write(&records)?;
        Ok(result)
    }

    /// Store `record` exactly as given, replacing any with the same subdomain.
    ///
    /// Used to mirror the primary store's authoritative result.
    pub async fn put(&self, record: &SiteRecord) -> Result<(), StoreError> {
        self.modify(|records| {
            match records.iter_mut().find(|r| r.subdomain == record.subdomain) {
                Some(existing) => *existing = record.clone(),
                None => records.push(record.clone()),
            }
        })
        .await
    }

    /// Replace the whole roster with a copy of the primary store's
    pub async fn replace_all(&self, records: &[SiteRecord]) -> Result<(), StoreError> {
        self.modify(|current| *current = records.to_vec()).await
    }
}

#[async_trait]
impl SiteStore for FallbackStore {
    fn backend(&self) -> &'static str {
        "json"
    }

    async fn get(&self, subdomain: &str) -> Result<Option<SiteRecord>, StoreError> {
        Ok(self
            .read_or_empty()?
            .into_iter()
            .find(|r| r.subdomain == subdomain))
    }

    async fn list(&self) -> Result<Vec<SiteRecord>, StoreError> {
        let mut records = self.read_or_empty()?;
        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn upsert(&self, draft: &SiteDraft) -> Result<SiteRecord, StoreError> {
        self.modify(|records| {
            if let Some(existing) = records.iter_mut().find(|r| r.subdomain == draft.subdomain) {
                existing.status = draft.status;
                existing.port = draft.port;
                return existing.clone();
            }

            let id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
            let record = SiteRecord {
                id,
                name: draft.name.clone(),
                subdomain: draft.subdomain.clone(),
                stack: draft.stack,
                port: draft.port,
                status: draft.status,
                created_at: Utc::now(),
            };
            records.push(record.clone());
            record
        })
        .await
    }

    async fn set_status(&self, subdomain: &str, status: SiteStatus) -> Result<bool, StoreError> {
        self.modify(|records| {
            match records.iter_mut().find(|r| r.subdomain == subdomain) {
                Some(record) => {
                    record.status = status;
                    true
                }
                None => false,
            }
        })
        .await
    }

    async fn delete(&self, subdomain: &str) -> Result<bool, StoreError> {
        self.modify(|records| {
            let before = records.len();
            records.retain(|r| r.subdomain != subdomain);
            records.len() != before
        })
        .await
    }
}
