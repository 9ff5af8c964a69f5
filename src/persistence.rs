//! Primary store with an always-written local mirror
//!
//! Writes go to the primary store when one is connected, then its full roster
//! is copied over the JSON fallback. Reads prefer the primary and drop back to
//! the fallback on any error. Only a failure of the fallback itself is
//! returned to the caller.

use crate::config::Config;
use crate::fallback::FallbackStore;
use crate::store::{
    connect_primary, redact_url, RosterStats, SiteDraft, SiteRecord, SiteStatus, SiteStore,
    StoreError,
};
use tracing::{info, warn};

pub struct Persistence {
    primary: Option<Box<dyn SiteStore>>,
    fallback: FallbackStore,
}

impl Persistence {
    /// Connect the configured primary store, if any, within the connect deadline.
    ///
    /// An unreachable primary is logged and the invocation continues in
    /// fallback-only mode.
    pub async fn open(config: &Config) -> Self {
        let fallback = FallbackStore::new(&config.paths.data_dir);

        let primary = match config.store.database_url.as_deref() {
            None => {
                info!("No database configured, using local fallback store only");
                None
            }
            Some(url) => match connect_primary(url, config.store.connect_timeout()).await {
                Ok(store) => {
                    info!(backend = store.backend(), "Primary store connected");
                    Some(store)
                }
                Err(e) => {
                    warn!(
                        url = %redact_url(url),
                        error = %e,
                        "Primary store unreachable, continuing with local fallback store"
                    );
                    None
                }
            },
        };

        Self { primary, fallback }
    }

    pub fn with_stores(primary: Option<Box<dyn SiteStore>>, fallback: FallbackStore) -> Self {
        Self { primary, fallback }
    }

    /// True when no primary store is connected
    pub fn is_degraded(&self) -> bool {
        self.primary.is_none()
    }

    pub fn fallback(&self) -> &FallbackStore {
        &self.fallback
    }

    // ==== Reads ====

    pub async fn get(&self, subdomain: &str) -> Result<Option<SiteRecord>, StoreError> {
        if let Some(primary) = &self.primary {
            match primary.get(subdomain).await {
                Ok(record) => return Ok(record),
                Err(e) => warn!(site = %subdomain, error = %e, "Primary read failed, using fallback"),
            }
        }
        self.fallback.get(subdomain).await
    }

    pub async fn list(&self) -> Result<Vec<SiteRecord>, StoreError> {
        if let Some(primary) = &self.primary {
            match primary.list().await {
                Ok(records) => return Ok(records),
                Err(e) => warn!(error = %e, "Primary roster read failed, using fallback"),
            }
        }
        self.fallback.list().await
    }

    pub async fn stats(&self) -> Result<RosterStats, StoreError> {
        if let Some(primary) = &self.primary {
            match primary.stats().await {
                Ok(stats) => return Ok(stats),
                Err(e) => warn!(error = %e, "Primary stats read failed, using fallback"),
            }
        }
        self.fallback.stats().await
    }

    // ==== Writes ====

    /// Copy the primary roster over the fallback; false if it could not be read
    async fn mirror_roster(&self, primary: &dyn SiteStore) -> Result<bool, StoreError> {
        match primary.list().await {
            Ok(records) => {
                self.fallback.replace_all(&records).await?;
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "Primary roster read failed, mirroring the changed row only");
                Ok(false)
            }
        }
    }

    /// Record a created site in both stores
    pub async fn upsert(&self, draft: &SiteDraft) -> Result<SiteRecord, StoreError> {
        if let Some(primary) = &self.primary {
            match primary.upsert(draft).await {
                Ok(record) => {
                    if !self.mirror_roster(primary.as_ref()).await? {
                        self.fallback.put(&record).await?;
                    }
                    return Ok(record);
                }
                Err(e) => warn!(site = %draft.subdomain, error = %e, "Primary upsert failed"),
            }
        }
        self.fallback.upsert(draft).await
    }

    /// Update a site's status in both stores; false if neither knew the site
    pub async fn set_status(&self, subdomain: &str, status: SiteStatus) -> Result<bool, StoreError> {
        if let Some(primary) = &self.primary {
            match primary.set_status(subdomain, status).await {
                Ok(true) => {
                    if !self.mirror_roster(primary.as_ref()).await? {
                        self.fallback.set_status(subdomain, status).await?;
                    }
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => warn!(site = %subdomain, error = %e, "Primary status update failed"),
            }
        }
        self.fallback.set_status(subdomain, status).await
    }

    /// Remove a site from both stores; false if neither knew the site
    pub async fn delete(&self, subdomain: &str) -> Result<bool, StoreError> {
        let Some(primary) = &self.primary else {
            return self.fallback.delete(subdomain).await;
        };

        let deleted = match primary.delete(subdomain).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(site = %subdomain, error = %e, "Primary delete failed");
                return self.fallback.delete(subdomain).await;
            }
        };

        let mirrored = self.fallback.delete(subdomain).await?;
        self.mirror_roster(primary.as_ref()).await?;
        Ok(deleted || mirrored)
    }

    /// Release the primary connection
    pub async fn close(self) {
        if let Some(primary) = self.primary {
            primary.close().await;
            info!(backend = primary.backend(), "Primary store closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::stack::Stack;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// A primary whose every call fails
    struct BrokenStore;

    #[async_trait]
    impl SiteStore for BrokenStore {
        fn backend(&self) -> &'static str {
            "broken"
        }
        async fn get(&self, _: &str) -> Result<Option<SiteRecord>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn list(&self) -> Result<Vec<SiteRecord>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn upsert(&self, _: &SiteDraft) -> Result<SiteRecord, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn set_status(&self, _: &str, _: SiteStatus) -> Result<bool, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
    }

    fn draft(subdomain: &str) -> SiteDraft {
        SiteDraft {
            name: subdomain.to_string(),
            subdomain: subdomain.to_string(),
            stack: Stack::Static,
            port: 10000,
            status: SiteStatus::Running,
        }
    }

    #[tokio::test]
    async fn test_writes_are_mirrored_to_fallback() {
        let dir = TempDir::new().unwrap();
        let primary = SqliteStore::open(dir.path().join("primary.db")).unwrap();
        let persistence =
            Persistence::with_stores(Some(Box::new(primary)), FallbackStore::new(dir.path()));

        let record = persistence.upsert(&draft("demo")).await.unwrap();
        assert_eq!(
            persistence.fallback().get("demo").await.unwrap(),
            Some(record.clone())
        );

        persistence.set_status("demo", SiteStatus::Stopped).await.unwrap();
        assert_eq!(
            persistence.fallback().get("demo").await.unwrap().unwrap().status,
            SiteStatus::Stopped
        );

        assert!(persistence.delete("demo").await.unwrap());
        assert!(persistence.fallback().list().await.unwrap().is_empty());
        persistence.close().await;
    }

    #[tokio::test]
    async fn test_primary_write_replaces_stale_fallback_roster() {
        let dir = TempDir::new().unwrap();
        let fallback = FallbackStore::new(dir.path());
        fallback.upsert(&draft("stale")).await.unwrap();

        let primary = SqliteStore::open(dir.path().join("primary.db")).unwrap();
        let persistence = Persistence::with_stores(Some(Box::new(primary)), fallback);
        persistence.upsert(&draft("demo")).await.unwrap();

        let mirrored = persistence.fallback().list().await.unwrap();
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0].subdomain, "demo");
    }

    #[tokio::test]
    async fn test_failing_primary_degrades_to_fallback() {
        let dir = TempDir::new().unwrap();
        let persistence =
            Persistence::with_stores(Some(Box::new(BrokenStore)), FallbackStore::new(dir.path()));

        let record = persistence.upsert(&draft("demo")).await.unwrap();
        assert_eq!(record.id, 1);
        assert!(persistence.set_status("demo", SiteStatus::Stopped).await.unwrap());

        let listed = persistence.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, SiteStatus::Stopped);
        assert_eq!(persistence.stats().await.unwrap().stopped, 1);
        assert!(persistence.get("demo").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_open_without_database_is_degraded() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.data_dir = dir.path().to_path_buf();

        let persistence = Persistence::open(&config).await;
        assert!(persistence.is_degraded());
        persistence.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_primary_is_degraded() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let mut config = Config::default();
        config.paths.data_dir = dir.path().to_path_buf();
        config.store.database_url = Some(format!("sqlite:{}/sites.db", blocker.display()));

        let persistence = Persistence::open(&config).await;
        assert!(persistence.is_degraded());
    }
}
