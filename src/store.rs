//! Site records and the storage capability shared by every backend
//!
//! Authoritative backends ([`crate::db::SqliteStore`],
//! [`crate::postgres::PostgresStore`]) and the local JSON mirror
//! ([`crate::fallback::FallbackStore`]) all implement [`SiteStore`].

use crate::stack::Stack;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Last-known runtime state of a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    Running,
    Stopped,
    NotFound,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteStatus::Running => "running",
            SiteStatus::Stopped => "stopped",
            SiteStatus::NotFound => "not_found",
        }
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown site status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for SiteStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SiteStatus::Running),
            "stopped" => Ok(SiteStatus::Stopped),
            "not_found" => Ok(SiteStatus::NotFound),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One provisioned site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub id: i64,
    pub name: String,
    pub subdomain: String,
    pub stack: Stack,
    pub port: u16,
    pub status: SiteStatus,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by a create; the store assigns id and creation time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteDraft {
    pub name: String,
    pub subdomain: String,
    pub stack: Stack,
    pub port: u16,
    pub status: SiteStatus,
}

/// Aggregate counts over the roster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterStats {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
}

impl RosterStats {
    pub fn from_records(records: &[SiteRecord]) -> Self {
        Self {
            total: records.len(),
            running: records
                .iter()
                .filter(|r| r.status == SiteStatus::Running)
                .count(),
            stopped: records
                .iter()
                .filter(|r| r.status == SiteStatus::Stopped)
                .count(),
        }
    }
}

/// Sort newest first, ties broken by id
pub fn sort_newest_first(records: &mut [SiteRecord]) {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not connect to store: {0}")]
    Connection(String),

    #[error("store did not answer within {0:?}")]
    Timeout(Duration),

    #[error("store query failed: {0}")]
    Backend(String),

    #[error("invalid stored data: {0}")]
    Serialisation(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialisation(err.to_string())
    }
}

/// Storage capability for site records
#[async_trait]
pub trait SiteStore: Send + Sync {
    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    async fn get(&self, subdomain: &str) -> Result<Option<SiteRecord>, StoreError>;

    /// All records, newest first
    async fn list(&self) -> Result<Vec<SiteRecord>, StoreError>;

    /// Insert, or update status and port of the record with the same subdomain.
    ///
    /// Id, name, stack and creation time of an existing record are kept.
    async fn upsert(&self, draft: &SiteDraft) -> Result<SiteRecord, StoreError>;

    /// Returns false when no record matched
    async fn set_status(&self, subdomain: &str, status: SiteStatus) -> Result<bool, StoreError>;

    /// Returns false when no record matched
    async fn delete(&self, subdomain: &str) -> Result<bool, StoreError>;

    async fn stats(&self) -> Result<RosterStats, StoreError> {
        Ok(RosterStats::from_records(&self.list().await?))
    }

    /// Release connections; the store must not be used afterwards
    async fn close(&self) {}
}

/// Open the authoritative store named by `url`.
///
/// `postgres://` and `postgresql://` URLs are connected within `deadline`;
/// when the deadline passes the connection future is dropped. `sqlite:` URLs
/// open a local database file.
pub async fn connect_primary(url: &str, deadline: Duration) -> Result<Box<dyn SiteStore>, StoreError> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        debug!(deadline_ms = deadline.as_millis() as u64, "Connecting to postgres");
        let store = tokio::time::timeout(deadline, crate::postgres::PostgresStore::connect(url, deadline))
            .await
            .map_err(|_| StoreError::Timeout(deadline))??;
        return Ok(Box::new(store));
    }

    if let Some(path) = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
    {
        let store = crate::db::SqliteStore::open(path)?;
        return Ok(Box::new(store));
    }

    Err(StoreError::Connection(format!(
        "unsupported database URL scheme in '{}'",
        redact_url(url)
    )))
}

/// Strip credentials from a URL before it reaches a log line
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
