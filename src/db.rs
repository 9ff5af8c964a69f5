//! SQLite site store
//!
//! Local authoritative backend, selected with a `sqlite:` database URL.

use crate::stack::Stack;
use crate::store::{sort_newest_first, SiteDraft, SiteRecord, SiteStatus, SiteStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

const SELECT_COLUMNS: &str = "SELECT id, name, subdomain, stack, port, status, created_at FROM websites";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Site store backed by a SQLite file
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(|e| StoreError::Connection(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection mutex poisoned".to_string()))
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: websites table
    fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
        debug!("Applying migration v1: websites table");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS websites (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                subdomain TEXT NOT NULL UNIQUE,
                stack TEXT NOT NULL DEFAULT 'static',
                port INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_websites_created ON websites(created_at);

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<SiteRecord> {
    let stack: String = row.get(3)?;
    let status: String = row.get(5)?;
    Ok(SiteRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        subdomain: row.get(2)?,
        stack: stack
            .parse::<Stack>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        port: row.get(4)?,
        status: status
            .parse::<SiteStatus>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        created_at: row.get(6)?,
    })
}

#[async_trait]
impl SiteStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, subdomain: &str) -> Result<Option<SiteRecord>, StoreError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("{} WHERE subdomain = ?1", SELECT_COLUMNS),
                params![subdomain],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<SiteRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(SELECT_COLUMNS)?;
        let mut records = stmt
            .query_map([], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn upsert(&self, draft: &SiteDraft) -> Result<SiteRecord, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO websites (name, subdomain, stack, port, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(subdomain) DO UPDATE SET
                status = excluded.status,
                port = excluded.port",
            params![
                draft.name,
                draft.subdomain,
                draft.stack.as_str(),
                draft.port,
                draft.status.as_str(),
                Utc::now(),
            ],
        )?;

        let record = conn.query_row(
            &format!("{} WHERE subdomain = ?1", SELECT_COLUMNS),
            params![draft.subdomain],
            row_to_record,
        )?;
        debug!(site = %record.subdomain, id = record.id, "Upserted site record");
        Ok(record)
    }

    async fn set_status(&self, subdomain: &str, status: SiteStatus) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE websites SET status = ?1 WHERE subdomain = ?2",
            params![status.as_str(), subdomain],
        )?;
        Ok(rows > 0)
    }

    async fn delete(&self, subdomain: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "DELETE FROM websites WHERE subdomain = ?1",
            params![subdomain],
        )?;
        Ok(rows > 0)
    }
}
