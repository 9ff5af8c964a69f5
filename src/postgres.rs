//! PostgreSQL site store
//!
//! The shared authoritative backend, used when `DATABASE_URL` is a postgres
//! URL and the server answers within the connect deadline.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::stack::Stack;
use crate::store::{SiteDraft, SiteRecord, SiteStatus, SiteStore, StoreError};

const SELECT_COLUMNS: &str = "SELECT id, name, subdomain, stack, port, status, created_at FROM websites";

fn backend_error(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Site store backed by a small PostgreSQL pool
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and make sure the `websites` table exists.
    pub async fn connect(url: &str, acquire_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.ensure_table().await?;

        info!("Connected to postgres site store");
        Ok(store)
    }

    async fn ensure_table(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS websites (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                subdomain TEXT NOT NULL UNIQUE,
                stack TEXT NOT NULL DEFAULT 'static',
                port INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;

        // Tables created by older dashboards have no stack column
        sqlx::query("ALTER TABLE websites ADD COLUMN IF NOT EXISTS stack TEXT NOT NULL DEFAULT 'static'")
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;

        Ok(())
    }
}

fn row_to_record(row: &PgRow) -> Result<SiteRecord, StoreError> {
    let stack: String = row.try_get("stack").map_err(backend_error)?;
    let status: String = row.try_get("status").map_err(backend_error)?;
    let port: i32 = row.try_get("port").map_err(backend_error)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(backend_error)?;

    Ok(SiteRecord {
        id: row.try_get("id").map_err(backend_error)?,
        name: row.try_get("name").map_err(backend_error)?,
        subdomain: row.try_get("subdomain").map_err(backend_error)?,
        stack: stack
            .parse::<Stack>()
            .map_err(|e| StoreError::Serialisation(e.to_string()))?,
        port: u16::try_from(port)
            .map_err(|_| StoreError::Serialisation(format!("port {} out of range", port)))?,
        status: status
            .parse::<SiteStatus>()
            .map_err(|e| StoreError::Serialisation(e.to_string()))?,
        created_at,
    })
}

#[async_trait]
impl SiteStore for PostgresStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn get(&self, subdomain: &str) -> Result<Option<SiteRecord>, StoreError> {
        let row = sqlx::query(&format!("{} WHERE subdomain = $1", SELECT_COLUMNS))
            .bind(subdomain)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_error)?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn list(&self) -> Result<Vec<SiteRecord>, StoreError> {
        let rows = sqlx::query(&format!("{} ORDER BY created_at DESC, id DESC", SELECT_COLUMNS))
            .fetch_all(&self.pool)
            .await
            .map_err(backend_error)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn upsert(&self, draft: &SiteDraft) -> Result<SiteRecord, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO websites (name, subdomain, stack, port, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (subdomain) DO UPDATE SET
                status = EXCLUDED.status,
                port = EXCLUDED.port
            RETURNING id, name, subdomain, stack, port, status, created_at
            "#,
        )
        .bind(&draft.name)
        .bind(&draft.subdomain)
        .bind(draft.stack.as_str())
        .bind(i32::from(draft.port))
        .bind(draft.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(backend_error)?;

        let record = row_to_record(&row)?;
        debug!(site = %record.subdomain, id = record.id, "Upserted site record");
        Ok(record)
    }

    async fn set_status(&self, subdomain: &str, status: SiteStatus) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE websites SET status = $1 WHERE subdomain = $2")
            .bind(status.as_str())
            .bind(subdomain)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, subdomain: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM websites WHERE subdomain = $1")
            .bind(subdomain)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn close(&self) {
        self.pool.close().await;
        debug!("Postgres pool closed");
    }
}
