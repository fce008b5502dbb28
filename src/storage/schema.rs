use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    PgPool, SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::StoreError;

/// Target table for ingested news rows.
pub(crate) const NEWS_TABLE: &str = "daily_news";

// ============================================================================
// Database
// ============================================================================

/// Handle to the relational store.
///
/// The backend is picked from the connection string scheme. Cloning shares
/// the underlying pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) backend: Backend,
}

#[derive(Clone)]
pub(crate) enum Backend {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl std::fmt::Debug for Database {
    // Never print connect options: they carry the password.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("backend", &self.backend_name())
            .finish()
    }
}

impl Database {
    /// Connect to the store and make sure the news table exists.
    ///
    /// Accepted URLs: `sqlite:<path>`, `sqlite://<path>`, `sqlite::memory:`,
    /// `postgres://...` and `postgresql://...`. SQLite files are created if
    /// missing.
    ///
    /// # Errors
    ///
    /// - [`StoreError::UnsupportedScheme`] for any other scheme
    /// - [`StoreError::Connect`] if the store is unreachable or the URL is invalid
    /// - [`StoreError::Migration`] if the table cannot be created
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let backend = if url.starts_with("sqlite:") {
            Backend::Sqlite(connect_sqlite(url).await?)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Backend::Postgres(connect_postgres(url).await?)
        } else {
            let scheme = url.split(':').next().unwrap_or_default().to_string();
            return Err(StoreError::UnsupportedScheme(scheme));
        };

        let db = Self { backend };
        db.migrate()
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        tracing::debug!(backend = db.backend_name(), "Database ready");
        Ok(db)
    }

    /// [`Database::open`], retried once after `backoff` if the first attempt
    /// fails.
    ///
    /// A store that is still starting (a database container coming up next
    /// to this job) gets a second chance. An unsupported scheme is not
    /// retried.
    pub async fn open_with_retry(url: &str, backoff: Duration) -> Result<Self, StoreError> {
        match Self::open(url).await {
            Ok(db) => Ok(db),
            Err(e @ StoreError::UnsupportedScheme(_)) => Err(e),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "Store unavailable, retrying once"
                );
                tokio::time::sleep(backoff).await;
                Self::open(url).await
            }
        }
    }

    /// Short backend label for logs.
    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Sqlite(_) => "sqlite",
            Backend::Postgres(_) => "postgres",
        }
    }

    /// Close all pooled connections.
    pub async fn close(&self) {
        match &self.backend {
            Backend::Sqlite(pool) => pool.close().await,
            Backend::Postgres(pool) => pool.close().await,
        }
    }

    /// Create the news table and its indexes if they do not exist.
    ///
    /// Runs in one transaction; every statement is `IF NOT EXISTS`, so
    /// re-running against an existing database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let mut tx = pool.begin().await?;
                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {NEWS_TABLE} (
                        id INTEGER PRIMARY KEY,
                        dedup_key TEXT NOT NULL UNIQUE,
                        title TEXT NOT NULL,
                        link TEXT NOT NULL,
                        published_at TEXT,
                        summary TEXT,
                        ingested_at TEXT NOT NULL
                    )
                "#
                ))
                .execute(&mut *tx)
                .await?;
                sqlx::query(&format!(
                    "CREATE INDEX IF NOT EXISTS idx_{NEWS_TABLE}_published \
                     ON {NEWS_TABLE}(published_at DESC)"
                ))
                .execute(&mut *tx)
                .await?;
                tx.commit().await
            }
            Backend::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {NEWS_TABLE} (
                        id BIGSERIAL PRIMARY KEY,
                        dedup_key TEXT NOT NULL UNIQUE,
                        title TEXT NOT NULL,
                        link TEXT NOT NULL,
                        published_at TIMESTAMPTZ,
                        summary TEXT,
                        ingested_at TIMESTAMPTZ NOT NULL
                    )
                "#
                ))
                .execute(&mut *tx)
                .await?;
                sqlx::query(&format!(
                    "CREATE INDEX IF NOT EXISTS idx_{NEWS_TABLE}_published \
                     ON {NEWS_TABLE}(published_at DESC)"
                ))
                .execute(&mut *tx)
                .await?;
                tx.commit().await
            }
        }
    }
}

async fn connect_sqlite(url: &str) -> Result<SqlitePool, StoreError> {
    // busy_timeout=5000: a concurrent run holding the write lock makes us wait
    // up to 5 seconds instead of failing with SQLITE_BUSY.
    let options = SqliteConnectOptions::from_str(url)
        .map_err(StoreError::Connect)?
        .create_if_missing(true)
        .pragma("busy_timeout", "5000");

    // Every connection to an in-memory database is a separate database, so
    // keep exactly one alive for the life of the pool.
    let pool_options = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
    } else {
        // SQLite is single-writer; a sequential run needs very few connections.
        SqlitePoolOptions::new().max_connections(5)
    };

    pool_options
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .map_err(StoreError::Connect)
}

async fn connect_postgres(url: &str) -> Result<PgPool, StoreError> {
    let options = PgConnectOptions::from_str(url).map_err(StoreError::Connect)?;
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .map_err(StoreError::Connect)
}
