use chrono::{DateTime, Utc};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Store errors with enough context to tell connection trouble from bad SQL.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection string names a backend we do not speak
    #[error("Unsupported database URL scheme: {0} (expected sqlite: or postgres://)")]
    UnsupportedScheme(String),

    /// Could not connect (or reconnect) to the store
    #[error("Database connection failed: {0}")]
    Connect(#[source] sqlx::Error),

    /// Schema creation failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Query or transaction failure
    #[error("Database error: {0}")]
    Query(#[from] sqlx::Error),
}

// ============================================================================
// Data Structures
// ============================================================================

/// A mapped feed item ready to be inserted.
///
/// `ingested_at` is not part of the record: the loader stamps it when the
/// row is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewsRecord {
    pub dedup_key: String,
    pub title: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}

/// A row read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredRecord {
    pub dedup_key: String,
    pub title: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub ingested_at: DateTime<Utc>,
}
