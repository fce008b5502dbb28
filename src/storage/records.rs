use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder, Sqlite};
use std::collections::HashSet;
use std::future::Future;

use super::schema::{Backend, Database, NEWS_TABLE};
use super::types::{NewsRecord, StoreError, StoredRecord};

/// Rows per INSERT statement. 6 columns * 50 = 300 bind parameters, well under
/// SQLite's limit.
const BATCH_SIZE: usize = 50;

/// The store capabilities the pipeline needs.
///
/// [`Database`] is the production implementation; tests substitute fakes to
/// script store failures.
pub trait NewsStore: Send + Sync {
    /// Returns the subset of `keys` already present, using one query.
    fn existing_keys(
        &self,
        keys: &[String],
    ) -> impl Future<Output = Result<HashSet<String>, StoreError>> + Send;

    /// Inserts `records` in a single transaction and returns how many rows
    /// were written.
    ///
    /// A key that already exists (for example inserted by a concurrent run) is
    /// skipped, not an error. Any other failure rolls back the whole batch.
    fn insert_new(
        &self,
        records: &[NewsRecord],
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;
}

impl NewsStore for Database {
    async fn existing_keys(&self, keys: &[String]) -> Result<HashSet<String>, StoreError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }

        let found: Vec<String> = match &self.backend {
            Backend::Sqlite(pool) => {
                let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                    "SELECT dedup_key FROM {NEWS_TABLE} WHERE dedup_key IN ("
                ));
                let mut separated = builder.separated(", ");
                for key in keys {
                    separated.push_bind(key);
                }
                separated.push_unseparated(")");
                builder.build_query_scalar().fetch_all(pool).await?
            }
            Backend::Postgres(pool) => {
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                    "SELECT dedup_key FROM {NEWS_TABLE} WHERE dedup_key IN ("
                ));
                let mut separated = builder.separated(", ");
                for key in keys {
                    separated.push_bind(key);
                }
                separated.push_unseparated(")");
                builder.build_query_scalar().fetch_all(pool).await?
            }
        };

        Ok(found.into_iter().collect())
    }

    async fn insert_new(&self, records: &[NewsRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        // One timestamp for the batch: rows from the same run sort together.
        let ingested_at = Utc::now();
        let mut inserted: u64 = 0;

        match &self.backend {
            Backend::Sqlite(pool) => {
                let mut tx = pool.begin().await?;
                for chunk in records.chunks(BATCH_SIZE) {
                    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(insert_prefix());
                    builder.push_values(chunk, |mut row, record| {
                        row.push_bind(&record.dedup_key)
                            .push_bind(&record.title)
                            .push_bind(&record.link)
                            .push_bind(record.published_at)
                            .push_bind(&record.summary)
                            .push_bind(ingested_at);
                    });
                    builder.push(" ON CONFLICT (dedup_key) DO NOTHING");
                    inserted += builder.build().execute(&mut *tx).await?.rows_affected();
                }
                tx.commit().await?;
            }
            Backend::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                for chunk in records.chunks(BATCH_SIZE) {
                    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(insert_prefix());
                    builder.push_values(chunk, |mut row, record| {
                        row.push_bind(&record.dedup_key)
                            .push_bind(&record.title)
                            .push_bind(&record.link)
                            .push_bind(record.published_at)
                            .push_bind(&record.summary)
                            .push_bind(ingested_at);
                    });
                    builder.push(" ON CONFLICT (dedup_key) DO NOTHING");
                    inserted += builder.build().execute(&mut *tx).await?.rows_affected();
                }
                tx.commit().await?;
            }
        }

        let inserted = inserted as usize;
        if inserted < records.len() {
            tracing::debug!(
                attempted = records.len(),
                inserted = inserted,
                "Some rows already present at insert time (concurrent run)"
            );
        }
        Ok(inserted)
    }
}

fn insert_prefix() -> String {
    format!(
        "INSERT INTO {NEWS_TABLE} (dedup_key, title, link, published_at, summary, ingested_at) "
    )
}

impl Database {
    // ========================================================================
    // Read-side helpers (verification, reporting)
    // ========================================================================

    /// Total number of stored news rows.
    pub async fn count_records(&self) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {NEWS_TABLE}");
        let count: i64 = match &self.backend {
            Backend::Sqlite(pool) => sqlx::query_scalar(&sql).fetch_one(pool).await?,
            Backend::Postgres(pool) => sqlx::query_scalar(&sql).fetch_one(pool).await?,
        };
        Ok(count)
    }

    /// Stored rows in insertion order, capped at `limit`.
    pub async fn list_records(&self, limit: i64) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query_as::<_, StoredRecord>(&format!(
                    "SELECT dedup_key, title, link, published_at, summary, ingested_at \
                     FROM {NEWS_TABLE} ORDER BY id LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(pool)
                .await?
            }
            Backend::Postgres(pool) => {
                sqlx::query_as::<_, StoredRecord>(&format!(
                    "SELECT dedup_key, title, link, published_at, summary, ingested_at \
                     FROM {NEWS_TABLE} ORDER BY id LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(pool)
                .await?
            }
        };
        Ok(rows)
    }

    /// Most recent ingestion timestamp, if any rows exist.
    pub async fn last_ingested_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let sql = format!("SELECT MAX(ingested_at) FROM {NEWS_TABLE}");
        let latest: Option<DateTime<Utc>> = match &self.backend {
            Backend::Sqlite(pool) => sqlx::query_scalar(&sql).fetch_one(pool).await?,
            Backend::Postgres(pool) => sqlx::query_scalar(&sql).fetch_one(pool).await?,
        };
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn test_db() -> Database {
        Database::open("sqlite::memory:").await.unwrap()
    }

    fn record(key: &str, title: &str) -> NewsRecord {
        NewsRecord {
            dedup_key: key.to_string(),
            title: title.to_string(),
            link: format!("https://example.com/{key}"),
            published_at: Some(Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap()),
            summary: Some(format!("Summary for {title}")),
        }
    }

    fn keys(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn sqlite_pool(db: &Database) -> &sqlx::SqlitePool {
        match &db.backend {
            Backend::Sqlite(pool) => pool,
            Backend::Postgres(_) => panic!("expected sqlite backend"),
        }
    }

    #[tokio::test]
    async fn test_insert_new_returns_inserted_count() {
        let db = test_db().await;
        let inserted = db
            .insert_new(&[record("a", "A"), record("b", "B")])
            .await
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(db.count_records().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_insert_empty_batch_is_noop() {
        let db = test_db().await;
        assert_eq!(db.insert_new(&[]).await.unwrap(), 0);
        assert_eq!(db.count_records().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_conflicting_key_is_skipped_not_error() {
        let db = test_db().await;
        db.insert_new(&[record("a", "A")]).await.unwrap();

        // "a" plays the row a concurrent run got in first.
        let inserted = db
            .insert_new(&[record("a", "A again"), record("b", "B")])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let rows = db.list_records(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        // Append-only: the original row is untouched.
        assert_eq!(rows[0].title, "A");
    }

    #[tokio::test]
    async fn test_existing_keys_returns_only_present() {
        let db = test_db().await;
        db.insert_new(&[record("a", "A"), record("c", "C")])
            .await
            .unwrap();

        let found = db.existing_keys(&keys(&["a", "b", "c", "d"])).await.unwrap();
        let expected: HashSet<String> = keys(&["a", "c"]).into_iter().collect();
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn test_existing_keys_empty_input() {
        let db = test_db().await;
        assert!(db.existing_keys(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_large_batch_spans_chunks() {
        let db = test_db().await;
        let batch: Vec<NewsRecord> = (0..(BATCH_SIZE * 2 + 7))
            .map(|i| record(&format!("k{i}"), &format!("Title {i}")))
            .collect();

        let inserted = db.insert_new(&batch).await.unwrap();
        assert_eq!(inserted, batch.len());
        assert_eq!(db.count_records().await.unwrap(), batch.len() as i64);
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_rows() {
        let db = test_db().await;
        let pool = sqlite_pool(&db);

        // Abort any insert of the poisoned title, mid-batch and in a later chunk.
        sqlx::query(&format!(
            "CREATE TRIGGER poison BEFORE INSERT ON {NEWS_TABLE} \
             WHEN NEW.title = 'poison' BEGIN SELECT RAISE(ABORT, 'poisoned row'); END"
        ))
        .execute(pool)
        .await
        .unwrap();

        let before = db.count_records().await.unwrap();

        let mut batch: Vec<NewsRecord> = (0..BATCH_SIZE + 5)
            .map(|i| record(&format!("k{i}"), &format!("Title {i}")))
            .collect();
        batch.push(record("bad", "poison"));

        let result = db.insert_new(&batch).await;
        assert!(matches!(result, Err(StoreError::Query(_))));

        let after = db.count_records().await.unwrap();
        assert_eq!(before, after, "no row of a failed batch may be committed");
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let db = test_db().await;
        let mut r = record("a", "Mixed Case Title");
        r.summary = None;
        r.published_at = None;
        db.insert_new(std::slice::from_ref(&r)).await.unwrap();

        let rows = db.list_records(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].dedup_key, "a");
        assert_eq!(rows[0].title, "Mixed Case Title");
        assert_eq!(rows[0].link, "https://example.com/a");
        assert_eq!(rows[0].published_at, None);
        assert_eq!(rows[0].summary, None);
    }

    #[tokio::test]
    async fn test_rows_in_one_batch_share_ingested_at() {
        let db = test_db().await;
        assert_eq!(db.last_ingested_at().await.unwrap(), None);

        db.insert_new(&[record("a", "A"), record("b", "B")])
            .await
            .unwrap();

        let rows = db.list_records(10).await.unwrap();
        assert_eq!(rows[0].ingested_at, rows[1].ingested_at);
        assert_eq!(
            db.last_ingested_at().await.unwrap(),
            Some(rows[0].ingested_at)
        );
    }
}
