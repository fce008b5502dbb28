use std::collections::HashSet;

use crate::storage::{NewsRecord, NewsStore, StoreError};

/// Records split by whether they still need loading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupOutcome {
    /// Records to insert, in their original order.
    pub fresh: Vec<NewsRecord>,
    /// Later copies of a key that appeared earlier in the same batch.
    pub duplicates_in_batch: usize,
    /// Records whose key the store already holds.
    pub already_present: usize,
}

/// Drops intra-batch duplicates (first occurrence wins), then drops records
/// the store already has.
///
/// Issues at most one existence query regardless of batch size.
pub async fn filter_new<S: NewsStore>(
    records: Vec<NewsRecord>,
    store: &S,
) -> Result<DedupOutcome, StoreError> {
    let total = records.len();
    let mut seen = HashSet::with_capacity(total);
    let unique: Vec<NewsRecord> = records
        .into_iter()
        .filter(|r| seen.insert(r.dedup_key.clone()))
        .collect();
    let duplicates_in_batch = total - unique.len();

    if unique.is_empty() {
        return Ok(DedupOutcome {
            duplicates_in_batch,
            ..DedupOutcome::default()
        });
    }

    let keys: Vec<String> = unique.iter().map(|r| r.dedup_key.clone()).collect();
    let existing = store.existing_keys(&keys).await?;

    let fresh: Vec<NewsRecord> = unique
        .into_iter()
        .filter(|r| !existing.contains(&r.dedup_key))
        .collect();
    let already_present = keys.len() - fresh.len();

    tracing::debug!(
        fresh = fresh.len(),
        duplicates_in_batch = duplicates_in_batch,
        already_present = already_present,
        "Deduplicated batch"
    );

    Ok(DedupOutcome {
        fresh,
        duplicates_in_batch,
        already_present,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store with a fixed key set that counts existence queries.
    #[derive(Default)]
    struct KeySetStore {
        keys: HashSet<String>,
        queries: AtomicUsize,
    }

    impl NewsStore for KeySetStore {
        async fn existing_keys(&self, keys: &[String]) -> Result<HashSet<String>, StoreError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(keys
                .iter()
                .filter(|k| self.keys.contains(*k))
                .cloned()
                .collect())
        }

        async fn insert_new(&self, records: &[NewsRecord]) -> Result<usize, StoreError> {
            Ok(records.len())
        }
    }

    fn record(key: &str, title: &str) -> NewsRecord {
        NewsRecord {
            dedup_key: key.to_string(),
            title: title.to_string(),
            link: format!("http://x/{key}"),
            published_at: None,
            summary: None,
        }
    }

    #[tokio::test]
    async fn test_first_occurrence_wins() {
        let store = KeySetStore::default();
        let outcome = filter_new(
            vec![record("a", "first"), record("b", "B"), record("a", "second")],
            &store,
        )
        .await
        .unwrap();

        let titles: Vec<_> = outcome.fresh.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["first", "B"]);
        assert_eq!(outcome.duplicates_in_batch, 1);
        assert_eq!(outcome.already_present, 0);
    }

    #[tokio::test]
    async fn test_existing_keys_filtered_with_one_query() {
        let store = KeySetStore {
            keys: ["b".to_string()].into_iter().collect(),
            ..KeySetStore::default()
        };
        let outcome = filter_new(
            vec![record("a", "A"), record("b", "B"), record("c", "C")],
            &store,
        )
        .await
        .unwrap();

        let keys: Vec<_> = outcome.fresh.iter().map(|r| r.dedup_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c"]);
        assert_eq!(outcome.already_present, 1);
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_skips_query() {
        let store = KeySetStore::default();
        let outcome = filter_new(Vec::new(), &store).await.unwrap();
        assert_eq!(outcome, DedupOutcome::default());
        assert_eq!(store.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_of_stored_key_counted_once_per_bucket() {
        let store = KeySetStore {
            keys: ["a".to_string()].into_iter().collect(),
            ..KeySetStore::default()
        };
        let outcome = filter_new(vec![record("a", "A"), record("a", "A")], &store)
            .await
            .unwrap();
        assert!(outcome.fresh.is_empty());
        assert_eq!(outcome.duplicates_in_batch, 1);
        assert_eq!(outcome.already_present, 1);
    }
}
