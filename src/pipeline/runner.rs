use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use url::Url;

use super::dedup::filter_new;
use super::error::{ErrorKind, PipelineError};
use super::mapper::map_entry;
use crate::config::Config;
use crate::feed::{parse_feed, FeedFetcher};
use crate::storage::{NewsRecord, NewsStore, StoreError};

// ============================================================================
// Run state and results
// ============================================================================

/// Where the runner is within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Idle,
    Fetching,
    Parsing,
    Mapping,
    Deduplicating,
    Loading,
    Failed,
}

/// Counters for one completed run.
///
/// `entries_seen` counts every `<item>` in the document. `skipped` covers
/// items without a title or link plus repeats within the same feed;
/// `already_present` covers keys the store already had, including rows a
/// concurrent run inserted between our existence check and our insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub entries_seen: usize,
    pub loaded: usize,
    pub skipped: usize,
    pub already_present: usize,
    pub elapsed: Duration,
}

/// Why a run stopped. Serialized as JSON for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    /// Stage that was executing when the run gave up.
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
    pub feed_url: String,
    pub at: DateTime<Utc>,
}

impl RunFailure {
    pub fn new(stage: Stage, error: &PipelineError, feed_url: &Url) -> Self {
        Self {
            stage,
            kind: error.kind(),
            message: error.to_string(),
            feed_url: feed_url.to_string(),
            at: Utc::now(),
        }
    }

    /// One-line JSON rendering; falls back to the plain message.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} during {:?}: {}", self.kind, self.stage, self.message)
    }
}

impl std::error::Error for RunFailure {}

// ============================================================================
// Runner
// ============================================================================

/// Retry and sizing knobs for [`PipelineRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    /// Extra fetch attempts after the first one fails transiently.
    pub max_retries: u32,
    /// Base delay; fetch retries double it per attempt.
    pub retry_backoff: Duration,
    /// Keep at most this many entries (0 = all).
    pub max_entries: usize,
}

impl From<&Config> for RunSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            max_entries: config.max_entries,
        }
    }
}

/// Runs fetch, parse, map, dedup and load for one feed.
///
/// Runs are sequential; a runner can be reused for any number of runs.
pub struct PipelineRunner<S> {
    fetcher: FeedFetcher,
    store: S,
    feed_url: Url,
    settings: RunSettings,
    state: Stage,
}

type StageResult<T> = Result<T, (Stage, PipelineError)>;

fn at<E: Into<PipelineError>>(stage: Stage) -> impl FnOnce(E) -> (Stage, PipelineError) {
    move |e| (stage, e.into())
}

impl<S: NewsStore> PipelineRunner<S> {
    pub fn new(fetcher: FeedFetcher, store: S, feed_url: Url, settings: RunSettings) -> Self {
        Self {
            fetcher,
            store,
            feed_url,
            settings,
            state: Stage::Idle,
        }
    }

    pub fn state(&self) -> Stage {
        self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Executes one run to completion.
    ///
    /// # Errors
    ///
    /// Returns a [`RunFailure`] naming the stage and error kind once retries
    /// are exhausted. Nothing is committed by a run that fails before or
    /// during loading.
    pub async fn run(&mut self) -> Result<RunReport, RunFailure> {
        let started = Instant::now();
        tracing::info!(feed = %self.feed_url, "Starting run");

        match self.run_stages().await {
            Ok(mut report) => {
                report.elapsed = started.elapsed();
                self.transition(Stage::Idle);
                tracing::info!(
                    entries_seen = report.entries_seen,
                    loaded = report.loaded,
                    skipped = report.skipped,
                    already_present = report.already_present,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Run complete"
                );
                Ok(report)
            }
            Err((stage, error)) => {
                self.transition(Stage::Failed);
                let failure = RunFailure::new(stage, &error, &self.feed_url);
                tracing::error!(
                    stage = ?failure.stage,
                    kind = %failure.kind,
                    feed = %failure.feed_url,
                    at = %failure.at,
                    error = %failure.message,
                    "Run failed"
                );
                Err(failure)
            }
        }
    }

    async fn run_stages(&mut self) -> StageResult<RunReport> {
        self.transition(Stage::Fetching);
        let bytes = self.fetch_with_retry().await.map_err(at(Stage::Fetching))?;
        let fetched_at = Utc::now();

        self.transition(Stage::Parsing);
        let feed = parse_feed(&bytes).map_err(at(Stage::Parsing))?;

        self.transition(Stage::Mapping);
        let limit = match self.settings.max_entries {
            0 => usize::MAX,
            n => n,
        };
        let usable = feed.entries().len();
        if usable > limit {
            tracing::info!(
                usable = usable,
                max_entries = limit,
                "Keeping only the first entries of the feed"
            );
        }
        let records: Vec<NewsRecord> = feed
            .entries()
            .take(limit)
            .map(|entry| map_entry(entry, fetched_at))
            .collect();

        self.transition(Stage::Deduplicating);
        let backoff = self.settings.retry_backoff;
        let store = &self.store;
        let outcome = retry_store_once(Stage::Deduplicating, backoff, || {
            filter_new(records.clone(), store)
        })
        .await
        .map_err(at(Stage::Deduplicating))?;

        self.transition(Stage::Loading);
        let fresh = outcome.fresh;
        let store = &self.store;
        let loaded = retry_store_once(Stage::Loading, backoff, || store.insert_new(&fresh))
            .await
            .map_err(at(Stage::Loading))?;

        Ok(RunReport {
            entries_seen: feed.seen(),
            loaded,
            skipped: feed.skipped() + outcome.duplicates_in_batch,
            already_present: outcome.already_present + fresh.len().saturating_sub(loaded),
            elapsed: Duration::ZERO,
        })
    }

    /// Fetches with exponential backoff on network errors and timeouts.
    async fn fetch_with_retry(&self) -> Result<Vec<u8>, PipelineError> {
        let mut attempt: u32 = 0;
        loop {
            let error = match self.fetcher.fetch(&self.feed_url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => PipelineError::from(e),
            };

            if !error.is_retryable_fetch() || attempt >= self.settings.max_retries {
                return Err(error);
            }

            let delay = backoff_delay(self.settings.retry_backoff, attempt);
            attempt += 1;
            tracing::warn!(
                attempt = attempt,
                max_retries = self.settings.max_retries,
                delay_ms = delay.as_millis() as u64,
                kind = %error.kind(),
                error = %error,
                "Fetch failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn transition(&mut self, next: Stage) {
        tracing::debug!(from = ?self.state, to = ?next, "Stage transition");
        self.state = next;
    }
}

/// `base * 2^attempt`, saturating.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// Runs a store operation, retrying it once after `backoff` on failure.
async fn retry_store_once<T, F, Fut>(
    stage: Stage,
    backoff: Duration,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::warn!(stage = ?stage, error = %e, "Store operation failed, retrying once");
            tokio::time::sleep(backoff).await;
            op().await
        }
    }
}
