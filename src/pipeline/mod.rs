//! The ETL run: map, deduplicate, load, and the runner that drives them.
//!
//! - [`mapper`] - pure conversion of feed entries into [`NewsRecord`](crate::storage::NewsRecord)s
//! - [`dedup`] - intra-batch and store-level duplicate filtering
//! - [`runner`] - stage state machine, retry policy and run reports
//! - [`schedule`] - fixed-interval repetition with graceful shutdown
//!
//! ```ignore
//! use news_etl::pipeline::{PipelineRunner, RunSettings};
//!
//! let settings = RunSettings::from(&config);
//! let mut runner = PipelineRunner::new(fetcher, db, config.feed_url.clone(), settings);
//! match runner.run().await {
//!     Ok(report) => println!("loaded {}", report.loaded),
//!     Err(failure) => eprintln!("{}", failure.to_json()),
//! }
//! ```

mod dedup;
mod error;
mod mapper;
mod runner;
mod schedule;

pub use dedup::{filter_new, DedupOutcome};
pub use error::{ErrorKind, PipelineError};
pub use mapper::{dedup_key, map_entry};
pub use runner::{PipelineRunner, RunFailure, RunReport, RunSettings, Stage};
pub use schedule::run_on_interval;
