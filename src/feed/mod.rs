//! Feed retrieval and parsing.
//!
//! - [`fetcher`] - HTTP retrieval of the raw feed body with timeout and size cap
//! - [`parser`] - RSS 2.0 parsing into [`FeedEntry`] values
//!
//! Neither stage retries or touches the store; the pipeline runner decides
//! what to do with their errors.
//!
//! # Example
//!
//! ```ignore
//! use news_etl::feed::{parse_feed, FeedFetcher};
//!
//! let bytes = fetcher.fetch(&config.feed_url).await?;
//! let feed = parse_feed(&bytes)?;
//! for entry in feed.entries() {
//!     println!("{} -> {}", entry.title, entry.link);
//! }
//! ```

mod fetcher;
mod parser;

pub use fetcher::{FeedFetcher, FetchError, DEFAULT_MAX_FEED_SIZE};
pub use parser::{parse_feed, FeedEntry, ParseError, ParsedFeed};
