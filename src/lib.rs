//! Idempotent RSS-to-database ingestion.
//!
//! One run fetches a news feed, maps its items to records keyed by a stable
//! hash, and inserts only the records the store does not already hold.

pub mod config;
pub mod feed;
pub mod pipeline;
pub mod storage;
pub mod util;
