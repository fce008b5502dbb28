//! Small helpers shared by the feed and pipeline stages.
//!
//! - **URL validation**: feed URLs must be absolute http(s) URLs with a host
//! - **Text cleanup**: control-character stripping and whitespace folding for
//!   values pulled out of feed XML

mod text;
mod url_validator;

pub use text::{clean_text, non_blank};
pub use url_validator::{validate_feed_url, UrlValidationError};
