mod records;
mod schema;
mod types;

pub use records::NewsStore;
pub use schema::Database;
pub use types::{NewsRecord, StoreError, StoredRecord};
