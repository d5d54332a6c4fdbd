//! Sequential block indexing.
//!
//! The [`ChainIndexer`] walks a chain block by block from the last number recorded in the
//! database, fetches receipts for each batch of blocks at once and hands every block to a
//! [`LogProcessor`]. A block that fails to process rewinds the database to its parent.

mod traits;
pub use traits::{DatabaseRewinder, IndexerSource, LogProcessor};

#[cfg(test)]
pub(crate) use traits::{MockDatabaseRewinder, MockIndexerSource, MockLogProcessor};

mod source;
pub use source::CachedSyncSource;

mod processor;
pub use processor::ChainIndexer;
