//! Metrics for the supervisor core.

/// Container for metrics.
#[derive(Debug, Clone)]
pub struct Metrics;

impl Metrics {
    /// Identifier for the counter that tracks receipt cache hits.
    pub const RECEIPTS_CACHE_HITS: &str = "base_supervisor_receipts_cache_hits";

    /// Identifier for the counter that tracks receipt cache misses.
    pub const RECEIPTS_CACHE_MISSES: &str = "base_supervisor_receipts_cache_misses";

    /// Identifier for the counter that tracks blocks handed to the log processor.
    pub const INDEXER_BLOCKS_PROCESSED: &str = "base_supervisor_indexer_blocks_processed";

    /// Identifier for the counter that tracks database rewinds issued by the indexer.
    pub const INDEXER_REWINDS: &str = "base_supervisor_indexer_rewinds";

    /// Identifier for the counter that tracks reset instructions sent to managed nodes.
    pub const NODE_RESETS: &str = "base_supervisor_node_resets";

    /// Identifier for the counter that tracks failed downstream updates.
    pub const NODE_UPDATE_FAILURES: &str = "base_supervisor_node_update_failures";

    /// Initializes metrics for the supervisor core.
    ///
    /// This does two things:
    /// * Describes various metrics.
    /// * Initializes metrics to 0 so they can be queried immediately.
    pub fn init() {
        Self::describe();
        Self::zero();
    }

    /// Describes metrics used in [`base_supervisor_core`][crate].
    pub fn describe() {
        metrics::describe_counter!(Self::RECEIPTS_CACHE_HITS, "Number of receipt cache hits");
        metrics::describe_counter!(Self::RECEIPTS_CACHE_MISSES, "Number of receipt cache misses");
        metrics::describe_counter!(
            Self::INDEXER_BLOCKS_PROCESSED,
            "Number of blocks whose logs were processed by the indexer"
        );
        metrics::describe_counter!(
            Self::INDEXER_REWINDS,
            "Number of database rewinds after a failure to process a block"
        );
        metrics::describe_counter!(
            Self::NODE_RESETS,
            "Number of reset instructions sent to managed nodes, by reset kind"
        );
        metrics::describe_counter!(
            Self::NODE_UPDATE_FAILURES,
            "Number of safety updates that could not be delivered to a managed node"
        );
    }

    /// Initializes the unlabeled counters to 0.
    fn zero() {
        metrics::counter!(Self::RECEIPTS_CACHE_HITS).absolute(0);
        metrics::counter!(Self::RECEIPTS_CACHE_MISSES).absolute(0);
        metrics::counter!(Self::INDEXER_BLOCKS_PROCESSED).absolute(0);
        metrics::counter!(Self::INDEXER_REWINDS).absolute(0);
    }
}
