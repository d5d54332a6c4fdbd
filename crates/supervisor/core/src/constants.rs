//! Default values shared by the supervisor components.

use std::time::Duration;

/// Maximum number of blocks the indexer collects before fetching their receipts in one batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;

/// Interval at which the indexer checks for new blocks without a head signal.
pub const DEFAULT_INDEXER_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Timeout applied to every indexer request against its source.
pub const DEFAULT_INDEXER_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of L1 blocks that must be built on top of a block before it is served.
pub const DEFAULT_CONFIRMATION_DEPTH: u64 = 2;

/// Interval between two polls of an L1 head.
pub const DEFAULT_L1_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Interval to wait after a failed L1 head poll.
pub const DEFAULT_L1_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// Timeout of a single L1 head poll.
pub const DEFAULT_L1_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout of a request sent to a managed node.
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout of a request handled by the supervisor backend on behalf of a node event.
pub const DEFAULT_INTERNAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval to wait before re-establishing a failed node subscription.
pub const DEFAULT_RESUBSCRIBE_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of each per-class event channel of a node controller.
pub const DEFAULT_EVENT_BUFFER: usize = 10;

/// Default number of receipt sets kept in the receipt cache.
pub const DEFAULT_RECEIPTS_CACHE_SIZE: usize = 1000;
