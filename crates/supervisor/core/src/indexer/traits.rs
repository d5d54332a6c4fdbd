//! Collaborators of the [`ChainIndexer`](super::ChainIndexer).

use async_trait::async_trait;

use crate::{BlockInfo, ChainId, Receipts, SupervisorResult};

/// Upstream source of blocks and their receipts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IndexerSource: Send + Sync {
    /// Returns the canonical block with the given number.
    ///
    /// Returns [`SupervisorError::NotFound`](crate::SupervisorError::NotFound) if the block does
    /// not exist yet.
    async fn block_ref_by_number(&self, number: u64) -> SupervisorResult<BlockInfo>;

    /// Returns the receipts of every block, in order.
    async fn batch_fetch_receipts(&self, blocks: &[BlockInfo]) -> SupervisorResult<Vec<Receipts>>;
}

/// Consumes the receipts of indexed blocks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogProcessor: Send + Sync {
    /// Processes the logs of `block`. Blocks are handed over in increasing number order.
    async fn process_logs(
        &self,
        chain: ChainId,
        block: &BlockInfo,
        receipts: &Receipts,
    ) -> SupervisorResult<()>;
}

/// The parts of the log database the indexer drives.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseRewinder: Send + Sync {
    /// Removes everything recorded above block `head`.
    async fn rewind(&self, chain: ChainId, head: u64) -> SupervisorResult<()>;

    /// Returns the number of the last block recorded for `chain`, if any.
    async fn latest_block_num(&self, chain: ChainId) -> Option<u64>;
}
