//! Adapts a sync node into an [`IndexerSource`].

use std::sync::Arc;

use async_trait::async_trait;

use super::IndexerSource;
use crate::{
    BlockInfo, ReceiptCache, Receipts, ReceiptsProvider, ReceiptsRequest, SupervisorResult,
    SyncSource,
};

/// An [`IndexerSource`] reading blocks from a [`SyncSource`] and receipts through a
/// [`ReceiptCache`] in front of the same node.
#[derive(Debug)]
pub struct CachedSyncSource<S: ?Sized> {
    node: Arc<S>,
    receipts: ReceiptCache<Arc<S>>,
}

impl<S: SyncSource + ?Sized> CachedSyncSource<S> {
    /// Wraps `node`, caching up to `cache_size` receipt sets.
    pub fn new(node: Arc<S>, cache_size: usize) -> Self {
        Self { receipts: ReceiptCache::new(Arc::clone(&node), cache_size), node }
    }

    /// Returns the receipts cache.
    pub const fn receipts(&self) -> &ReceiptCache<Arc<S>> {
        &self.receipts
    }
}

#[async_trait]
impl<S: SyncSource + ?Sized> IndexerSource for CachedSyncSource<S> {
    async fn block_ref_by_number(&self, number: u64) -> SupervisorResult<BlockInfo> {
        self.node.block_ref_by_number(number).await
    }

    async fn batch_fetch_receipts(&self, blocks: &[BlockInfo]) -> SupervisorResult<Vec<Receipts>> {
        let requests: Vec<_> = blocks.iter().copied().map(ReceiptsRequest::all).collect();
        self.receipts.batch_fetch_receipts(&requests).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemorySyncNode, block_info, receipts_for};

    #[tokio::test]
    async fn test_receipts_are_cached() {
        let node = Arc::new(MemorySyncNode::new(10, 20));
        let source = CachedSyncSource::new(Arc::clone(&node), 16);
        let blocks: Vec<_> = (0..3).map(block_info).collect();

        let first = source.batch_fetch_receipts(&blocks).await.unwrap();
        let second = source.batch_fetch_receipts(&blocks).await.unwrap();

        assert_eq!(first, (0..3).map(receipts_for).collect::<Vec<_>>());
        assert_eq!(first, second);
        assert_eq!(node.receipt_batches(), vec![3]);
        assert_eq!(source.block_ref_by_number(2).await.unwrap(), block_info(2));
    }
}
