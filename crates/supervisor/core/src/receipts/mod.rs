//! Receipt retrieval.
//!
//! [`ReceiptsProvider`] is implemented by anything that can serve block receipts, and by
//! [`ReceiptCache`], which decorates another provider with an LRU cache and suppresses duplicate
//! in-flight requests.

use std::sync::Arc;

use alloy_primitives::{B256, keccak256};
use async_trait::async_trait;

use crate::{BlockInfo, Receipts, SupervisorResult};

mod cache;
pub use cache::ReceiptCache;

/// A request for the receipts of one block, optionally restricted to a set of transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptsRequest {
    /// The block to fetch receipts for.
    pub block: BlockInfo,
    /// The transactions of the block whose receipts are requested. Empty means all of them.
    pub tx_hashes: Vec<B256>,
}

impl ReceiptsRequest {
    /// Creates a new request.
    pub const fn new(block: BlockInfo, tx_hashes: Vec<B256>) -> Self {
        Self { block, tx_hashes }
    }

    /// Creates a request for all receipts of `block`.
    pub const fn all(block: BlockInfo) -> Self {
        Self { block, tx_hashes: Vec::new() }
    }

    /// Returns the cache key of the request.
    ///
    /// The key is the block hash when all receipts are requested, otherwise the hash of the block
    /// hash followed by the transaction hashes in request order.
    pub fn key(&self) -> B256 {
        if self.tx_hashes.is_empty() {
            return self.block.hash;
        }
        let mut buf = Vec::with_capacity(32 * (self.tx_hashes.len() + 1));
        buf.extend_from_slice(self.block.hash.as_slice());
        for tx in &self.tx_hashes {
            buf.extend_from_slice(tx.as_slice());
        }
        keccak256(buf)
    }
}

/// Returns a key identifying a batch of requests: the hash of the request keys in order.
pub fn batch_key(requests: &[ReceiptsRequest]) -> B256 {
    let mut buf = Vec::with_capacity(32 * requests.len());
    for request in requests {
        buf.extend_from_slice(request.key().as_slice());
    }
    keccak256(buf)
}

/// Serves block receipts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReceiptsProvider: Send + Sync {
    /// Fetches the receipts of `block`, restricted to `tx_hashes` unless it is empty.
    async fn fetch_receipts(
        &self,
        block: &BlockInfo,
        tx_hashes: &[B256],
    ) -> SupervisorResult<Receipts>;

    /// Fetches the receipts of several blocks at once.
    ///
    /// The result holds one entry per request, in request order.
    async fn batch_fetch_receipts(
        &self,
        requests: &[ReceiptsRequest],
    ) -> SupervisorResult<Vec<Receipts>>;
}

#[async_trait]
impl<T: ReceiptsProvider + ?Sized> ReceiptsProvider for Arc<T> {
    async fn fetch_receipts(
        &self,
        block: &BlockInfo,
        tx_hashes: &[B256],
    ) -> SupervisorResult<Receipts> {
        (**self).fetch_receipts(block, tx_hashes).await
    }

    async fn batch_fetch_receipts(
        &self,
        requests: &[ReceiptsRequest],
    ) -> SupervisorResult<Vec<Receipts>> {
        (**self).batch_fetch_receipts(requests).await
    }
}
