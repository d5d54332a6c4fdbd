//! Capabilities of managed nodes and of the supervisor backend.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

use crate::{
    BlockId, BlockInfo, ChainId, DerivedIdPair, DerivedPair, ReceiptsProvider, SupervisorResult,
};

/// A stream of events pushed by a managed node. An `Err` item ends the subscription.
pub type EventStream<T> = BoxStream<'static, SupervisorResult<T>>;

/// Read access to the chain data of a managed node.
#[async_trait]
pub trait SyncSource: ReceiptsProvider {
    /// Returns the canonical block with the given number.
    async fn block_ref_by_number(&self, number: u64) -> SupervisorResult<BlockInfo>;

    /// Returns the id of the chain the node follows.
    async fn chain_id(&self) -> SupervisorResult<ChainId>;
}

/// Control over the derivation of a managed node.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SyncControl: Send + Sync {
    /// Subscribes to new unsafe blocks.
    async fn subscribe_unsafe_blocks(&self) -> SupervisorResult<EventStream<BlockInfo>>;

    /// Subscribes to new local-safe blocks.
    async fn subscribe_derivation_updates(&self) -> SupervisorResult<EventStream<DerivedPair>>;

    /// Subscribes to signals that the node consumed all L1 data it knows about.
    async fn subscribe_exhaust_l1_events(&self) -> SupervisorResult<EventStream<DerivedPair>>;

    /// Subscribes to reset requests. Items are diagnostic messages.
    async fn subscribe_reset_events(&self) -> SupervisorResult<EventStream<String>>;

    /// Promotes the node's cross-unsafe head.
    async fn update_cross_unsafe(&self, id: BlockId) -> SupervisorResult<()>;

    /// Promotes the node's cross-safe head.
    async fn update_cross_safe(&self, derived: BlockId, derived_from: BlockId)
    -> SupervisorResult<()>;

    /// Promotes the node's finalized head.
    async fn update_finalized(&self, id: BlockId) -> SupervisorResult<()>;

    /// Resets the node's heads.
    async fn reset(
        &self,
        unsafe_head: BlockId,
        safe: BlockId,
        finalized: BlockId,
    ) -> SupervisorResult<()>;

    /// Hands the next L1 block to the node.
    async fn provide_l1(&self, next: BlockInfo) -> SupervisorResult<()>;

    /// Returns the pair the node's derivation starts from.
    async fn anchor_point(&self) -> SupervisorResult<DerivedPair>;
}

/// A managed node: a [`SyncSource`] that also exposes [`SyncControl`].
pub trait SyncNode: SyncSource + SyncControl {}

impl<T: SyncSource + SyncControl + ?Sized> SyncNode for T {}

/// The supervisor operations a [`NodeController`](crate::NodeController) drives on behalf of
/// node events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Records a new unsafe head.
    async fn update_local_unsafe(&self, chain: ChainId, head: BlockInfo) -> SupervisorResult<()>;

    /// Records a new local-safe head.
    async fn update_local_safe(
        &self,
        chain: ChainId,
        derived_from: BlockInfo,
        derived: BlockInfo,
    ) -> SupervisorResult<()>;

    /// Returns the local-safe head.
    async fn local_safe(&self, chain: ChainId) -> SupervisorResult<DerivedIdPair>;

    /// Returns the local-unsafe head.
    async fn local_unsafe(&self, chain: ChainId) -> SupervisorResult<BlockId>;

    /// Returns the last cross-safe block derived from `derived_from`.
    async fn safe_derived_at(
        &self,
        chain: ChainId,
        derived_from: BlockId,
    ) -> SupervisorResult<BlockId>;

    /// Returns the finalized head.
    async fn finalized(&self, chain: ChainId) -> SupervisorResult<BlockId>;

    /// Returns the L1 block with the given number.
    async fn l1_block_ref_by_number(&self, number: u64) -> SupervisorResult<BlockInfo>;
}

/// The safety database, as far as node controllers are concerned.
#[cfg_attr(test, mockall::automock)]
pub trait ChainsDb: Send + Sync {
    /// Returns the local-safe head.
    ///
    /// Returns [`SupervisorError::Future`](crate::SupervisorError::Future) if nothing has been
    /// recorded for the chain yet.
    fn local_safe(&self, chain: ChainId) -> SupervisorResult<DerivedPair>;

    /// Records a new local-safe head.
    fn update_local_safe(
        &self,
        chain: ChainId,
        derived_from: BlockInfo,
        derived: BlockInfo,
    ) -> SupervisorResult<()>;

    /// Records a new cross-safe head.
    fn update_cross_safe(
        &self,
        chain: ChainId,
        derived_from: BlockInfo,
        derived: BlockInfo,
    ) -> SupervisorResult<()>;

    /// Subscribes to cross-unsafe promotions.
    fn subscribe_cross_unsafe(&self, chain: ChainId)
    -> SupervisorResult<broadcast::Receiver<BlockId>>;

    /// Subscribes to cross-safe promotions.
    fn subscribe_cross_safe(
        &self,
        chain: ChainId,
    ) -> SupervisorResult<broadcast::Receiver<DerivedIdPair>>;

    /// Subscribes to finality promotions.
    fn subscribe_finalized(&self, chain: ChainId) -> SupervisorResult<broadcast::Receiver<BlockId>>;
}
