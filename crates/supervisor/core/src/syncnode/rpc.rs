//! JSON-RPC transport for managed nodes.

use std::fmt;

use alloy_primitives::B256;
use async_trait::async_trait;
use futures::StreamExt;
use jsonrpsee::{
    core::{
        ClientError, RpcResult, SubscriptionResult,
        client::{ClientT, Subscription},
        params::BatchRequestBuilder,
    },
    proc_macros::rpc,
    rpc_params,
    types::ErrorObject,
    ws_client::{WsClient, WsClientBuilder},
};
use serde::de::DeserializeOwned;
use url::Url;

use super::{EventStream, SyncControl, SyncSource};
use crate::{
    BlockId, BlockInfo, ChainId, DerivedPair, Receipts, ReceiptsProvider, ReceiptsRequest,
    SupervisorError, SupervisorResult,
};

/// The `interop` API served by managed nodes.
#[rpc(client, namespace = "interop")]
pub trait InteropApi {
    /// Returns the canonical block with the given number.
    #[method(name = "blockRefByNumber")]
    async fn block_ref_by_number(&self, number: u64) -> RpcResult<BlockInfo>;

    /// Returns the receipts of the block with the given hash.
    #[method(name = "fetchReceipts")]
    async fn fetch_receipts(&self, block_hash: B256) -> RpcResult<Receipts>;

    /// Returns the chain id of the node.
    #[method(name = "chainID")]
    async fn chain_id(&self) -> RpcResult<ChainId>;

    /// Promotes the cross-unsafe head.
    #[method(name = "updateCrossUnsafe")]
    async fn update_cross_unsafe(&self, id: BlockId) -> RpcResult<()>;

    /// Promotes the cross-safe head.
    #[method(name = "updateCrossSafe")]
    async fn update_cross_safe(&self, derived: BlockId, derived_from: BlockId) -> RpcResult<()>;

    /// Promotes the finalized head.
    #[method(name = "updateFinalized")]
    async fn update_finalized(&self, id: BlockId) -> RpcResult<()>;

    /// Resets the node's heads.
    #[method(name = "reset")]
    async fn reset(&self, unsafe_head: BlockId, safe: BlockId, finalized: BlockId)
    -> RpcResult<()>;

    /// Hands the next L1 block to the node.
    #[method(name = "provideL1")]
    async fn provide_l1(&self, next: BlockInfo) -> RpcResult<()>;

    /// Returns the pair the node's derivation starts from.
    #[method(name = "anchorPoint")]
    async fn anchor_point(&self) -> RpcResult<DerivedPair>;

    /// Subscribes to new unsafe blocks.
    #[subscription(
        name = "subscribeUnsafeBlocks" => "unsafeBlocks",
        unsubscribe = "unsubscribeUnsafeBlocks",
        item = BlockInfo
    )]
    async fn subscribe_unsafe_blocks(&self) -> SubscriptionResult;

    /// Subscribes to derivation updates.
    #[subscription(
        name = "subscribeDerivationUpdates" => "derivationUpdates",
        unsubscribe = "unsubscribeDerivationUpdates",
        item = DerivedPair
    )]
    async fn subscribe_derivation_updates(&self) -> SubscriptionResult;

    /// Subscribes to L1 exhaustion signals.
    #[subscription(
        name = "subscribeExhaustL1Events" => "exhaustL1Events",
        unsubscribe = "unsubscribeExhaustL1Events",
        item = DerivedPair
    )]
    async fn subscribe_exhaust_l1_events(&self) -> SubscriptionResult;

    /// Subscribes to reset requests.
    #[subscription(
        name = "subscribeResetEvents" => "resetEvents",
        unsubscribe = "unsubscribeResetEvents",
        item = String
    )]
    async fn subscribe_reset_events(&self) -> SubscriptionResult;
}

/// A managed node reached over a WebSocket JSON-RPC connection.
pub struct RpcSyncNode {
    name: String,
    client: WsClient,
}

impl fmt::Debug for RpcSyncNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcSyncNode").field("name", &self.name).finish_non_exhaustive()
    }
}

impl fmt::Display for RpcSyncNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl RpcSyncNode {
    /// Wraps an established client.
    pub fn new(name: impl Into<String>, client: WsClient) -> Self {
        Self { name: name.into(), client }
    }

    /// Connects to the node at `url`.
    pub async fn connect(url: &Url) -> SupervisorResult<Self> {
        let client = WsClientBuilder::default().build(url.as_str()).await?;
        debug!(target: "supervisor::rpc", %url, "Connected to managed node");
        Ok(Self::new(url.to_string(), client))
    }

    /// Returns the name of the node.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Maps call errors reporting missing data to [`SupervisorError::NotFound`].
fn map_call_error(err: ClientError) -> SupervisorError {
    match &err {
        ClientError::Call(obj) if is_not_found(obj) => SupervisorError::NotFound,
        _ => SupervisorError::Rpc(err),
    }
}

fn is_not_found(obj: &ErrorObject<'_>) -> bool {
    obj.message().to_ascii_lowercase().contains("not found")
}

fn event_stream<T>(subscription: Subscription<T>) -> EventStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    subscription
        .map(|item| item.map_err(|err| SupervisorError::Custom(err.to_string())))
        .boxed()
}

#[async_trait]
impl ReceiptsProvider for RpcSyncNode {
    /// Returns every receipt of `block`. The node has no transaction filter, `tx_hashes` only
    /// identifies the request.
    async fn fetch_receipts(
        &self,
        block: &BlockInfo,
        _tx_hashes: &[B256],
    ) -> SupervisorResult<Receipts> {
        InteropApiClient::fetch_receipts(&self.client, block.hash).await.map_err(map_call_error)
    }

    async fn batch_fetch_receipts(
        &self,
        requests: &[ReceiptsRequest],
    ) -> SupervisorResult<Vec<Receipts>> {
        let mut batch = BatchRequestBuilder::new();
        for request in requests {
            batch
                .insert("interop_fetchReceipts", rpc_params![request.block.hash])
                .map_err(|err| SupervisorError::Custom(err.to_string()))?;
        }
        let responses = self.client.batch_request::<Receipts>(batch).await?;
        responses
            .into_iter()
            .map(|response| {
                response.map_err(|obj| {
                    if is_not_found(&obj) {
                        SupervisorError::NotFound
                    } else {
                        SupervisorError::Custom(obj.message().to_string())
                    }
                })
            })
            .collect()
    }
}

#[async_trait]
impl SyncSource for RpcSyncNode {
    async fn block_ref_by_number(&self, number: u64) -> SupervisorResult<BlockInfo> {
        InteropApiClient::block_ref_by_number(&self.client, number).await.map_err(map_call_error)
    }

    async fn chain_id(&self) -> SupervisorResult<ChainId> {
        Ok(InteropApiClient::chain_id(&self.client).await?)
    }
}

#[async_trait]
impl SyncControl for RpcSyncNode {
    async fn subscribe_unsafe_blocks(&self) -> SupervisorResult<EventStream<BlockInfo>> {
        Ok(event_stream(InteropApiClient::subscribe_unsafe_blocks(&self.client).await?))
    }

    async fn subscribe_derivation_updates(&self) -> SupervisorResult<EventStream<DerivedPair>> {
        Ok(event_stream(InteropApiClient::subscribe_derivation_updates(&self.client).await?))
    }

    async fn subscribe_exhaust_l1_events(&self) -> SupervisorResult<EventStream<DerivedPair>> {
        Ok(event_stream(InteropApiClient::subscribe_exhaust_l1_events(&self.client).await?))
    }

    async fn subscribe_reset_events(&self) -> SupervisorResult<EventStream<String>> {
        Ok(event_stream(InteropApiClient::subscribe_reset_events(&self.client).await?))
    }

    async fn update_cross_unsafe(&self, id: BlockId) -> SupervisorResult<()> {
        Ok(InteropApiClient::update_cross_unsafe(&self.client, id).await?)
    }

    async fn update_cross_safe(
        &self,
        derived: BlockId,
        derived_from: BlockId,
    ) -> SupervisorResult<()> {
        Ok(InteropApiClient::update_cross_safe(&self.client, derived, derived_from).await?)
    }

    async fn update_finalized(&self, id: BlockId) -> SupervisorResult<()> {
        Ok(InteropApiClient::update_finalized(&self.client, id).await?)
    }

    async fn reset(
        &self,
        unsafe_head: BlockId,
        safe: BlockId,
        finalized: BlockId,
    ) -> SupervisorResult<()> {
        Ok(InteropApiClient::reset(&self.client, unsafe_head, safe, finalized).await?)
    }

    async fn provide_l1(&self, next: BlockInfo) -> SupervisorResult<()> {
        Ok(InteropApiClient::provide_l1(&self.client, next).await?)
    }

    async fn anchor_point(&self) -> SupervisorResult<DerivedPair> {
        InteropApiClient::anchor_point(&self.client).await.map_err(map_call_error)
    }
}

#[cfg(test)]
mod tests {
    use jsonrpsee::types::ErrorObjectOwned;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::not_found("block not found", true)]
    #[case::capitalized("Not Found", true)]
    #[case::other("internal error", false)]
    fn test_map_call_error(#[case] message: &str, #[case] not_found: bool) {
        let err = ClientError::Call(ErrorObjectOwned::owned(-32000, message, None::<()>));
        let mapped = map_call_error(err);
        assert_eq!(matches!(mapped, SupervisorError::NotFound), not_found);
    }
}
