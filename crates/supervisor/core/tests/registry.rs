//! Attaching managed nodes to the controller registry.

use std::sync::Arc;

use base_supervisor_core::{
    ChainsDb, ControllerRegistry, DerivedPair, NodeControllerConfig, SupervisorError,
    test_utils::{MemoryBackend, MemoryChainsDb, MemorySyncNode, NodeCall, block_info},
};
use tokio_util::sync::CancellationToken;

const CHAIN_A: u64 = 901;
const CHAIN_B: u64 = 902;

fn registry(db: &Arc<MemoryChainsDb>) -> ControllerRegistry<MemoryChainsDb, MemoryBackend> {
    ControllerRegistry::new(
        [CHAIN_A, CHAIN_B].into_iter().collect(),
        Arc::clone(db),
        Arc::new(MemoryBackend::default()),
        NodeControllerConfig::default(),
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn bootstraps_each_chain_once() {
    let db = Arc::new(MemoryChainsDb::default());
    let registry = registry(&db);
    let anchor_a = DerivedPair::new(block_info(100), block_info(0));
    let anchor_b = DerivedPair::new(block_info(101), block_info(2));
    let nodes = [
        (CHAIN_A, Arc::new(MemorySyncNode::new(CHAIN_A, 20).with_anchor(anchor_a))),
        (CHAIN_A, Arc::new(MemorySyncNode::new(CHAIN_A, 20))),
        (CHAIN_B, Arc::new(MemorySyncNode::new(CHAIN_B, 20).with_anchor(anchor_b))),
    ];

    for (chain, node) in &nodes {
        registry.attach(*chain, node.clone()).await.unwrap();
    }

    let anchor_calls: Vec<_> = nodes.iter().map(|(_, node)| node.anchor_calls()).collect();
    assert_eq!(anchor_calls, vec![1, 0, 1]);
    assert_eq!(db.cross_safe_writes(), 2);
    assert_eq!(db.local_safe_writes(), 2);
    assert_eq!(db.local_safe(CHAIN_A).unwrap(), anchor_a);
    assert_eq!(db.local_safe(CHAIN_B).unwrap(), anchor_b);

    let mut chains = registry.chains();
    chains.sort_unstable();
    assert_eq!(chains, vec![CHAIN_A, CHAIN_B]);
    registry.close().await;
}

#[tokio::test]
async fn rejects_unknown_chain() {
    let db = Arc::new(MemoryChainsDb::default());
    let registry = registry(&db);
    let node = Arc::new(MemorySyncNode::new(7, 20));

    let err = registry.attach(7, node.clone()).await.unwrap_err();

    assert!(matches!(err, SupervisorError::UnknownChain(7)));
    assert_eq!(node.anchor_calls(), 0);
    assert_eq!(db.cross_safe_writes(), 0);
    assert!(registry.chains().is_empty());
}

#[tokio::test]
async fn promotions_reach_every_node_of_the_chain() {
    let db = Arc::new(MemoryChainsDb::default());
    let registry = registry(&db);
    let first = Arc::new(MemorySyncNode::new(CHAIN_A, 20));
    let second = Arc::new(MemorySyncNode::new(CHAIN_A, 20));
    let first_controller = registry.attach(CHAIN_A, first.clone()).await.unwrap();
    let second_controller = registry.attach(CHAIN_A, second.clone()).await.unwrap();

    db.promote_finalized(CHAIN_A, block_info(4).id());

    first_controller.await_sent_finalized_update(4).await.unwrap();
    second_controller.await_sent_finalized_update(4).await.unwrap();
    assert_eq!(first.calls(), vec![NodeCall::Finalized(block_info(4).id())]);
    assert_eq!(second.calls(), vec![NodeCall::Finalized(block_info(4).id())]);
    registry.close().await;
}
