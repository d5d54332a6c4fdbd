//! The [`ControllerRegistry`].

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use super::{ChainsDb, NodeController, SyncBackend, SyncControl};
use crate::{
    ChainId, DependencySet, NodeControllerConfig, SupervisorError, SupervisorResult,
    util::bounded,
};

/// The controllers attached for one chain.
struct ChainControllers<B: ?Sized> {
    /// Serializes attachments for the chain.
    attach: AsyncMutex<()>,
    controllers: parking_lot::RwLock<Vec<Arc<NodeController<B>>>>,
}

impl<B: ?Sized> Default for ChainControllers<B> {
    fn default() -> Self {
        Self { attach: AsyncMutex::new(()), controllers: parking_lot::RwLock::new(Vec::new()) }
    }
}

/// Owns the [`NodeController`]s of every chain in the dependency set.
///
/// A chain may have several redundant nodes attached. Attaching the first node of a chain whose
/// database is empty seeds the database with the node's anchor point.
pub struct ControllerRegistry<DB: ?Sized, B: ?Sized> {
    chains: parking_lot::RwLock<HashMap<ChainId, Arc<ChainControllers<B>>>>,
    db: Arc<DB>,
    backend: Arc<B>,
    dependency_set: DependencySet,
    config: NodeControllerConfig,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl<DB: ?Sized, B: ?Sized> fmt::Debug for ControllerRegistry<DB, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerRegistry")
            .field("dependency_set", &self.dependency_set)
            .field("chains", &self.chains.read().keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<DB, B> ControllerRegistry<DB, B>
where
    DB: ChainsDb + ?Sized,
    B: SyncBackend + ?Sized + 'static,
{
    /// Creates an empty registry. Controllers are children of `cancel`.
    pub fn new(
        dependency_set: DependencySet,
        db: Arc<DB>,
        backend: Arc<B>,
        config: NodeControllerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            chains: parking_lot::RwLock::new(HashMap::new()),
            db,
            backend,
            dependency_set,
            config,
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    /// Attaches a node to `chain` and starts its controller.
    ///
    /// Returns [`SupervisorError::UnknownChain`] if the chain is not in the dependency set, and
    /// [`SupervisorError::Cancelled`] once the registry is closed.
    pub async fn attach(
        &self,
        chain: ChainId,
        node: Arc<dyn SyncControl>,
    ) -> SupervisorResult<Arc<NodeController<B>>> {
        if !self.dependency_set.has_chain(chain) {
            warn!(target: "supervisor::registry", chain_id = %chain, "Rejecting node of chain outside the dependency set");
            return Err(SupervisorError::UnknownChain(chain));
        }

        let entry = {
            let existing = self.chains.read().get(&chain).cloned();
            match existing {
                Some(entry) => entry,
                None => Arc::clone(self.chains.write().entry(chain).or_default()),
            }
        };
        let _attach = entry.attach.lock().await;
        // Checked under the attach lock: `close` takes it before draining the chain.
        if self.closed.load(Ordering::Acquire) {
            debug!(target: "supervisor::registry", chain_id = %chain, "Registry closed, not attaching node");
            return Err(SupervisorError::Cancelled);
        }

        self.maybe_init_safe_db(chain, node.as_ref()).await;

        let controller = Arc::new(NodeController::spawn(
            chain,
            node,
            Arc::clone(&self.backend),
            self.db.as_ref(),
            self.config,
            &self.cancel,
        ));
        entry.controllers.write().push(Arc::clone(&controller));
        info!(target: "supervisor::registry", chain_id = %chain, "Attached node controller");
        Ok(controller)
    }

    /// Seeds the safety database of `chain` with the anchor point of `node` if it is empty.
    async fn maybe_init_safe_db(&self, chain: ChainId, node: &dyn SyncControl) {
        match self.db.local_safe(chain) {
            Err(SupervisorError::Future) => {}
            Ok(_) => {
                debug!(target: "supervisor::registry", chain_id = %chain, "Chain database already initialized");
                return;
            }
            Err(err) => {
                warn!(target: "supervisor::registry", chain_id = %chain, error = %err, "Failed to read local-safe head");
                return;
            }
        }

        debug!(target: "supervisor::registry", chain_id = %chain, "Initializing chain database");
        let anchor =
            match bounded(&self.cancel, self.config.node_timeout, node.anchor_point()).await {
                Ok(anchor) => anchor,
                Err(err) => {
                    warn!(target: "supervisor::registry", chain_id = %chain, error = %err, "Failed to get anchor point");
                    return;
                }
            };

        if let Err(err) = self.db.update_cross_safe(chain, anchor.derived_from, anchor.derived) {
            warn!(target: "supervisor::registry", chain_id = %chain, error = %err, "Failed to initialize cross-safe");
        }
        if let Err(err) = self.db.update_local_safe(chain, anchor.derived_from, anchor.derived) {
            warn!(target: "supervisor::registry", chain_id = %chain, error = %err, "Failed to initialize local-safe");
        }
        info!(target: "supervisor::registry", chain_id = %chain, anchor = %anchor, "Initialized chain database");
    }
}

impl<DB: ?Sized, B: ?Sized> ControllerRegistry<DB, B> {
    /// Returns the controllers attached to `chain`.
    pub fn controllers(&self, chain: ChainId) -> Vec<Arc<NodeController<B>>> {
        self.chains
            .read()
            .get(&chain)
            .map(|entry| entry.controllers.read().clone())
            .unwrap_or_default()
    }

    /// Returns the chains with at least one attached controller.
    pub fn chains(&self) -> Vec<ChainId> {
        self.chains
            .read()
            .iter()
            .filter(|(_, entry)| !entry.controllers.read().is_empty())
            .map(|(chain, _)| *chain)
            .collect()
    }

    /// Detaches and closes `controller`. Returns `false` if it was not attached to `chain`.
    pub async fn detach(&self, chain: ChainId, controller: &Arc<NodeController<B>>) -> bool {
        let Some(entry) = self.chains.read().get(&chain).cloned() else {
            return false;
        };
        let removed = {
            let mut controllers = entry.controllers.write();
            let before = controllers.len();
            controllers.retain(|c| !Arc::ptr_eq(c, controller));
            controllers.len() != before
        };
        if removed {
            controller.close().await;
            info!(target: "supervisor::registry", chain_id = %chain, "Detached node controller");
        }
        removed
    }

    /// Closes every controller. Later attachments are rejected.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let entries: Vec<_> = self.chains.write().drain().collect();
        for (chain, entry) in entries {
            // Waits out an attachment in progress so its controller is closed too.
            let _attach = entry.attach.lock().await;
            let controllers = std::mem::take(&mut *entry.controllers.write());
            for controller in controllers {
                controller.close().await;
            }
            debug!(target: "supervisor::registry", chain_id = %chain, "Closed chain controllers");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        DerivedPair,
        syncnode::{MockChainsDb, MockSyncBackend, MockSyncControl},
        test_utils::{MemoryBackend, MemoryChainsDb, MemorySyncNode, block_info},
    };

    const CHAIN: ChainId = 901;

    fn registry(db: &Arc<MemoryChainsDb>) -> ControllerRegistry<MemoryChainsDb, MemoryBackend> {
        ControllerRegistry::new(
            [CHAIN, 902].into_iter().collect(),
            Arc::clone(db),
            Arc::new(MemoryBackend::default()),
            NodeControllerConfig::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_first_node_bootstraps_empty_database() {
        let db = Arc::new(MemoryChainsDb::default());
        let registry = registry(&db);
        let anchor = DerivedPair::new(block_info(100), block_info(3));
        let first = Arc::new(MemorySyncNode::new(CHAIN, 20).with_anchor(anchor));
        let second = Arc::new(MemorySyncNode::new(CHAIN, 20));

        registry.attach(CHAIN, first.clone()).await.unwrap();
        registry.attach(CHAIN, second.clone()).await.unwrap();

        assert_eq!(first.anchor_calls(), 1);
        assert_eq!(second.anchor_calls(), 0);
        assert_eq!(db.cross_safe_writes(), 1);
        assert_eq!(db.local_safe_writes(), 1);
        assert_eq!(db.local_safe(CHAIN).unwrap(), anchor);
        assert_eq!(db.cross_safe(CHAIN), Some(anchor));
        assert_eq!(registry.controllers(CHAIN).len(), 2);
        registry.close().await;
    }

    #[tokio::test]
    async fn test_rejects_chain_outside_dependency_set() {
        let db = Arc::new(MemoryChainsDb::default());
        let registry = registry(&db);
        let node = Arc::new(MemorySyncNode::new(999, 20));

        let err = registry.attach(999, node.clone()).await.unwrap_err();

        assert!(matches!(err, SupervisorError::UnknownChain(999)));
        assert_eq!(node.anchor_calls(), 0);
        assert!(registry.controllers(999).is_empty());
        assert!(registry.chains().is_empty());
    }

    #[tokio::test]
    async fn test_anchor_failure_leaves_database_empty() {
        let mut db = MockChainsDb::new();
        db.expect_local_safe().returning(|_| Err(SupervisorError::Future));
        db.expect_update_cross_safe().never();
        db.expect_update_local_safe().never();
        db.expect_subscribe_cross_unsafe()
            .returning(|_| Err(SupervisorError::Custom("unavailable".to_string())));
        db.expect_subscribe_cross_safe()
            .returning(|_| Err(SupervisorError::Custom("unavailable".to_string())));
        db.expect_subscribe_finalized()
            .returning(|_| Err(SupervisorError::Custom("unavailable".to_string())));
        let mut node = MockSyncControl::new();
        node.expect_anchor_point().times(1).returning(|| Err(SupervisorError::NotFound));
        node.expect_subscribe_unsafe_blocks()
            .returning(|| Err(SupervisorError::SubscriptionClosed));
        node.expect_subscribe_derivation_updates()
            .returning(|| Err(SupervisorError::SubscriptionClosed));
        node.expect_subscribe_exhaust_l1_events()
            .returning(|| Err(SupervisorError::SubscriptionClosed));
        node.expect_subscribe_reset_events()
            .returning(|| Err(SupervisorError::SubscriptionClosed));

        let registry = ControllerRegistry::new(
            [CHAIN].into_iter().collect(),
            Arc::new(db),
            Arc::new(MockSyncBackend::new()),
            NodeControllerConfig::default(),
            CancellationToken::new(),
        );

        registry.attach(CHAIN, Arc::new(node)).await.unwrap();

        assert_eq!(registry.chains(), vec![CHAIN]);
        registry.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_attachment_in_progress() {
        let db = Arc::new(MemoryChainsDb::default());
        let registry = Arc::new(registry(&db));
        let node = Arc::new(
            MemorySyncNode::new(CHAIN, 20).with_anchor_delay(Duration::from_secs(5)),
        );

        let attaching = tokio::spawn({
            let registry = Arc::clone(&registry);
            let node = Arc::clone(&node);
            async move { registry.attach(CHAIN, node).await }
        });
        while node.anchor_calls() == 0 {
            tokio::task::yield_now().await;
        }
        registry.close().await;
        let controller = attaching.await.unwrap().unwrap();

        db.promote_finalized(CHAIN, block_info(4).id());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(node.calls().is_empty());
        assert!(registry.controllers(CHAIN).is_empty());
        assert_eq!(controller.chain(), CHAIN);

        let late = Arc::new(MemorySyncNode::new(CHAIN, 20));
        let err = registry.attach(CHAIN, late.clone()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Cancelled));
        assert_eq!(late.anchor_calls(), 0);
    }

    #[tokio::test]
    async fn test_detach() {
        let db = Arc::new(MemoryChainsDb::default());
        let registry = registry(&db);
        let node = Arc::new(MemorySyncNode::new(CHAIN, 20));
        let controller = registry.attach(CHAIN, node.clone()).await.unwrap();
        node.wait_for_subscriptions(4).await;

        assert!(registry.detach(CHAIN, &controller).await);
        assert!(!registry.detach(CHAIN, &controller).await);

        assert!(registry.controllers(CHAIN).is_empty());
        assert!(registry.chains().is_empty());
        assert!(!node.push_unsafe_block(block_info(21)));
    }
}
