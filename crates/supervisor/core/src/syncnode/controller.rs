//! The [`NodeController`].

use std::{fmt, sync::Arc};

use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        mpsc, watch,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::{ChainsDb, SyncBackend, SyncControl, resubscribe::spawn_resubscribe};
use crate::{
    BlockId, BlockInfo, ChainId, DerivedIdPair, DerivedPair, Metrics, NodeControllerConfig,
    ResetKind, SafetyHeads, SupervisorError, SupervisorResult, util::bounded,
};

/// Keeps one managed node in sync with the supervisor.
///
/// Safety promotions recorded in the database are pushed down to the node, and the node's
/// unsafe blocks, derivation updates, L1 exhaustion signals and reset requests are handled
/// against the backend. A backend rejecting a derivation update resets the node to a state
/// resolved from the backend.
pub struct NodeController<B: ?Sized> {
    state: Arc<ControllerState<B>>,
    loop_cancel: CancellationToken,
    subscriptions_cancel: CancellationToken,
    event_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,
    subscriptions: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<B: ?Sized> fmt::Debug for NodeController<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeController")
            .field("chain", &self.state.chain)
            .field("config", &self.state.config)
            .finish_non_exhaustive()
    }
}

/// Receivers of the node events, fed by the subscription tasks.
struct NodeEvents {
    unsafe_blocks: mpsc::Receiver<BlockInfo>,
    derivation_updates: mpsc::Receiver<DerivedPair>,
    exhaust_l1: mpsc::Receiver<DerivedPair>,
    resets: mpsc::Receiver<String>,
}

/// Receivers of the database promotions. A missing receiver disables its branch.
struct DbEvents {
    cross_unsafe: Option<broadcast::Receiver<BlockId>>,
    cross_safe: Option<broadcast::Receiver<DerivedIdPair>>,
    finalized: Option<broadcast::Receiver<BlockId>>,
}

struct ControllerState<B: ?Sized> {
    chain: ChainId,
    node: Arc<dyn SyncControl>,
    backend: Arc<B>,
    config: NodeControllerConfig,
    cancel: CancellationToken,
    last_sent_cross_unsafe: watch::Sender<Option<BlockId>>,
    last_sent_cross_safe: watch::Sender<Option<DerivedIdPair>>,
    last_sent_finalized: watch::Sender<Option<BlockId>>,
}

impl<B: SyncBackend + ?Sized + 'static> NodeController<B> {
    /// Subscribes to the database promotions and node events of `chain` and starts the event
    /// loop.
    ///
    /// Failing to subscribe to a database promotion is logged; the controller runs without it.
    pub fn spawn<DB: ChainsDb + ?Sized>(
        chain: ChainId,
        node: Arc<dyn SyncControl>,
        backend: Arc<B>,
        db: &DB,
        config: NodeControllerConfig,
        cancel: &CancellationToken,
    ) -> Self {
        let loop_cancel = cancel.child_token();
        let subscriptions_cancel = cancel.child_token();

        let db_events = DbEvents {
            cross_unsafe: db_subscription(chain, "cross-unsafe", db.subscribe_cross_unsafe(chain)),
            cross_safe: db_subscription(chain, "cross-safe", db.subscribe_cross_safe(chain)),
            finalized: db_subscription(chain, "finalized", db.subscribe_finalized(chain)),
        };

        let (unsafe_tx, unsafe_blocks) = mpsc::channel(config.event_buffer);
        let (derivation_tx, derivation_updates) = mpsc::channel(config.event_buffer);
        let (exhaust_tx, exhaust_l1) = mpsc::channel(config.event_buffer);
        let (reset_tx, resets) = mpsc::channel(config.event_buffer);
        let interval = config.resubscribe_interval;

        let subscriptions = vec![
            {
                let node = Arc::clone(&node);
                spawn_resubscribe(
                    chain,
                    "reset-events",
                    move || {
                        let node = Arc::clone(&node);
                        async move { node.subscribe_reset_events().await }
                    },
                    reset_tx,
                    interval,
                    subscriptions_cancel.clone(),
                )
            },
            {
                let node = Arc::clone(&node);
                spawn_resubscribe(
                    chain,
                    "unsafe-blocks",
                    move || {
                        let node = Arc::clone(&node);
                        async move { node.subscribe_unsafe_blocks().await }
                    },
                    unsafe_tx,
                    interval,
                    subscriptions_cancel.clone(),
                )
            },
            {
                let node = Arc::clone(&node);
                spawn_resubscribe(
                    chain,
                    "derivation-updates",
                    move || {
                        let node = Arc::clone(&node);
                        async move { node.subscribe_derivation_updates().await }
                    },
                    derivation_tx,
                    interval,
                    subscriptions_cancel.clone(),
                )
            },
            {
                let node = Arc::clone(&node);
                spawn_resubscribe(
                    chain,
                    "exhaust-l1-events",
                    move || {
                        let node = Arc::clone(&node);
                        async move { node.subscribe_exhaust_l1_events().await }
                    },
                    exhaust_tx,
                    interval,
                    subscriptions_cancel.clone(),
                )
            },
        ];

        let state = Arc::new(ControllerState {
            chain,
            node,
            backend,
            config,
            cancel: loop_cancel.clone(),
            last_sent_cross_unsafe: watch::Sender::new(None),
            last_sent_cross_safe: watch::Sender::new(None),
            last_sent_finalized: watch::Sender::new(None),
        });
        let node_events = NodeEvents { unsafe_blocks, derivation_updates, exhaust_l1, resets };
        let event_loop = tokio::spawn(Arc::clone(&state).run(node_events, db_events));

        Self {
            state,
            loop_cancel,
            subscriptions_cancel,
            event_loop: parking_lot::Mutex::new(Some(event_loop)),
            subscriptions: parking_lot::Mutex::new(subscriptions),
        }
    }
}

impl<B: ?Sized> NodeController<B> {
    /// Returns the chain of the managed node.
    pub fn chain(&self) -> ChainId {
        self.state.chain
    }

    /// Returns the managed node.
    pub fn node(&self) -> &Arc<dyn SyncControl> {
        &self.state.node
    }

    /// Waits until a cross-unsafe update of at least block `min` has been delivered to the node.
    pub async fn await_sent_cross_unsafe_update(&self, min: u64) -> SupervisorResult<()> {
        let mut rx = self.state.last_sent_cross_unsafe.subscribe();
        rx.wait_for(|sent| sent.is_some_and(|id| id.number >= min))
            .await
            .map(|_| ())
            .map_err(|_| SupervisorError::ChannelClosed)
    }

    /// Waits until a cross-safe update deriving at least block `min` has been delivered to the
    /// node.
    pub async fn await_sent_cross_safe_update(&self, min: u64) -> SupervisorResult<()> {
        let mut rx = self.state.last_sent_cross_safe.subscribe();
        rx.wait_for(|sent| sent.is_some_and(|pair| pair.derived.number >= min))
            .await
            .map(|_| ())
            .map_err(|_| SupervisorError::ChannelClosed)
    }

    /// Waits until a finalized update of at least block `min` has been delivered to the node.
    pub async fn await_sent_finalized_update(&self, min: u64) -> SupervisorResult<()> {
        let mut rx = self.state.last_sent_finalized.subscribe();
        rx.wait_for(|sent| sent.is_some_and(|id| id.number >= min))
            .await
            .map(|_| ())
            .map_err(|_| SupervisorError::ChannelClosed)
    }

    /// Stops the controller.
    ///
    /// The event loop is stopped and awaited before the subscriptions are torn down, so no
    /// handler runs against a released subscription.
    pub async fn close(&self) {
        self.loop_cancel.cancel();
        let event_loop = self.event_loop.lock().take();
        if let Some(event_loop) = event_loop {
            let _ = event_loop.await;
        }

        self.subscriptions_cancel.cancel();
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions {
            let _ = subscription.await;
        }
        debug!(target: "supervisor::node", chain_id = %self.state.chain, "Node controller closed");
    }
}

fn db_subscription<T>(
    chain: ChainId,
    name: &'static str,
    subscription: SupervisorResult<broadcast::Receiver<T>>,
) -> Option<broadcast::Receiver<T>> {
    subscription
        .inspect_err(|err| {
            warn!(target: "supervisor::node", chain_id = %chain, subscription = name, error = %err, "Failed to subscribe to database updates");
        })
        .ok()
}

/// Receives the next promotion, skipping lagged ones. Pends forever once the channel is closed.
async fn next_promotion<T: Clone>(
    chain: ChainId,
    name: &'static str,
    rx: &mut Option<broadcast::Receiver<T>>,
) -> T {
    loop {
        let Some(receiver) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(value) => return value,
            Err(RecvError::Lagged(skipped)) => {
                warn!(target: "supervisor::node", chain_id = %chain, subscription = name, skipped, "Database updates lagged");
            }
            Err(RecvError::Closed) => {
                warn!(target: "supervisor::node", chain_id = %chain, subscription = name, "Database updates closed");
                *rx = None;
            }
        }
    }
}

impl<B: SyncBackend + ?Sized> ControllerState<B> {
    async fn run(self: Arc<Self>, mut events: NodeEvents, mut db: DbEvents) {
        info!(target: "supervisor::node", chain_id = %self.chain, "Starting node controller");
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,
                Some(msg) = events.resets.recv() => self.on_reset_event(msg).await,
                id = next_promotion(self.chain, "cross-unsafe", &mut db.cross_unsafe) => {
                    self.on_cross_unsafe_update(id).await;
                }
                pair = next_promotion(self.chain, "cross-safe", &mut db.cross_safe) => {
                    self.on_cross_safe_update(pair).await;
                }
                id = next_promotion(self.chain, "finalized", &mut db.finalized) => {
                    self.on_finalized_update(id).await;
                }
                Some(block) = events.unsafe_blocks.recv() => self.on_unsafe_block(block).await,
                Some(pair) = events.derivation_updates.recv() => self.on_derivation_update(pair).await,
                Some(pair) = events.exhaust_l1.recv() => self.on_exhaust_l1_event(pair).await,
            }
        }
        info!(target: "supervisor::node", chain_id = %self.chain, "Exiting node controller");
    }

    async fn on_cross_unsafe_update(&self, id: BlockId) {
        debug!(target: "supervisor::node", chain_id = %self.chain, cross_unsafe = ?id, "Updating cross-unsafe");
        match bounded(&self.cancel, self.config.node_timeout, self.node.update_cross_unsafe(id)).await
        {
            Ok(()) => {
                self.last_sent_cross_unsafe.send_replace(Some(id));
            }
            Err(err) => {
                metrics::counter!(Metrics::NODE_UPDATE_FAILURES, "update" => "cross_unsafe")
                    .increment(1);
                warn!(target: "supervisor::node", chain_id = %self.chain, error = %err, "Node failed cross-unsafe updating");
            }
        }
    }

    async fn on_cross_safe_update(&self, pair: DerivedIdPair) {
        debug!(
            target: "supervisor::node",
            chain_id = %self.chain,
            derived = ?pair.derived,
            derived_from = ?pair.derived_from,
            "Updating cross-safe"
        );
        let update = self.node.update_cross_safe(pair.derived, pair.derived_from);
        match bounded(&self.cancel, self.config.node_timeout, update).await {
            Ok(()) => {
                self.last_sent_cross_safe.send_replace(Some(pair));
            }
            Err(err) => {
                metrics::counter!(Metrics::NODE_UPDATE_FAILURES, "update" => "cross_safe")
                    .increment(1);
                warn!(target: "supervisor::node", chain_id = %self.chain, error = %err, "Node failed cross-safe updating");
            }
        }
    }

    async fn on_finalized_update(&self, id: BlockId) {
        debug!(target: "supervisor::node", chain_id = %self.chain, finalized = ?id, "Updating finalized");
        match bounded(&self.cancel, self.config.node_timeout, self.node.update_finalized(id)).await {
            Ok(()) => {
                self.last_sent_finalized.send_replace(Some(id));
            }
            Err(err) => {
                metrics::counter!(Metrics::NODE_UPDATE_FAILURES, "update" => "finalized")
                    .increment(1);
                warn!(target: "supervisor::node", chain_id = %self.chain, error = %err, "Node failed finality updating");
            }
        }
    }

    async fn on_unsafe_block(&self, block: BlockInfo) {
        info!(target: "supervisor::node", chain_id = %self.chain, unsafe_block = %block, "Node has new unsafe block");
        let update = self.backend.update_local_unsafe(self.chain, block);
        if let Err(err) = bounded(&self.cancel, self.config.internal_timeout, update).await {
            warn!(
                target: "supervisor::node",
                chain_id = %self.chain,
                unsafe_block = %block,
                error = %err,
                "Backend failed to pick up on new unsafe block"
            );
        }
    }

    async fn on_derivation_update(&self, pair: DerivedPair) {
        info!(
            target: "supervisor::node",
            chain_id = %self.chain,
            derived = %pair.derived,
            derived_from = %pair.derived_from,
            "Node derived new block"
        );
        let update = self.backend.update_local_safe(self.chain, pair.derived_from, pair.derived);
        let Err(err) = bounded(&self.cancel, self.config.internal_timeout, update).await else {
            return;
        };
        warn!(
            target: "supervisor::node",
            chain_id = %self.chain,
            derived = %pair.derived,
            derived_from = %pair.derived_from,
            error = %err,
            "Backend failed to process local-safe update"
        );
        if let Some(kind) = ResetKind::from_error(&err) {
            self.reset_signal(kind, pair.derived_from).await;
        }
    }

    async fn on_exhaust_l1_event(&self, completed: DerivedPair) {
        info!(
            target: "supervisor::node",
            chain_id = %self.chain,
            l2 = %completed.derived,
            l1 = %completed.derived_from,
            "Node completed syncing"
        );
        let number = completed.derived_from.number + 1;
        let next = match bounded(
            &self.cancel,
            self.config.internal_timeout,
            self.backend.l1_block_ref_by_number(number),
        )
        .await
        {
            Ok(next) => next,
            Err(err) if err.is_not_found() => {
                debug!(target: "supervisor::node", chain_id = %self.chain, l1_block = %completed.derived_from, error = %err, "Next L1 block is not yet available");
                return;
            }
            Err(err) => {
                error!(target: "supervisor::node", chain_id = %self.chain, l1_block = %completed.derived_from, error = %err, "Failed to retrieve next L1 block for node");
                return;
            }
        };

        if !completed.derived_from.is_parent_of(&next) {
            // The node asks for a reset if the block does not fit its derivation state.
            debug!(
                target: "supervisor::node",
                chain_id = %self.chain,
                l1_block = %completed.derived_from,
                next = %next,
                "Next L1 block does not build on the exhausted one, possible reorg"
            );
        }

        let provide = self.node.provide_l1(next);
        if let Err(err) = bounded(&self.cancel, self.config.node_timeout, provide).await {
            warn!(target: "supervisor::node", chain_id = %self.chain, next = %next, error = %err, "Failed to provide next L1 block to node");
        }
    }

    async fn on_reset_event(&self, msg: String) {
        warn!(target: "supervisor::node", chain_id = %self.chain, reason = %msg, "Node sent us a reset error");
        self.reset_signal(ResetKind::Future, BlockInfo::default()).await;
    }

    /// Resets the node to the heads the backend considers correct for `kind`.
    ///
    /// [`ResetKind::Conflict`] resets the safe head to the block derived at `l1_ref`,
    /// [`ResetKind::Future`] to the local-safe head. [`ResetKind::OutOfOrder`] is only logged.
    async fn reset_signal(&self, kind: ResetKind, l1_ref: BlockInfo) {
        if kind == ResetKind::OutOfOrder {
            warn!(target: "supervisor::node", chain_id = %self.chain, l1_ref = %l1_ref, "Node detected out of order block");
            return;
        }

        let heads = match bounded(
            &self.cancel,
            self.config.internal_timeout,
            self.resolve_reset_heads(kind, l1_ref),
        )
        .await
        {
            Ok(heads) => heads,
            Err(err) => {
                warn!(target: "supervisor::node", chain_id = %self.chain, %kind, error = %err, "Failed to resolve reset target");
                return;
            }
        };
        if !heads.is_ordered() {
            warn!(
                target: "supervisor::node",
                chain_id = %self.chain,
                unsafe_head = ?heads.unsafe_head,
                safe = ?heads.local_safe,
                finalized = ?heads.finalized,
                "Resetting node to unordered heads"
            );
        }

        warn!(
            target: "supervisor::node",
            chain_id = %self.chain,
            %kind,
            unsafe_head = ?heads.unsafe_head,
            safe = ?heads.local_safe,
            finalized = ?heads.finalized,
            "Resetting node"
        );
        let reset = self.node.reset(heads.unsafe_head, heads.local_safe, heads.finalized);
        match bounded(&self.cancel, self.config.node_timeout, reset).await {
            Ok(()) => {
                metrics::counter!(Metrics::NODE_RESETS, "kind" => kind.to_string()).increment(1);
            }
            Err(err) => {
                warn!(target: "supervisor::node", chain_id = %self.chain, error = %err, "Node failed to reset");
            }
        }
    }

    async fn resolve_reset_heads(
        &self,
        kind: ResetKind,
        l1_ref: BlockInfo,
    ) -> SupervisorResult<SafetyHeads> {
        let unsafe_head = self.backend.local_unsafe(self.chain).await?;
        let finalized = self.backend.finalized(self.chain).await?;
        let safe = match kind {
            ResetKind::Conflict => self.backend.safe_derived_at(self.chain, l1_ref.id()).await?,
            ResetKind::Future | ResetKind::OutOfOrder => {
                self.backend.local_safe(self.chain).await?.derived
            }
        };
        Ok(SafetyHeads { unsafe_head, local_safe: safe, cross_safe: safe, finalized })
    }
}
