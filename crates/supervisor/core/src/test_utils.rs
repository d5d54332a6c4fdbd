//! In-memory collaborators for tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use alloy_consensus::{Eip658Value, Receipt};
use alloy_primitives::B256;
use async_trait::async_trait;
use futures::{StreamExt, channel::mpsc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::{
    BlockId, BlockInfo, ChainId, ChainsDb, DatabaseRewinder, DerivedIdPair, DerivedPair,
    EventStream, IndexerSource, LogProcessor, Receipts, ReceiptsProvider, ReceiptsRequest,
    SupervisorError, SupervisorResult, SyncBackend, SyncControl, SyncSource,
};

/// Returns the hash of block `number` of the test chain.
pub fn block_hash(number: u64) -> B256 {
    B256::left_padding_from(&(number + 1).to_be_bytes())
}

/// Returns block `number` of the test chain. Consecutive blocks are linked by parent hash.
pub fn block_info(number: u64) -> BlockInfo {
    let parent_hash = if number == 0 { B256::ZERO } else { block_hash(number - 1) };
    BlockInfo::new(block_hash(number), number, parent_hash, number * 2)
}

/// Returns the receipts of block `number` of the test chain.
pub fn receipts_for(number: u64) -> Receipts {
    vec![Receipt {
        status: Eip658Value::Eip658(true),
        cumulative_gas_used: 21_000 * (number + 1),
        logs: vec![],
    }]
}

/// A log database that records processed blocks in memory.
///
/// Blocks must be processed in order; a gap is rejected with [`SupervisorError::OutOfOrder`].
#[derive(Debug, Default)]
pub struct MemoryLogDb {
    processed: Mutex<Vec<BlockInfo>>,
    fail_at: Mutex<Option<u64>>,
    rewinds: Mutex<Vec<u64>>,
}

impl MemoryLogDb {
    /// Makes the next attempt to process block `number` fail.
    pub fn fail_once_at(&self, number: u64) {
        *self.fail_at.lock() = Some(number);
    }

    /// Returns the numbers of the recorded blocks.
    pub fn processed_numbers(&self) -> Vec<u64> {
        self.processed.lock().iter().map(|b| b.number).collect()
    }

    /// Returns the heads of every rewind, in order.
    pub fn rewinds(&self) -> Vec<u64> {
        self.rewinds.lock().clone()
    }
}

#[async_trait]
impl LogProcessor for MemoryLogDb {
    async fn process_logs(
        &self,
        _chain: ChainId,
        block: &BlockInfo,
        _receipts: &Receipts,
    ) -> SupervisorResult<()> {
        {
            let mut fail_at = self.fail_at.lock();
            if *fail_at == Some(block.number) {
                fail_at.take();
                return Err(SupervisorError::Custom(format!("failed to process {}", block.number)));
            }
        }
        let mut processed = self.processed.lock();
        let expected = processed.last().map_or(0, |last| last.number + 1);
        if block.number != expected {
            return Err(SupervisorError::OutOfOrder);
        }
        processed.push(*block);
        Ok(())
    }
}

#[async_trait]
impl DatabaseRewinder for MemoryLogDb {
    async fn rewind(&self, _chain: ChainId, head: u64) -> SupervisorResult<()> {
        self.processed.lock().retain(|b| b.number <= head);
        self.rewinds.lock().push(head);
        Ok(())
    }

    async fn latest_block_num(&self, _chain: ChainId) -> Option<u64> {
        self.processed.lock().last().map(|b| b.number)
    }
}

/// A chain of [`block_info`] blocks up to a movable head.
#[derive(Debug)]
pub struct MemoryChainSource {
    head: AtomicU64,
    block_delay: Duration,
    receipt_batches: Mutex<Vec<usize>>,
}

impl MemoryChainSource {
    /// Creates a source serving blocks `0..=head`.
    pub fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            block_delay: Duration::ZERO,
            receipt_batches: Mutex::new(Vec::new()),
        }
    }

    /// Delays every block lookup by `delay`.
    pub fn with_block_delay(mut self, delay: Duration) -> Self {
        self.block_delay = delay;
        self
    }

    /// Moves the head.
    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Returns the size of every receipts batch served, in order.
    pub fn receipt_batches(&self) -> Vec<usize> {
        self.receipt_batches.lock().clone()
    }
}

#[async_trait]
impl IndexerSource for MemoryChainSource {
    async fn block_ref_by_number(&self, number: u64) -> SupervisorResult<BlockInfo> {
        if !self.block_delay.is_zero() {
            tokio::time::sleep(self.block_delay).await;
        }
        if number > self.head.load(Ordering::SeqCst) {
            return Err(SupervisorError::NotFound);
        }
        Ok(block_info(number))
    }

    async fn batch_fetch_receipts(&self, blocks: &[BlockInfo]) -> SupervisorResult<Vec<Receipts>> {
        self.receipt_batches.lock().push(blocks.len());
        Ok(blocks.iter().map(|b| receipts_for(b.number)).collect())
    }
}

/// A downstream call received by a [`MemorySyncNode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCall {
    /// `update_cross_unsafe`
    CrossUnsafe(BlockId),
    /// `update_cross_safe`
    CrossSafe {
        /// Derived block.
        derived: BlockId,
        /// L1 block it was derived from.
        derived_from: BlockId,
    },
    /// `update_finalized`
    Finalized(BlockId),
    /// `reset`
    Reset {
        /// Unsafe head.
        unsafe_head: BlockId,
        /// Safe head.
        safe: BlockId,
        /// Finalized head.
        finalized: BlockId,
    },
    /// `provide_l1`
    ProvideL1(BlockInfo),
}

type EventSender<T> = Mutex<Option<mpsc::UnboundedSender<SupervisorResult<T>>>>;

/// A managed node held in memory.
///
/// Serves the [`block_info`] chain up to a head, records downstream calls, and lets tests push
/// events into its subscriptions.
#[derive(Debug)]
pub struct MemorySyncNode {
    chain: ChainId,
    head: AtomicU64,
    anchor: DerivedPair,
    anchor_delay: Duration,
    anchor_calls: AtomicUsize,
    receipt_batches: Mutex<Vec<usize>>,
    calls: watch::Sender<Vec<NodeCall>>,
    subscriptions: watch::Sender<usize>,
    fail_updates: Mutex<bool>,
    unsafe_blocks: EventSender<BlockInfo>,
    derivation_updates: EventSender<DerivedPair>,
    exhaust_l1: EventSender<DerivedPair>,
    resets: EventSender<String>,
}

impl MemorySyncNode {
    /// Creates a node of `chain` serving blocks `0..=head`.
    pub fn new(chain: ChainId, head: u64) -> Self {
        Self {
            chain,
            head: AtomicU64::new(head),
            anchor: DerivedPair::new(block_info(100), block_info(0)),
            anchor_delay: Duration::ZERO,
            anchor_calls: AtomicUsize::new(0),
            receipt_batches: Mutex::new(Vec::new()),
            calls: watch::Sender::new(Vec::new()),
            subscriptions: watch::Sender::new(0),
            fail_updates: Mutex::new(false),
            unsafe_blocks: Mutex::new(None),
            derivation_updates: Mutex::new(None),
            exhaust_l1: Mutex::new(None),
            resets: Mutex::new(None),
        }
    }

    /// Sets the anchor point served by the node.
    pub fn with_anchor(mut self, anchor: DerivedPair) -> Self {
        self.anchor = anchor;
        self
    }

    /// Delays every anchor point request by `delay`.
    pub fn with_anchor_delay(mut self, delay: Duration) -> Self {
        self.anchor_delay = delay;
        self
    }

    /// Makes every downstream update fail.
    pub fn fail_updates(&self, fail: bool) {
        *self.fail_updates.lock() = fail;
    }

    /// Returns how often the anchor point was requested.
    pub fn anchor_calls(&self) -> usize {
        self.anchor_calls.load(Ordering::SeqCst)
    }

    /// Returns the size of every receipts batch served, in order.
    pub fn receipt_batches(&self) -> Vec<usize> {
        self.receipt_batches.lock().clone()
    }

    /// Returns the downstream calls received so far.
    pub fn calls(&self) -> Vec<NodeCall> {
        self.calls.borrow().clone()
    }

    /// Waits until the received downstream calls satisfy `f`.
    pub async fn wait_for_calls(&self, mut f: impl FnMut(&[NodeCall]) -> bool) {
        let mut rx = self.calls.subscribe();
        let _ = rx.wait_for(|calls| f(calls)).await;
    }

    /// Waits until at least `count` subscriptions have been opened.
    pub async fn wait_for_subscriptions(&self, count: usize) {
        let mut rx = self.subscriptions.subscribe();
        let _ = rx.wait_for(|opened| *opened >= count).await;
    }

    /// Pushes a new unsafe block. Returns `false` if nobody is subscribed.
    pub fn push_unsafe_block(&self, block: BlockInfo) -> bool {
        push(&self.unsafe_blocks, Ok(block))
    }

    /// Pushes a derivation update. Returns `false` if nobody is subscribed.
    pub fn push_derivation_update(&self, pair: DerivedPair) -> bool {
        push(&self.derivation_updates, Ok(pair))
    }

    /// Pushes an L1 exhaustion signal. Returns `false` if nobody is subscribed.
    pub fn push_exhaust_l1(&self, pair: DerivedPair) -> bool {
        push(&self.exhaust_l1, Ok(pair))
    }

    /// Pushes a reset request. Returns `false` if nobody is subscribed.
    pub fn push_reset(&self, reason: impl Into<String>) -> bool {
        push(&self.resets, Ok(reason.into()))
    }

    /// Fails the unsafe blocks subscription.
    pub fn fail_unsafe_blocks(&self) -> bool {
        push(&self.unsafe_blocks, Err(SupervisorError::SubscriptionClosed))
    }

    fn record(&self, call: NodeCall) -> SupervisorResult<()> {
        if *self.fail_updates.lock() {
            return Err(SupervisorError::Custom("update rejected".to_string()));
        }
        self.calls.send_modify(|calls| calls.push(call));
        Ok(())
    }

    fn subscribe<T: Send + 'static>(&self, slot: &EventSender<T>) -> EventStream<T> {
        let (tx, rx) = mpsc::unbounded();
        *slot.lock() = Some(tx);
        self.subscriptions.send_modify(|opened| *opened += 1);
        rx.boxed()
    }
}

fn push<T>(slot: &EventSender<T>, event: SupervisorResult<T>) -> bool {
    slot.lock().as_ref().is_some_and(|tx| tx.unbounded_send(event).is_ok())
}

#[async_trait]
impl ReceiptsProvider for MemorySyncNode {
    async fn fetch_receipts(
        &self,
        block: &BlockInfo,
        _tx_hashes: &[B256],
    ) -> SupervisorResult<Receipts> {
        Ok(receipts_for(block.number))
    }

    async fn batch_fetch_receipts(
        &self,
        requests: &[ReceiptsRequest],
    ) -> SupervisorResult<Vec<Receipts>> {
        self.receipt_batches.lock().push(requests.len());
        Ok(requests.iter().map(|r| receipts_for(r.block.number)).collect())
    }
}

#[async_trait]
impl SyncSource for MemorySyncNode {
    async fn block_ref_by_number(&self, number: u64) -> SupervisorResult<BlockInfo> {
        if number > self.head.load(Ordering::SeqCst) {
            return Err(SupervisorError::NotFound);
        }
        Ok(block_info(number))
    }

    async fn chain_id(&self) -> SupervisorResult<ChainId> {
        Ok(self.chain)
    }
}

#[async_trait]
impl SyncControl for MemorySyncNode {
    async fn subscribe_unsafe_blocks(&self) -> SupervisorResult<EventStream<BlockInfo>> {
        Ok(self.subscribe(&self.unsafe_blocks))
    }

    async fn subscribe_derivation_updates(&self) -> SupervisorResult<EventStream<DerivedPair>> {
        Ok(self.subscribe(&self.derivation_updates))
    }

    async fn subscribe_exhaust_l1_events(&self) -> SupervisorResult<EventStream<DerivedPair>> {
        Ok(self.subscribe(&self.exhaust_l1))
    }

    async fn subscribe_reset_events(&self) -> SupervisorResult<EventStream<String>> {
        Ok(self.subscribe(&self.resets))
    }

    async fn update_cross_unsafe(&self, id: BlockId) -> SupervisorResult<()> {
        self.record(NodeCall::CrossUnsafe(id))
    }

    async fn update_cross_safe(
        &self,
        derived: BlockId,
        derived_from: BlockId,
    ) -> SupervisorResult<()> {
        self.record(NodeCall::CrossSafe { derived, derived_from })
    }

    async fn update_finalized(&self, id: BlockId) -> SupervisorResult<()> {
        self.record(NodeCall::Finalized(id))
    }

    async fn reset(
        &self,
        unsafe_head: BlockId,
        safe: BlockId,
        finalized: BlockId,
    ) -> SupervisorResult<()> {
        self.record(NodeCall::Reset { unsafe_head, safe, finalized })
    }

    async fn provide_l1(&self, next: BlockInfo) -> SupervisorResult<()> {
        self.record(NodeCall::ProvideL1(next))
    }

    async fn anchor_point(&self) -> SupervisorResult<DerivedPair> {
        self.anchor_calls.fetch_add(1, Ordering::SeqCst);
        if !self.anchor_delay.is_zero() {
            tokio::time::sleep(self.anchor_delay).await;
        }
        Ok(self.anchor)
    }
}

#[derive(Debug)]
struct DbChannels {
    cross_unsafe: broadcast::Sender<BlockId>,
    cross_safe: broadcast::Sender<DerivedIdPair>,
    finalized: broadcast::Sender<BlockId>,
}

impl Default for DbChannels {
    fn default() -> Self {
        Self {
            cross_unsafe: broadcast::Sender::new(16),
            cross_safe: broadcast::Sender::new(16),
            finalized: broadcast::Sender::new(16),
        }
    }
}

/// A safety database held in memory.
#[derive(Debug, Default)]
pub struct MemoryChainsDb {
    local_safe: Mutex<HashMap<ChainId, DerivedPair>>,
    cross_safe: Mutex<HashMap<ChainId, DerivedPair>>,
    local_safe_writes: AtomicUsize,
    cross_safe_writes: AtomicUsize,
    channels: Mutex<HashMap<ChainId, DbChannels>>,
}

impl MemoryChainsDb {
    /// Returns the number of local-safe writes.
    pub fn local_safe_writes(&self) -> usize {
        self.local_safe_writes.load(Ordering::SeqCst)
    }

    /// Returns the number of cross-safe writes.
    pub fn cross_safe_writes(&self) -> usize {
        self.cross_safe_writes.load(Ordering::SeqCst)
    }

    /// Returns the recorded cross-safe head.
    pub fn cross_safe(&self, chain: ChainId) -> Option<DerivedPair> {
        self.cross_safe.lock().get(&chain).copied()
    }

    /// Publishes a cross-unsafe promotion.
    pub fn promote_cross_unsafe(&self, chain: ChainId, id: BlockId) {
        let _ = self.channels.lock().entry(chain).or_default().cross_unsafe.send(id);
    }

    /// Publishes a finality promotion.
    pub fn promote_finalized(&self, chain: ChainId, id: BlockId) {
        let _ = self.channels.lock().entry(chain).or_default().finalized.send(id);
    }
}

impl ChainsDb for MemoryChainsDb {
    fn local_safe(&self, chain: ChainId) -> SupervisorResult<DerivedPair> {
        self.local_safe.lock().get(&chain).copied().ok_or(SupervisorError::Future)
    }

    fn update_local_safe(
        &self,
        chain: ChainId,
        derived_from: BlockInfo,
        derived: BlockInfo,
    ) -> SupervisorResult<()> {
        self.local_safe_writes.fetch_add(1, Ordering::SeqCst);
        self.local_safe.lock().insert(chain, DerivedPair::new(derived_from, derived));
        Ok(())
    }

    fn update_cross_safe(
        &self,
        chain: ChainId,
        derived_from: BlockInfo,
        derived: BlockInfo,
    ) -> SupervisorResult<()> {
        self.cross_safe_writes.fetch_add(1, Ordering::SeqCst);
        let pair = DerivedPair::new(derived_from, derived);
        self.cross_safe.lock().insert(chain, pair);
        let _ = self.channels.lock().entry(chain).or_default().cross_safe.send(pair.ids());
        Ok(())
    }

    fn subscribe_cross_unsafe(
        &self,
        chain: ChainId,
    ) -> SupervisorResult<broadcast::Receiver<BlockId>> {
        Ok(self.channels.lock().entry(chain).or_default().cross_unsafe.subscribe())
    }

    fn subscribe_cross_safe(
        &self,
        chain: ChainId,
    ) -> SupervisorResult<broadcast::Receiver<DerivedIdPair>> {
        Ok(self.channels.lock().entry(chain).or_default().cross_safe.subscribe())
    }

    fn subscribe_finalized(&self, chain: ChainId) -> SupervisorResult<broadcast::Receiver<BlockId>> {
        Ok(self.channels.lock().entry(chain).or_default().finalized.subscribe())
    }
}

/// A supervisor backend held in memory.
///
/// Reads are answered from fixed heads; writes are recorded. Queued errors are returned by the
/// next local-safe updates.
#[derive(Debug)]
pub struct MemoryBackend {
    /// Local-unsafe head.
    pub local_unsafe: BlockId,
    /// Local-safe head.
    pub local_safe: DerivedIdPair,
    /// Finalized head.
    pub finalized: BlockId,
    /// Answer of `safe_derived_at`.
    pub safe_derived_at: BlockId,
    /// Highest L1 block served by `l1_block_ref_by_number`.
    pub l1_head: u64,
    /// L1 block served with a parent hash off the [`block_info`] chain.
    pub forked_l1: Option<u64>,
    local_safe_errors: Mutex<VecDeque<SupervisorError>>,
    unsafe_heads: watch::Sender<Vec<BlockInfo>>,
    local_safe_updates: watch::Sender<Vec<DerivedPair>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            local_unsafe: block_info(20).id(),
            local_safe: DerivedPair::new(block_info(110).id(), block_info(15).id()),
            finalized: block_info(5).id(),
            safe_derived_at: block_info(12).id(),
            l1_head: 120,
            forked_l1: None,
            local_safe_errors: Mutex::new(VecDeque::new()),
            unsafe_heads: watch::Sender::new(Vec::new()),
            local_safe_updates: watch::Sender::new(Vec::new()),
        }
    }
}

impl MemoryBackend {
    /// Queues an error for the next local-safe update.
    pub fn reject_next_local_safe(&self, err: SupervisorError) {
        self.local_safe_errors.lock().push_back(err);
    }

    /// Waits until at least `count` unsafe heads have been recorded and returns them.
    pub async fn wait_for_unsafe_heads(&self, count: usize) -> Vec<BlockInfo> {
        let mut rx = self.unsafe_heads.subscribe();
        rx.wait_for(|heads| heads.len() >= count).await.map(|h| h.to_vec()).unwrap_or_default()
    }

    /// Waits until at least `count` local-safe updates have been recorded and returns them.
    pub async fn wait_for_local_safe_updates(&self, count: usize) -> Vec<DerivedPair> {
        let mut rx = self.local_safe_updates.subscribe();
        rx.wait_for(|updates| updates.len() >= count).await.map(|u| u.to_vec()).unwrap_or_default()
    }
}

#[async_trait]
impl SyncBackend for MemoryBackend {
    async fn update_local_unsafe(&self, _chain: ChainId, head: BlockInfo) -> SupervisorResult<()> {
        self.unsafe_heads.send_modify(|heads| heads.push(head));
        Ok(())
    }

    async fn update_local_safe(
        &self,
        _chain: ChainId,
        derived_from: BlockInfo,
        derived: BlockInfo,
    ) -> SupervisorResult<()> {
        let rejection = self.local_safe_errors.lock().pop_front();
        if let Some(err) = rejection {
            return Err(err);
        }
        self.local_safe_updates.send_modify(|u| u.push(DerivedPair::new(derived_from, derived)));
        Ok(())
    }

    async fn local_safe(&self, _chain: ChainId) -> SupervisorResult<DerivedIdPair> {
        Ok(self.local_safe)
    }

    async fn local_unsafe(&self, _chain: ChainId) -> SupervisorResult<BlockId> {
        Ok(self.local_unsafe)
    }

    async fn safe_derived_at(
        &self,
        _chain: ChainId,
        _derived_from: BlockId,
    ) -> SupervisorResult<BlockId> {
        Ok(self.safe_derived_at)
    }

    async fn finalized(&self, _chain: ChainId) -> SupervisorResult<BlockId> {
        Ok(self.finalized)
    }

    async fn l1_block_ref_by_number(&self, number: u64) -> SupervisorResult<BlockInfo> {
        if number > self.l1_head {
            return Err(SupervisorError::NotYetAvailable(number));
        }
        if self.forked_l1 == Some(number) {
            return Ok(BlockInfo { parent_hash: B256::repeat_byte(0xff), ..block_info(number) });
        }
        Ok(block_info(number))
    }
}
