//! The [`ChainIndexer`] worker.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    sync::{Mutex as AsyncMutex, mpsc, watch},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::{DatabaseRewinder, IndexerSource, LogProcessor};
use crate::{
    BlockInfo, ChainId, IndexerConfig, Metrics, SupervisorError, SupervisorResult, util::bounded,
};

/// Indexes the blocks of one chain in order.
///
/// The indexer is a cheap handle over shared state: clones drive the same worker. Work is
/// triggered by [`Self::notify_head_advanced`], by a periodic tick, or synchronously through
/// [`Self::process_to_head`].
pub struct ChainIndexer<P, D> {
    inner: Arc<Inner<P, D>>,
}

impl<P, D> fmt::Debug for ChainIndexer<P, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainIndexer")
            .field("chain", &self.inner.chain)
            .field("last_head", &self.inner.last_head)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<P, D> Clone for ChainIndexer<P, D> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct Inner<P, D> {
    chain: ChainId,
    /// Guards source swaps and serializes batches.
    source: AsyncMutex<Option<Arc<dyn IndexerSource>>>,
    processor: Arc<P>,
    rewinder: Arc<D>,
    last_head: AtomicU64,
    wake_tx: mpsc::Sender<()>,
    wake_rx: parking_lot::Mutex<Option<mpsc::Receiver<()>>>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    indexed: watch::Sender<Option<BlockInfo>>,
    config: IndexerConfig,
    cancel: CancellationToken,
}

impl<P, D> ChainIndexer<P, D>
where
    P: LogProcessor + 'static,
    D: DatabaseRewinder + 'static,
{
    /// Creates an indexer for `chain` without a source. Its worker is a child of `cancel`.
    pub fn new(
        chain: ChainId,
        processor: Arc<P>,
        rewinder: Arc<D>,
        config: IndexerConfig,
        cancel: &CancellationToken,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(Inner {
                chain,
                source: AsyncMutex::new(None),
                processor,
                rewinder,
                last_head: AtomicU64::new(0),
                wake_tx,
                wake_rx: parking_lot::Mutex::new(Some(wake_rx)),
                worker: parking_lot::Mutex::new(None),
                indexed: watch::Sender::new(None),
                config,
                cancel: cancel.child_token(),
            }),
        }
    }

    /// Returns the chain this indexer works on.
    pub fn chain(&self) -> ChainId {
        self.inner.chain
    }

    /// Spawns the background worker. Calling it again has no effect.
    pub fn start(&self) {
        let Some(wake_rx) = self.inner.wake_rx.lock().take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        *self.inner.worker.lock() = Some(tokio::spawn(inner.run(wake_rx)));
    }

    /// Replaces the source. Waits for an in-flight batch fetch to finish first.
    pub async fn set_source(&self, source: Arc<dyn IndexerSource>) {
        *self.inner.source.lock().await = Some(source);
        debug!(target: "supervisor::indexer", chain_id = %self.inner.chain, "Indexer source attached");
        self.inner.wake();
    }

    /// Removes the source. Waits for an in-flight batch fetch to finish first.
    pub async fn clear_source(&self) {
        self.inner.source.lock().await.take();
    }

    /// Records the latest known head and wakes the worker.
    ///
    /// Wake-ups collapse: if one is already pending this is a no-op apart from recording the
    /// head.
    pub fn notify_head_advanced(&self, head: BlockInfo) {
        self.inner.last_head.fetch_max(head.number, Ordering::AcqRel);
        self.inner.wake();
    }

    /// Returns the highest head announced through [`Self::notify_head_advanced`].
    pub fn last_head(&self) -> u64 {
        self.inner.last_head.load(Ordering::Acquire)
    }

    /// Subscribes to the last successfully indexed block.
    pub fn subscribe_indexed(&self) -> watch::Receiver<Option<BlockInfo>> {
        self.inner.indexed.subscribe()
    }

    /// Indexes until the source has no further block available or a block fails to process.
    pub async fn process_to_head(&self) -> SupervisorResult<()> {
        self.inner.work().await
    }

    /// Stops the worker and waits for it to exit.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl<P, D> Inner<P, D>
where
    P: LogProcessor,
    D: DatabaseRewinder,
{
    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    async fn run(self: Arc<Self>, mut wake_rx: mpsc::Receiver<()>) {
        info!(target: "supervisor::indexer", chain_id = %self.chain, "Starting chain indexer");
        let mut ticker = time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,
                _ = wake_rx.recv() => {}
                _ = ticker.tick() => {}
            }

            match self.work().await {
                Ok(()) | Err(SupervisorError::Cancelled) => {}
                Err(SupervisorError::NoRpcSource) => {
                    debug!(target: "supervisor::indexer", chain_id = %self.chain, "No source attached, cannot index new blocks");
                }
                Err(err) if err.is_not_found() => {
                    debug!(target: "supervisor::indexer", chain_id = %self.chain, error = %err, "Next blocks not available yet");
                }
                Err(err) => {
                    warn!(target: "supervisor::indexer", chain_id = %self.chain, error = %err, "Failed to index new blocks");
                }
            }
        }
        info!(target: "supervisor::indexer", chain_id = %self.chain, "Chain indexer stopped");
    }

    /// Indexes batches back to back for as long as batches come back full.
    async fn work(&self) -> SupervisorResult<()> {
        while self.range_update().await? {
            trace!(target: "supervisor::indexer", chain_id = %self.chain, "Batch full, continuing");
        }
        Ok(())
    }

    /// Indexes the next batch of blocks.
    ///
    /// Returns `true` if a full batch was indexed and more blocks are likely available.
    async fn range_update(&self) -> SupervisorResult<bool> {
        // Held until the batch is processed so concurrent runs read the cursor in turn.
        let source = self.source.lock().await;
        let source = source.as_ref().ok_or(SupervisorError::NoRpcSource)?;
        let next = match self.rewinder.latest_block_num(self.chain).await {
            Some(latest) => latest + 1,
            None => 0,
        };
        let timeout = self.config.rpc_timeout;

        let mut blocks: Vec<BlockInfo> = Vec::with_capacity(self.config.max_batch_size);
        for number in next..next + self.config.max_batch_size as u64 {
            let block =
                match bounded(&self.cancel, timeout, source.block_ref_by_number(number)).await {
                    Ok(block) => block,
                    Err(err) if err.is_not_found() => break,
                    Err(err) => return Err(err),
                };
            if let Some(parent) = blocks.last() &&
                !parent.is_parent_of(&block)
            {
                debug!(
                    target: "supervisor::indexer",
                    chain_id = %self.chain,
                    parent = %parent,
                    block = %block,
                    "Block does not build on the previous one, ending batch"
                );
                break;
            }
            blocks.push(block);
        }
        if blocks.is_empty() {
            return Ok(false);
        }

        let receipts = bounded(&self.cancel, timeout, source.batch_fetch_receipts(&blocks)).await?;
        if receipts.len() != blocks.len() {
            return Err(SupervisorError::ReceiptCountMismatch {
                expected: blocks.len(),
                actual: receipts.len(),
            });
        }

        for (block, receipts) in blocks.iter().zip(&receipts) {
            if let Err(err) = self.processor.process_logs(self.chain, block, receipts).await {
                error!(
                    target: "supervisor::indexer",
                    chain_id = %self.chain,
                    block = %block,
                    error = %err,
                    "Failed to process block"
                );
                self.rewind_before(block).await;
                return Ok(false);
            }
            metrics::counter!(Metrics::INDEXER_BLOCKS_PROCESSED).increment(1);
            self.indexed.send_replace(Some(*block));
        }

        debug!(
            target: "supervisor::indexer",
            chain_id = %self.chain,
            from = blocks[0].number,
            to = blocks[blocks.len() - 1].number,
            "Indexed blocks"
        );
        Ok(blocks.len() == self.config.max_batch_size)
    }

    /// Rewinds the database to the parent of `block`, unless `block` is genesis.
    async fn rewind_before(&self, block: &BlockInfo) {
        if block.number == 0 {
            warn!(target: "supervisor::indexer", chain_id = %self.chain, "Cannot rewind below genesis");
            return;
        }
        let head = block.number - 1;
        match self.rewinder.rewind(self.chain, head).await {
            Ok(()) => {
                metrics::counter!(Metrics::INDEXER_REWINDS).increment(1);
                info!(target: "supervisor::indexer", chain_id = %self.chain, head, "Rewound database after processing failure");
            }
            Err(err) => {
                error!(target: "supervisor::indexer", chain_id = %self.chain, head, error = %err, "Failed to rewind database");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        indexer::{MockDatabaseRewinder, MockIndexerSource, MockLogProcessor},
        test_utils::{MemoryChainSource, MemoryLogDb, block_info, receipts_for},
    };

    const CHAIN: ChainId = 901;

    fn indexer(
        db: &Arc<MemoryLogDb>,
        max_batch_size: usize,
    ) -> ChainIndexer<MemoryLogDb, MemoryLogDb> {
        let config = IndexerConfig { max_batch_size, ..Default::default() };
        ChainIndexer::new(CHAIN, Arc::clone(db), Arc::clone(db), config, &CancellationToken::new())
    }

    #[tokio::test]
    async fn test_process_to_head_batches() {
        let db = Arc::new(MemoryLogDb::default());
        let source = Arc::new(MemoryChainSource::new(24));
        let indexer = indexer(&db, 10);
        indexer.set_source(source.clone()).await;

        indexer.process_to_head().await.unwrap();

        assert_eq!(source.receipt_batches(), vec![10, 10, 5]);
        assert_eq!(db.processed_numbers(), (0..=24).collect::<Vec<_>>());
        assert_eq!(*indexer.subscribe_indexed().borrow(), Some(block_info(24)));
    }

    #[tokio::test]
    async fn test_resumes_from_database_cursor() {
        let db = Arc::new(MemoryLogDb::default());
        let source = Arc::new(MemoryChainSource::new(4));
        let indexer = indexer(&db, 10);
        indexer.set_source(source.clone()).await;

        indexer.process_to_head().await.unwrap();
        source.set_head(7);
        indexer.process_to_head().await.unwrap();

        assert_eq!(source.receipt_batches(), vec![5, 3]);
        assert_eq!(db.processed_numbers(), (0..=7).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_rewinds_on_processing_failure() {
        let db = Arc::new(MemoryLogDb::default());
        db.fail_once_at(6);
        let source = Arc::new(MemoryChainSource::new(9));
        let indexer = indexer(&db, 10);
        indexer.set_source(source.clone()).await;

        indexer.process_to_head().await.unwrap();
        assert_eq!(db.processed_numbers(), (0..=5).collect::<Vec<_>>());
        assert_eq!(db.rewinds(), vec![5]);

        indexer.process_to_head().await.unwrap();
        assert_eq!(db.processed_numbers(), (0..=9).collect::<Vec<_>>());
        assert_eq!(source.receipt_batches(), vec![10, 4]);
    }

    #[tokio::test]
    async fn test_genesis_failure_is_not_rewound() {
        let mut processor = MockLogProcessor::new();
        processor
            .expect_process_logs()
            .times(1)
            .returning(|_, _, _| Err(SupervisorError::Custom("bad logs".to_string())));
        let mut rewinder = MockDatabaseRewinder::new();
        rewinder.expect_latest_block_num().returning(|_| None);
        rewinder.expect_rewind().never();
        let mut source = MockIndexerSource::new();
        source.expect_block_ref_by_number().returning(|n| {
            if n < 3 { Ok(block_info(n)) } else { Err(SupervisorError::NotFound) }
        });
        source
            .expect_batch_fetch_receipts()
            .times(1)
            .returning(|blocks| Ok(blocks.iter().map(|b| receipts_for(b.number)).collect()));

        let indexer = ChainIndexer::new(
            CHAIN,
            Arc::new(processor),
            Arc::new(rewinder),
            IndexerConfig::default(),
            &CancellationToken::new(),
        );
        indexer.set_source(Arc::new(source)).await;

        indexer.process_to_head().await.unwrap();
    }

    #[tokio::test]
    async fn test_walk_stops_at_parent_mismatch() {
        let mut source = MockIndexerSource::new();
        source.expect_block_ref_by_number().returning(|n| match n {
            0..=2 => Ok(block_info(n)),
            3 => Ok(BlockInfo { parent_hash: Default::default(), ..block_info(3) }),
            _ => Err(SupervisorError::NotFound),
        });
        source
            .expect_batch_fetch_receipts()
            .withf(|blocks| blocks.len() == 3)
            .times(1)
            .returning(|blocks| Ok(blocks.iter().map(|b| receipts_for(b.number)).collect()));
        let db = Arc::new(MemoryLogDb::default());
        let indexer = indexer(&db, 10);
        indexer.set_source(Arc::new(source)).await;

        indexer.process_to_head().await.unwrap();

        assert_eq!(db.processed_numbers(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_no_source() {
        let db = Arc::new(MemoryLogDb::default());
        let indexer = indexer(&db, 10);

        assert!(matches!(indexer.process_to_head().await, Err(SupervisorError::NoRpcSource)));
    }

    #[tokio::test]
    async fn test_receipt_count_mismatch() {
        let mut source = MockIndexerSource::new();
        source.expect_block_ref_by_number().returning(|n| {
            if n < 2 { Ok(block_info(n)) } else { Err(SupervisorError::NotFound) }
        });
        source.expect_batch_fetch_receipts().returning(|_| Ok(vec![receipts_for(0)]));
        let db = Arc::new(MemoryLogDb::default());
        let indexer = indexer(&db, 10);
        indexer.set_source(Arc::new(source)).await;

        let err = indexer.process_to_head().await.unwrap_err();

        assert!(matches!(err, SupervisorError::ReceiptCountMismatch { expected: 2, actual: 1 }));
        assert!(db.processed_numbers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_runs_do_not_rewind_each_other() {
        let db = Arc::new(MemoryLogDb::default());
        let source =
            Arc::new(MemoryChainSource::new(9).with_block_delay(Duration::from_millis(1)));
        let first = indexer(&db, 10);
        first.set_source(source.clone()).await;
        first.process_to_head().await.unwrap();

        source.set_head(29);
        let second = first.clone();
        let (a, b) = tokio::join!(first.process_to_head(), second.process_to_head());

        a.unwrap();
        b.unwrap();
        assert!(db.rewinds().is_empty());
        assert_eq!(db.processed_numbers(), (0..=29).collect::<Vec<_>>());
        assert_eq!(source.receipt_batches(), vec![10, 10, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_indexes_on_head_signal() {
        let db = Arc::new(MemoryLogDb::default());
        let source = Arc::new(MemoryChainSource::new(2));
        let indexer = indexer(&db, 10);
        indexer.set_source(source.clone()).await;
        indexer.start();

        let mut indexed = indexer.subscribe_indexed();
        indexed.wait_for(|b| b.is_some_and(|b| b.number == 2)).await.unwrap();

        source.set_head(5);
        indexer.notify_head_advanced(block_info(5));
        indexed.wait_for(|b| b.is_some_and(|b| b.number == 5)).await.unwrap();
        assert_eq!(indexer.last_head(), 5);

        indexer.close().await;
        source.set_head(8);
        indexer.notify_head_advanced(block_info(8));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(db.processed_numbers().last(), Some(&5));
    }
}
