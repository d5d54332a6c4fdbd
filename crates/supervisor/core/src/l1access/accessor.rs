//! The [`UpstreamAccessor`].

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::{
    sync::{RwLock, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::{L1Source, poller::poll_head};
use crate::{
    AccessorConfig, BlockInfo, BlockLabel, SupervisorError, SupervisorResult, util::bounded,
};

/// An attached client together with the pollers watching its heads.
#[derive(Debug)]
struct Attached<S: ?Sized> {
    client: Arc<S>,
    cancel: CancellationToken,
    pollers: Vec<JoinHandle<()>>,
}

impl<S: ?Sized> Attached<S> {
    async fn stop(self) {
        self.cancel.cancel();
        for poller in self.pollers {
            let _ = poller.await;
        }
    }
}

/// Serves L1 block references while withholding blocks that are not sufficiently confirmed.
///
/// A background poller tracks the latest L1 height; requests for blocks within
/// [`AccessorConfig::confirmation_depth`] of it fail with [`SupervisorError::NotYetAvailable`]
/// without reaching the client. A second poller publishes the finalized head.
#[derive(Debug)]
pub struct UpstreamAccessor<S: ?Sized> {
    attached: RwLock<Option<Attached<S>>>,
    tip_height: Arc<AtomicU64>,
    finalized: watch::Sender<Option<BlockInfo>>,
    config: AccessorConfig,
    cancel: CancellationToken,
}

impl<S: L1Source + ?Sized + 'static> UpstreamAccessor<S> {
    /// Creates an accessor without a client. Its pollers are children of `cancel`.
    pub fn new(config: AccessorConfig, cancel: CancellationToken) -> Self {
        Self {
            attached: RwLock::new(None),
            tip_height: Arc::new(AtomicU64::new(0)),
            finalized: watch::Sender::new(None),
            config,
            cancel,
        }
    }

    /// Replaces the upstream client.
    ///
    /// The pollers of the previous client are stopped before the new ones start, all under the
    /// client write lock, so the two clients are never polled at the same time.
    pub async fn attach_client(&self, client: Arc<S>) {
        let mut attached = self.attached.write().await;
        if let Some(previous) = attached.take() {
            previous.stop().await;
        }

        let cancel = self.cancel.child_token();
        let tip_height = Arc::clone(&self.tip_height);
        let latest = tokio::spawn(poll_head(
            Arc::clone(&client),
            BlockLabel::Latest,
            self.config,
            cancel.clone(),
            move |head| tip_height.store(head.number, Ordering::Release),
        ));
        let finalized_tx = self.finalized.clone();
        let finalized = tokio::spawn(poll_head(
            Arc::clone(&client),
            BlockLabel::Finalized,
            self.config,
            cancel.clone(),
            move |head| {
                finalized_tx.send_replace(Some(head));
            },
        ));

        *attached = Some(Attached { client, cancel, pollers: vec![latest, finalized] });
        info!(target: "supervisor::l1_access", "Attached L1 client");
    }

    async fn client(&self) -> SupervisorResult<Arc<S>> {
        self.attached
            .read()
            .await
            .as_ref()
            .map(|attached| Arc::clone(&attached.client))
            .ok_or(SupervisorError::NoRpcSource)
    }

    /// Returns the L1 block with the given number if it is at least
    /// [`AccessorConfig::confirmation_depth`] blocks below the latest observed tip.
    pub async fn block_ref_by_number(&self, number: u64) -> SupervisorResult<BlockInfo> {
        let client = self.client().await?;
        let tip = self.tip_height();
        // Nothing is confirmed while the tip is shallower than the depth.
        if tip.checked_sub(self.config.confirmation_depth).is_none_or(|max| number > max) {
            trace!(target: "supervisor::l1_access", number, tip, "Withholding unconfirmed L1 block");
            return Err(SupervisorError::NotYetAvailable(number));
        }
        bounded(&self.cancel, self.config.request_timeout, client.l1_block_ref_by_number(number))
            .await
    }

    /// Returns the L1 head with the given label, straight from the client.
    pub async fn head_by_label(&self, label: BlockLabel) -> SupervisorResult<BlockInfo> {
        let client = self.client().await?;
        bounded(&self.cancel, self.config.request_timeout, client.l1_block_ref_by_label(label))
            .await
    }

    /// Returns the latest observed L1 height.
    pub fn tip_height(&self) -> u64 {
        self.tip_height.load(Ordering::Acquire)
    }

    /// Subscribes to the finalized L1 head.
    pub fn subscribe_finalized(&self) -> watch::Receiver<Option<BlockInfo>> {
        self.finalized.subscribe()
    }

    /// Stops the pollers and detaches the client.
    pub async fn close(&self) {
        if let Some(attached) = self.attached.write().await.take() {
            attached.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use async_trait::async_trait;

    use super::*;
    use crate::{l1access::MockL1Source, test_utils::block_info};

    /// Source with a fixed latest head that counts its head polls.
    #[derive(Debug)]
    struct FixedSource {
        latest: u64,
        polls: AtomicUsize,
    }

    impl FixedSource {
        fn new(latest: u64) -> Arc<Self> {
            Arc::new(Self { latest, polls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl L1Source for FixedSource {
        async fn l1_block_ref_by_number(&self, number: u64) -> SupervisorResult<BlockInfo> {
            Ok(block_info(number))
        }

        async fn l1_block_ref_by_label(&self, label: BlockLabel) -> SupervisorResult<BlockInfo> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(match label {
                BlockLabel::Latest => block_info(self.latest),
                BlockLabel::Finalized => block_info(self.latest.saturating_sub(10)),
            })
        }
    }

    async fn wait_for_tip<S: L1Source + ?Sized + 'static>(accessor: &UpstreamAccessor<S>, tip: u64) {
        while accessor.tip_height() != tip {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_client() {
        let accessor =
            UpstreamAccessor::<MockL1Source>::new(AccessorConfig::default(), CancellationToken::new());
        assert!(matches!(
            accessor.block_ref_by_number(1).await,
            Err(SupervisorError::NoRpcSource)
        ));
        assert!(matches!(
            accessor.head_by_label(BlockLabel::Latest).await,
            Err(SupervisorError::NoRpcSource)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_withholds_unconfirmed_blocks() {
        let accessor =
            UpstreamAccessor::new(AccessorConfig::default(), CancellationToken::new());
        accessor.attach_client(FixedSource::new(100)).await;
        wait_for_tip(&accessor, 100).await;

        assert_eq!(accessor.block_ref_by_number(98).await.unwrap(), block_info(98));
        assert!(matches!(
            accessor.block_ref_by_number(99).await,
            Err(SupervisorError::NotYetAvailable(99))
        ));
        assert!(matches!(
            accessor.block_ref_by_number(101).await,
            Err(SupervisorError::NotYetAvailable(101))
        ));

        let mut finalized = accessor.subscribe_finalized();
        let head = *finalized.wait_for(Option::is_some).await.unwrap();
        assert_eq!(head, Some(block_info(90)));

        accessor.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_withholds_genesis_below_confirmation_depth() {
        let accessor =
            UpstreamAccessor::new(AccessorConfig::default(), CancellationToken::new());
        accessor.attach_client(FixedSource::new(1)).await;
        wait_for_tip(&accessor, 1).await;

        assert!(matches!(
            accessor.block_ref_by_number(0).await,
            Err(SupervisorError::NotYetAvailable(0))
        ));

        accessor.attach_client(FixedSource::new(2)).await;
        wait_for_tip(&accessor, 2).await;
        assert_eq!(accessor.block_ref_by_number(0).await.unwrap(), block_info(0));

        accessor.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_stops_previous_pollers() {
        let accessor =
            UpstreamAccessor::new(AccessorConfig::default(), CancellationToken::new());
        let first = FixedSource::new(100);
        let second = FixedSource::new(200);

        accessor.attach_client(Arc::clone(&first)).await;
        wait_for_tip(&accessor, 100).await;
        accessor.attach_client(Arc::clone(&second)).await;
        wait_for_tip(&accessor, 200).await;

        let polls = first.polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(first.polls.load(Ordering::SeqCst), polls);
        assert!(second.polls.load(Ordering::SeqCst) > 2);

        accessor.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_back_off() {
        let mut source = MockL1Source::new();
        source
            .expect_l1_block_ref_by_label()
            .withf(|label| *label == BlockLabel::Latest)
            .returning(|_| Err(SupervisorError::Custom("unavailable".to_string())));
        source
            .expect_l1_block_ref_by_label()
            .withf(|label| *label == BlockLabel::Finalized)
            .returning(|_| Ok(block_info(5)));
        let accessor =
            UpstreamAccessor::new(AccessorConfig::default(), CancellationToken::new());
        accessor.attach_client(Arc::new(source)).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(accessor.tip_height(), 0);
        assert!(matches!(
            accessor.block_ref_by_number(0).await,
            Err(SupervisorError::NotYetAvailable(0))
        ));
        assert!(matches!(
            accessor.block_ref_by_number(1).await,
            Err(SupervisorError::NotYetAvailable(1))
        ));

        accessor.close().await;
    }
}
