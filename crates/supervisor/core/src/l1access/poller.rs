//! Head polling.

use std::sync::Arc;

use alloy_primitives::B256;
use tokio_util::sync::CancellationToken;

use super::L1Source;
use crate::{AccessorConfig, BlockInfo, BlockLabel, SupervisorError, util::bounded};

/// Polls the `label` head of `source` until `cancel` fires, calling `on_head` whenever the head
/// hash changes.
///
/// Failed polls are retried after [`AccessorConfig::error_backoff`] instead of
/// [`AccessorConfig::poll_interval`].
pub(super) async fn poll_head<S, F>(
    source: Arc<S>,
    label: BlockLabel,
    config: AccessorConfig,
    cancel: CancellationToken,
    mut on_head: F,
) where
    S: L1Source + ?Sized,
    F: FnMut(BlockInfo) + Send,
{
    let mut last: Option<B256> = None;
    loop {
        let delay = match bounded(
            &cancel,
            config.request_timeout,
            source.l1_block_ref_by_label(label),
        )
        .await
        {
            Ok(head) => {
                if last != Some(head.hash) {
                    trace!(target: "supervisor::l1_access", %label, head = %head, "New L1 head");
                    last = Some(head.hash);
                    on_head(head);
                }
                config.poll_interval
            }
            Err(SupervisorError::Cancelled) => break,
            Err(err) => {
                warn!(target: "supervisor::l1_access", %label, error = %err, "Failed to poll L1 head");
                config.error_backoff
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!(target: "supervisor::l1_access", %label, "L1 head poller stopped");
}
