//! Supervised node subscriptions.

use std::{future::Future, time::Duration};

use futures::StreamExt;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::{future::FutureExt as _, sync::CancellationToken};

use super::EventStream;
use crate::{ChainId, SupervisorResult};

/// Spawns a task that keeps a node subscription alive and forwards its events to `tx`.
///
/// Whenever subscribing fails or the stream ends or yields an error, the task waits `interval`
/// and subscribes again, dropping the previous stream. The task exits when `cancel` fires or when
/// `tx` is closed.
pub(super) fn spawn_resubscribe<T, F, Fut>(
    chain: ChainId,
    name: &'static str,
    subscribe: F,
    tx: mpsc::Sender<T>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = SupervisorResult<EventStream<T>>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match subscribe().with_cancellation_token(&cancel).await {
                None => break,
                Some(Ok(stream)) => {
                    debug!(target: "supervisor::node", chain_id = %chain, subscription = name, "Subscribed to node events");
                    if forward(chain, name, stream, &tx, &cancel).await.is_break() {
                        break;
                    }
                }
                Some(Err(err)) => {
                    warn!(target: "supervisor::node", chain_id = %chain, subscription = name, error = %err, "Failed to subscribe to node events");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        trace!(target: "supervisor::node", chain_id = %chain, subscription = name, "Subscription task stopped");
    })
}

/// Forwards events until the stream fails. Breaks if the task should exit.
async fn forward<T>(
    chain: ChainId,
    name: &'static str,
    mut stream: EventStream<T>,
    tx: &mpsc::Sender<T>,
    cancel: &CancellationToken,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return ControlFlow::Break(()),
            item = stream.next() => item,
        };
        match item {
            Some(Ok(event)) => {
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return ControlFlow::Break(()),
                    sent = tx.send(event) => sent,
                };
                if sent.is_err() {
                    return ControlFlow::Break(());
                }
            }
            Some(Err(err)) => {
                warn!(target: "supervisor::node", chain_id = %chain, subscription = name, error = %err, "Node subscription failed, resubscribing");
                return ControlFlow::Continue(());
            }
            None => {
                warn!(target: "supervisor::node", chain_id = %chain, subscription = name, "Node subscription closed, resubscribing");
                return ControlFlow::Continue(());
            }
        }
    }
}
