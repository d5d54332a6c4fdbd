//! Helpers for bounding requests by a timeout and a cancellation token.

use std::{future::Future, time::Duration};

use tokio_util::{future::FutureExt as _, sync::CancellationToken};

use crate::{SupervisorError, SupervisorResult};

/// Runs `fut` until it completes, `timeout` elapses or `cancel` fires, whichever happens first.
pub(crate) async fn bounded<F, T>(
    cancel: &CancellationToken,
    timeout: Duration,
    fut: F,
) -> SupervisorResult<T>
where
    F: Future<Output = SupervisorResult<T>>,
{
    match tokio::time::timeout(timeout, fut).with_cancellation_token(cancel).await {
        None => Err(SupervisorError::Cancelled),
        Some(Err(_)) => Err(SupervisorError::Timeout(timeout)),
        Some(Ok(res)) => res,
    }
}
