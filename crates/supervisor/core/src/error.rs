//! Error types shared by the supervisor components.

use std::time::Duration;

use thiserror::Error;

use crate::ChainId;

/// The error taxonomy of the supervisor.
///
/// The data-availability and consistency variants drive recovery: [`Self::NotFound`] and
/// [`Self::NotYetAvailable`] are retried later, while [`Self::Conflict`], [`Self::Future`] and
/// [`Self::OutOfOrder`] classify a divergence between a node and the database (see
/// [`ResetKind::from_error`](crate::ResetKind::from_error)).
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The requested data does not exist (yet).
    #[error("not found")]
    NotFound,
    /// The requested block exists upstream but is not sufficiently confirmed.
    #[error("block {0} is not yet available")]
    NotYetAvailable(u64),
    /// The data conflicts with what has already been recorded.
    #[error("conflicting data")]
    Conflict,
    /// The data is ahead of what the counterpart can justify.
    #[error("data from the future")]
    Future,
    /// The data is older than data that was already processed.
    #[error("out of order data")]
    OutOfOrder,
    /// The chain is not part of the dependency set.
    #[error("chain {0} is not in the dependency set")]
    UnknownChain(ChainId),
    /// A request did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// A request was abandoned because its owner is shutting down.
    #[error("request cancelled")]
    Cancelled,
    /// No upstream client is attached.
    #[error("no rpc source configured")]
    NoRpcSource,
    /// A receipts provider returned a different number of receipt sets than requested.
    #[error("expected {expected} receipt sets, got {actual}")]
    ReceiptCountMismatch {
        /// The number of requested receipt sets.
        expected: usize,
        /// The number of returned receipt sets.
        actual: usize,
    },
    /// A subscription was closed by the remote end.
    #[error("subscription closed")]
    SubscriptionClosed,
    /// An internal channel was closed unexpectedly.
    #[error("a channel has been closed unexpectedly")]
    ChannelClosed,
    /// JSON-RPC client error.
    #[error(transparent)]
    Rpc(#[from] jsonrpsee::core::ClientError),
    /// Any other error.
    #[error("{0}")]
    Custom(String),
}

impl SupervisorError {
    /// Returns `true` if the error means the data is not available yet and the request should be
    /// retried later.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound | Self::NotYetAvailable(_))
    }
}

/// Result type alias for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::not_found(SupervisorError::NotFound, true)]
    #[case::not_yet_available(SupervisorError::NotYetAvailable(7), true)]
    #[case::conflict(SupervisorError::Conflict, false)]
    #[case::timeout(SupervisorError::Timeout(Duration::from_secs(1)), false)]
    #[case::no_source(SupervisorError::NoRpcSource, false)]
    fn test_is_not_found(#[case] err: SupervisorError, #[case] expected: bool) {
        assert_eq!(err.is_not_found(), expected);
    }
}
