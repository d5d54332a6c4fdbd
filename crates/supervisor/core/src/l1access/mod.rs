//! Confirmation-gated access to L1 data.

use async_trait::async_trait;

use crate::{BlockInfo, BlockLabel, SupervisorResult};

mod poller;

mod accessor;
pub use accessor::UpstreamAccessor;

/// An L1 RPC source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait L1Source: Send + Sync {
    /// Returns the L1 block with the given number.
    async fn l1_block_ref_by_number(&self, number: u64) -> SupervisorResult<BlockInfo>;

    /// Returns the L1 head with the given label.
    async fn l1_block_ref_by_label(&self, label: BlockLabel) -> SupervisorResult<BlockInfo>;
}
