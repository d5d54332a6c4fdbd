//! Safety levels and reset classification.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::BlockId;
use crate::SupervisorError;

/// Label of an upstream head.
#[derive(Debug, Clone, Copy, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockLabel {
    /// The latest block.
    #[display("latest")]
    Latest,
    /// The latest finalized block.
    #[display("finalized")]
    Finalized,
}

/// The safety tiers a block moves through, from least to most safe.
#[derive(
    Debug, Clone, Copy, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    /// Accepted by a node without L1 or cross-chain confirmation.
    #[display("unsafe")]
    Unsafe,
    /// Derived from L1 data, without cross-chain checks.
    #[display("local_safe")]
    LocalSafe,
    /// Local-safe and verified against the dependency set.
    #[display("cross_safe")]
    CrossSafe,
    /// Irreversible per L1 finality.
    #[display("finalized")]
    Finalized,
}

/// The frontier of every safety tier of one chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafetyHeads {
    /// Unsafe head.
    pub unsafe_head: BlockId,
    /// Local-safe head.
    pub local_safe: BlockId,
    /// Cross-safe head.
    pub cross_safe: BlockId,
    /// Finalized head.
    pub finalized: BlockId,
}

impl SafetyHeads {
    /// Returns the head of the given tier.
    pub const fn head(&self, level: SafetyLevel) -> BlockId {
        match level {
            SafetyLevel::Unsafe => self.unsafe_head,
            SafetyLevel::LocalSafe => self.local_safe,
            SafetyLevel::CrossSafe => self.cross_safe,
            SafetyLevel::Finalized => self.finalized,
        }
    }

    /// Returns `true` if `finalized <= cross-safe <= local-safe <= unsafe` by block number.
    pub const fn is_ordered(&self) -> bool {
        self.finalized.number <= self.cross_safe.number &&
            self.cross_safe.number <= self.local_safe.number &&
            self.local_safe.number <= self.unsafe_head.number
    }
}

/// Why a node must be reset.
#[derive(Debug, Clone, Copy, Display, PartialEq, Eq, Hash)]
pub enum ResetKind {
    /// The node's derived history disagrees with the database.
    #[display("conflict")]
    Conflict,
    /// The node reported a block beyond what the database recorded as safe.
    #[display("future")]
    Future,
    /// A stale event arrived after a newer one was processed.
    #[display("out_of_order")]
    OutOfOrder,
}

impl ResetKind {
    /// Classifies a backend error, returning [`None`] if the error does not call for a reset.
    pub const fn from_error(err: &SupervisorError) -> Option<Self> {
        match err {
            SupervisorError::Conflict => Some(Self::Conflict),
            SupervisorError::Future => Some(Self::Future),
            SupervisorError::OutOfOrder => Some(Self::OutOfOrder),
            _ => None,
        }
    }
}
