//! Block references.

use alloy_eips::BlockNumHash;
use alloy_primitives::B256;
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// A reduced block reference holding only the block number and hash.
pub type BlockId = BlockNumHash;

/// Block Header Info
#[derive(
    Debug, Clone, Display, Copy, Eq, Hash, PartialEq, Default, Serialize, Deserialize,
)]
#[display("BlockInfo {{ hash: {hash}, number: {number}, parent_hash: {parent_hash}, timestamp: {timestamp} }}")]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    /// The block hash
    pub hash: B256,
    /// The block number
    pub number: u64,
    /// The parent block hash
    pub parent_hash: B256,
    /// The block timestamp
    pub timestamp: u64,
}

impl BlockInfo {
    /// Instantiates a new [`BlockInfo`].
    pub const fn new(hash: B256, number: u64, parent_hash: B256, timestamp: u64) -> Self {
        Self { hash, number, parent_hash, timestamp }
    }

    /// Returns the block ID.
    pub const fn id(&self) -> BlockId {
        BlockNumHash { hash: self.hash, number: self.number }
    }

    /// Returns the ID of the parent block.
    ///
    /// The parent of the genesis block is reported as number 0 with the zero hash.
    pub const fn parent_id(&self) -> BlockId {
        BlockNumHash { hash: self.parent_hash, number: self.number.saturating_sub(1) }
    }

    /// Returns `true` if this [`BlockInfo`] is the direct parent of the given block.
    pub fn is_parent_of(&self, block: &Self) -> bool {
        self.number + 1 == block.number && self.hash == block.parent_hash
    }
}
