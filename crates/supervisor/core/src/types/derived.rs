//! Derivation pairs.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::{BlockId, BlockInfo};

/// Asserts that `derived` is the output of processing the L1 data available at `derived_from`.
#[derive(Debug, Clone, Copy, Display, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[display("DerivedPair {{ derived_from: {derived_from}, derived: {derived} }}")]
#[serde(rename_all = "camelCase")]
pub struct DerivedPair<T = BlockInfo> {
    /// The L1 block the pair was derived from.
    pub derived_from: T,
    /// The L2 block that was derived.
    pub derived: T,
}

/// A [`DerivedPair`] reduced to block ids.
pub type DerivedIdPair = DerivedPair<BlockId>;

impl<T> DerivedPair<T> {
    /// Creates a new pair.
    pub const fn new(derived_from: T, derived: T) -> Self {
        Self { derived_from, derived }
    }
}

impl DerivedPair<BlockInfo> {
    /// Reduces both references of the pair to their ids.
    pub const fn ids(&self) -> DerivedIdPair {
        DerivedPair { derived_from: self.derived_from.id(), derived: self.derived.id() }
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::B256;

    use super::*;

    #[test]
    fn test_ids() {
        let l1 = BlockInfo::new(B256::with_last_byte(1), 100, B256::ZERO, 1);
        let l2 = BlockInfo::new(B256::with_last_byte(2), 7, B256::ZERO, 2);
        let pair = DerivedPair::new(l1, l2);

        let ids = pair.ids();
        assert_eq!(ids.derived_from, l1.id());
        assert_eq!(ids.derived, l2.id());
    }

    #[test]
    fn test_serde_camel_case() {
        let pair = DerivedPair::new(BlockInfo::default(), BlockInfo::default());
        let json = serde_json::to_value(pair).unwrap();
        assert!(json.get("derivedFrom").is_some());
        assert!(json.get("derived").is_some());
    }
}
