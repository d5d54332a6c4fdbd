//! The set of chains the supervisor manages.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::ChainId;

/// The chains that may be attached to the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySet {
    /// Member chain ids.
    pub chains: HashSet<ChainId>,
}

impl DependencySet {
    /// Returns `true` if the chain is a member of the set.
    pub fn has_chain(&self, chain: ChainId) -> bool {
        self.chains.contains(&chain)
    }

    /// Returns the number of member chains.
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// Returns `true` if the set has no members.
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

impl FromIterator<ChainId> for DependencySet {
    fn from_iter<I: IntoIterator<Item = ChainId>>(iter: I) -> Self {
        Self { chains: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_chain() {
        let set: DependencySet = [10, 8453].into_iter().collect();
        assert!(set.has_chain(10));
        assert!(set.has_chain(8453));
        assert!(!set.has_chain(1));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_deserialize() {
        let set: DependencySet = serde_json::from_str(r#"{"chains":[901,902]}"#).unwrap();
        assert!(set.has_chain(901));
        assert!(set.has_chain(902));
        assert!(!set.is_empty());
    }
}
