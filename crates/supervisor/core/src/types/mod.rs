//! Core types shared across the supervisor components.

mod block;
pub use block::{BlockId, BlockInfo};

mod derived;
pub use derived::{DerivedIdPair, DerivedPair};

mod safety;
pub use safety::{BlockLabel, ResetKind, SafetyHeads, SafetyLevel};

mod dependency;
pub use dependency::DependencySet;

/// Identifier of a chain participating in the dependency set.
pub use alloy_primitives::ChainId;

/// The receipts of a single block, in transaction order.
pub type Receipts = Vec<alloy_consensus::Receipt>;
