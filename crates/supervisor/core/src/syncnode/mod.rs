//! Synchronization between the supervisor and its managed nodes.
//!
//! Every attached node gets a [`NodeController`] that pushes safety promotions down to the node
//! and handles the events the node pushes up. The [`ControllerRegistry`] owns the controllers of
//! all chains and bootstraps empty chain databases from the first attached node.

mod traits;
pub use traits::{ChainsDb, EventStream, SyncBackend, SyncControl, SyncNode, SyncSource};

#[cfg(test)]
pub(crate) use traits::{MockChainsDb, MockSyncBackend, MockSyncControl};

mod resubscribe;

mod controller;
pub use controller::NodeController;

mod registry;
pub use registry::ControllerRegistry;

mod rpc;
pub use rpc::{InteropApiClient, RpcSyncNode};
