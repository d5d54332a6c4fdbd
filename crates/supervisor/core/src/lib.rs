#![doc = include_str!("../README.md")]
#![doc(
    html_logo_url = "https://avatars.githubusercontent.com/u/16627100?s=200&v=4",
    issue_tracker_base_url = "https://github.com/base/base/issues/"
)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod config;
pub use config::{
    AccessorConfig, ConfigError, IndexerConfig, NodeControllerConfig, SupervisorArgs,
    SupervisorConfig,
};

pub mod constants;

mod error;
pub use error::{SupervisorError, SupervisorResult};

mod metrics;
pub use metrics::Metrics;

mod types;
pub use types::{
    BlockId, BlockInfo, BlockLabel, ChainId, DependencySet, DerivedIdPair, DerivedPair, Receipts,
    ResetKind, SafetyHeads, SafetyLevel,
};

mod util;

mod receipts;
pub use receipts::{ReceiptCache, ReceiptsProvider, ReceiptsRequest, batch_key};

mod l1access;
pub use l1access::{L1Source, UpstreamAccessor};

mod indexer;
pub use indexer::{
    CachedSyncSource, ChainIndexer, DatabaseRewinder, IndexerSource, LogProcessor,
};

mod syncnode;
pub use syncnode::{
    ChainsDb, ControllerRegistry, EventStream, InteropApiClient, NodeController, RpcSyncNode,
    SyncBackend, SyncControl, SyncNode, SyncSource,
};

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
