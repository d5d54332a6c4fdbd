//! Configuration types and validation for the supervisor.

use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use url::Url;

use crate::constants::{
    DEFAULT_CONFIRMATION_DEPTH, DEFAULT_EVENT_BUFFER, DEFAULT_INDEXER_POLL_INTERVAL,
    DEFAULT_INDEXER_RPC_TIMEOUT, DEFAULT_INTERNAL_TIMEOUT, DEFAULT_L1_ERROR_BACKOFF,
    DEFAULT_L1_POLL_INTERVAL, DEFAULT_L1_REQUEST_TIMEOUT, DEFAULT_MAX_BATCH_SIZE,
    DEFAULT_NODE_TIMEOUT, DEFAULT_RECEIPTS_CACHE_SIZE, DEFAULT_RESUBSCRIBE_INTERVAL,
};

/// Errors that can occur during configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid URL format.
    #[error("invalid {field} URL: {reason}")]
    InvalidUrl {
        /// The field name that contains the invalid URL.
        field: &'static str,
        /// The reason the URL is invalid.
        reason: String,
    },
    /// A field value is out of the allowed range.
    #[error("{field} must be {constraint}, got {value}")]
    OutOfRange {
        /// The field name that is out of range.
        field: &'static str,
        /// The constraint description.
        constraint: &'static str,
        /// The actual value.
        value: String,
    },
}

/// Supervisor tuning arguments.
#[derive(Debug, Clone, Parser)]
#[command(next_help_heading = "Supervisor")]
pub struct SupervisorArgs {
    /// WebSocket URLs of the managed nodes.
    #[arg(
        long = "node-rpc",
        env = "SUPERVISOR_NODE_RPCS",
        value_delimiter = ',',
        value_parser = parse_url
    )]
    pub node_rpcs: Vec<Url>,

    /// Maximum number of blocks indexed per receipts batch.
    #[arg(long = "indexer.max-batch-size", env = "SUPERVISOR_INDEXER_MAX_BATCH_SIZE", default_value_t = DEFAULT_MAX_BATCH_SIZE)]
    pub max_batch_size: usize,

    /// Interval at which the indexer checks for new blocks (e.g., "5s").
    #[arg(
        long = "indexer.poll-interval",
        env = "SUPERVISOR_INDEXER_POLL_INTERVAL",
        default_value = "5s",
        value_parser = parse_duration
    )]
    pub indexer_poll_interval: Duration,

    /// Number of receipt sets kept in the receipts cache.
    #[arg(long = "receipts-cache-size", env = "SUPERVISOR_RECEIPTS_CACHE_SIZE", default_value_t = DEFAULT_RECEIPTS_CACHE_SIZE)]
    pub receipts_cache_size: usize,

    /// Number of L1 confirmations required before a block is served.
    #[arg(long = "l1.confirmation-depth", env = "SUPERVISOR_L1_CONFIRMATION_DEPTH", default_value_t = DEFAULT_CONFIRMATION_DEPTH)]
    pub confirmation_depth: u64,

    /// Interval between two polls of an L1 head (e.g., "3s").
    #[arg(
        long = "l1.poll-interval",
        env = "SUPERVISOR_L1_POLL_INTERVAL",
        default_value = "3s",
        value_parser = parse_duration
    )]
    pub l1_poll_interval: Duration,

    /// Timeout of requests sent to managed nodes (e.g., "10s").
    #[arg(
        long = "node.timeout",
        env = "SUPERVISOR_NODE_TIMEOUT",
        default_value = "10s",
        value_parser = parse_duration
    )]
    pub node_timeout: Duration,

    /// Timeout of backend requests triggered by node events (e.g., "30s").
    #[arg(
        long = "node.internal-timeout",
        env = "SUPERVISOR_NODE_INTERNAL_TIMEOUT",
        default_value = "30s",
        value_parser = parse_duration
    )]
    pub internal_timeout: Duration,

    /// Interval before a failed node subscription is re-established (e.g., "10s").
    #[arg(
        long = "node.resubscribe-interval",
        env = "SUPERVISOR_NODE_RESUBSCRIBE_INTERVAL",
        default_value = "10s",
        value_parser = parse_duration
    )]
    pub resubscribe_interval: Duration,
}

/// Configuration of a [`ChainIndexer`](crate::ChainIndexer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexerConfig {
    /// Maximum number of blocks collected before fetching receipts.
    pub max_batch_size: usize,
    /// Interval at which the worker wakes up without a head signal.
    pub poll_interval: Duration,
    /// Timeout of each request against the source.
    pub rpc_timeout: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            poll_interval: DEFAULT_INDEXER_POLL_INTERVAL,
            rpc_timeout: DEFAULT_INDEXER_RPC_TIMEOUT,
        }
    }
}

/// Configuration of an [`UpstreamAccessor`](crate::UpstreamAccessor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessorConfig {
    /// Number of blocks withheld below the latest observed tip.
    pub confirmation_depth: u64,
    /// Interval between two polls of a head.
    pub poll_interval: Duration,
    /// Interval to wait after a failed poll.
    pub error_backoff: Duration,
    /// Timeout of a single poll.
    pub request_timeout: Duration,
}

impl Default for AccessorConfig {
    fn default() -> Self {
        Self {
            confirmation_depth: DEFAULT_CONFIRMATION_DEPTH,
            poll_interval: DEFAULT_L1_POLL_INTERVAL,
            error_backoff: DEFAULT_L1_ERROR_BACKOFF,
            request_timeout: DEFAULT_L1_REQUEST_TIMEOUT,
        }
    }
}

/// Configuration of a [`NodeController`](crate::NodeController).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeControllerConfig {
    /// Timeout of requests sent to the node.
    pub node_timeout: Duration,
    /// Timeout of backend requests triggered by node events.
    pub internal_timeout: Duration,
    /// Interval before a failed subscription is re-established.
    pub resubscribe_interval: Duration,
    /// Capacity of each event channel.
    pub event_buffer: usize,
}

impl Default for NodeControllerConfig {
    fn default() -> Self {
        Self {
            node_timeout: DEFAULT_NODE_TIMEOUT,
            internal_timeout: DEFAULT_INTERNAL_TIMEOUT,
            resubscribe_interval: DEFAULT_RESUBSCRIBE_INTERVAL,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Validated supervisor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// WebSocket URLs of the managed nodes.
    pub node_rpcs: Vec<Url>,
    /// Number of receipt sets kept in the receipts cache.
    pub receipts_cache_size: usize,
    /// Indexer configuration.
    pub indexer: IndexerConfig,
    /// L1 accessor configuration.
    pub accessor: AccessorConfig,
    /// Node controller configuration.
    pub node: NodeControllerConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            node_rpcs: Vec::new(),
            receipts_cache_size: DEFAULT_RECEIPTS_CACHE_SIZE,
            indexer: IndexerConfig::default(),
            accessor: AccessorConfig::default(),
            node: NodeControllerConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Validates the raw arguments and builds the configuration.
    pub fn from_args(args: SupervisorArgs) -> Result<Self, ConfigError> {
        for url in &args.node_rpcs {
            validate_url(url, "node-rpc")?;
        }
        non_zero("indexer.max-batch-size", args.max_batch_size as u64)?;
        non_zero("receipts-cache-size", args.receipts_cache_size as u64)?;
        non_zero_duration("indexer.poll-interval", args.indexer_poll_interval)?;
        non_zero_duration("l1.poll-interval", args.l1_poll_interval)?;
        non_zero_duration("node.timeout", args.node_timeout)?;
        non_zero_duration("node.internal-timeout", args.internal_timeout)?;
        non_zero_duration("node.resubscribe-interval", args.resubscribe_interval)?;

        Ok(Self {
            node_rpcs: args.node_rpcs,
            receipts_cache_size: args.receipts_cache_size,
            indexer: IndexerConfig {
                max_batch_size: args.max_batch_size,
                poll_interval: args.indexer_poll_interval,
                ..Default::default()
            },
            accessor: AccessorConfig {
                confirmation_depth: args.confirmation_depth,
                poll_interval: args.l1_poll_interval,
                ..Default::default()
            },
            node: NodeControllerConfig {
                node_timeout: args.node_timeout,
                internal_timeout: args.internal_timeout,
                resubscribe_interval: args.resubscribe_interval,
                ..Default::default()
            },
        })
    }
}

/// Validate that a URL has a scheme and host.
pub fn validate_url(url: &Url, field: &'static str) -> Result<(), ConfigError> {
    if url.scheme().is_empty() {
        return Err(ConfigError::InvalidUrl { field, reason: "missing scheme".to_string() });
    }

    if url.host().is_none() {
        return Err(ConfigError::InvalidUrl { field, reason: "missing host".to_string() });
    }

    Ok(())
}

fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::OutOfRange {
            field,
            constraint: "greater than 0",
            value: value.to_string(),
        });
    }
    Ok(())
}

fn non_zero_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::OutOfRange {
            field,
            constraint: "greater than 0s",
            value: format!("{value:?}"),
        });
    }
    Ok(())
}

/// Parse a duration string using humantime.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Parse a URL string.
fn parse_url(s: &str) -> Result<Url, url::ParseError> {
    Url::parse(s)
}
