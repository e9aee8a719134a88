//! # RiverMQ Stream Core
//!
//! RiverMQ is the per-stream runtime of a durable publish/subscribe messaging
//! engine. A *stream* is an append-only, sequence-numbered log of messages
//! bound to one or more subject patterns, with configurable retention,
//! storage, replication, deduplication, and mirroring.
//!
//! ## Architecture Overview
//!
//! The crate is organized around the following core components:
//!
//! - [`stream`] - Stream lifecycle, ingest pipeline, and mirror/source supervision
//! - [`store`] - Storage contract plus memory and file backed implementations
//! - [`account`] - Per-account stream registry, quotas, and snapshot restore
//! - [`broker`] - Subject router contract and an in-process broker
//! - [`sendq`] - Bounded outbound queue drained by a dedicated pump worker
//! - [`dedupe`] - Sliding duplicate-suppression window with a purge timer
//! - [`replication`] - Consensus node contract and proposal encoding
//! - [`config`] - Stream configuration schema, defaults, and admission rules
//!
//! Inbound publishes flow from the broker router into the ingest pipeline,
//! which validates headers, enforces limits, appends to the store, and fans
//! the message out to interested consumers. Mirrors and sources pull from
//! upstream streams through durable consumers and re-enter the same pipeline
//! while preserving origin sequencing. In clustered mode accepted messages
//! are first proposed to a consensus log and applied on replay.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rivermq::account::{Account, AccountConfig};
//! use rivermq::broker::InProcessBroker;
//! use rivermq::config::StreamConfig;
//!
//! fn main() -> rivermq::Result<()> {
//!     let broker = Arc::new(InProcessBroker::new());
//!     let account = Account::new(AccountConfig::new("ACME", "./data"), broker);
//!
//!     let stream = account.add_stream(StreamConfig {
//!         name: "orders".to_string(),
//!         subjects: vec!["orders.>".to_string()],
//!         ..Default::default()
//!     })?;
//!
//!     println!("stream {} ready", stream.name());
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod advisory;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod dedupe;
pub mod headers;
pub mod replication;
pub mod sendq;
pub mod snapshot;
pub mod store;
pub mod stream;
pub mod subject;

pub use account::{Account, AccountConfig, AccountLimits};
pub use broker::{Broker, InProcessBroker};
pub use config::{DiscardPolicy, RetentionPolicy, StorageType, StreamConfig, StreamSource};
pub use consumer::{Consumer, ConsumerFactory};
pub use headers::Headers;
pub use replication::ConsensusNode;
pub use store::{MessageStore, StoreState, StoredMsg};
pub use stream::{Stream, StreamInfo};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RiverMQ error types
///
/// Per-message rejections (duplicate ids, expectation mismatches, size caps)
/// are reported back to the publisher through the publish-ack and are never
/// fatal to the stream. Configuration and lifecycle errors surface to the
/// caller; storage and replication errors may tear a stream down.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage subsystem errors including file I/O and persistence failures
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing and serialization errors
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stream configuration validation and admission errors
    #[error("invalid stream configuration: {0}")]
    Config(String),

    /// A stream with this name exists with a different configuration
    #[error("stream name already in use")]
    StreamAlreadyExists,

    #[error("stream not found")]
    StreamNotFound,

    /// The stream has been stopped or deleted
    #[error("invalid stream")]
    StreamClosed,

    /// Proposed sequence does not line up with the local log
    #[error("last sequence mismatch")]
    LastSeqMismatch,

    /// Message id was already seen inside the duplicate window
    #[error("msgid is duplicate")]
    DuplicateMsgId,

    #[error("expected stream does not match")]
    ExpectedStreamMismatch,

    #[error("wrong last sequence: {0}")]
    ExpectedLastSeqMismatch(u64),

    #[error("wrong last msg ID: {0}")]
    ExpectedLastMsgIdMismatch(String),

    #[error("message size exceeds maximum allowed")]
    MaxPayloadExceeded,

    #[error("resource limits exceeded for account")]
    AccountLimitsExceeded,

    #[error("maximum number of streams reached")]
    TooManyStreams,

    /// Store rejected or failed an operation
    #[error("store error: {0}")]
    Store(String),

    #[error("store is closed")]
    StoreClosed,

    /// Consensus proposal or apply failures
    #[error("replication error: {0}")]
    Replication(String),

    /// Snapshot archive was malformed or did not match the restore request
    #[error("restore error: {0}")]
    Restore(String),

    /// The engine was disabled after a fatal storage error
    #[error("messaging engine is disabled")]
    Disabled,
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error detail carried inside a publish-ack or an upstream API reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u16,
    pub description: String,
}

impl ApiError {
    pub fn new(code: u16, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description, self.code)
    }
}
