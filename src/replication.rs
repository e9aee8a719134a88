//! Consensus bridge.
//!
//! In clustered mode the leader does not apply inbound publishes directly.
//! Accepted messages are encoded as [`StreamEntry`] values and proposed to
//! the consensus node; committed entries come back through the stream's
//! apply path, which re-enters the ingest pipeline with the proposed
//! sequence and timestamp. Rejections that never reach the log bump the
//! stream's failed-count so proposed sequences stay aligned.

use crate::headers::Headers;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Contract for the consensus/log-replication node backing a clustered
/// stream.
pub trait ConsensusNode: Send + Sync {
    /// True while this replica is the elected leader.
    fn is_leader(&self) -> bool;

    /// Submits an encoded entry for replication. May block on quorum
    /// back-pressure.
    fn propose(&self, entry: Vec<u8>) -> Result<()>;

    fn stop(&self);

    /// Stops the node and discards its log.
    fn delete(&self);
}

/// Cluster placement handed to a stream by the metadata layer.
#[derive(Clone)]
pub struct StreamAssignment {
    /// Subject peers use to sync against this replica.
    pub sync_subject: String,
    /// True once the assignment's originating request was answered; used to
    /// suppress duplicate advisories.
    pub responded: bool,
    pub node: Option<Arc<dyn ConsensusNode>>,
}

/// A replicated inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub subject: String,
    pub reply: String,
    pub headers: Headers,
    pub msg: Vec<u8>,
    /// Message count the proposer observed; the entry lands at `seq + 1`.
    pub seq: u64,
    /// Unix nanoseconds, zero when the applier should stamp its own.
    pub ts: i64,
}

pub fn encode_stream_entry(entry: &StreamEntry) -> Result<Vec<u8>> {
    bincode::serialize(entry).map_err(|e| Error::Replication(e.to_string()))
}

pub fn decode_stream_entry(buf: &[u8]) -> Result<StreamEntry> {
    bincode::deserialize(buf).map_err(|e| Error::Replication(e.to_string()))
}
