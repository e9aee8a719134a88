//! Consumer contract.
//!
//! Delivery state machines live outside the stream core. The stream owns
//! the registry of handles and drives them through this trait: pending
//! accounting on every append, immediate delivery attempts, purge and stop
//! notifications. A consumer holds only a weak reference back to its stream
//! and treats a missing back-reference as closed.

use crate::headers::Headers;
use crate::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Handle the stream keeps for each attached consumer.
pub trait Consumer: Send + Sync {
    fn name(&self) -> String;

    /// Filter subject, when the consumer only wants a subset of the stream.
    fn filter_subject(&self) -> Option<String> {
        None
    }

    /// Clustered consumers only deliver from their leader replica.
    fn is_leader(&self) -> bool {
        true
    }

    fn inc_stream_pending(&self, seq: u64, subject: &str);

    fn dec_stream_pending(&self, seq: u64, subject: &str);

    /// Attempts to deliver the message inline. Returns false when the
    /// consumer could not take it now and wants a wakeup signal instead.
    fn deliver_current_msg(
        &self,
        subject: &str,
        hdr: &Headers,
        msg: &Bytes,
        seq: u64,
        ts: i64,
    ) -> bool;

    fn signal_new_messages(&self);

    /// Called by the send pump when a tagged delivery found no interest.
    fn did_not_deliver(&self, seq: u64);

    /// True while the consumer still needs an ack for `seq`. Drives
    /// interest-retention removal.
    fn needs_ack(&self, _seq: u64) -> bool {
        false
    }

    /// The stream was purged up to `first_seq`.
    fn purge(&self, first_seq: u64);

    fn stop(&self, delete: bool, advisory: bool);

    /// Serialized durable state for snapshot archives. `None` excludes the
    /// consumer from snapshots.
    fn snapshot_meta(&self) -> Option<ConsumerSnapshot> {
        None
    }
}

/// Archived consumer metadata and delivery state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSnapshot {
    pub name: String,
    /// False for ephemeral consumers. Restores recreate those as durable
    /// first so they survive the restart, then switch them back.
    pub durable: bool,
    pub created: DateTime<Utc>,
    pub config: serde_json::Value,
    pub state: serde_json::Value,
}

/// Recreates consumers while restoring a stream from a snapshot.
pub trait ConsumerFactory: Send + Sync {
    fn restore(
        &self,
        stream: &Arc<crate::stream::Stream>,
        snapshot: ConsumerSnapshot,
    ) -> Result<Arc<dyn Consumer>>;
}
