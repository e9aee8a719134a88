//! # Storage Layer
//!
//! The stream core talks to its backing log through the [`MessageStore`]
//! contract. Two implementations are provided:
//!
//! - [`memory::MemoryStore`] - in-memory ordered map, used for
//!   `StorageType::Memory` streams and throughout the test suite
//! - [`file::FileStore`] - append-only log file with CRC checked records and
//!   an in-memory index rebuilt on open
//!
//! Sequence numbers are assigned by the store on [`MessageStore::store_msg`]
//! and by the caller on [`MessageStore::store_raw_msg`] (used when a
//! consensus log or an upstream mirror dictates sequencing). Every mutation
//! is reported through the registered storage-update callback as
//! `(delta_msgs, delta_bytes, seq, subject)`; the stream uses single-message
//! removals to keep consumer pending counts honest and forwards byte deltas
//! to the account usage accounting.

pub mod file;
pub mod memory;


use crate::config::{StorageType, StreamConfig};
use crate::headers::Headers;
use crate::Result;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked on every store mutation with
/// `(delta_msgs, delta_bytes, seq, subject)`.
pub type StorageUpdateFn = Box<dyn Fn(i64, i64, u64, &str) + Send + Sync>;

/// Aggregate state of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreState {
    pub msgs: u64,
    pub bytes: u64,
    pub first_seq: u64,
    pub first_ts: i64,
    pub last_seq: u64,
    pub last_ts: i64,
}

/// A message loaded from a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMsg {
    pub subject: String,
    pub seq: u64,
    pub headers: Headers,
    pub data: Bytes,
    /// Unix nanoseconds.
    pub ts: i64,
}

impl StoredMsg {
    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.ts)
    }
}

/// A file to be placed into a snapshot archive, relative to the stream's
/// storage directory.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    pub rel_path: String,
    pub data: Vec<u8>,
}

/// Contract the stream core places on its backing log.
pub trait MessageStore: Send + Sync {
    /// Assigns the next sequence, persists the message, and returns
    /// `(seq, ts)` with `ts` in unix nanoseconds.
    fn store_msg(&self, subject: &str, hdr: &Headers, msg: &Bytes) -> Result<(u64, i64)>;

    /// Persists a message at a caller-assigned sequence and timestamp.
    fn store_raw_msg(
        &self,
        subject: &str,
        hdr: &Headers,
        msg: &Bytes,
        seq: u64,
        ts: i64,
    ) -> Result<()>;

    /// Advances the sequence without storing a body. Returns the skipped
    /// sequence.
    fn skip_msg(&self) -> u64;

    fn load_msg(&self, seq: u64) -> Result<StoredMsg>;

    /// Removes a message. Returns false if no message exists at `seq`.
    fn remove_msg(&self, seq: u64) -> Result<bool>;

    /// Removes a message after overwriting its payload with random bytes.
    fn erase_msg(&self, seq: u64) -> Result<bool>;

    /// Removes all messages. Returns the number purged.
    fn purge(&self) -> Result<u64>;

    /// Removes all messages with sequence strictly below `up_to_seq` and
    /// makes `up_to_seq` the first sequence. Returns the number removed.
    fn compact(&self, up_to_seq: u64) -> Result<u64>;

    fn state(&self) -> StoreState;

    /// Earliest sequence whose timestamp is at or after `ts`, or 0 if none.
    fn seq_from_time(&self, ts: i64) -> u64;

    fn register_storage_updates(&self, cb: StorageUpdateFn);

    /// Produces the store's files for a snapshot archive. `check_msgs`
    /// requests an integrity pass over every record first.
    fn snapshot(&self, deadline: Duration, check_msgs: bool) -> Result<Vec<SnapshotFile>>;

    fn update_config(&self, cfg: &StreamConfig) -> Result<()>;

    /// Flushes and closes the store, keeping data on disk.
    fn stop(&self) -> Result<()>;

    /// Closes the store and removes any on-disk data.
    fn delete(&self) -> Result<()>;
}

/// Tuning knobs for the file store.
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Write buffer size. Auto-tuned from the stream limits when not set
    /// explicitly.
    pub block_size: usize,
}

pub const FILE_STORE_MIN_BLOCK_SIZE: usize = 8 * 1024;
pub const FILE_STORE_MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;
pub const FILE_STORE_DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            block_size: FILE_STORE_DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Opens or creates the store for `cfg` under `dir`.
pub fn create_store(
    cfg: &StreamConfig,
    dir: &Path,
    fs_cfg: FileStoreConfig,
) -> Result<Arc<dyn MessageStore>> {
    match cfg.storage {
        StorageType::Memory => Ok(Arc::new(memory::MemoryStore::open(cfg.clone(), dir)?)),
        StorageType::File => Ok(Arc::new(file::FileStore::open(cfg.clone(), dir, fs_cfg)?)),
    }
}

/// Estimated per-record overhead beyond subject, headers, and payload.
pub(crate) const MSG_RECORD_OVERHEAD: usize = 16;

pub(crate) fn msg_size(subject: &str, hdr: &Headers, msg: &[u8]) -> u64 {
    (subject.len() + hdr.encoded_len() + msg.len() + MSG_RECORD_OVERHEAD) as u64
}

pub(crate) fn now_nanos() -> i64 {
    // Out of range only past the year 2262.
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
