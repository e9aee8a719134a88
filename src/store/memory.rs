//! Memory backed message store.

use super::{msg_size, now_nanos, MessageStore, SnapshotFile, StorageUpdateFn, StoreState, StoredMsg};
use crate::config::{DiscardPolicy, StreamConfig};
use crate::headers::Headers;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

const SNAPSHOT_MSGS_FILE: &str = "msgs.json";

/// Serialized form written into snapshot archives so that restores rebuild
/// the exact state, sequence gaps included.
#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    state: StoreState,
    msgs: Vec<StoredMsg>,
}

#[derive(Default)]
struct MemInner {
    msgs: BTreeMap<u64, StoredMsg>,
    first_seq: u64,
    first_ts: i64,
    last_seq: u64,
    last_ts: i64,
    bytes: u64,
    closed: bool,
}

type UpdateEvent = (i64, i64, u64, String);

/// In-memory store. Data does not survive [`MessageStore::stop`]; snapshots
/// serialize the full message set so restores still round-trip.
pub struct MemoryStore {
    dir: PathBuf,
    cfg: Mutex<StreamConfig>,
    inner: Mutex<MemInner>,
    cb: RwLock<Option<StorageUpdateFn>>,
}

impl MemoryStore {
    /// Opens a memory store under `dir`. If a prior snapshot payload exists
    /// there (placed by a restore), the message set is rebuilt from it.
    pub fn open(cfg: StreamConfig, dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let store = Self {
            dir: dir.to_path_buf(),
            cfg: Mutex::new(cfg),
            inner: Mutex::new(MemInner::default()),
            cb: RwLock::new(None),
        };

        let payload_path = store.dir.join(SNAPSHOT_MSGS_FILE);
        if payload_path.exists() {
            let buf = std::fs::read(&payload_path)?;
            let payload: SnapshotPayload = serde_json::from_slice(&buf)?;
            let mut inner = store.inner.lock();
            inner.first_seq = payload.state.first_seq;
            inner.first_ts = payload.state.first_ts;
            inner.last_seq = payload.state.last_seq;
            inner.last_ts = payload.state.last_ts;
            inner.bytes = payload.state.bytes;
            for m in payload.msgs {
                inner.msgs.insert(m.seq, m);
            }
            debug!(
                msgs = inner.msgs.len(),
                last_seq = inner.last_seq,
                "recovered memory store from snapshot payload"
            );
        }
        Ok(store)
    }

    fn fire(&self, events: Vec<UpdateEvent>) {
        if events.is_empty() {
            return;
        }
        let cb = self.cb.read();
        if let Some(cb) = cb.as_ref() {
            for (md, bd, seq, subj) in &events {
                cb(*md, *bd, *seq, subj);
            }
        }
    }

    /// Drops messages past `max_age`. Lock must be held.
    fn expire_locked(inner: &mut MemInner, max_age: Option<Duration>, events: &mut Vec<UpdateEvent>) {
        let Some(age) = max_age else { return };
        let cutoff = now_nanos().saturating_sub(age.as_nanos() as i64);
        while let Some((&seq, rec)) = inner.msgs.iter().next() {
            if rec.ts >= cutoff {
                break;
            }
            let size = msg_size(&rec.subject, &rec.headers, &rec.data);
            let subject = rec.subject.clone();
            inner.msgs.remove(&seq);
            inner.bytes = inner.bytes.saturating_sub(size);
            Self::advance_first_locked(inner);
            events.push((-1, -(size as i64), seq, subject));
        }
    }

    fn advance_first_locked(inner: &mut MemInner) {
        match inner.msgs.iter().next() {
            Some((&seq, rec)) => {
                inner.first_seq = seq;
                inner.first_ts = rec.ts;
            }
            None => {
                inner.first_seq = inner.last_seq + 1;
                inner.first_ts = 0;
            }
        }
    }

    /// Evicts from the front while over the configured limits. Lock must be
    /// held.
    fn enforce_limits_locked(
        inner: &mut MemInner,
        max_msgs: i64,
        max_bytes: i64,
        events: &mut Vec<UpdateEvent>,
    ) {
        loop {
            let over_msgs = max_msgs >= 0 && inner.msgs.len() as i64 > max_msgs;
            let over_bytes = max_bytes >= 0 && inner.bytes as i64 > max_bytes;
            if !over_msgs && !over_bytes {
                return;
            }
            let Some((&seq, rec)) = inner.msgs.iter().next() else {
                return;
            };
            let size = msg_size(&rec.subject, &rec.headers, &rec.data);
            let subject = rec.subject.clone();
            inner.msgs.remove(&seq);
            inner.bytes = inner.bytes.saturating_sub(size);
            Self::advance_first_locked(inner);
            events.push((-1, -(size as i64), seq, subject));
        }
    }

    fn insert_locked(
        &self,
        inner: &mut MemInner,
        subject: &str,
        hdr: &Headers,
        msg: &Bytes,
        seq: u64,
        ts: i64,
        events: &mut Vec<UpdateEvent>,
    ) -> Result<()> {
        let (max_msgs, max_bytes, discard) = {
            let cfg = self.cfg.lock();
            (cfg.max_msgs, cfg.max_bytes, cfg.discard)
        };
        let size = msg_size(subject, hdr, msg);

        if discard == DiscardPolicy::New {
            if max_msgs >= 0 && inner.msgs.len() as i64 + 1 > max_msgs {
                return Err(Error::Store("maximum messages exceeded".to_string()));
            }
            if max_bytes >= 0 && (inner.bytes + size) as i64 > max_bytes {
                return Err(Error::Store("maximum bytes exceeded".to_string()));
            }
        }

        let was_empty = inner.msgs.is_empty();
        inner.msgs.insert(
            seq,
            StoredMsg {
                subject: subject.to_string(),
                seq,
                headers: hdr.clone(),
                data: msg.clone(),
                ts,
            },
        );
        inner.bytes += size;
        inner.last_seq = seq;
        inner.last_ts = ts;
        if was_empty {
            inner.first_seq = seq;
            inner.first_ts = ts;
        }
        events.push((1, size as i64, seq, subject.to_string()));

        if discard == DiscardPolicy::Old {
            Self::enforce_limits_locked(inner, max_msgs, max_bytes, events);
        }
        Ok(())
    }

    fn remove_inner(&self, seq: u64) -> Result<bool> {
        let mut events = Vec::new();
        let removed = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Error::StoreClosed);
            }
            match inner.msgs.remove(&seq) {
                Some(rec) => {
                    let size = msg_size(&rec.subject, &rec.headers, &rec.data);
                    inner.bytes = inner.bytes.saturating_sub(size);
                    if seq == inner.first_seq {
                        Self::advance_first_locked(&mut inner);
                    }
                    events.push((-1, -(size as i64), seq, rec.subject));
                    true
                }
                None => false,
            }
        };
        self.fire(events);
        Ok(removed)
    }
}

impl MessageStore for MemoryStore {
    fn store_msg(&self, subject: &str, hdr: &Headers, msg: &Bytes) -> Result<(u64, i64)> {
        let max_age = self.cfg.lock().max_age;
        let mut events = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Error::StoreClosed);
            }
            Self::expire_locked(&mut inner, max_age, &mut events);
            let seq = inner.last_seq + 1;
            let ts = now_nanos();
            self.insert_locked(&mut inner, subject, hdr, msg, seq, ts, &mut events)
                .map(|_| (seq, ts))
        };
        self.fire(events);
        result
    }

    fn store_raw_msg(
        &self,
        subject: &str,
        hdr: &Headers,
        msg: &Bytes,
        seq: u64,
        ts: i64,
    ) -> Result<()> {
        let max_age = self.cfg.lock().max_age;
        let mut events = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Error::StoreClosed);
            }
            if seq <= inner.last_seq {
                return Err(Error::Store(format!("msg sequence {seq} already used")));
            }
            Self::expire_locked(&mut inner, max_age, &mut events);
            self.insert_locked(&mut inner, subject, hdr, msg, seq, ts, &mut events)
        };
        self.fire(events);
        result
    }

    fn skip_msg(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.last_seq += 1;
        inner.last_ts = now_nanos();
        if inner.msgs.is_empty() {
            inner.first_seq = inner.last_seq + 1;
            inner.first_ts = 0;
        }
        inner.last_seq
    }

    fn load_msg(&self, seq: u64) -> Result<StoredMsg> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(Error::StoreClosed);
        }
        inner
            .msgs
            .get(&seq)
            .cloned()
            .ok_or_else(|| Error::Store("no message found".to_string()))
    }

    fn remove_msg(&self, seq: u64) -> Result<bool> {
        self.remove_inner(seq)
    }

    fn erase_msg(&self, seq: u64) -> Result<bool> {
        // Nothing to scrub for volatile storage.
        self.remove_inner(seq)
    }

    fn purge(&self) -> Result<u64> {
        let mut events = Vec::new();
        let purged = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Error::StoreClosed);
            }
            let purged = inner.msgs.len() as u64;
            let bytes = inner.bytes;
            inner.msgs.clear();
            inner.bytes = 0;
            inner.first_seq = inner.last_seq + 1;
            inner.first_ts = 0;
            if purged > 0 {
                events.push((-(purged as i64), -(bytes as i64), 0, String::new()));
            }
            purged
        };
        self.fire(events);
        Ok(purged)
    }

    fn compact(&self, up_to_seq: u64) -> Result<u64> {
        let mut events = Vec::new();
        let purged = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Error::StoreClosed);
            }
            let keep = inner.msgs.split_off(&up_to_seq);
            let dropped = std::mem::replace(&mut inner.msgs, keep);
            let mut purged = 0u64;
            let mut bytes = 0u64;
            for rec in dropped.values() {
                purged += 1;
                bytes += msg_size(&rec.subject, &rec.headers, &rec.data);
            }
            inner.bytes = inner.bytes.saturating_sub(bytes);
            inner.first_seq = up_to_seq;
            if inner.last_seq + 1 < up_to_seq {
                inner.last_seq = up_to_seq - 1;
            }
            match inner.msgs.get(&up_to_seq) {
                Some(rec) => inner.first_ts = rec.ts,
                None => inner.first_ts = 0,
            }
            if purged > 0 {
                events.push((-(purged as i64), -(bytes as i64), 0, String::new()));
            }
            purged
        };
        self.fire(events);
        Ok(purged)
    }

    // Kept a pure read: callers may hold the stream lock, and expiry would
    // fire storage-update callbacks that re-enter it. Aged messages are
    // expired on the append paths instead.
    fn state(&self) -> StoreState {
        let inner = self.inner.lock();
        StoreState {
            msgs: inner.msgs.len() as u64,
            bytes: inner.bytes,
            first_seq: inner.first_seq,
            first_ts: inner.first_ts,
            last_seq: inner.last_seq,
            last_ts: inner.last_ts,
        }
    }

    fn seq_from_time(&self, ts: i64) -> u64 {
        let inner = self.inner.lock();
        inner
            .msgs
            .values()
            .find(|rec| rec.ts >= ts)
            .map(|rec| rec.seq)
            .unwrap_or(0)
    }

    fn register_storage_updates(&self, cb: StorageUpdateFn) {
        *self.cb.write() = Some(cb);
    }

    fn snapshot(&self, deadline: Duration, _check_msgs: bool) -> Result<Vec<SnapshotFile>> {
        let start = Instant::now();
        let payload = {
            let inner = self.inner.lock();
            if inner.closed {
                return Err(Error::StoreClosed);
            }
            SnapshotPayload {
                state: StoreState {
                    msgs: inner.msgs.len() as u64,
                    bytes: inner.bytes,
                    first_seq: inner.first_seq,
                    first_ts: inner.first_ts,
                    last_seq: inner.last_seq,
                    last_ts: inner.last_ts,
                },
                msgs: inner.msgs.values().cloned().collect(),
            }
        };
        let data = serde_json::to_vec(&payload)?;
        if start.elapsed() > deadline {
            return Err(Error::Store("snapshot deadline exceeded".to_string()));
        }
        Ok(vec![SnapshotFile {
            rel_path: SNAPSHOT_MSGS_FILE.to_string(),
            data,
        }])
    }

    fn update_config(&self, cfg: &StreamConfig) -> Result<()> {
        *self.cfg.lock() = cfg.clone();
        let (max_msgs, max_bytes, max_age) = {
            let cfg = self.cfg.lock();
            (cfg.max_msgs, cfg.max_bytes, cfg.max_age)
        };
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            Self::expire_locked(&mut inner, max_age, &mut events);
            Self::enforce_limits_locked(&mut inner, max_msgs, max_bytes, &mut events);
        }
        self.fire(events);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.inner.lock().closed = true;
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        self.inner.lock().closed = true;
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}
