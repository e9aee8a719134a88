//! # Stream Runtime
//!
//! A [`Stream`] is the per-stream runtime: it owns the backing store, the
//! duplicate window, the registry of consumer handles, the outbound send
//! queue, and, in clustered mode, the bridge to the consensus node.
//!
//! The ingest pipeline ([`Stream::process_stream_msg`]) runs every inbound
//! message through validation, optimistic-concurrency guards, duplicate
//! suppression, size and quota checks, and finally the append plus consumer
//! fan-out. One reader-writer lock guards the in-memory state; the lock is
//! always released around store calls that can fire storage-update
//! callbacks, which re-enter the stream in read mode.

mod sourcing;

#[cfg(test)]
mod tests;

use crate::account::Account;
use crate::advisory::{StreamAction, StreamActionAdvisory};
use crate::broker::Broker;
use crate::config::{self, RetentionPolicy, StreamConfig};
use crate::consumer::{Consumer, ConsumerSnapshot};
use crate::dedupe::{DedupEntry, DedupWindow, PurgeTimer};
use crate::headers::{Headers, CLIENT_INFO_HDR};
use crate::replication::{
    decode_stream_entry, encode_stream_entry, ConsensusNode, StreamAssignment, StreamEntry,
};
use crate::sendq::{OutboundMessage, SendQueue};
use crate::snapshot::{self, SnapshotResult, StreamMeta};
use crate::store::{
    self, FileStoreConfig, MessageStore, StoreState, StoredMsg, FILE_STORE_MAX_BLOCK_SIZE,
    FILE_STORE_MIN_BLOCK_SIZE,
};
use crate::subject;
use crate::{ApiError, Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Sender};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

pub use sourcing::make_ack_reply;
pub(crate) use sourcing::SourceInfo;

/// Subject for cluster stream-info requests:
/// `$JS.CLUSTER.STREAM.INFO.<account>.<name>`.
pub const CLUSTER_STREAM_INFO_PREFIX: &str = "$JS.CLUSTER.STREAM.INFO";

/// Per-upstream status view.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSourceInfo {
    pub name: String,
    pub lag: u64,
    /// Time since the last upstream delivery.
    pub active: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

/// Configuration and current state for a stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub created: DateTime<Utc>,
    pub state: StoreState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror: Option<StreamSourceInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<StreamSourceInfo>,
}

#[derive(Serialize)]
struct ErrAck<'a> {
    stream: &'a str,
    error: ApiError,
}

pub(crate) struct StreamState {
    pub(crate) cfg: StreamConfig,
    pub(crate) created: DateTime<Utc>,
    pub(crate) lseq: u64,
    pub(crate) lmsgid: String,
    /// Publishes rejected before reaching the consensus log.
    pub(crate) clfs: u64,
    /// Next proposed cluster sequence, leader only.
    pub(crate) clseq: u64,
    pub(crate) consumers: HashMap<String, Arc<dyn Consumer>>,
    pub(crate) num_filter: usize,
    pub(crate) active: bool,
    pub(crate) closed: bool,
    pub(crate) dd: DedupWindow,
    pub(crate) dd_timer: Option<PurgeTimer>,
    pub(crate) subject_sids: HashMap<String, u64>,
    pub(crate) info_sid: Option<u64>,
    pub(crate) sync_sid: Option<u64>,
    pub(crate) mirror: Option<SourceInfo>,
    pub(crate) sources: HashMap<String, SourceInfo>,
    pub(crate) source_gen: u64,
    pub(crate) node: Option<Arc<dyn ConsensusNode>>,
    pub(crate) sa: Option<StreamAssignment>,
    pub(crate) quit_tx: Option<Sender<()>>,
}

/// A stream of messages bound to a set of subjects.
pub struct Stream {
    name: String,
    account_name: String,
    pub(crate) account: Weak<Account>,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) sendq: SendQueue,
    pub_ack_prefix: Vec<u8>,
    pub(crate) state: RwLock<StreamState>,
}

impl Stream {
    pub(crate) fn new(
        account: &Arc<Account>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn MessageStore>,
        cfg: StreamConfig,
    ) -> Arc<Self> {
        let (quit_tx, quit_rx) = channel::bounded(1);
        let sendq = SendQueue::start(Arc::clone(&broker), &cfg.name, quit_rx);
        // Pre-marshalled so the hot path only appends digits and a brace.
        let pub_ack_prefix = format!("{{\"stream\":\"{}\",\"seq\":", cfg.name).into_bytes();

        Arc::new(Self {
            name: cfg.name.clone(),
            account_name: account.name().to_string(),
            account: Arc::downgrade(account),
            broker,
            store,
            sendq,
            pub_ack_prefix,
            state: RwLock::new(StreamState {
                cfg,
                created: Utc::now(),
                lseq: 0,
                lmsgid: String::new(),
                clfs: 0,
                clseq: 0,
                consumers: HashMap::new(),
                num_filter: 0,
                active: false,
                closed: false,
                dd: DedupWindow::new(),
                dd_timer: None,
                subject_sids: HashMap::new(),
                info_sid: None,
                sync_sid: None,
                mirror: None,
                sources: HashMap::new(),
                source_gen: 0,
                node: None,
                sa: None,
                quit_tx: Some(quit_tx),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> StreamConfig {
        self.state.read().cfg.clone()
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.state.read().created
    }

    pub(crate) fn set_created(&self, created: DateTime<Utc>) {
        self.state.write().created = created;
    }

    pub fn last_seq(&self) -> u64 {
        self.state.read().lseq
    }

    pub fn set_last_seq(&self, lseq: u64) {
        self.state.write().lseq = lseq;
    }

    /// Current state of the backing store.
    pub fn state(&self) -> StoreState {
        self.store.state()
    }

    /// Number of message ids being tracked for duplicate suppression.
    pub fn num_msg_ids(&self) -> usize {
        self.state.read().dd.len()
    }

    pub fn is_clustered(&self) -> bool {
        self.state.read().node.is_some()
    }

    fn is_leader_locked(st: &StreamState) -> bool {
        st.node.as_ref().map(|n| n.is_leader()).unwrap_or(true)
    }

    pub fn is_leader(&self) -> bool {
        Self::is_leader_locked(&self.state.read())
    }

    pub fn info(&self) -> StreamInfo {
        let st = self.state.read();
        StreamInfo {
            config: st.cfg.clone(),
            created: st.created,
            state: self.store.state(),
            mirror: st.mirror.as_ref().map(SourceInfo::view),
            sources: st.sources.values().map(SourceInfo::view).collect(),
        }
    }

    pub(crate) fn set_stream_assignment(&self, sa: StreamAssignment) {
        let mut st = self.state.write();
        st.node = sa.node.clone();
        st.sa = Some(sa);
    }

    // ---------------------------------------------------------------------
    // Block size auto-tuning

    /// Estimated stored size of the largest expected message.
    fn max_msg_size_estimate(cfg: &StreamConfig) -> u64 {
        const DEFAULT_MAX_PAYLOAD: i64 = 1024 * 1024;
        const DEFAULT_MAX_SUBJECT: usize = 256;
        let payload = if cfg.max_msg_size > 0 {
            cfg.max_msg_size
        } else {
            DEFAULT_MAX_PAYLOAD
        };
        let subject = cfg
            .subjects
            .iter()
            .filter(|s| subject::is_literal(s))
            .map(|s| s.len())
            .max()
            .unwrap_or(DEFAULT_MAX_SUBJECT);
        payload as u64 + subject as u64 + store::MSG_RECORD_OVERHEAD as u64
    }

    /// Targets a block holding 125% of the theoretical stream limit,
    /// rounded up to a 100 byte multiple and clamped to the file store
    /// bounds.
    pub(crate) fn auto_tune_block_size(cfg: &StreamConfig) -> FileStoreConfig {
        let total_est = if cfg.max_bytes > 0 {
            cfg.max_bytes as u64
        } else if cfg.max_msgs > 0 {
            Self::max_msg_size_estimate(cfg) * cfg.max_msgs as u64
        } else {
            return FileStoreConfig::default();
        };

        let mut blk = total_est / 4 + 1;
        if blk % 100 != 0 {
            blk += 100 - blk % 100;
        }
        let blk = (blk as usize).clamp(FILE_STORE_MIN_BLOCK_SIZE, FILE_STORE_MAX_BLOCK_SIZE);
        FileStoreConfig { block_size: blk }
    }

    // ---------------------------------------------------------------------
    // Dedupe

    /// Rebuilds the duplicate window from the tail of the store after a
    /// recovery or restore.
    pub(crate) fn rebuild_dedupe(self: &Arc<Self>) {
        let window = self.state.read().cfg.dedup_window;
        let state = self.store.state();
        {
            let mut st = self.state.write();
            st.lseq = state.last_seq;
        }
        if state.last_seq == 0 {
            return;
        }

        let horizon = store::now_nanos().saturating_sub(window.as_nanos() as i64);
        let sseq = self.store.seq_from_time(horizon);
        if sseq == 0 {
            return;
        }

        let mut last_id = String::new();
        let mut entries = Vec::new();
        for seq in sseq..=state.last_seq {
            let mut msg_id = String::new();
            if let Ok(msg) = self.store.load_msg(seq) {
                if let Some(id) = msg.headers.msg_id() {
                    msg_id = id.to_string();
                    entries.push(DedupEntry {
                        id: msg_id.clone(),
                        seq,
                        ts: msg.ts,
                    });
                }
            }
            if seq == state.last_seq {
                last_id = msg_id;
            }
        }

        let mut st = self.state.write();
        st.lmsgid = last_id;
        for entry in entries {
            self.store_msg_id_locked(&mut st, entry);
        }
    }

    /// Lock must be held.
    fn store_msg_id_locked(self: &Arc<Self>, st: &mut StreamState, entry: DedupEntry) {
        st.dd.store(entry);
        if st.dd_timer.is_none() {
            let weak = Arc::downgrade(self);
            st.dd_timer = Some(PurgeTimer::spawn(st.cfg.dedup_window, move || {
                weak.upgrade().and_then(|s| s.purge_msg_ids())
            }));
        }
    }

    /// Timer callback. Returns the next delay, or `None` once the window
    /// drained.
    fn purge_msg_ids(&self) -> Option<Duration> {
        let mut st = self.state.write();
        let window = st.cfg.dedup_window;
        let next = st.dd.purge(store::now_nanos(), window);
        if next.is_none() {
            st.dd_timer = None;
        }
        next
    }

    // ---------------------------------------------------------------------
    // Ingest pipeline

    /// Subject handler entry point. Non-leaders drop deliveries; they see
    /// messages only through the consensus apply path.
    pub fn process_inbound_msg(
        self: &Arc<Self>,
        subject: &str,
        reply: &str,
        hdr: &Headers,
        msg: &Bytes,
    ) {
        let (is_leader, is_clustered) = {
            let st = self.state.read();
            if st.closed {
                return;
            }
            (Self::is_leader_locked(&st), st.node.is_some())
        };
        if !is_leader {
            return;
        }

        let result = if is_clustered {
            self.propose_inbound(subject, reply, hdr, msg)
        } else {
            self.process_stream_msg(subject, reply, hdr, msg, 0, 0)
        };
        if let Err(err) = result {
            debug!(stream = %self.name, %err, "inbound message rejected");
        }
    }

    /// Encodes an accepted inbound message and proposes it to the consensus
    /// node. Local application happens in [`Stream::apply_committed`].
    pub fn propose_inbound(
        &self,
        subject: &str,
        reply: &str,
        hdr: &Headers,
        msg: &Bytes,
    ) -> Result<()> {
        let (node, entry) = {
            let mut st = self.state.write();
            let node = st
                .node
                .clone()
                .ok_or_else(|| Error::Replication("stream is not clustered".to_string()))?;
            if st.clseq < st.lseq + st.clfs {
                st.clseq = st.lseq + st.clfs;
            }
            let entry = encode_stream_entry(&StreamEntry {
                subject: subject.to_string(),
                reply: reply.to_string(),
                headers: hdr.clone(),
                msg: msg.to_vec(),
                seq: st.clseq,
                ts: 0,
            })?;
            st.clseq += 1;
            (node, entry)
        };
        node.propose(entry)
    }

    /// Replays a committed consensus entry through the ingest pipeline.
    pub fn apply_committed(self: &Arc<Self>, entry: &[u8]) -> Result<()> {
        let e = decode_stream_entry(entry)?;
        let msg = Bytes::from(e.msg);
        self.process_stream_msg(&e.subject, &e.reply, &e.headers, &msg, e.seq, e.ts)
    }

    fn send_err_ack(&self, reply: &str, code: u16, description: &str) {
        if reply.is_empty() {
            return;
        }
        let ack = ErrAck {
            stream: &self.name,
            error: ApiError::new(code, description),
        };
        let buf = match serde_json::to_vec(&ack) {
            Ok(buf) => buf,
            Err(err) => {
                error!(stream = %self.name, %err, "failed to marshal error ack");
                return;
            }
        };
        self.sendq
            .send(OutboundMessage::new(reply, "", Bytes::from(buf)));
    }

    fn send_seq_ack(&self, reply: &str, seq: u64, duplicate: bool) {
        if reply.is_empty() {
            return;
        }
        let mut buf = self.pub_ack_prefix.clone();
        buf.extend_from_slice(seq.to_string().as_bytes());
        if duplicate {
            buf.extend_from_slice(b",\"duplicate\": true}");
        } else {
            buf.push(b'}');
        }
        self.sendq
            .send(OutboundMessage::new(reply, "", Bytes::from(buf)));
    }

    /// The ingest pipeline. `proposed_lseq` carries the message count the
    /// proposer observed (the entry lands at `proposed_lseq + 1`); zero
    /// means unproposed. `proposed_ts` preserves an origin timestamp.
    pub fn process_stream_msg(
        self: &Arc<Self>,
        subject: &str,
        reply: &str,
        hdr: &Headers,
        msg: &Bytes,
        proposed_lseq: u64,
        proposed_ts: i64,
    ) -> Result<()> {
        let mut st = self.state.write();
        if st.closed {
            return Ok(());
        }

        let name = self.name.clone();
        let do_ack = !st.cfg.no_ack;
        let storage = st.cfg.storage;
        let max_msg_size = st.cfg.max_msg_size;
        let num_consumers = st.consumers.len();
        let interest_retention = st.cfg.retention == RetentionPolicy::Interest;
        let is_leader = Self::is_leader_locked(&st);
        let can_respond = do_ack && !reply.is_empty() && is_leader;

        // The consensus layer passes the sequence it ordered against. A gap
        // means this replica missed something, except for a brand-new
        // mirror whose store can be fast-forwarded to the origin position.
        if proposed_lseq > 0 && proposed_lseq != st.lseq + st.clfs {
            let mut mismatch = true;
            if st.cfg.mirror.is_some() && self.store.state().first_seq == 0 {
                if let Err(err) = self.store.compact(proposed_lseq + 1) {
                    warn!(stream = %name, %err, "failed to fast-forward mirror store");
                } else {
                    st.lseq = proposed_lseq;
                    mismatch = false;
                }
            }
            if mismatch {
                drop(st);
                if can_respond {
                    self.send_err_ack(reply, 503, "expected stream sequence does not match");
                }
                return Err(Error::LastSeqMismatch);
            }
        }

        // Request routing info from another account is not ours to keep.
        let mut hdr = hdr.clone();
        hdr.remove(CLIENT_INFO_HDR);

        let msg_id = hdr.msg_id().unwrap_or_default().to_string();

        if let Some(dde) = st.dd.check(&msg_id) {
            let dseq = dde.seq;
            st.clfs += 1;
            drop(st);
            if can_respond {
                self.send_seq_ack(reply, dseq, true);
            }
            return Err(Error::DuplicateMsgId);
        }

        if let Some(sname) = hdr.expected_stream() {
            if sname != name {
                st.clfs += 1;
                drop(st);
                if can_respond {
                    self.send_err_ack(reply, 400, "expected stream does not match");
                }
                return Err(Error::ExpectedStreamMismatch);
            }
        }

        if let Some(eseq) = hdr.expected_last_seq() {
            if eseq != st.lseq {
                let lseq = st.lseq;
                st.clfs += 1;
                drop(st);
                if can_respond {
                    self.send_err_ack(reply, 400, &format!("wrong last sequence: {lseq}"));
                }
                return Err(Error::ExpectedLastSeqMismatch(lseq));
            }
        }

        if let Some(eid) = hdr.expected_last_msg_id() {
            if eid != st.lmsgid {
                let last = st.lmsgid.clone();
                st.clfs += 1;
                drop(st);
                if can_respond {
                    self.send_err_ack(reply, 400, &format!("wrong last msg ID: {last}"));
                }
                return Err(Error::ExpectedLastMsgIdMismatch(last));
            }
        }

        if max_msg_size >= 0 && (hdr.encoded_len() + msg.len()) as i64 > max_msg_size {
            st.clfs += 1;
            drop(st);
            if can_respond {
                self.send_err_ack(reply, 400, "message size exceeds maximum allowed");
            }
            return Err(Error::MaxPayloadExceeded);
        }

        // Interest retention with nobody listening: burn the sequence but
        // skip the write.
        let mut no_interest = false;
        if interest_retention {
            if num_consumers == 0 {
                no_interest = true;
            } else if st.num_filter == num_consumers {
                no_interest = !st.consumers.values().any(|o| match o.filter_subject() {
                    Some(f) => subject::subject_is_subset_match(subject, &f),
                    None => true,
                });
            }
        }

        let ts = if proposed_ts != 0 {
            proposed_ts
        } else {
            store::now_nanos()
        };

        if no_interest {
            let seq = self.store.skip_msg();
            st.lseq = seq;
            st.lmsgid = msg_id.clone();
            if !msg_id.is_empty() {
                self.store_msg_id_locked(
                    &mut st,
                    DedupEntry {
                        id: msg_id,
                        seq,
                        ts,
                    },
                );
            }
            drop(st);
            if can_respond {
                self.send_seq_ack(reply, seq, false);
            }
            return Ok(());
        }

        // Assume the append succeeds; the store runs outside the lock
        // because its update callbacks re-enter us.
        let olseq = st.lseq;
        let olmsgid = std::mem::replace(&mut st.lmsgid, msg_id.clone());
        st.lseq += 1;
        drop(st);

        let stored = if proposed_lseq == 0 && proposed_ts == 0 {
            self.store.store_msg(subject, &hdr, msg)
        } else {
            let seq = olseq + 1;
            self.store
                .store_raw_msg(subject, &hdr, msg, seq, ts)
                .map(|()| (seq, ts))
        };

        let (seq, ts) = match stored {
            Err(err) => {
                let mut st = self.state.write();
                st.lseq = olseq;
                st.lmsgid = olmsgid;
                drop(st);
                if !matches!(err, Error::StoreClosed) {
                    error!(
                        account = %self.account_name,
                        stream = %name,
                        %err,
                        "failed to store message"
                    );
                }
                if can_respond {
                    self.send_err_ack(reply, 503, &err.to_string());
                }
                return Err(err);
            }
            Ok(v) => v,
        };

        if let Some(acc) = self.account.upgrade() {
            if acc.limits_exceeded(storage) {
                warn!(account = %self.account_name, "resource limits exceeded for account");
                if let Err(err) = self.store.remove_msg(seq) {
                    debug!(stream = %name, %err, "failed to remove over-limit message");
                }
                if can_respond {
                    self.send_err_ack(reply, 400, "resource limits exceeded for account");
                }
                return Err(Error::AccountLimitsExceeded);
            }
        }

        if !msg_id.is_empty() {
            let mut st = self.state.write();
            self.store_msg_id_locked(
                &mut st,
                DedupEntry {
                    id: msg_id,
                    seq,
                    ts,
                },
            );
        }

        if can_respond {
            self.send_seq_ack(reply, seq, false);
        }

        if num_consumers > 0 {
            let obs: Vec<Arc<dyn Consumer>> = {
                let st = self.state.read();
                st.consumers
                    .values()
                    .filter(|o| o.is_leader())
                    .cloned()
                    .collect()
            };
            for o in obs {
                o.inc_stream_pending(seq, subject);
                if !o.deliver_current_msg(subject, &hdr, msg, seq, ts) {
                    o.signal_new_messages();
                }
            }
        }

        Ok(())
    }

    // ---------------------------------------------------------------------
    // Consumers

    /// Attaches a consumer handle.
    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<()> {
        let mut st = self.state.write();
        if st.closed {
            return Err(Error::StreamClosed);
        }
        if st.cfg.max_consumers >= 0 && st.consumers.len() as i64 >= st.cfg.max_consumers {
            return Err(Error::Config("maximum consumers limit reached".to_string()));
        }
        let filter = consumer.filter_subject();
        if st.cfg.retention == RetentionPolicy::WorkQueue {
            let partition_taken = match &filter {
                Some(f) => !Self::partition_unique_locked(&st, f),
                None => !st.consumers.is_empty(),
            };
            if partition_taken {
                return Err(Error::Config(
                    "multiple non-filtered consumers not allowed on workqueue stream".to_string(),
                ));
            }
        }
        if filter.is_some() {
            st.num_filter += 1;
        }
        st.consumers.insert(consumer.name(), consumer);
        Ok(())
    }

    pub fn remove_consumer(&self, name: &str) {
        let mut st = self.state.write();
        if let Some(o) = st.consumers.remove(name) {
            if o.filter_subject().is_some() {
                st.num_filter -= 1;
            }
        }
    }

    pub fn lookup_consumer(&self, name: &str) -> Option<Arc<dyn Consumer>> {
        self.state.read().consumers.get(name).cloned()
    }

    pub fn num_consumers(&self) -> usize {
        self.state.read().consumers.len()
    }

    pub fn consumers(&self) -> Vec<Arc<dyn Consumer>> {
        self.state.read().consumers.values().cloned().collect()
    }

    /// True when no existing consumer overlaps the proposed filter. Lock
    /// must be held.
    fn partition_unique_locked(st: &StreamState, partition: &str) -> bool {
        for o in st.consumers.values() {
            match o.filter_subject() {
                None => return false,
                Some(f) => {
                    if subject::subject_is_subset_match(partition, &f) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// True while some other consumer still needs `seq` acked. Lock must be
    /// held.
    fn check_interest_locked(st: &StreamState, seq: u64, except: &str) -> bool {
        st.consumers
            .values()
            .any(|o| o.name() != except && o.needs_ack(seq))
    }

    /// Consumer-side acknowledgement under WorkQueue or Interest retention.
    pub fn ack_msg(&self, consumer_name: &str, seq: u64) {
        let retention = self.state.read().cfg.retention;
        match retention {
            RetentionPolicy::Limits => {}
            RetentionPolicy::WorkQueue => {
                if let Err(err) = self.store.remove_msg(seq) {
                    debug!(stream = %self.name, seq, %err, "workqueue ack removal failed");
                }
            }
            RetentionPolicy::Interest => {
                let has_interest = {
                    let st = self.state.read();
                    Self::check_interest_locked(&st, seq, consumer_name)
                };
                if !has_interest {
                    if let Err(err) = self.store.remove_msg(seq) {
                        debug!(stream = %self.name, seq, %err, "interest ack removal failed");
                    }
                }
            }
        }
    }

    /// Storage-update fan-in for single message removals.
    pub(crate) fn consumers_dec_pending(&self, seq: u64, subject: &str) {
        let st = self.state.read();
        for o in st.consumers.values() {
            o.dec_stream_pending(seq, subject);
        }
    }

    // ---------------------------------------------------------------------
    // Message access

    pub fn get_msg(&self, seq: u64) -> Result<StoredMsg> {
        self.store.load_msg(seq)
    }

    pub fn delete_msg(&self, seq: u64) -> Result<bool> {
        if self.state.read().closed {
            return Err(Error::StreamClosed);
        }
        self.store.remove_msg(seq)
    }

    pub fn erase_msg(&self, seq: u64) -> Result<bool> {
        if self.state.read().closed {
            return Err(Error::StreamClosed);
        }
        self.store.erase_msg(seq)
    }

    // ---------------------------------------------------------------------
    // Leadership

    /// Installs or removes this replica's leader surfaces: subject
    /// handlers, cluster control subscriptions, and upstream consumers.
    pub fn set_leader(self: &Arc<Self>, leader: bool) -> Result<()> {
        let mut st = self.state.write();
        if st.closed {
            return Err(Error::StreamClosed);
        }
        if leader {
            self.start_cluster_subs_locked(&mut st);
            self.subscribe_to_stream_locked(&mut st)?;
        } else {
            Self::stop_cluster_subs_locked(&self.broker, &mut st);
            self.unsubscribe_to_stream_locked(&mut st);
        }
        Ok(())
    }

    /// Lock must be held.
    fn subscribe_to_stream_locked(self: &Arc<Self>, st: &mut StreamState) -> Result<()> {
        if st.active {
            return Ok(());
        }
        for subj in st.cfg.subjects.clone() {
            self.subscribe_subject_locked(st, &subj)?;
        }
        if st.cfg.mirror.is_some() {
            self.setup_mirror_consumer_locked(st)?;
        } else if !st.cfg.sources.is_empty() {
            self.setup_source_consumers_locked(st);
        }
        st.active = true;
        Ok(())
    }

    /// Lock must be held.
    fn subscribe_subject_locked(self: &Arc<Self>, st: &mut StreamState, subj: &str) -> Result<()> {
        let weak = Arc::downgrade(self);
        let sid = self.broker.subscribe(
            subj,
            Arc::new(move |subject, reply, hdr, msg| {
                if let Some(s) = weak.upgrade() {
                    s.process_inbound_msg(subject, reply, hdr, msg);
                }
            }),
        )?;
        st.subject_sids.insert(subj.to_string(), sid);
        Ok(())
    }

    /// Lock must be held.
    fn unsubscribe_to_stream_locked(&self, st: &mut StreamState) {
        for (_, sid) in st.subject_sids.drain() {
            self.broker.unsubscribe(sid);
        }
        if let Some(mirror) = st.mirror.take() {
            if let Some(sid) = mirror.sid {
                self.broker.unsubscribe(sid);
            }
            self.send_consumer_delete(&mirror.name, &self.mirror_durable(&mirror.name));
        }
        if !st.sources.is_empty() {
            self.stop_source_consumers_locked(st);
        }
        st.active = false;
    }

    /// Lock must be held.
    fn start_cluster_subs_locked(self: &Arc<Self>, st: &mut StreamState) {
        if st.info_sid.is_none() {
            let isubj = format!(
                "{CLUSTER_STREAM_INFO_PREFIX}.{}.{}",
                self.account_name, self.name
            );
            let weak = Arc::downgrade(self);
            match self.broker.subscribe(
                &isubj,
                Arc::new(move |_subject, reply, _hdr, _msg| {
                    if let Some(s) = weak.upgrade() {
                        s.handle_cluster_stream_info(reply);
                    }
                }),
            ) {
                Ok(sid) => st.info_sid = Some(sid),
                Err(err) => warn!(stream = %self.name, %err, "failed to install info handler"),
            }
        }
        if st.node.is_some() && st.sync_sid.is_none() {
            if let Some(sync_subject) = st.sa.as_ref().map(|sa| sa.sync_subject.clone()) {
                let weak = Arc::downgrade(self);
                match self.broker.subscribe(
                    &sync_subject,
                    Arc::new(move |_subject, reply, _hdr, _msg| {
                        if let Some(s) = weak.upgrade() {
                            s.handle_sync_request(reply);
                        }
                    }),
                ) {
                    Ok(sid) => st.sync_sid = Some(sid),
                    Err(err) => warn!(stream = %self.name, %err, "failed to install sync handler"),
                }
            }
        }
    }

    /// Lock must be held.
    fn stop_cluster_subs_locked(broker: &Arc<dyn Broker>, st: &mut StreamState) {
        if let Some(sid) = st.info_sid.take() {
            broker.unsubscribe(sid);
        }
        if let Some(sid) = st.sync_sid.take() {
            broker.unsubscribe(sid);
        }
    }

    fn handle_cluster_stream_info(&self, reply: &str) {
        if reply.is_empty() {
            return;
        }
        match serde_json::to_vec(&self.info()) {
            Ok(buf) => self
                .sendq
                .send(OutboundMessage::new(reply, "", Bytes::from(buf))),
            Err(err) => error!(stream = %self.name, %err, "failed to marshal stream info"),
        }
    }

    fn handle_sync_request(&self, reply: &str) {
        if reply.is_empty() {
            return;
        }
        match serde_json::to_vec(&self.store.state()) {
            Ok(buf) => self
                .sendq
                .send(OutboundMessage::new(reply, "", Bytes::from(buf))),
            Err(err) => error!(stream = %self.name, %err, "failed to marshal sync state"),
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle

    /// Applies a configuration update. Immutable fields are rejected by
    /// [`config::config_update_check`].
    pub fn update(self: &Arc<Self>, new_cfg: &StreamConfig) -> Result<()> {
        let ocfg = self.config();
        let cfg = config::config_update_check(&ocfg, new_cfg)?;

        let mut st = self.state.write();
        if st.closed {
            return Err(Error::StreamClosed);
        }
        let is_leader = Self::is_leader_locked(&st);
        if is_leader && st.active {
            let mut current: std::collections::HashSet<&str> =
                ocfg.subjects.iter().map(|s| s.as_str()).collect();
            for subj in cfg.subjects.clone() {
                if !current.remove(subj.as_str()) {
                    self.subscribe_subject_locked(&mut st, &subj)?;
                }
            }
            let removed: Vec<String> = current.into_iter().map(str::to_string).collect();
            for subj in removed {
                if let Some(sid) = st.subject_sids.remove(&subj) {
                    self.broker.unsubscribe(sid);
                }
            }

            if cfg.dedup_window != ocfg.dedup_window {
                if let Some(timer) = &st.dd_timer {
                    // Fire now; the purge pass reschedules against the new
                    // window.
                    timer.reset(Duration::from_micros(1));
                }
            }
        }

        st.cfg = cfg.clone();
        let suppress = st.node.is_some() && st.sa.as_ref().map(|sa| sa.responded).unwrap_or(false);
        let send_advisory = is_leader && !suppress;
        drop(st);

        self.store.update_config(&cfg)?;
        if send_advisory {
            self.send_advisory(StreamAction::Modify);
        }
        Ok(())
    }

    /// Removes all messages and resets the duplicate window. Consumers are
    /// told the new first sequence.
    pub fn purge(&self) -> Result<u64> {
        let obs = {
            let mut st = self.state.write();
            if st.closed {
                return Err(Error::StreamClosed);
            }
            st.dd.clear();
            st.consumers.values().cloned().collect::<Vec<_>>()
        };

        let purged = self.store.purge()?;
        let stats = self.store.state();
        for o in obs {
            o.purge(stats.first_seq);
        }
        Ok(purged)
    }

    pub(crate) fn send_advisory(&self, action: StreamAction) {
        let template = self.state.read().cfg.template_owner.clone();
        let adv = StreamActionAdvisory::new(&self.name, action, template);
        match serde_json::to_vec(&adv) {
            Ok(buf) => self
                .sendq
                .send(OutboundMessage::new(adv.subject(), "", Bytes::from(buf))),
            Err(err) => error!(stream = %self.name, %err, "failed to marshal advisory"),
        }
    }

    /// Stops the stream and optionally deletes its data.
    pub fn delete(self: &Arc<Self>) -> Result<()> {
        self.stop(true, true)
    }

    /// Tears the stream down in a fixed order: account map, consumers,
    /// subscriptions, pump, consensus node, advisories, timers, store.
    pub fn stop(self: &Arc<Self>, delete: bool, advisory: bool) -> Result<()> {
        if let Some(acc) = self.account.upgrade() {
            let storage = self.state.read().cfg.storage;
            let bytes = self.store.state().bytes;
            if bytes > 0 {
                acc.update_usage(storage, -(bytes as i64));
            }
            acc.remove_stream_entry(&self.name);
        }

        let obs = {
            let mut st = self.state.write();
            if st.closed {
                return Err(Error::StreamClosed);
            }
            st.num_filter = 0;
            st.consumers.drain().map(|(_, o)| o).collect::<Vec<_>>()
        };
        for o in &obs {
            o.stop(delete, advisory);
        }

        let node = {
            let mut st = self.state.write();
            Self::stop_cluster_subs_locked(&self.broker, &mut st);
            self.unsubscribe_to_stream_locked(&mut st);
            // Dropping the quit sender releases the pump regardless of
            // queue contents.
            st.quit_tx = None;
            st.node.take()
        };

        if let Some(node) = node {
            if delete {
                node.delete();
            } else {
                node.stop();
            }
        }

        if delete {
            let sources = self.state.read().cfg.sources.clone();
            for ssi in sources {
                self.send_consumer_delete(&ssi.name, &self.source_durable(&ssi.name));
            }
        }

        if delete && advisory {
            self.send_advisory(StreamAction::Delete);
        }

        self.sendq.shutdown();

        {
            let mut st = self.state.write();
            if let Some(timer) = st.dd_timer.take() {
                timer.stop();
            }
            st.dd.clear();
            // Closing stands in for dropping the internal broker clients;
            // every handler checks it before touching the stream.
            st.closed = true;
        }

        if delete {
            self.store.delete()
        } else {
            self.store.stop()
        }
    }

    // ---------------------------------------------------------------------
    // Snapshots

    /// Builds a snapshot archive of the stream and, optionally, its
    /// consumers.
    pub fn snapshot(
        &self,
        deadline: Duration,
        check_msgs: bool,
        include_consumers: bool,
    ) -> Result<SnapshotResult> {
        let (meta, consumer_snaps) = {
            let st = self.state.read();
            if st.closed {
                return Err(Error::StreamClosed);
            }
            let meta = StreamMeta {
                config: st.cfg.clone(),
                created: st.created,
            };
            let snaps: Vec<ConsumerSnapshot> = if include_consumers {
                st.consumers
                    .values()
                    .filter_map(|o| o.snapshot_meta())
                    .collect()
            } else {
                Vec::new()
            };
            (meta, snaps)
        };

        let store_files = self.store.snapshot(deadline, check_msgs)?;
        let files = snapshot::build_snapshot_files(&meta, store_files, &consumer_snaps)?;
        let data = snapshot::write_archive(&files)?;
        Ok(SnapshotResult {
            data,
            state: self.store.state(),
        })
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("account", &self.account_name)
            .finish()
    }
}
