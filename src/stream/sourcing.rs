//! Mirror and source supervision.
//!
//! Both pull from upstream streams through durable consumers created over
//! the API (`$JS.API.CONSUMER.DURABLE.CREATE.<upstream>.<durable>`), with
//! deterministic durable names so a restarted stream reattaches to the same
//! cursor. Deliveries carry their origin coordinates in the reply subject;
//! a mirror preserves the upstream sequence numbers while a source assigns
//! local ones and stamps the origin into a header for later recovery.
//!
//! Every failure path converges on tear-down-and-reinstall: RPC timeouts
//! retry, delivery gaps recreate the upstream consumer at the last known
//! good position, and a sequence mismatch resets the mirror.

use super::{Stream, StreamSourceInfo, StreamState};
use crate::headers::{Headers, STREAM_SOURCE_HDR};
use crate::sendq::OutboundMessage;
use crate::{ApiError, Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use crossbeam::channel;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

const CONSUMER_CREATE_TIMEOUT: Duration = Duration::from_secs(2);
const UPSTREAM_ACK_WAIT: Duration = Duration::from_secs(48 * 60 * 60);
const UPSTREAM_MAX_ACK_PENDING: i64 = 64;

/// Tracking for one upstream attachment.
pub(crate) struct SourceInfo {
    pub(crate) name: String,
    pub(crate) sid: Option<u64>,
    /// Generation guard; deliveries and RPC outcomes from a previous
    /// installation are ignored.
    pub(crate) gen: u64,
    pub(crate) sseq: u64,
    pub(crate) dseq: u64,
    pub(crate) lag: u64,
    pub(crate) err: Option<ApiError>,
    pub(crate) last: Instant,
}

impl SourceInfo {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sid: None,
            gen: 0,
            sseq: 0,
            dseq: 0,
            lag: 0,
            err: None,
            last: Instant::now(),
        }
    }

    pub(crate) fn view(&self) -> StreamSourceInfo {
        StreamSourceInfo {
            name: self.name.clone(),
            lag: self.lag,
            active: self.last.elapsed(),
            error: self.err.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DeliverPolicy {
    #[default]
    All,
    ByStartSequence,
    ByStartTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConsumerRequestConfig {
    durable_name: String,
    deliver_subject: String,
    deliver_policy: DeliverPolicy,
    #[serde(default, skip_serializing_if = "is_zero")]
    opt_start_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    opt_start_time: Option<DateTime<Utc>>,
    ack_policy: String,
    ack_wait: Duration,
    max_deliver: i64,
    max_ack_pending: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter_subject: Option<String>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl ConsumerRequestConfig {
    fn durable(durable: String, deliver_subject: String) -> Self {
        Self {
            durable_name: durable,
            deliver_subject,
            deliver_policy: DeliverPolicy::All,
            opt_start_seq: 0,
            opt_start_time: None,
            ack_policy: "explicit".to_string(),
            ack_wait: UPSTREAM_ACK_WAIT,
            max_deliver: 1,
            max_ack_pending: UPSTREAM_MAX_ACK_PENDING,
            filter_subject: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CreateConsumerRequest {
    stream: String,
    config: ConsumerRequestConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConsumerCreateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ApiError>,
}

/// What to reinstall when an upstream RPC has to be retried.
#[derive(Clone, Copy)]
enum UpstreamKind {
    Mirror,
    Source { restart_seq: u64 },
}

/// Origin coordinates parsed from an upstream delivery reply:
/// `$JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<dseq>.<ts>.<pending>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AckReplyInfo {
    pub stream: String,
    pub consumer: String,
    pub delivery_count: u64,
    pub stream_seq: u64,
    pub deliver_seq: u64,
    pub ts: i64,
    pub pending: u64,
}

pub(crate) fn parse_ack_reply(reply: &str) -> Option<AckReplyInfo> {
    let tokens: Vec<&str> = reply.split('.').collect();
    if tokens.len() != 9 || tokens[0] != "$JS" || tokens[1] != "ACK" {
        return None;
    }
    Some(AckReplyInfo {
        stream: tokens[2].to_string(),
        consumer: tokens[3].to_string(),
        delivery_count: tokens[4].parse().ok()?,
        stream_seq: tokens[5].parse().ok()?,
        deliver_seq: tokens[6].parse().ok()?,
        ts: tokens[7].parse().ok()?,
        pending: tokens[8].parse().ok()?,
    })
}

/// Builds an upstream delivery reply subject.
pub fn make_ack_reply(
    stream: &str,
    consumer: &str,
    delivery_count: u64,
    stream_seq: u64,
    deliver_seq: u64,
    ts: i64,
    pending: u64,
) -> String {
    format!("$JS.ACK.{stream}.{consumer}.{delivery_count}.{stream_seq}.{deliver_seq}.{ts}.{pending}")
}

/// Origin stream and sequence from a stamped source header.
pub(crate) fn stream_and_seq(reply: &str) -> Option<(String, u64)> {
    let info = parse_ack_reply(reply)?;
    Some((info.stream, info.stream_seq))
}

fn deterministic_durable(kind: &str, upstream: &str, me: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{kind}:{upstream}:{me}").as_bytes(),
    )
    .simple()
    .to_string()
}

impl Stream {
    pub(crate) fn mirror_durable(&self, upstream: &str) -> String {
        deterministic_durable("MIRROR", upstream, self.name())
    }

    pub(crate) fn source_durable(&self, upstream: &str) -> String {
        deterministic_durable("SOURCE", upstream, self.name())
    }

    pub(crate) fn send_consumer_delete(&self, upstream: &str, durable: &str) {
        let subject = format!("$JS.API.CONSUMER.DELETE.{upstream}.{durable}");
        self.sendq
            .send(OutboundMessage::new(subject, "", Bytes::new()));
    }

    /// Mirror status, if this stream mirrors another.
    pub fn mirror_info(&self) -> Option<StreamSourceInfo> {
        self.state.read().mirror.as_ref().map(SourceInfo::view)
    }

    /// Status of every configured source.
    pub fn sources_info(&self) -> Vec<StreamSourceInfo> {
        self.state
            .read()
            .sources
            .values()
            .map(SourceInfo::view)
            .collect()
    }

    // ---------------------------------------------------------------------
    // Mirror

    /// Lock must be held.
    pub(crate) fn setup_mirror_consumer_locked(
        self: &Arc<Self>,
        st: &mut StreamState,
    ) -> Result<()> {
        let Some(mcfg) = st.cfg.mirror.clone() else {
            return Ok(());
        };

        // Tear down whatever was installed before.
        if let Some(mirror) = &mut st.mirror {
            if let Some(sid) = mirror.sid.take() {
                self.broker.unsubscribe(sid);
            }
        }
        st.source_gen += 1;
        let gen = st.source_gen;

        let deliver = format!("$JS.M.{}", Uuid::new_v4().simple());
        let weak = Arc::downgrade(self);
        let sid = self.broker.subscribe(
            &deliver,
            Arc::new(move |subject, reply, hdr, msg| {
                if let Some(s) = weak.upgrade() {
                    s.process_inbound_mirror_msg(gen, subject, reply, hdr, msg);
                }
            }),
        )?;
        let mut info = SourceInfo::new(&mcfg.name);
        info.sid = Some(sid);
        info.gen = gen;
        st.mirror = Some(info);

        let durable = self.mirror_durable(&mcfg.name);
        // Any prior durable is stale; ask the upstream to drop it first.
        self.send_consumer_delete(&mcfg.name, &durable);

        let state = self.store.state();
        let mut cfg = ConsumerRequestConfig::durable(durable.clone(), deliver);
        cfg.deliver_policy = DeliverPolicy::ByStartSequence;
        cfg.opt_start_seq = state.last_seq;
        // Start options only apply to a first attachment.
        if state.msgs == 0 {
            if mcfg.opt_start_seq > 0 {
                cfg.opt_start_seq = mcfg.opt_start_seq;
            } else if mcfg.opt_start_time.is_some() {
                cfg.opt_start_time = mcfg.opt_start_time;
                cfg.deliver_policy = DeliverPolicy::ByStartTime;
                cfg.opt_start_seq = 0;
            }
        }
        if cfg.opt_start_seq == 0 && cfg.opt_start_time.is_none() {
            cfg.deliver_policy = DeliverPolicy::All;
        }

        self.request_upstream_consumer(gen, UpstreamKind::Mirror, &mcfg.name, &durable, cfg);
        Ok(())
    }

    pub(crate) fn reset_mirror_consumer(self: &Arc<Self>) {
        let mut st = self.state.write();
        if st.closed {
            return;
        }
        if let Err(err) = self.setup_mirror_consumer_locked(&mut st) {
            warn!(stream = %self.name(), %err, "failed to reset mirror consumer");
        }
    }

    fn process_inbound_mirror_msg(
        self: &Arc<Self>,
        gen: u64,
        subject: &str,
        reply: &str,
        hdr: &Headers,
        msg: &Bytes,
    ) {
        let Some(info) = parse_ack_reply(reply) else {
            return;
        };

        let clustered = {
            let mut st = self.state.write();
            match &mut st.mirror {
                Some(mirror) if mirror.gen == gen => {
                    mirror.lag = info.pending;
                    mirror.last = Instant::now();
                }
                // Not current anymore.
                _ => return,
            }
            st.node.is_some()
        };

        let proposed = info.stream_seq.saturating_sub(1);
        let result = if clustered {
            self.propose_mirror(subject, hdr, msg, proposed, info.ts)
        } else {
            self.process_stream_msg(subject, "", hdr, msg, proposed, info.ts)
        };

        match result {
            Ok(()) => {
                if !reply.is_empty() {
                    self.sendq
                        .send(OutboundMessage::new(reply, "", Bytes::new()));
                }
            }
            Err(Error::LastSeqMismatch) => {
                // We may have missed messages, restart.
                self.reset_mirror_consumer();
            }
            Err(err) => {
                let text = err.to_string();
                if text.contains("no space left") {
                    error!(stream = %self.name(), "storage out of space, disabling engine");
                    if let Some(acc) = self.account.upgrade() {
                        acc.disable();
                    }
                } else {
                    debug!(stream = %self.name(), %err, "error processing mirror msg");
                }
            }
        }
    }

    /// Proposes a mirrored message at its origin position.
    fn propose_mirror(
        &self,
        subject: &str,
        hdr: &Headers,
        msg: &Bytes,
        seq: u64,
        ts: i64,
    ) -> Result<()> {
        let node = self
            .state
            .read()
            .node
            .clone()
            .ok_or_else(|| Error::Replication("stream is not clustered".to_string()))?;
        let entry = crate::replication::encode_stream_entry(&crate::replication::StreamEntry {
            subject: subject.to_string(),
            reply: String::new(),
            headers: hdr.clone(),
            msg: msg.to_vec(),
            seq,
            ts,
        })?;
        node.propose(entry)
    }

    // ---------------------------------------------------------------------
    // Sources

    /// Lock must be held.
    pub(crate) fn setup_source_consumers_locked(self: &Arc<Self>, st: &mut StreamState) {
        for si in st.sources.values_mut() {
            if let Some(sid) = si.sid.take() {
                self.broker.unsubscribe(sid);
            }
        }

        self.starting_sequence_for_sources_locked(st);

        for ssi in st.cfg.sources.clone() {
            let seq = st
                .sources
                .get(&ssi.name)
                .map(|si| si.sseq + 1)
                .unwrap_or(1);
            self.set_source_consumer_locked(st, &ssi.name, seq);
        }
    }

    /// Lock must be held.
    pub(crate) fn stop_source_consumers_locked(&self, st: &mut StreamState) {
        let names: Vec<String> = st.sources.keys().cloned().collect();
        for name in names {
            if let Some(si) = st.sources.get_mut(&name) {
                if let Some(sid) = si.sid.take() {
                    self.broker.unsubscribe(sid);
                }
            }
            let durable = self.source_durable(&name);
            self.send_consumer_delete(&name, &durable);
        }
    }

    /// Rebuilds per-source positions by scanning the local log backwards
    /// for stamped origin headers. Stops as soon as every configured source
    /// is resolved. Lock must be held.
    pub(crate) fn starting_sequence_for_sources_locked(&self, st: &mut StreamState) {
        st.sources.clear();
        if st.cfg.sources.is_empty() {
            return;
        }
        for ssi in &st.cfg.sources {
            st.sources.insert(ssi.name.clone(), SourceInfo::new(&ssi.name));
        }

        let state = self.store.state();
        if state.msgs == 0 {
            return;
        }

        let expected = st.cfg.sources.len();
        let mut seqs: std::collections::HashMap<String, u64> = std::collections::HashMap::new();
        for seq in (state.first_seq..=state.last_seq).rev() {
            let Ok(msg) = self.store.load_msg(seq) else {
                continue;
            };
            let Some(reply) = msg.headers.stream_source() else {
                continue;
            };
            let Some((sname, sseq)) = stream_and_seq(reply) else {
                continue;
            };
            if st.sources.contains_key(&sname) && !seqs.contains_key(&sname) {
                seqs.insert(sname, sseq);
                if seqs.len() == expected {
                    break;
                }
            }
        }

        for (name, seq) in seqs {
            if let Some(si) = st.sources.get_mut(&name) {
                si.sseq = seq;
                si.dseq = 1;
            }
        }
    }

    /// Installs (or reinstalls) the upstream consumer for one source,
    /// starting at `seq`. Lock must be held.
    pub(crate) fn set_source_consumer_locked(
        self: &Arc<Self>,
        st: &mut StreamState,
        name: &str,
        seq: u64,
    ) {
        if !st.sources.contains_key(name) {
            return;
        }
        st.source_gen += 1;
        let gen = st.source_gen;

        if let Some(si) = st.sources.get_mut(name) {
            if let Some(sid) = si.sid.take() {
                self.broker.unsubscribe(sid);
            }
            si.sseq = 0;
            si.dseq = 0;
            si.gen = gen;
        }

        let durable = self.source_durable(name);
        self.send_consumer_delete(name, &durable);

        let deliver = format!("$JS.S.{}", Uuid::new_v4().simple());
        let weak = Arc::downgrade(self);
        let sname = name.to_string();
        let sid = match self.broker.subscribe(
            &deliver,
            Arc::new(move |subject, reply, hdr, msg| {
                if let Some(s) = weak.upgrade() {
                    s.process_inbound_source_msg(gen, &sname, subject, reply, hdr, msg);
                }
            }),
        ) {
            Ok(sid) => sid,
            Err(err) => {
                if let Some(si) = st.sources.get_mut(name) {
                    si.err = Some(ApiError::new(500, err.to_string()));
                }
                return;
            }
        };
        if let Some(si) = st.sources.get_mut(name) {
            si.sid = Some(sid);
        }

        let ssi = st.cfg.sources.iter().find(|s| s.name == name).cloned();
        let mut cfg = ConsumerRequestConfig::durable(durable.clone(), deliver);
        if seq <= 1 {
            if let Some(ssi) = &ssi {
                if ssi.opt_start_seq > 0 {
                    cfg.opt_start_seq = ssi.opt_start_seq;
                    cfg.deliver_policy = DeliverPolicy::ByStartSequence;
                } else if ssi.opt_start_time.is_some() {
                    cfg.opt_start_time = ssi.opt_start_time;
                    cfg.deliver_policy = DeliverPolicy::ByStartTime;
                }
            }
        } else {
            cfg.opt_start_seq = seq;
            cfg.deliver_policy = DeliverPolicy::ByStartSequence;
        }
        if let Some(ssi) = &ssi {
            cfg.filter_subject = ssi.filter_subject.clone();
        }

        self.request_upstream_consumer(
            gen,
            UpstreamKind::Source { restart_seq: seq },
            name,
            &durable,
            cfg,
        );
    }

    fn process_inbound_source_msg(
        self: &Arc<Self>,
        gen: u64,
        name: &str,
        subject: &str,
        reply: &str,
        hdr: &Headers,
        msg: &Bytes,
    ) {
        let Some(info) = parse_ack_reply(reply) else {
            return;
        };

        let clustered = {
            let mut st = self.state.write();
            let mut restart = None;
            {
                let Some(si) = st.sources.get_mut(name) else {
                    return;
                };
                // Redeliveries could introduce duplicates, drop them.
                if si.gen != gen || info.delivery_count > 1 {
                    return;
                }
                if info.deliver_seq == si.dseq + 1 {
                    si.dseq += 1;
                    si.sseq += 1;
                    if info.deliver_seq == 1 {
                        si.sseq = info.stream_seq;
                    }
                    si.last = Instant::now();
                    si.lag = info.pending;
                } else {
                    restart = Some(si.sseq + 1);
                }
            }
            if let Some(at) = restart {
                self.set_source_consumer_locked(&mut st, name, at);
                return;
            }
            st.node.is_some()
        };

        // Keep the origin reply, it carries all the metadata needed to
        // rebuild source positions after a restart.
        let mut hdr = hdr.clone();
        hdr.insert(STREAM_SOURCE_HDR, reply);

        let result = if clustered {
            self.propose_inbound(subject, "", &hdr, msg)
        } else {
            self.process_stream_msg(subject, "", &hdr, msg, 0, 0)
        };
        if let Err(err) = result {
            error!(stream = %self.name(), source = name, %err, "error processing source msg");
        }

        if !reply.is_empty() {
            self.sendq
                .send(OutboundMessage::new(reply, "", Bytes::new()));
        }
    }

    // ---------------------------------------------------------------------
    // Upstream consumer RPC

    /// Fires the durable-create request and parks a waiter on the reply
    /// inbox. Timeouts tear down and reinstall; API errors are recorded and
    /// left for the operator.
    fn request_upstream_consumer(
        self: &Arc<Self>,
        gen: u64,
        kind: UpstreamKind,
        upstream: &str,
        durable: &str,
        cfg: ConsumerRequestConfig,
    ) {
        let reply_inbox = format!("_INBOX.{}", Uuid::new_v4().simple());
        let (tx, rx) = channel::bounded::<ConsumerCreateResponse>(1);
        let reply_sid = match self.broker.subscribe(
            &reply_inbox,
            Arc::new(move |_subject, _reply, _hdr, msg| {
                let resp = serde_json::from_slice::<ConsumerCreateResponse>(msg).unwrap_or(
                    ConsumerCreateResponse {
                        error: Some(ApiError::new(400, "invalid JSON response")),
                    },
                );
                let _ = tx.try_send(resp);
            }),
        ) {
            Ok(sid) => sid,
            Err(err) => {
                warn!(stream = %self.name(), %err, "failed to subscribe consumer create inbox");
                return;
            }
        };

        let req = CreateConsumerRequest {
            stream: upstream.to_string(),
            config: cfg,
        };
        let buf = match serde_json::to_vec(&req) {
            Ok(buf) => buf,
            Err(err) => {
                error!(stream = %self.name(), %err, "failed to marshal consumer create request");
                self.broker.unsubscribe(reply_sid);
                return;
            }
        };
        let subject = format!("$JS.API.CONSUMER.DURABLE.CREATE.{upstream}.{durable}");
        self.sendq
            .send(OutboundMessage::new(subject, &reply_inbox, Bytes::from(buf)));

        let weak = Arc::downgrade(self);
        let broker = Arc::clone(&self.broker);
        let upstream = upstream.to_string();
        let spawned = thread::Builder::new()
            .name("rivermq-upstream-rpc".to_string())
            .spawn(move || {
                let should_retry = match rx.recv_timeout(CONSUMER_CREATE_TIMEOUT) {
                    Ok(resp) => {
                        if let Some(s) = weak.upgrade() {
                            s.handle_upstream_response(kind, &upstream, gen, resp.error);
                        }
                        false
                    }
                    Err(_) => true,
                };
                broker.unsubscribe(reply_sid);
                if should_retry {
                    if let Some(s) = weak.upgrade() {
                        s.retry_upstream_consumer(kind, &upstream, gen);
                    }
                }
            });
        if let Err(err) = spawned {
            error!(stream = %self.name(), %err, "failed to spawn upstream rpc waiter");
        }
    }

    fn handle_upstream_response(
        self: &Arc<Self>,
        kind: UpstreamKind,
        upstream: &str,
        gen: u64,
        error: Option<ApiError>,
    ) {
        let mut st = self.state.write();
        match kind {
            UpstreamKind::Mirror => {
                if let Some(mirror) = &mut st.mirror {
                    if mirror.gen != gen {
                        return;
                    }
                    if let Some(err) = &error {
                        warn!(
                            stream = %self.name(),
                            upstream,
                            %err,
                            "mirror consumer create failed"
                        );
                        if let Some(sid) = mirror.sid.take() {
                            self.broker.unsubscribe(sid);
                        }
                    }
                    mirror.err = error;
                }
            }
            UpstreamKind::Source { .. } => {
                if let Some(si) = st.sources.get_mut(upstream) {
                    if si.gen != gen {
                        return;
                    }
                    if let Some(err) = &error {
                        warn!(
                            stream = %self.name(),
                            upstream,
                            %err,
                            "source consumer create failed"
                        );
                    }
                    si.err = error;
                }
            }
        }
    }

    fn retry_upstream_consumer(self: &Arc<Self>, kind: UpstreamKind, upstream: &str, gen: u64) {
        let mut st = self.state.write();
        if st.closed {
            return;
        }
        match kind {
            UpstreamKind::Mirror => {
                if st.mirror.as_ref().map(|m| m.gen) == Some(gen) {
                    if let Err(err) = self.setup_mirror_consumer_locked(&mut st) {
                        warn!(stream = %self.name(), %err, "mirror consumer retry failed");
                    }
                }
            }
            UpstreamKind::Source { restart_seq } => {
                if st.sources.get(upstream).map(|s| s.gen) == Some(gen) {
                    self.set_source_consumer_locked(&mut st, upstream, restart_seq);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ack_reply() {
        let reply = make_ack_reply("ORDERS", "durable1", 1, 42, 7, 1234, 5);
        let info = parse_ack_reply(&reply).unwrap();
        assert_eq!(info.stream, "ORDERS");
        assert_eq!(info.consumer, "durable1");
        assert_eq!(info.delivery_count, 1);
        assert_eq!(info.stream_seq, 42);
        assert_eq!(info.deliver_seq, 7);
        assert_eq!(info.ts, 1234);
        assert_eq!(info.pending, 5);

        assert!(parse_ack_reply("$JS.ACK.too.short").is_none());
        assert!(parse_ack_reply("$JS.NACK.a.b.1.2.3.4.5").is_none());
        assert!(parse_ack_reply("$JS.ACK.a.b.x.2.3.4.5").is_none());
    }

    #[test]
    fn test_stream_and_seq() {
        let reply = make_ack_reply("UP", "d", 1, 99, 1, 0, 0);
        assert_eq!(stream_and_seq(&reply), Some(("UP".to_string(), 99)));
    }

    #[test]
    fn test_durable_names_are_deterministic() {
        let a = deterministic_durable("MIRROR", "UP", "ME");
        let b = deterministic_durable("MIRROR", "UP", "ME");
        assert_eq!(a, b);
        assert_ne!(a, deterministic_durable("SOURCE", "UP", "ME"));
        assert_ne!(a, deterministic_durable("MIRROR", "UP2", "ME"));
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_consumer_request_shape() {
        let mut cfg = ConsumerRequestConfig::durable("d1".into(), "$JS.M.x".into());
        cfg.deliver_policy = DeliverPolicy::ByStartSequence;
        cfg.opt_start_seq = 10;
        let req = CreateConsumerRequest {
            stream: "UP".into(),
            config: cfg,
        };
        let v: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&req).unwrap()).unwrap();
        assert_eq!(v["stream"], "UP");
        assert_eq!(v["config"]["deliver_policy"], "by_start_sequence");
        assert_eq!(v["config"]["opt_start_seq"], 10);
        assert_eq!(v["config"]["max_ack_pending"], 64);
        assert_eq!(v["config"]["max_deliver"], 1);
        assert!(v["config"].get("filter_subject").is_none());
    }
}
