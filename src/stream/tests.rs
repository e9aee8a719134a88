use super::*;
use crate::account::{Account, AccountConfig, AccountLimits};
use crate::broker::InProcessBroker;
use crate::config::StreamConfig;
use crate::headers::{
    EXPECTED_LAST_MSG_ID_HDR, EXPECTED_LAST_SEQ_HDR, EXPECTED_STREAM_HDR, MSG_ID_HDR,
};
use crate::replication::ConsensusNode;
use bytes::Bytes;
use crossbeam::channel::{self, Receiver};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tempfile::TempDir;

fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}

struct Harness {
    broker: Arc<InProcessBroker>,
    account: Arc<Account>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(InProcessBroker::new());
    let account = Account::new(
        AccountConfig::new("TEST", dir.path()),
        broker.clone() as Arc<dyn Broker>,
    );
    Harness {
        broker,
        account,
        _dir: dir,
    }
}

impl Harness {
    fn add_stream(&self, mutate: impl FnOnce(&mut StreamConfig)) -> Arc<Stream> {
        let mut cfg = StreamConfig {
            name: "orders".to_string(),
            subjects: vec!["orders.>".to_string()],
            storage: crate::config::StorageType::Memory,
            ..Default::default()
        };
        mutate(&mut cfg);
        self.account.add_stream(cfg).unwrap()
    }

    /// Subscribes a one-shot reply inbox and returns it with its receiver.
    fn reply_inbox(&self) -> (String, Receiver<Bytes>) {
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let (tx, rx) = channel::bounded(16);
        self.broker
            .subscribe(
                &inbox,
                Arc::new(move |_s, _r, _h, msg| {
                    let _ = tx.try_send(msg.clone());
                }),
            )
            .unwrap();
        (inbox, rx)
    }

    /// Publishes and waits for the publish-ack JSON.
    fn publish(&self, subject: &str, hdr: &Headers, body: &str) -> serde_json::Value {
        let (inbox, rx) = self.reply_inbox();
        self.broker
            .publish(subject, "", &inbox, hdr, &Bytes::from(body.to_string()));
        let buf = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("no publish ack");
        serde_json::from_slice(&buf).expect("bad ack json")
    }
}

#[derive(Default)]
struct TestConsumer {
    name: String,
    filter: Option<String>,
    delivered: Mutex<Vec<(u64, String)>>,
    pending: Mutex<Vec<u64>>,
    purged: Mutex<Option<u64>>,
    signals: AtomicUsize,
    stopped: AtomicUsize,
    ack_needed: Mutex<Vec<u64>>,
}

impl TestConsumer {
    fn named(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ..Default::default()
        })
    }

    fn filtered(name: &str, filter: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            filter: Some(filter.to_string()),
            ..Default::default()
        })
    }
}

impl Consumer for TestConsumer {
    fn name(&self) -> String {
        self.name.clone()
    }
    fn filter_subject(&self) -> Option<String> {
        self.filter.clone()
    }
    fn inc_stream_pending(&self, seq: u64, _subject: &str) {
        self.pending.lock().push(seq);
    }
    fn dec_stream_pending(&self, seq: u64, _subject: &str) {
        self.pending.lock().retain(|&s| s != seq);
    }
    fn deliver_current_msg(
        &self,
        subject: &str,
        _hdr: &Headers,
        _msg: &Bytes,
        seq: u64,
        _ts: i64,
    ) -> bool {
        self.delivered.lock().push((seq, subject.to_string()));
        true
    }
    fn signal_new_messages(&self) {
        self.signals.fetch_add(1, Ordering::SeqCst);
    }
    fn did_not_deliver(&self, _seq: u64) {}
    fn needs_ack(&self, seq: u64) -> bool {
        self.ack_needed.lock().contains(&seq)
    }
    fn purge(&self, first_seq: u64) {
        *self.purged.lock() = Some(first_seq);
    }
    fn stop(&self, _delete: bool, _advisory: bool) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_publish_assigns_sequences() {
    let h = harness();
    let stream = h.add_stream(|_| {});

    let ack = h.publish("orders.new", &Headers::new(), "m1");
    assert_eq!(ack["stream"], "orders");
    assert_eq!(ack["seq"], 1);
    let ack = h.publish("orders.new", &Headers::new(), "m2");
    assert_eq!(ack["seq"], 2);

    assert_eq!(stream.last_seq(), 2);
    assert_eq!(stream.state().last_seq, 2);
}

#[test]
fn test_duplicate_msg_id_within_window() {
    let h = harness();
    let stream = h.add_stream(|cfg| cfg.dedup_window = Duration::from_secs(2));

    let mut hdr = Headers::new();
    hdr.insert(MSG_ID_HDR, "A");
    let ack = h.publish("orders.new", &hdr, "m1");
    assert_eq!(ack["seq"], 1);
    assert!(ack.get("duplicate").is_none());

    let ack = h.publish("orders.new", &hdr, "m1-again");
    assert_eq!(ack["seq"], 1);
    assert_eq!(ack["duplicate"], true);

    assert_eq!(stream.state().msgs, 1);
    assert_eq!(stream.last_seq(), 1);
    assert_eq!(stream.num_msg_ids(), 1);
}

#[test]
fn test_dedup_window_drains_after_quiescence() {
    let h = harness();
    let stream = h.add_stream(|cfg| cfg.dedup_window = Duration::from_millis(100));

    let mut hdr = Headers::new();
    hdr.insert(MSG_ID_HDR, "A");
    h.publish("orders.new", &hdr, "m1");
    assert_eq!(stream.num_msg_ids(), 1);

    // After the window passes the id can be used again for a new sequence.
    assert!(wait_until(Duration::from_secs(2), || stream.num_msg_ids() == 0));
    let ack = h.publish("orders.new", &hdr, "m2");
    assert_eq!(ack["seq"], 2);
}

#[test]
fn test_expected_last_seq_guard() {
    let h = harness();
    let _stream = h.add_stream(|_| {});
    for i in 1..=3 {
        let ack = h.publish("orders.new", &Headers::new(), &format!("m{i}"));
        assert_eq!(ack["seq"], i);
    }

    let mut hdr = Headers::new();
    hdr.insert(EXPECTED_LAST_SEQ_HDR, "3");
    let ack = h.publish("orders.new", &hdr, "m4");
    assert_eq!(ack["seq"], 4);

    // Same guard again now fails against lseq 4.
    let ack = h.publish("orders.new", &hdr, "m5");
    assert_eq!(ack["error"]["code"], 400);
    assert_eq!(ack["error"]["description"], "wrong last sequence: 4");
}

#[test]
fn test_expected_stream_guard() {
    let h = harness();
    let _stream = h.add_stream(|_| {});
    let mut hdr = Headers::new();
    hdr.insert(EXPECTED_STREAM_HDR, "other");
    let ack = h.publish("orders.new", &hdr, "m");
    assert_eq!(ack["error"]["code"], 400);
    assert_eq!(ack["error"]["description"], "expected stream does not match");
}

#[test]
fn test_expected_last_msg_id_guard() {
    let h = harness();
    let _stream = h.add_stream(|_| {});
    let mut hdr = Headers::new();
    hdr.insert(MSG_ID_HDR, "first");
    h.publish("orders.new", &hdr, "m1");

    let mut hdr = Headers::new();
    hdr.insert(EXPECTED_LAST_MSG_ID_HDR, "first");
    let ack = h.publish("orders.new", &hdr, "m2");
    assert_eq!(ack["seq"], 2);

    let mut hdr = Headers::new();
    hdr.insert(EXPECTED_LAST_MSG_ID_HDR, "first");
    let ack = h.publish("orders.new", &hdr, "m3");
    assert_eq!(ack["error"]["code"], 400);
    // The last append had no msg id.
    assert_eq!(ack["error"]["description"], "wrong last msg ID: ");
}

#[test]
fn test_max_msg_size() {
    let h = harness();
    let stream = h.add_stream(|cfg| cfg.max_msg_size = 10);

    let ack = h.publish("orders.new", &Headers::new(), "exactly10b");
    assert_eq!(ack["seq"], 1);

    let ack = h.publish("orders.new", &Headers::new(), "elevenbytes");
    assert_eq!(ack["error"]["code"], 400);
    assert_eq!(
        ack["error"]["description"],
        "message size exceeds maximum allowed"
    );
    assert_eq!(stream.last_seq(), 1);
}

#[test]
fn test_interest_retention_skips_without_consumers() {
    let h = harness();
    let stream = h.add_stream(|cfg| cfg.retention = RetentionPolicy::Interest);

    let ack = h.publish("orders.new", &Headers::new(), "m1");
    assert_eq!(ack["seq"], 1);

    let state = stream.state();
    assert_eq!(state.last_seq, 1);
    assert_eq!(state.msgs, 0);
}

#[test]
fn test_interest_retention_with_filtered_consumers() {
    let h = harness();
    let stream = h.add_stream(|cfg| cfg.retention = RetentionPolicy::Interest);
    stream
        .add_consumer(TestConsumer::filtered("eu", "orders.eu.>"))
        .unwrap();

    // No filter matches, skipped.
    let ack = h.publish("orders.us.new", &Headers::new(), "m1");
    assert_eq!(ack["seq"], 1);
    assert_eq!(stream.state().msgs, 0);

    // Matching filter, stored.
    let ack = h.publish("orders.eu.new", &Headers::new(), "m2");
    assert_eq!(ack["seq"], 2);
    assert_eq!(stream.state().msgs, 1);
}

#[test]
fn test_no_ack_suppresses_response() {
    let h = harness();
    let stream = h.add_stream(|cfg| cfg.no_ack = true);

    let (inbox, rx) = h.reply_inbox();
    h.broker
        .publish("orders.new", "", &inbox, &Headers::new(), &Bytes::from("m"));
    assert!(wait_until(Duration::from_millis(500), || stream.last_seq() == 1));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn test_consumer_fanout() {
    let h = harness();
    let stream = h.add_stream(|_| {});
    let c1 = TestConsumer::named("c1");
    let c2 = TestConsumer::named("c2");
    stream.add_consumer(c1.clone()).unwrap();
    stream.add_consumer(c2.clone()).unwrap();
    assert_eq!(stream.num_consumers(), 2);

    h.publish("orders.new", &Headers::new(), "m1");
    assert_eq!(c1.delivered.lock().as_slice(), &[(1, "orders.new".to_string())]);
    assert_eq!(c2.delivered.lock().as_slice(), &[(1, "orders.new".to_string())]);
    assert_eq!(c1.pending.lock().as_slice(), &[1]);
}

#[test]
fn test_purge_notifies_consumers_and_clears_dedup() {
    let h = harness();
    let stream = h.add_stream(|_| {});
    let c1 = TestConsumer::named("c1");
    stream.add_consumer(c1.clone()).unwrap();

    let mut hdr = Headers::new();
    hdr.insert(MSG_ID_HDR, "A");
    for i in 0..100 {
        let mut hdr = hdr.clone();
        hdr.insert(MSG_ID_HDR, format!("id{i}"));
        h.publish("orders.new", &hdr, "m");
    }
    assert_eq!(stream.state().msgs, 100);
    assert_eq!(stream.num_msg_ids(), 100);

    assert_eq!(stream.purge().unwrap(), 100);
    assert_eq!(stream.state().msgs, 0);
    assert_eq!(stream.num_msg_ids(), 0);
    assert_eq!(*c1.purged.lock(), Some(101));
}

#[test]
fn test_workqueue_single_consumer_rule() {
    let h = harness();
    let stream = h.add_stream(|cfg| cfg.retention = RetentionPolicy::WorkQueue);
    stream.add_consumer(TestConsumer::named("c1")).unwrap();
    assert!(stream.add_consumer(TestConsumer::named("c2")).is_err());

    let h2 = harness();
    let stream2 = h2.add_stream(|cfg| cfg.retention = RetentionPolicy::WorkQueue);
    stream2
        .add_consumer(TestConsumer::filtered("eu", "orders.eu.>"))
        .unwrap();
    // Overlapping partition rejected, disjoint accepted.
    assert!(stream2
        .add_consumer(TestConsumer::filtered("eu2", "orders.eu.>"))
        .is_err());
    stream2
        .add_consumer(TestConsumer::filtered("us", "orders.us.>"))
        .unwrap();
}

#[test]
fn test_ack_msg_retention() {
    let h = harness();
    let stream = h.add_stream(|cfg| cfg.retention = RetentionPolicy::WorkQueue);
    let c1 = TestConsumer::named("c1");
    stream.add_consumer(c1.clone()).unwrap();
    h.publish("orders.new", &Headers::new(), "m1");
    assert_eq!(stream.state().msgs, 1);
    stream.ack_msg("c1", 1);
    assert_eq!(stream.state().msgs, 0);

    let h2 = harness();
    let stream2 = h2.add_stream(|cfg| cfg.retention = RetentionPolicy::Interest);
    let a = TestConsumer::named("a");
    let b = TestConsumer::named("b");
    stream2.add_consumer(a.clone()).unwrap();
    stream2.add_consumer(b.clone()).unwrap();
    h2.publish("orders.new", &Headers::new(), "m1");
    assert_eq!(stream2.state().msgs, 1);

    // Another consumer still needs the message.
    b.ack_needed.lock().push(1);
    stream2.ack_msg("a", 1);
    assert_eq!(stream2.state().msgs, 1);

    b.ack_needed.lock().clear();
    stream2.ack_msg("b", 1);
    assert_eq!(stream2.state().msgs, 0);
}

#[test]
fn test_update_subject_set() {
    let h = harness();
    let stream = h.add_stream(|_| {});

    let mut cfg = stream.config();
    cfg.subjects = vec!["orders.>".to_string(), "returns.>".to_string()];
    stream.update(&cfg).unwrap();

    let ack = h.publish("returns.new", &Headers::new(), "r1");
    assert_eq!(ack["seq"], 1);

    let mut cfg = stream.config();
    cfg.subjects = vec!["returns.>".to_string()];
    stream.update(&cfg).unwrap();

    let (inbox, rx) = h.reply_inbox();
    assert!(!h
        .broker
        .publish("orders.new", "", &inbox, &Headers::new(), &Bytes::from("m")));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_stop_tears_down() {
    let h = harness();
    let stream = h.add_stream(|_| {});
    let c1 = TestConsumer::named("c1");
    stream.add_consumer(c1.clone()).unwrap();
    h.publish("orders.new", &Headers::new(), "m1");

    stream.stop(false, false).unwrap();
    assert_eq!(c1.stopped.load(Ordering::SeqCst), 1);
    assert!(h.account.lookup_stream("orders").is_none());

    // Subject handlers are gone.
    assert!(!h
        .broker
        .publish("orders.new", "", "", &Headers::new(), &Bytes::from("m")));
    assert!(stream.stop(false, false).is_err());
}

#[test]
fn test_account_limits_reject_publish() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(InProcessBroker::new());
    let account = Account::new(
        AccountConfig::new("TEST", dir.path()).with_limits(AccountLimits {
            max_memory: 64,
            ..Default::default()
        }),
        broker.clone() as Arc<dyn Broker>,
    );
    let h = Harness {
        broker,
        account,
        _dir: dir,
    };
    let stream = h.add_stream(|_| {});

    // First publish lands over the tiny quota, second is rejected and
    // rolled back.
    let ack = h.publish("orders.new", &Headers::new(), "pushes us over the byte quota");
    assert_eq!(ack["seq"], 1);
    let ack = h.publish("orders.new", &Headers::new(), "rejected");
    assert_eq!(ack["error"]["code"], 400);
    assert_eq!(
        ack["error"]["description"],
        "resource limits exceeded for account"
    );
    assert_eq!(stream.state().msgs, 1);
}

#[test]
fn test_proposed_sequence_mismatch() {
    let h = harness();
    let stream = h.add_stream(|_| {});
    h.publish("orders.new", &Headers::new(), "m1");

    let err = stream
        .process_stream_msg("orders.new", "", &Headers::new(), &Bytes::from("m"), 5, 1)
        .unwrap_err();
    assert!(matches!(err, Error::LastSeqMismatch));
    assert_eq!(stream.last_seq(), 1);
}

struct LoopbackNode {
    target: RwLock<Weak<Stream>>,
    proposals: Mutex<Vec<Vec<u8>>>,
}

impl LoopbackNode {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            target: RwLock::new(Weak::new()),
            proposals: Mutex::new(Vec::new()),
        })
    }

    fn bind(&self, stream: &Arc<Stream>) {
        *self.target.write() = Arc::downgrade(stream);
    }
}

impl ConsensusNode for LoopbackNode {
    fn is_leader(&self) -> bool {
        true
    }
    fn propose(&self, entry: Vec<u8>) -> Result<()> {
        self.proposals.lock().push(entry.clone());
        if let Some(stream) = self.target.read().upgrade() {
            stream.apply_committed(&entry)?;
        }
        Ok(())
    }
    fn stop(&self) {}
    fn delete(&self) {}
}

fn clustered_harness(name: &str) -> (Harness, Arc<Stream>, Arc<LoopbackNode>) {
    let h = harness();
    let node = LoopbackNode::new();
    let sa = StreamAssignment {
        sync_subject: format!("$JS.SYNC.{name}"),
        responded: true,
        node: Some(node.clone() as Arc<dyn ConsensusNode>),
    };
    let cfg = StreamConfig {
        name: name.to_string(),
        subjects: vec![format!("{name}.>")],
        storage: crate::config::StorageType::Memory,
        ..Default::default()
    };
    let stream = h.account.add_stream_with_assignment(cfg, sa).unwrap();
    node.bind(&stream);
    stream.set_leader(true).unwrap();
    (h, stream, node)
}

#[test]
fn test_clustered_publish_goes_through_proposal() {
    let (h, stream, node) = clustered_harness("clu");

    for i in 1..=3 {
        let ack = h.publish("clu.x", &Headers::new(), &format!("m{i}"));
        assert_eq!(ack["seq"], i);
    }
    assert_eq!(node.proposals.lock().len(), 3);
    assert_eq!(stream.last_seq(), 3);
    assert_eq!(stream.state().last_seq, 3);
}

#[test]
fn test_clustered_rejects_keep_sequence_aligned() {
    let (h, stream, _node) = clustered_harness("clu2");

    let mut hdr = Headers::new();
    hdr.insert(MSG_ID_HDR, "A");
    let ack = h.publish("clu2.x", &hdr, "m1");
    assert_eq!(ack["seq"], 1);

    // Duplicate bumps the failed count instead of consuming a sequence.
    let ack = h.publish("clu2.x", &hdr, "m1");
    assert_eq!(ack["duplicate"], true);

    // Later publishes still line up with the consensus sequence.
    let ack = h.publish("clu2.x", &Headers::new(), "m2");
    assert_eq!(ack["seq"], 2);
    assert_eq!(stream.state().last_seq, 2);
}

#[test]
fn test_consensus_replay_reproduces_state() {
    let (h, stream, node) = clustered_harness("src");

    let mut hdr = Headers::new();
    hdr.insert(MSG_ID_HDR, "last-one");
    h.publish("src.x", &Headers::new(), "m1");
    h.publish("src.x", &Headers::new(), "m2");
    h.publish("src.x", &hdr, "m3");

    // Replay the exact log into a fresh replica.
    let h2 = harness();
    let node2 = LoopbackNode::new();
    let sa = StreamAssignment {
        sync_subject: "$JS.SYNC.replica".to_string(),
        responded: true,
        node: Some(node2.clone() as Arc<dyn ConsensusNode>),
    };
    let cfg = StreamConfig {
        name: "src".to_string(),
        subjects: vec!["src.>".to_string()],
        storage: crate::config::StorageType::Memory,
        ..Default::default()
    };
    let replica = h2.account.add_stream_with_assignment(cfg, sa).unwrap();
    node2.bind(&replica);

    for entry in node.proposals.lock().iter() {
        replica.apply_committed(entry).unwrap();
    }

    assert_eq!(replica.last_seq(), stream.last_seq());
    assert_eq!(replica.state().last_seq, stream.state().last_seq);
    assert_eq!(replica.state().msgs, stream.state().msgs);
    let orig = stream.get_msg(3).unwrap();
    let copy = replica.get_msg(3).unwrap();
    assert_eq!(orig.subject, copy.subject);
    assert_eq!(orig.data, copy.data);
    assert_eq!(orig.headers, copy.headers);
}

#[test]
fn test_auto_tune_block_size() {
    let mut cfg = crate::config::check_stream_config(&StreamConfig {
        name: "t".to_string(),
        ..Default::default()
    })
    .unwrap();

    // Nothing set leaves the default.
    let fs = Stream::auto_tune_block_size(&cfg);
    assert_eq!(fs.block_size, crate::store::FILE_STORE_DEFAULT_BLOCK_SIZE);

    // Max bytes drives the estimate: 125% of the limit, in 100 byte steps.
    cfg.max_bytes = 1_000_000;
    let fs = Stream::auto_tune_block_size(&cfg);
    assert_eq!(fs.block_size % 100, 0);
    assert!(fs.block_size >= 250_000 && fs.block_size <= 250_100);

    // Clamped at the bounds.
    cfg.max_bytes = 1;
    assert_eq!(
        Stream::auto_tune_block_size(&cfg).block_size,
        crate::store::FILE_STORE_MIN_BLOCK_SIZE
    );
    cfg.max_bytes = i64::MAX;
    assert_eq!(
        Stream::auto_tune_block_size(&cfg).block_size,
        crate::store::FILE_STORE_MAX_BLOCK_SIZE
    );
}

#[test]
fn test_stream_info_surfaces_state() {
    let h = harness();
    let stream = h.add_stream(|_| {});
    h.publish("orders.new", &Headers::new(), "m1");

    let info = stream.info();
    assert_eq!(info.config.name, "orders");
    assert_eq!(info.state.msgs, 1);
    assert!(info.mirror.is_none());
    assert!(info.sources.is_empty());
}
