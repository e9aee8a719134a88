use bytes::Bytes;
use parking_lot::Mutex;
use rivermq::account::{Account, AccountConfig};
use rivermq::broker::{Broker, InProcessBroker};
use rivermq::config::{StorageType, StreamConfig, StreamSource};
use rivermq::consumer::{Consumer, ConsumerFactory, ConsumerSnapshot};
use rivermq::headers::{Headers, MSG_ID_HDR, STREAM_SOURCE_HDR};
use rivermq::store::StoredMsg;
use rivermq::stream::{make_ack_reply, Stream};
use rivermq::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
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
    fn publish(&self, subject: &str, hdr: &Headers, body: &str) -> serde_json::Value {
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.broker
            .subscribe(
                &inbox,
                Arc::new(move |_s, _r, _h, msg| {
                    let _ = tx.try_send(msg.clone());
                }),
            )
            .unwrap();
        self.broker
            .publish(subject, "", &inbox, hdr, &Bytes::from(body.to_string()));
        let buf = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("no publish ack");
        serde_json::from_slice(&buf).expect("bad ack json")
    }

    /// Emulates an upstream consumer API: answers durable-create requests
    /// with an empty (success) response and reports them on a channel.
    fn upstream_api(
        &self,
        upstream: &str,
    ) -> crossbeam::channel::Receiver<serde_json::Value> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let broker = self.broker.clone();
        self.broker
            .subscribe(
                &format!("$JS.API.CONSUMER.DURABLE.CREATE.{upstream}.*"),
                Arc::new(move |_subject, reply, _hdr, msg| {
                    let req: serde_json::Value = serde_json::from_slice(msg).unwrap();
                    if !reply.is_empty() {
                        broker.publish(reply, "", "", &Headers::new(), &Bytes::from_static(b"{}"));
                    }
                    let _ = tx.send(req);
                }),
            )
            .unwrap();
        rx
    }
}

// S1: two publishes with the same message id inside the window yield the
// same sequence and a single stored copy.
#[test]
fn test_dedup_scenario() {
    let h = harness();
    let stream = h
        .account
        .add_stream(StreamConfig {
            name: "S".to_string(),
            subjects: vec!["s.>".to_string()],
            storage: StorageType::Memory,
            dedup_window: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();

    let mut hdr = Headers::new();
    hdr.insert(MSG_ID_HDR, "A");
    let ack = h.publish("s.1", &hdr, "payload");
    assert_eq!(ack["seq"], 1);
    std::thread::sleep(Duration::from_millis(100));
    let ack = h.publish("s.1", &hdr, "payload");
    assert_eq!(ack["seq"], 1);
    assert_eq!(ack["duplicate"], true);

    assert_eq!(stream.state().msgs, 1);
}

// S5: a mirror preserves upstream sequence numbers and catches up to
// lag 0.
#[test]
fn test_mirror_preserves_upstream_sequences() {
    let h = harness();

    let up = h
        .account
        .add_stream(StreamConfig {
            name: "UP".to_string(),
            subjects: vec!["up.>".to_string()],
            storage: StorageType::Memory,
            ..Default::default()
        })
        .unwrap();
    for i in 1..=3 {
        let ack = h.publish("up.x", &Headers::new(), &format!("m{i}"));
        assert_eq!(ack["seq"], i);
    }
    let upstream_msgs: Vec<StoredMsg> = (1..=3).map(|seq| up.get_msg(seq).unwrap()).collect();

    // Answer the durable-create and stream the upstream messages to the
    // mirror's delivery subject, most recent pending counts included.
    let broker = h.broker.clone();
    let msgs = Arc::new(upstream_msgs.clone());
    h.broker
        .subscribe(
            "$JS.API.CONSUMER.DURABLE.CREATE.UP.*",
            Arc::new(move |_subject, reply, _hdr, req| {
                let req: serde_json::Value = serde_json::from_slice(req).unwrap();
                let deliver = req["config"]["deliver_subject"].as_str().unwrap().to_string();
                if !reply.is_empty() {
                    broker.publish(reply, "", "", &Headers::new(), &Bytes::from_static(b"{}"));
                }
                for (i, m) in msgs.iter().enumerate() {
                    let pending = (msgs.len() - 1 - i) as u64;
                    let ack = make_ack_reply("UP", "d1", 1, m.seq, (i + 1) as u64, m.ts, pending);
                    broker.publish(&deliver, "", &ack, &m.headers, &m.data);
                }
            }),
        )
        .unwrap();

    let mirror = h
        .account
        .add_stream(StreamConfig {
            name: "MIRROR".to_string(),
            storage: StorageType::Memory,
            mirror: Some(StreamSource {
                name: "UP".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        mirror.state().last_seq == 3 && mirror.state().msgs == 3
    }));

    for m in &upstream_msgs {
        let copy = mirror.get_msg(m.seq).unwrap();
        assert_eq!(copy.seq, m.seq);
        assert_eq!(copy.subject, m.subject);
        assert_eq!(copy.data, m.data);
        assert_eq!(copy.ts, m.ts);
    }
    let info = mirror.mirror_info().expect("mirror info");
    assert_eq!(info.name, "UP");
    assert_eq!(info.lag, 0);
}

// S6: a delivery gap recreates the upstream source consumer at the last
// good position and nothing out of order is committed.
#[test]
fn test_source_gap_recovery() {
    let h = harness();
    let requests = h.upstream_api("UPS");

    let agg = h
        .account
        .add_stream(StreamConfig {
            name: "AGG".to_string(),
            subjects: vec!["agg.>".to_string()],
            storage: StorageType::Memory,
            sources: vec![StreamSource {
                name: "UPS".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        })
        .unwrap();

    let first = requests
        .recv_timeout(Duration::from_secs(2))
        .expect("no source consumer request");
    let deliver = first["config"]["deliver_subject"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(first["config"].get("opt_start_seq").is_none());

    let send = |dseq: u64, sseq: u64, body: &str| {
        let ack = make_ack_reply("UPS", "d1", 1, sseq, dseq, 1_000 + sseq as i64, 0);
        h.broker
            .publish(&deliver, "", &ack, &Headers::new(), &Bytes::from(body.to_string()));
    };

    send(1, 10, "m10");
    send(2, 11, "m11");
    assert!(wait_until(Duration::from_secs(1), || agg.state().msgs == 2));

    // Origin coordinates are stamped for later position recovery.
    let stored = agg.get_msg(1).unwrap();
    let origin = stored.headers.get(STREAM_SOURCE_HDR).expect("origin header");
    assert!(origin.starts_with("$JS.ACK.UPS."));

    // Skip dseq 3: the consumer is torn down and recreated at sseq 12.
    send(4, 13, "m13");
    let second = requests
        .recv_timeout(Duration::from_secs(2))
        .expect("no reinstall request");
    assert_eq!(second["config"]["deliver_policy"], "by_start_sequence");
    assert_eq!(second["config"]["opt_start_seq"], 12);

    // The out-of-order message was not committed.
    assert_eq!(agg.state().msgs, 2);
    assert_eq!(agg.state().last_seq, 2);

    // Redelivery in order on the new consumer resumes ingestion.
    let deliver2 = second["config"]["deliver_subject"]
        .as_str()
        .unwrap()
        .to_string();
    let ack = make_ack_reply("UPS", "d1", 1, 12, 1, 1_012, 0);
    h.broker
        .publish(&deliver2, "", &ack, &Headers::new(), &Bytes::from("m12"));
    assert!(wait_until(Duration::from_secs(1), || agg.state().msgs == 3));
}

// S7: purge empties the store, notifies consumers of the new first
// sequence, and clears the duplicate window.
#[test]
fn test_purge_scenario() {
    let h = harness();
    let stream = h
        .account
        .add_stream(StreamConfig {
            name: "P".to_string(),
            subjects: vec!["p.>".to_string()],
            storage: StorageType::Memory,
            ..Default::default()
        })
        .unwrap();
    let consumer = TrackingConsumer::new("c1");
    stream.add_consumer(consumer.clone()).unwrap();

    for i in 0..100 {
        let mut hdr = Headers::new();
        hdr.insert(MSG_ID_HDR, format!("id{i}"));
        h.publish("p.x", &hdr, "m");
    }
    assert_eq!(stream.state().msgs, 100);

    assert_eq!(stream.purge().unwrap(), 100);
    assert_eq!(stream.state().msgs, 0);
    assert_eq!(stream.num_msg_ids(), 0);
    assert_eq!(*consumer.purged.lock(), Some(101));
}

struct TrackingConsumer {
    name: String,
    delivered: Mutex<Vec<u64>>,
    purged: Mutex<Option<u64>>,
}

impl TrackingConsumer {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            delivered: Mutex::new(Vec::new()),
            purged: Mutex::new(None),
        })
    }
}

impl Consumer for TrackingConsumer {
    fn name(&self) -> String {
        self.name.clone()
    }
    fn inc_stream_pending(&self, _seq: u64, _subject: &str) {}
    fn dec_stream_pending(&self, _seq: u64, _subject: &str) {}
    fn deliver_current_msg(
        &self,
        _subject: &str,
        _hdr: &Headers,
        _msg: &Bytes,
        seq: u64,
        _ts: i64,
    ) -> bool {
        self.delivered.lock().push(seq);
        true
    }
    fn signal_new_messages(&self) {}
    fn did_not_deliver(&self, _seq: u64) {}
    fn purge(&self, first_seq: u64) {
        *self.purged.lock() = Some(first_seq);
    }
    fn stop(&self, _delete: bool, _advisory: bool) {}
    fn snapshot_meta(&self) -> Option<ConsumerSnapshot> {
        Some(ConsumerSnapshot {
            name: self.name.clone(),
            durable: true,
            created: chrono::Utc::now(),
            config: serde_json::json!({ "ack_policy": "explicit" }),
            state: serde_json::json!({ "delivered": self.delivered.lock().len() }),
        })
    }
}

struct TrackingFactory {
    restored: Mutex<Vec<String>>,
}

impl ConsumerFactory for TrackingFactory {
    fn restore(
        &self,
        _stream: &Arc<Stream>,
        snapshot: ConsumerSnapshot,
    ) -> Result<Arc<dyn Consumer>> {
        self.restored.lock().push(snapshot.name.clone());
        Ok(TrackingConsumer::new(&snapshot.name))
    }
}

// Property 7: snapshot then restore reproduces the stream config, every
// message, and the consumer set.
#[test]
fn test_snapshot_restore_roundtrip() {
    let h = harness();
    let cfg = StreamConfig {
        name: "ORD".to_string(),
        subjects: vec!["orders.>".to_string()],
        ..Default::default()
    };
    let stream = h.account.add_stream(cfg).unwrap();
    let consumer = TrackingConsumer::new("workers");
    stream.add_consumer(consumer).unwrap();

    let mut hdr = Headers::new();
    hdr.insert(MSG_ID_HDR, "order-1");
    hdr.insert("X-Tenant", "acme");
    h.publish("orders.new", &hdr, "first");
    h.publish("orders.new", &Headers::new(), "second");
    h.publish("orders.closed", &Headers::new(), "third");

    let original_cfg = stream.config();
    let original_created = stream.created();
    let originals: Vec<StoredMsg> = (1..=3).map(|seq| stream.get_msg(seq).unwrap()).collect();

    let snap = stream
        .snapshot(Duration::from_secs(5), true, true)
        .unwrap();
    assert_eq!(snap.state.msgs, 3);

    h.account.delete_stream("ORD").unwrap();
    assert!(h.account.lookup_stream("ORD").is_none());

    // No factory registered: consumers in the archive fail the restore.
    assert!(h
        .account
        .restore_stream("ORD", snap.data.as_slice())
        .is_err());

    let factory = Arc::new(TrackingFactory {
        restored: Mutex::new(Vec::new()),
    });
    h.account.set_consumer_factory(factory.clone());

    // A name mismatch is rejected outright.
    assert!(h
        .account
        .restore_stream("OTHER", snap.data.as_slice())
        .is_err());

    let restored = h
        .account
        .restore_stream("ORD", snap.data.as_slice())
        .unwrap();

    assert_eq!(restored.config(), original_cfg);
    assert_eq!(restored.created(), original_created);
    let state = restored.state();
    assert_eq!(state.msgs, 3);
    assert_eq!(state.last_seq, 3);
    for m in &originals {
        let copy = restored.get_msg(m.seq).unwrap();
        assert_eq!(&copy, m);
    }
    assert_eq!(factory.restored.lock().as_slice(), &["workers".to_string()]);
    assert!(restored.lookup_consumer("workers").is_some());

    // Restoring over a live stream is refused.
    assert!(h
        .account
        .restore_stream("ORD", snap.data.as_slice())
        .is_err());
}

// File-backed streams recover sequences and the duplicate window across a
// stop and re-open.
#[test]
fn test_file_stream_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StreamConfig {
        name: "FS".to_string(),
        subjects: vec!["fs.>".to_string()],
        dedup_window: Duration::from_secs(120),
        ..Default::default()
    };

    {
        let broker = Arc::new(InProcessBroker::new());
        let account = Account::new(
            AccountConfig::new("TEST", dir.path()),
            broker.clone() as Arc<dyn Broker>,
        );
        let h = Harness {
            broker,
            account,
            _dir: tempfile::tempdir().unwrap(),
        };
        let stream = h.account.add_stream(cfg.clone()).unwrap();
        let mut hdr = Headers::new();
        hdr.insert(MSG_ID_HDR, "only-once");
        assert_eq!(h.publish("fs.x", &hdr, "m1")["seq"], 1);
        assert_eq!(h.publish("fs.x", &Headers::new(), "m2")["seq"], 2);
        stream.stop(false, false).unwrap();
    }

    let broker = Arc::new(InProcessBroker::new());
    let account = Account::new(
        AccountConfig::new("TEST", dir.path()),
        broker.clone() as Arc<dyn Broker>,
    );
    let h = Harness {
        broker,
        account,
        _dir: tempfile::tempdir().unwrap(),
    };
    let stream = h.account.add_stream(cfg).unwrap();

    assert_eq!(stream.last_seq(), 2);
    assert_eq!(stream.get_msg(1).unwrap().data, Bytes::from("m1"));

    // The duplicate window was rebuilt from the log.
    let mut hdr = Headers::new();
    hdr.insert(MSG_ID_HDR, "only-once");
    let ack = h.publish("fs.x", &hdr, "again");
    assert_eq!(ack["seq"], 1);
    assert_eq!(ack["duplicate"], true);
    assert_eq!(stream.state().msgs, 2);
}
