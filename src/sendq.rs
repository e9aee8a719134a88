//! Bounded outbound queue and its pump worker.
//!
//! Every internal protocol message a stream produces (publish acks,
//! consumer-create RPCs, upstream acks, advisories) goes through one bounded
//! FIFO drained by a dedicated thread. A full queue blocks the producer;
//! that back-pressure is the stream's only flow-control primitive.

use crate::broker::Broker;
use crate::consumer::Consumer;
use crate::headers::Headers;
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Send queue capacity.
pub const SEND_QUEUE_CAPACITY: usize = 4096;

const WARN_THRESHOLD: usize = 3 * SEND_QUEUE_CAPACITY / 4;
const WARN_FREQUENCY: Duration = Duration::from_secs(1);

/// An outbound internal protocol message.
pub struct OutboundMessage {
    pub subject: String,
    pub deliver_subject: String,
    pub reply: String,
    pub headers: Headers,
    pub msg: Bytes,
    /// Set for consumer deliveries; failed deliveries feed back through
    /// [`Consumer::did_not_deliver`].
    pub consumer: Option<Arc<dyn Consumer>>,
    pub seq: u64,
}

impl OutboundMessage {
    pub fn new(subject: impl Into<String>, reply: impl Into<String>, msg: Bytes) -> Self {
        Self {
            subject: subject.into(),
            deliver_subject: String::new(),
            reply: reply.into(),
            headers: Headers::new(),
            msg,
            consumer: None,
            seq: 0,
        }
    }
}

/// Producer half of the queue. The pump thread exits on the `None` sentinel
/// or when the quit channel closes, whichever comes first.
pub struct SendQueue {
    tx: Sender<Option<OutboundMessage>>,
}

impl SendQueue {
    pub fn start(broker: Arc<dyn Broker>, stream_name: &str, quit: Receiver<()>) -> Self {
        let (tx, rx) = channel::bounded(SEND_QUEUE_CAPACITY);
        let name = stream_name.to_string();
        if let Err(err) = thread::Builder::new()
            .name(format!("rivermq-pump-{name}"))
            .spawn(move || pump_loop(broker, name, rx, quit))
        {
            error!(%err, "failed to spawn send pump");
        }
        Self { tx }
    }

    /// Enqueues a message, blocking while the queue is full.
    pub fn send(&self, pm: OutboundMessage) {
        let _ = self.tx.send(Some(pm));
    }

    /// Enqueues the termination sentinel. The pump drains everything queued
    /// ahead of it, then exits.
    pub fn shutdown(&self) {
        let _ = self.tx.send(None);
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

fn pump_loop(
    broker: Arc<dyn Broker>,
    stream_name: String,
    rx: Receiver<Option<OutboundMessage>>,
    quit: Receiver<()>,
) {
    let mut last_warn = Instant::now() - WARN_FREQUENCY;

    loop {
        if rx.len() > WARN_THRESHOLD && last_warn.elapsed() >= WARN_FREQUENCY {
            warn!(
                stream = %stream_name,
                depth = rx.len(),
                "internal send queue over 75% capacity"
            );
            last_warn = Instant::now();
        }

        crossbeam::select! {
            recv(rx) -> pm => match pm {
                Ok(Some(pm)) => {
                    let did_deliver = broker.publish(
                        &pm.subject,
                        &pm.deliver_subject,
                        &pm.reply,
                        &pm.headers,
                        &pm.msg,
                    );
                    if let Some(consumer) = &pm.consumer {
                        if pm.seq > 0 && !did_deliver {
                            consumer.did_not_deliver(pm.seq);
                        }
                    }
                }
                Ok(None) | Err(_) => return,
            },
            recv(quit) -> _ => return,
        }
    }
}
