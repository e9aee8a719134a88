//! Subject router contract and an in-process broker.
//!
//! The stream core installs subject handlers through [`Broker`] and pushes
//! outbound protocol traffic back through it from the send pump. Production
//! deployments bridge this trait onto the wire transport; the bundled
//! [`InProcessBroker`] routes within the process and backs the test suite.

use crate::headers::Headers;
use crate::subject;
use crate::Result;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Subscription handler, invoked with `(subject, reply, headers, msg)`.
pub type MsgHandler = Arc<dyn Fn(&str, &str, &Headers, &Bytes) + Send + Sync>;

/// Subject routing surface the stream core depends on.
pub trait Broker: Send + Sync {
    /// Installs a handler for a subject pattern and returns its sid.
    fn subscribe(&self, pattern: &str, handler: MsgHandler) -> Result<u64>;

    fn unsubscribe(&self, sid: u64);

    /// Routes a message. When `deliver_subject` is non-empty the handlers
    /// see it instead of the routed subject. Returns true if at least one
    /// subscription matched.
    fn publish(
        &self,
        subject: &str,
        deliver_subject: &str,
        reply: &str,
        hdr: &Headers,
        msg: &Bytes,
    ) -> bool;
}

struct Subscription {
    pattern: String,
    handler: MsgHandler,
}

/// Wildcard-aware in-process router.
#[derive(Default)]
pub struct InProcessBroker {
    subs: RwLock<HashMap<u64, Subscription>>,
    next_sid: AtomicU64,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_subscriptions(&self) -> usize {
        self.subs.read().len()
    }
}

impl Broker for InProcessBroker {
    fn subscribe(&self, pattern: &str, handler: MsgHandler) -> Result<u64> {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed) + 1;
        self.subs.write().insert(
            sid,
            Subscription {
                pattern: pattern.to_string(),
                handler,
            },
        );
        Ok(sid)
    }

    fn unsubscribe(&self, sid: u64) {
        self.subs.write().remove(&sid);
    }

    fn publish(
        &self,
        subject: &str,
        deliver_subject: &str,
        reply: &str,
        hdr: &Headers,
        msg: &Bytes,
    ) -> bool {
        // Snapshot matching handlers so delivery runs without the lock;
        // handlers are free to re-enter the broker.
        let handlers: Vec<MsgHandler> = {
            let subs = self.subs.read();
            subs.values()
                .filter(|s| subject::matches(subject, &s.pattern))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        if handlers.is_empty() {
            return false;
        }
        let seen = if deliver_subject.is_empty() {
            subject
        } else {
            deliver_subject
        };
        for handler in handlers {
            handler(seen, reply, hdr, msg);
        }
        true
    }
}
