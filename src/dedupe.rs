//! Duplicate-suppression window.
//!
//! Message ids are remembered for the configured window in two structures
//! kept in lockstep: a map for O(1) lookups and an insertion-ordered vector
//! walked by the purge pass. The vector is never trimmed at the front;
//! instead a moving head index advances over expired entries and the whole
//! vector is compacted once the dead prefix dominates.
//!
//! The purge timer is a plain thread parked on a control channel, so it can
//! be reset or cancelled while the stream lock is held without any risk of
//! re-entry.

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;
use tracing::error;

/// Floor for timer rescheduling so a dense window cannot spin the purge
/// thread.
pub const MIN_PURGE_INTERVAL: Duration = Duration::from_millis(50);

/// One remembered message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupEntry {
    pub id: String,
    pub seq: u64,
    /// Unix nanoseconds at insert.
    pub ts: i64,
}

/// Sliding window of recently seen message ids.
#[derive(Default)]
pub struct DedupWindow {
    map: HashMap<String, DedupEntry>,
    arr: Vec<DedupEntry>,
    index: usize,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an id. Empty ids never match.
    pub fn check(&self, id: &str) -> Option<&DedupEntry> {
        if id.is_empty() {
            return None;
        }
        self.map.get(id)
    }

    /// Remembers an entry. Returns true if the window was empty before, in
    /// which case the caller must arm the purge timer.
    pub fn store(&mut self, entry: DedupEntry) -> bool {
        let was_empty = self.map.is_empty();
        self.map.insert(entry.id.clone(), entry.clone());
        self.arr.push(entry);
        was_empty
    }

    /// Expires entries older than `window` as of `now`. Returns the delay
    /// until the next purge, or `None` once the window is empty and the
    /// timer should be dropped.
    pub fn purge(&mut self, now: i64, window: Duration) -> Option<Duration> {
        let window_ns = window.as_nanos() as i64;
        let mut next = window;

        while self.index < self.arr.len() {
            let entry = &self.arr[self.index];
            let age = now - entry.ts;
            if age >= window_ns {
                self.map.remove(&entry.id);
                self.index += 1;
                continue;
            }
            next = Duration::from_nanos((window_ns - age).max(0) as u64);
            break;
        }

        if self.map.is_empty() {
            self.arr.clear();
            self.index = 0;
            return None;
        }

        // Compact once the dead prefix is two thirds of the vector.
        if self.arr.capacity() > 3 * (self.arr.len() - self.index) {
            self.arr = self.arr.split_off(self.index);
            self.index = 0;
        }

        Some(next.max(MIN_PURGE_INTERVAL))
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.arr.clear();
        self.index = 0;
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Capacity of the backing vector, exposed for tests.
    pub fn arr_capacity(&self) -> usize {
        self.arr.capacity()
    }

    pub fn arr_len(&self) -> usize {
        self.arr.len()
    }
}

enum TimerCmd {
    Reset(Duration),
    Stop,
}

/// Self-rescheduling single-shot timer backing the dedup purge.
///
/// `on_fire` runs on the timer thread and returns the next delay, or `None`
/// to let the timer die. Dropping the handle also stops the thread.
pub struct PurgeTimer {
    tx: Sender<TimerCmd>,
}

impl PurgeTimer {
    pub fn spawn<F>(delay: Duration, mut on_fire: F) -> Self
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let (tx, rx) = channel::unbounded();
        if let Err(err) = thread::Builder::new()
            .name("rivermq-dedup-timer".to_string())
            .spawn(move || {
                let mut wait = delay;
                loop {
                    match rx.recv_timeout(wait) {
                        Ok(TimerCmd::Reset(d)) => wait = d,
                        Ok(TimerCmd::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                        Err(RecvTimeoutError::Timeout) => match on_fire() {
                            Some(next) => wait = next,
                            None => return,
                        },
                    }
                }
            })
        {
            error!(%err, "failed to spawn dedup purge timer");
        }
        Self { tx }
    }

    pub fn reset(&self, delay: Duration) {
        let _ = self.tx.send(TimerCmd::Reset(delay));
    }

    pub fn stop(&self) {
        let _ = self.tx.send(TimerCmd::Stop);
    }
}
