//! Message headers and the well-known header names the ingest pipeline
//! consumes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Message id used for duplicate suppression.
pub const MSG_ID_HDR: &str = "Nats-Msg-Id";
/// Optimistic-concurrency guard against the stream name.
pub const EXPECTED_STREAM_HDR: &str = "Nats-Expected-Stream";
/// Optimistic-concurrency guard against the last assigned sequence.
pub const EXPECTED_LAST_SEQ_HDR: &str = "Nats-Expected-Last-Sequence";
/// Optimistic-concurrency guard against the last message id.
pub const EXPECTED_LAST_MSG_ID_HDR: &str = "Nats-Expected-Last-Msg-Id";
/// Origin metadata stamped by the source subsystem before re-ingest.
pub const STREAM_SOURCE_HDR: &str = "Nats-Stream-Source";
/// Request routing info attached when a message crossed account boundaries.
/// Stripped on ingest.
pub const CLIENT_INFO_HDR: &str = "Nats-Request-Info";

/// An ordered string map of message headers.
///
/// The map is kept sorted so that serialized forms and size accounting are
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|v| v.as_str())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Wire size estimate used for max message size checks. Each header
    /// contributes `name: value\r\n`.
    pub fn encoded_len(&self) -> usize {
        self.0.iter().map(|(k, v)| k.len() + v.len() + 4).sum()
    }

    /// Message id, if present and non-empty.
    pub fn msg_id(&self) -> Option<&str> {
        self.get(MSG_ID_HDR).filter(|v| !v.is_empty())
    }

    pub fn expected_stream(&self) -> Option<&str> {
        self.get(EXPECTED_STREAM_HDR).filter(|v| !v.is_empty())
    }

    /// Expected last sequence, when present and parseable as a positive
    /// integer. A zero or malformed value is treated as absent.
    pub fn expected_last_seq(&self) -> Option<u64> {
        self.get(EXPECTED_LAST_SEQ_HDR)
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
    }

    pub fn expected_last_msg_id(&self) -> Option<&str> {
        self.get(EXPECTED_LAST_MSG_ID_HDR).filter(|v| !v.is_empty())
    }

    pub fn stream_source(&self) -> Option<&str> {
        self.get(STREAM_SOURCE_HDR).filter(|v| !v.is_empty())
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_id_lookup() {
        let mut hdr = Headers::new();
        assert!(hdr.msg_id().is_none());
        hdr.insert(MSG_ID_HDR, "abc");
        assert_eq!(hdr.msg_id(), Some("abc"));
        hdr.insert(MSG_ID_HDR, "");
        assert!(hdr.msg_id().is_none());
    }

    #[test]
    fn test_expected_last_seq_parsing() {
        let mut hdr = Headers::new();
        hdr.insert(EXPECTED_LAST_SEQ_HDR, "42");
        assert_eq!(hdr.expected_last_seq(), Some(42));
        hdr.insert(EXPECTED_LAST_SEQ_HDR, "0");
        assert_eq!(hdr.expected_last_seq(), None);
        hdr.insert(EXPECTED_LAST_SEQ_HDR, "nope");
        assert_eq!(hdr.expected_last_seq(), None);
    }

    #[test]
    fn test_encoded_len() {
        let mut hdr = Headers::new();
        hdr.insert("A", "b");
        hdr.insert("Cd", "ef");
        assert_eq!(hdr.encoded_len(), (1 + 1 + 4) + (2 + 2 + 4));
    }
}
