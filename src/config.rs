//! Stream configuration schema, defaults, and admission rules.
//!
//! [`check_stream_config`] is applied once on create and update. It fills in
//! defaults, normalizes zero values, and rejects configurations the runtime
//! cannot honor. [`config_update_check`] additionally enforces which fields
//! may change on a live stream.

use crate::subject;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default duplicate-suppression window.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(2 * 60);

/// Replicas range.
pub const DEFAULT_REPLICAS: usize = 1;
pub const MAX_REPLICAS: usize = 5;

/// Retention policy for a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep messages until limits evict them.
    #[default]
    Limits,
    /// Keep messages only while at least one consumer still needs them.
    Interest,
    /// Each message is consumed by exactly one consumer, then removed.
    WorkQueue,
}

/// Policy applied when a stream limit is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    /// Evict the oldest message to make room.
    #[default]
    Old,
    /// Reject the new message.
    New,
}

/// Backing storage for a stream. Immutable after create.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// Upstream origin for a mirror or a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSource {
    pub name: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub opt_start_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_neg_one(v: &i64) -> bool {
    *v == -1
}

/// Stream configuration.
///
/// Limit fields use `-1` for unbounded; a `0` is coerced to the default or
/// to `-1` by [`check_stream_config`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub discard: DiscardPolicy,
    #[serde(default)]
    pub max_consumers: i64,
    #[serde(default)]
    pub max_msgs: i64,
    #[serde(default)]
    pub max_bytes: i64,
    #[serde(default, skip_serializing_if = "is_neg_one")]
    pub max_msg_size: i64,
    /// Maximum message age. `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<Duration>,
    #[serde(default)]
    pub storage: StorageType,
    #[serde(default)]
    pub replicas: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_ack: bool,
    /// Duplicate-suppression window. A zero duration selects the default.
    #[serde(default)]
    pub dedup_window: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<StreamSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<StreamSource>,
}

/// Validates and normalizes a stream configuration.
pub fn check_stream_config(config: &StreamConfig) -> Result<StreamConfig> {
    if !subject::is_valid_name(&config.name) {
        return Err(Error::Config(
            "stream name is required and can not contain '.', '*', '>'".to_string(),
        ));
    }

    let mut cfg = config.clone();

    if cfg.replicas == 0 {
        cfg.replicas = DEFAULT_REPLICAS;
    }
    if cfg.replicas > MAX_REPLICAS {
        return Err(Error::Config(format!(
            "maximum replicas is {MAX_REPLICAS}"
        )));
    }
    if cfg.max_msgs == 0 {
        cfg.max_msgs = -1;
    }
    if cfg.max_bytes == 0 {
        cfg.max_bytes = -1;
    }
    if cfg.max_msg_size == 0 {
        cfg.max_msg_size = -1;
    }
    if cfg.max_consumers == 0 {
        cfg.max_consumers = -1;
    }

    if cfg.dedup_window.is_zero() {
        cfg.dedup_window = match cfg.max_age {
            Some(age) if age < DEFAULT_DEDUP_WINDOW => age,
            _ => DEFAULT_DEDUP_WINDOW,
        };
    }
    if let Some(age) = cfg.max_age {
        if cfg.dedup_window > age {
            return Err(Error::Config(
                "duplicates window can not be larger then max age".to_string(),
            ));
        }
    }

    if let Some(mirror) = &cfg.mirror {
        if !cfg.subjects.is_empty() {
            return Err(Error::Config(
                "stream mirrors can not also contain subjects".to_string(),
            ));
        }
        if !cfg.sources.is_empty() {
            return Err(Error::Config(
                "stream mirrors can not also contain other sources".to_string(),
            ));
        }
        if mirror.filter_subject.is_some() {
            return Err(Error::Config(
                "stream mirrors can not contain filtered subjects".to_string(),
            ));
        }
        if mirror.opt_start_seq > 0 && mirror.opt_start_time.is_some() {
            return Err(Error::Config(
                "stream mirrors can not have both start seq and start time configured".to_string(),
            ));
        }
    }

    if cfg.subjects.is_empty() {
        if cfg.mirror.is_none() && cfg.sources.is_empty() {
            cfg.subjects.push(cfg.name.clone());
        }
    } else {
        // Overlap among our own subjects is allowed, exact duplicates are not.
        let mut seen = std::collections::HashSet::with_capacity(cfg.subjects.len());
        for subj in &cfg.subjects {
            if !subject::is_valid_subject(subj) {
                return Err(Error::Config(format!("invalid subject {subj:?}")));
            }
            if !seen.insert(subj.as_str()) {
                return Err(Error::Config("duplicate subjects detected".to_string()));
            }
            if subject::subject_is_subset_match(subj, "$JS.API.>") {
                return Err(Error::Config(
                    "subjects overlap with jetstream api".to_string(),
                ));
            }
        }
    }

    Ok(cfg)
}

/// Validates an update against the current configuration. Returns the
/// normalized new configuration on success.
pub fn config_update_check(old: &StreamConfig, new: &StreamConfig) -> Result<StreamConfig> {
    let cfg = check_stream_config(new)?;

    if cfg.name != old.name {
        return Err(Error::Config(
            "stream configuration name must match original".to_string(),
        ));
    }
    if cfg.max_consumers != old.max_consumers {
        return Err(Error::Config(
            "stream configuration update can not change max consumers".to_string(),
        ));
    }
    if cfg.storage != old.storage {
        return Err(Error::Config(
            "stream configuration update can not change storage type".to_string(),
        ));
    }
    if cfg.retention != old.retention {
        return Err(Error::Config(
            "stream configuration update can not change retention policy".to_string(),
        ));
    }
    if old.template_owner.is_some() {
        return Err(Error::Config(
            "stream configuration update not allowed on template owned stream".to_string(),
        ));
    }
    if cfg.template_owner.is_some() {
        return Err(Error::Config(
            "stream configuration update can not be owned by a template".to_string(),
        ));
    }
    if cfg.replicas != old.replicas {
        return Err(Error::Config(
            "stream configuration update can not change replicas".to_string(),
        ));
    }

    Ok(cfg)
}
