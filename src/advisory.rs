//! Lifecycle advisories.
//!
//! Streams publish a typed JSON event whenever they are created, updated,
//! or deleted, unless the change came in through a clustered assignment
//! that already answered the caller, or while a snapshot restore is
//! rebuilding state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const STREAM_ACTION_ADVISORY_TYPE: &str = "io.rivermq.advisory.v1.stream_action";

const ADVISORY_PREFIX: &str = "$JS.EVENT.ADVISORY.STREAM";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamAction {
    Create,
    Modify,
    Delete,
}

/// Advisory payload for stream lifecycle changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamActionAdvisory {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub time: DateTime<Utc>,
    pub stream: String,
    pub action: StreamAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl StreamActionAdvisory {
    pub fn new(stream: &str, action: StreamAction, template: Option<String>) -> Self {
        Self {
            kind: STREAM_ACTION_ADVISORY_TYPE.to_string(),
            id: Uuid::new_v4().simple().to_string(),
            time: Utc::now(),
            stream: stream.to_string(),
            action,
            template,
        }
    }

    /// Subject this advisory publishes on.
    pub fn subject(&self) -> String {
        let action = match self.action {
            StreamAction::Create => "CREATED",
            StreamAction::Modify => "UPDATED",
            StreamAction::Delete => "DELETED",
        };
        format!("{ADVISORY_PREFIX}.{action}.{}", self.stream)
    }
}
