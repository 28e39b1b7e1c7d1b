use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::topic::Topic;

/// Kind of change carried by a [`ChangeEvent`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Ephemeral message not backed by a row change
    Broadcast,
}

/// A data-change event delivered to every listener on a topic
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub topic: Topic,
    pub kind: ChangeKind,
    #[serde(default)]
    pub record: serde_json::Value,
    #[serde(default)]
    pub old_record: serde_json::Value,
    pub commit_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(topic: Topic, kind: ChangeKind, record: serde_json::Value) -> Self {
        Self {
            topic,
            kind,
            record,
            old_record: serde_json::Value::Null,
            commit_timestamp: Utc::now(),
        }
    }

    pub fn with_old_record(mut self, old_record: serde_json::Value) -> Self {
        self.old_record = old_record;
        self
    }
}
