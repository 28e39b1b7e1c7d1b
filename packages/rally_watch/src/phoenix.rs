//! Phoenix channel frames as spoken by the realtime service.
//!
//! Every frame is a JSON object `{topic, event, payload, ref, join_ref}`.
//! A coordinator topic key maps onto one wire channel `realtime:<key>`; the
//! join payload asks for row changes on the table (and filter) the key names.

use chrono::{DateTime, Utc};
use rally_realtime::{ChangeEvent, ChangeKind, Topic};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const PHOENIX_TOPIC: &str = "phoenix";
pub const WIRE_PREFIX: &str = "realtime:";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";
pub const EVENT_BROADCAST: &str = "broadcast";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl Frame {
    pub fn join(topic: &Topic, reference: &str, access_token: Option<&str>) -> Self {
        let spec = ChannelSpec::parse(topic);
        let mut payload = json!({
            "config": {
                "broadcast": { "self": false, "ack": false },
                "presence": { "key": "" },
                "postgres_changes": spec.postgres_changes(),
            }
        });
        if let Some(token) = access_token {
            payload["access_token"] = Value::String(token.to_string());
        }
        Self {
            topic: wire_topic(topic),
            event: EVENT_JOIN.to_string(),
            payload,
            reference: Some(reference.to_string()),
            join_ref: Some(reference.to_string()),
        }
    }

    pub fn leave(wire: &str, reference: &str, join_ref: &str) -> Self {
        Self {
            topic: wire.to_string(),
            event: EVENT_LEAVE.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    pub fn heartbeat(reference: &str) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    /// `Ok(())` for an `ok` reply, the server's reason otherwise.
    pub fn reply_status(&self) -> Result<(), String> {
        match self.payload.get("status").and_then(Value::as_str) {
            Some("ok") => Ok(()),
            Some(status) => {
                let reason = self
                    .payload
                    .pointer("/response/reason")
                    .and_then(Value::as_str)
                    .unwrap_or(status);
                Err(reason.to_string())
            }
            None => Err("reply without status".to_string()),
        }
    }
}

pub fn wire_topic(topic: &Topic) -> String {
    format!("{WIRE_PREFIX}{topic}")
}

/// What a topic key asks the server for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSpec {
    pub schema: String,
    pub table: String,
    pub filters: Vec<(String, String)>,
    /// Keys like `room:7` carry no column filter and name a broadcast room
    pub broadcast_only: bool,
}

impl ChannelSpec {
    pub fn parse(topic: &Topic) -> Self {
        let (head, tail) = match topic.as_str().split_once(':') {
            Some((head, tail)) => (head, Some(tail)),
            None => (topic.as_str(), None),
        };
        let (schema, table) = match head.split_once('.') {
            Some((schema, table)) => (schema.to_string(), table.to_string()),
            None => ("public".to_string(), head.to_string()),
        };

        let mut filters = Vec::new();
        let mut broadcast_only = false;
        if let Some(tail) = tail {
            for part in tail.split(',') {
                match part.split_once('=') {
                    Some((column, value)) => filters.push((column.to_string(), value.to_string())),
                    None => broadcast_only = true,
                }
            }
        }

        Self {
            schema,
            table,
            filters,
            broadcast_only,
        }
    }

    /// The server evaluates one equality filter; the rest are checked on
    /// arrival by [`ChannelSpec::matches`].
    fn postgres_changes(&self) -> Value {
        if self.broadcast_only {
            return json!([]);
        }
        let mut change = json!({
            "event": "*",
            "schema": self.schema,
            "table": self.table,
        });
        if let Some((column, value)) = self.filters.first() {
            change["filter"] = Value::String(format!("{column}=eq.{value}"));
        }
        json!([change])
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.filters.iter().all(|(column, expected)| match record.get(column) {
            Some(Value::String(s)) => s == expected,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == *expected,
        })
    }
}

/// Translate an inbound frame into a [`ChangeEvent`] for `topic`.
///
/// Returns `None` for frames that carry no change (replies, presence) and
/// for row changes that fail a client-side filter.
pub fn parse_change(topic: &Topic, spec: &ChannelSpec, frame: &Frame) -> Option<ChangeEvent> {
    match frame.event.as_str() {
        EVENT_POSTGRES_CHANGES => {
            let data = frame.payload.get("data")?;
            let kind = match data.get("type").and_then(Value::as_str)? {
                "INSERT" => ChangeKind::Insert,
                "UPDATE" => ChangeKind::Update,
                "DELETE" => ChangeKind::Delete,
                _ => return None,
            };
            let record = data.get("record").cloned().unwrap_or(Value::Null);
            let old_record = data.get("old_record").cloned().unwrap_or(Value::Null);
            let filtered = if kind == ChangeKind::Delete {
                &old_record
            } else {
                &record
            };
            if !spec.matches(filtered) {
                return None;
            }

            let mut event = ChangeEvent::new(topic.clone(), kind, record).with_old_record(old_record);
            if let Some(ts) = data
                .get("commit_timestamp")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            {
                event.commit_timestamp = ts;
            }
            Some(event)
        }
        EVENT_BROADCAST => Some(ChangeEvent::new(
            topic.clone(),
            ChangeKind::Broadcast,
            frame.payload.clone(),
        )),
        _ => None,
    }
}
