//! Topic keys.
//!
//! A topic names "what changes to watch for". Keys are canonical: the same
//! logical request always yields the same key, so consumers asking for the
//! same data share a single transport channel.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TopicError;

const RESERVED: [char; 3] = [':', '=', ','];

/// Opaque, cheaply cloneable topic key.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(Arc<str>);

impl Topic {
    /// Wrap an already-conventional key such as `"messages:42"`.
    pub fn new(key: impl AsRef<str>) -> Result<Self, TopicError> {
        let key = key.as_ref().trim();
        if key.is_empty() {
            return Err(TopicError::Empty);
        }
        Ok(Self(Arc::from(key)))
    }

    /// Start building a key for changes on `table`.
    pub fn builder(table: impl Into<String>) -> TopicBuilder {
        TopicBuilder {
            schema: None,
            table: table.into(),
            filters: BTreeMap::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Builds a canonical [`Topic`] from subscription parameters.
///
/// Filters are keyed by column and rendered in column order, so the order in
/// which callers add them does not matter. Adding the same column twice keeps
/// the last value.
#[derive(Clone, Debug)]
pub struct TopicBuilder {
    schema: Option<String>,
    table: String,
    filters: BTreeMap<String, String>,
}

impl TopicBuilder {
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn filter(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filters.insert(column.into(), value.to_string());
        self
    }

    pub fn build(self) -> Result<Topic, TopicError> {
        let table = self.table.trim();
        if table.is_empty() {
            return Err(TopicError::Empty);
        }
        check_segment(table)?;

        let mut key = match self.schema.as_deref().map(str::trim) {
            // "public" is the backend's default schema; omit it so both
            // spellings share a channel.
            Some(schema) if !schema.is_empty() && schema != "public" => {
                check_segment(schema)?;
                format!("{schema}.{table}")
            }
            _ => table.to_string(),
        };

        if !self.filters.is_empty() {
            let rendered: Result<Vec<String>, TopicError> = self
                .filters
                .iter()
                .map(|(column, value)| {
                    check_segment(column)?;
                    if value.contains(',') {
                        return Err(TopicError::ReservedCharacter(value.clone()));
                    }
                    Ok(format!("{column}={value}"))
                })
                .collect();
            key.push(':');
            key.push_str(&rendered?.join(","));
        }

        Topic::new(key)
    }
}

fn check_segment(segment: &str) -> Result<(), TopicError> {
    if segment.contains(RESERVED) {
        return Err(TopicError::ReservedCharacter(segment.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_key() {
        let topic = Topic::new("messages:42").unwrap();
        assert_eq!(topic.as_str(), "messages:42");
        assert_eq!(topic.to_string(), "messages:42");
    }

    #[test]
    fn empty_key_rejected() {
        assert_eq!(Topic::new("   "), Err(TopicError::Empty));
        assert_eq!(Topic::builder("").build(), Err(TopicError::Empty));
    }

    #[test]
    fn builder_is_order_independent() {
        let a = Topic::builder("matches")
            .filter("player_id", 9)
            .filter("court", 3)
            .build()
            .unwrap();
        let b = Topic::builder("matches")
            .filter("court", 3)
            .filter("player_id", 9)
            .build()
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "matches:court=3,player_id=9");
    }

    #[test]
    fn default_schema_is_elided() {
        let a = Topic::builder("messages")
            .schema("public")
            .filter("conversation_id", "c1")
            .build()
            .unwrap();
        let b = Topic::builder("messages")
            .filter("conversation_id", "c1")
            .build()
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "messages:conversation_id=c1");

        let c = Topic::builder("ledger").schema("rewards").build().unwrap();
        assert_eq!(c.as_str(), "rewards.ledger");
    }

    #[test]
    fn reserved_characters_rejected() {
        assert!(matches!(
            Topic::builder("a:b").build(),
            Err(TopicError::ReservedCharacter(_))
        ));
        assert!(matches!(
            Topic::builder("t").filter("col", "x,y").build(),
            Err(TopicError::ReservedCharacter(_))
        ));
    }

    #[test]
    fn serde_is_transparent() {
        let topic = Topic::new("invites:7").unwrap();
        let json = serde_json::to_string(&topic).unwrap();
        assert_eq!(json, "\"invites:7\"");
        let back: Topic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, topic);
    }
}
