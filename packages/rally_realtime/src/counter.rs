//! Per-topic reference counting. Pure bookkeeping: the coordinator acts on
//! the 0↔1 boundaries these methods report.

use std::collections::{BTreeMap, HashMap};

use crate::error::MisuseError;
use crate::topic::Topic;

#[derive(Debug, Default)]
pub struct RefCounter {
    counts: HashMap<Topic, usize>,
}

impl RefCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new count
    pub fn increment(&mut self, topic: &Topic) -> usize {
        let count = self.counts.entry(topic.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Returns the new count.
    ///
    /// Decrementing a topic already at zero clamps: the count stays zero and
    /// [`MisuseError::CountUnderflow`] is returned.
    pub fn decrement(&mut self, topic: &Topic) -> Result<usize, MisuseError> {
        match self.counts.get_mut(topic) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(*count)
            }
            Some(_) => {
                self.counts.remove(topic);
                Ok(0)
            }
            None => Err(MisuseError::CountUnderflow {
                topic: topic.clone(),
            }),
        }
    }

    pub fn count_of(&self, topic: &Topic) -> usize {
        self.counts.get(topic).copied().unwrap_or(0)
    }

    /// Number of topics with a non-zero count
    pub fn live_topics(&self) -> usize {
        self.counts.len()
    }

    pub fn snapshot(&self) -> BTreeMap<Topic, usize> {
        self.counts
            .iter()
            .map(|(topic, count)| (topic.clone(), *count))
            .collect()
    }

    pub fn reset(&mut self) {
        self.counts.clear();
    }
}
