use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::event::ChangeEvent;
use crate::topic::Topic;

/// Unique identifier for an issued subscription
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Callback invoked with every event on a topic.
///
/// Returning `Err` (or panicking) is contained: later listeners on the same
/// topic still receive the event.
pub type Listener = Arc<dyn Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`Listener`]
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Capability token for one subscription.
///
/// The handle only names the subscription; the coordinator that issued it is
/// the source of truth for whether it is still live. Cloning a handle does not
/// create a second subscription, and releasing any clone releases it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub(crate) coordinator: u64,
    pub(crate) id: HandleId,
    pub(crate) topic: Topic,
}

impl SubscriptionHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.topic)
    }
}

/// Lifecycle of a single subscription as seen by its consumer.
///
/// `Unbound → Subscribing → Active → Releasing → Released`. A failed
/// subscribe returns to `Unbound`. An `Active` subscription whose channel
/// the transport dropped reads as `Interrupted` until it is re-activated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Unbound,
    Subscribing,
    Active,
    /// Still registered, but no events arrive until the channel reopens
    Interrupted,
    Releasing,
    Released,
}

impl HandleState {
    /// Whether events may currently be delivered to this consumer
    pub fn is_receiving(self) -> bool {
        matches!(self, Self::Active)
    }
}
