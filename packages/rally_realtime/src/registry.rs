//! Channel registry: at most one transport channel per topic.
//!
//! The registry is plain data guarded by the coordinator's lock. Everything
//! that has to wait on the transport (the connect handshake) happens in
//! [`connect`], outside the lock; its outcome is folded back in with
//! [`ChannelRegistry::settle`]. This module is the only caller of
//! [`Transport`] and [`Connection`].

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ConnectionError, DispatchFailure};
use crate::event::ChangeEvent;
use crate::handle::{HandleId, Listener};
use crate::topic::Topic;
use crate::transport::{Connection, OpenedChannel, Transport};

/// Outcome of a pending open, published to every subscriber waiting on it
pub(crate) type Settlement = Option<Result<(), ConnectionError>>;

enum Phase<C> {
    /// Handshake in flight. Dropping the sender tells waiters the open was
    /// abandoned.
    Opening {
        settled: watch::Sender<Settlement>,
    },
    Open {
        connection: C,
        pump: JoinHandle<()>,
    },
    /// The transport ended the event stream on its own. Listeners stay
    /// registered; the next subscribe reopens.
    Dropped,
}

/// Public view of a record's phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    Opening,
    Open,
    Dropped,
}

struct ChannelRecord<C> {
    /// Identifies this record across reopen cycles
    incarnation: u64,
    /// Identifies the current transport connection
    generation: u64,
    phase: Phase<C>,
    listeners: Vec<(HandleId, Listener)>,
    /// Subscribers awaiting a pending open that have not registered yet
    waiting: usize,
    opened_at: Option<DateTime<Utc>>,
    events_delivered: u64,
    dispatch_failures: u64,
}

impl<C> ChannelRecord<C> {
    fn is_idle(&self) -> bool {
        self.waiting == 0 && self.listeners.is_empty()
    }

    fn phase(&self) -> ChannelPhase {
        match self.phase {
            Phase::Opening { .. } => ChannelPhase::Opening,
            Phase::Open { .. } => ChannelPhase::Open,
            Phase::Dropped => ChannelPhase::Dropped,
        }
    }
}

/// Diagnostics for one channel
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelStats {
    pub topic: Topic,
    pub phase: ChannelPhase,
    pub listeners: usize,
    pub waiting: usize,
    pub events_delivered: u64,
    pub dispatch_failures: u64,
    pub opened_at: Option<DateTime<Utc>>,
}

/// What a subscriber has to do to get onto a topic
pub(crate) enum OpenStep {
    /// The channel is open; register immediately.
    Ready,
    /// Another subscriber already started the open; wait for it.
    Wait {
        incarnation: u64,
        settled: watch::Receiver<Settlement>,
    },
    /// Nothing is open; the caller must spawn [`connect`] for `generation`.
    Connect {
        incarnation: u64,
        generation: u64,
        settled: watch::Receiver<Settlement>,
    },
}

pub(crate) struct ChannelRegistry<C: Connection> {
    channels: HashMap<Topic, ChannelRecord<C>>,
    next_id: u64,
}

impl<C: Connection> ChannelRegistry<C> {
    pub(crate) fn new() -> Self {
        Self {
            channels: HashMap::new(),
            next_id: 1,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Idempotent open. Subscribers that do not get [`OpenStep::Ready`] are
    /// counted as waiting until they [`register`](Self::register) or
    /// [`withdraw`](Self::withdraw).
    pub(crate) fn open(&mut self, topic: &Topic) -> OpenStep {
        let generation = self.next_id();

        if let Some(record) = self.channels.get_mut(topic) {
            match &record.phase {
                Phase::Open { .. } => return OpenStep::Ready,
                Phase::Opening { settled } => {
                    record.waiting += 1;
                    return OpenStep::Wait {
                        incarnation: record.incarnation,
                        settled: settled.subscribe(),
                    };
                }
                Phase::Dropped => {
                    debug!(topic = %topic, listeners = record.listeners.len(), "reopening dropped channel");
                    let (tx, rx) = watch::channel(None);
                    record.phase = Phase::Opening { settled: tx };
                    record.generation = generation;
                    record.waiting += 1;
                    return OpenStep::Connect {
                        incarnation: record.incarnation,
                        generation,
                        settled: rx,
                    };
                }
            }
        }

        let incarnation = self.next_id();
        let (tx, rx) = watch::channel(None);
        debug!(topic = %topic, generation, "opening channel");
        self.channels.insert(
            topic.clone(),
            ChannelRecord {
                incarnation,
                generation,
                phase: Phase::Opening { settled: tx },
                listeners: Vec::new(),
                waiting: 1,
                opened_at: None,
                events_delivered: 0,
                dispatch_failures: 0,
            },
        );
        OpenStep::Connect {
            incarnation,
            generation,
            settled: rx,
        }
    }

    /// Fold the result of [`connect`] back in.
    ///
    /// `spawn_pump` is invoked only when the channel actually goes live.
    /// A connection that arrives for a record that was closed, replaced, or
    /// abandoned by every waiter is closed on the spot.
    pub(crate) fn settle(
        &mut self,
        topic: &Topic,
        generation: u64,
        result: Result<OpenedChannel<C>, ConnectionError>,
        spawn_pump: impl FnOnce(mpsc::Receiver<ChangeEvent>) -> JoinHandle<()>,
    ) {
        let current = self.channels.get(topic).is_some_and(|record| {
            record.generation == generation && matches!(record.phase, Phase::Opening { .. })
        });
        if !current {
            if let Ok(opened) = result {
                info!(topic = %topic, generation, "closing channel opened after teardown");
                opened.connection.close();
            }
            return;
        }

        let Some(record) = self.channels.get_mut(topic) else {
            return;
        };

        match result {
            Ok(opened) if record.is_idle() => {
                info!(topic = %topic, "no subscribers left when open settled; closing");
                opened.connection.close();
                self.channels.remove(topic);
            }
            Ok(opened) => {
                let pump = spawn_pump(opened.events);
                let previous = std::mem::replace(
                    &mut record.phase,
                    Phase::Open {
                        connection: opened.connection,
                        pump,
                    },
                );
                record.opened_at = Some(Utc::now());
                info!(topic = %topic, generation, waiting = record.waiting, "channel open");
                if let Phase::Opening { settled } = previous {
                    settled.send_replace(Some(Ok(())));
                }
            }
            Err(err) => {
                warn!(topic = %topic, error = %err, "channel failed to open");
                let previous = if record.listeners.is_empty() {
                    self.channels.remove(topic).map(|record| record.phase)
                } else {
                    Some(std::mem::replace(&mut record.phase, Phase::Dropped))
                };
                if let Some(Phase::Opening { settled }) = previous {
                    settled.send_replace(Some(Err(err)));
                }
            }
        }
    }

    /// Attach a listener to an open channel. Fails if the record is gone or
    /// has been replaced since the subscriber started waiting.
    pub(crate) fn register(
        &mut self,
        topic: &Topic,
        incarnation: Option<u64>,
        id: HandleId,
        listener: Listener,
    ) -> Result<(), ConnectionError> {
        let record = self
            .channels
            .get_mut(topic)
            .filter(|record| incarnation.is_none_or(|inc| record.incarnation == inc))
            .ok_or_else(|| ConnectionError::Cancelled {
                topic: topic.clone(),
            })?;

        if incarnation.is_some() {
            record.waiting = record.waiting.saturating_sub(1);
        }
        record.listeners.push((id, listener));
        Ok(())
    }

    /// A waiting subscriber gave up (its future was dropped or its open
    /// failed). Closes the channel if nobody else wants it.
    pub(crate) fn withdraw(&mut self, topic: &Topic, incarnation: u64) {
        let Some(record) = self.channels.get_mut(topic) else {
            return;
        };
        if record.incarnation != incarnation {
            return;
        }
        record.waiting = record.waiting.saturating_sub(1);
        debug!(topic = %topic, waiting = record.waiting, "subscriber withdrew from pending open");
        // An Opening record is resolved by `settle`, which sees the same count.
        if record.is_idle() && !matches!(record.phase, Phase::Opening { .. }) {
            self.close(topic);
        }
    }

    /// Returns whether the listener was registered
    pub(crate) fn remove_listener(&mut self, topic: &Topic, id: HandleId) -> bool {
        let Some(record) = self.channels.get_mut(topic) else {
            return false;
        };
        let before = record.listeners.len();
        record.listeners.retain(|(listener_id, _)| *listener_id != id);
        record.listeners.len() != before
    }

    /// Close `topic` if no listener or waiter still needs it
    pub(crate) fn close_if_idle(&mut self, topic: &Topic) -> bool {
        if self.channels.get(topic).is_some_and(|record| record.is_idle()) {
            self.close(topic);
            return true;
        }
        false
    }

    /// Close the transport channel for `topic` and forget it. No-op if absent.
    pub(crate) fn close(&mut self, topic: &Topic) {
        if let Some(record) = self.channels.remove(topic) {
            close_record(topic, record);
        }
    }

    /// Close every channel. Returns how many records were removed.
    pub(crate) fn close_all(&mut self) -> usize {
        let count = self.channels.len();
        for (topic, record) in self.channels.drain() {
            close_record(&topic, record);
        }
        count
    }

    /// The transport ended the event stream for `generation`.
    pub(crate) fn mark_dropped(&mut self, topic: &Topic, generation: u64) -> bool {
        let Some(record) = self.channels.get_mut(topic) else {
            return false;
        };
        if record.generation != generation || !matches!(record.phase, Phase::Open { .. }) {
            return false;
        }
        record.phase = Phase::Dropped;
        record.opened_at = None;
        if record.is_idle() {
            self.channels.remove(topic);
        }
        true
    }

    /// Listeners for `topic` in registration order. With a generation, only
    /// the matching connection is served.
    pub(crate) fn snapshot(&self, topic: &Topic, generation: Option<u64>) -> Vec<Listener> {
        self.channels
            .get(topic)
            .filter(|record| generation.is_none_or(|g| record.generation == g))
            .map(|record| {
                record
                    .listeners
                    .iter()
                    .map(|(_, listener)| listener.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn record_delivery(&mut self, topic: &Topic, failures: usize) {
        if let Some(record) = self.channels.get_mut(topic) {
            record.events_delivered += 1;
            record.dispatch_failures += failures as u64;
        }
    }

    pub(crate) fn phase(&self, topic: &Topic) -> Option<ChannelPhase> {
        self.channels.get(topic).map(|record| record.phase())
    }

    pub(crate) fn is_open(&self, topic: &Topic) -> bool {
        self.channels
            .get(topic)
            .is_some_and(|record| matches!(record.phase, Phase::Open { .. }))
    }

    pub(crate) fn stats(&self) -> Vec<ChannelStats> {
        let mut stats: Vec<ChannelStats> = self
            .channels
            .iter()
            .map(|(topic, record)| ChannelStats {
                topic: topic.clone(),
                phase: record.phase(),
                listeners: record.listeners.len(),
                waiting: record.waiting,
                events_delivered: record.events_delivered,
                dispatch_failures: record.dispatch_failures,
                opened_at: record.opened_at,
            })
            .collect();
        stats.sort_by(|a, b| a.topic.cmp(&b.topic));
        stats
    }
}

fn close_record<C: Connection>(topic: &Topic, record: ChannelRecord<C>) {
    match record.phase {
        Phase::Open { connection, pump } => {
            pump.abort();
            connection.close();
            info!(topic = %topic, "channel closed");
        }
        // Dropping the sender wakes waiters with a cancellation.
        Phase::Opening { settled } => {
            drop(settled);
            debug!(topic = %topic, "pending open abandoned");
        }
        Phase::Dropped => {
            debug!(topic = %topic, "dropped channel forgotten");
        }
    }
}

/// Establish a channel for `topic`, bounded by `timeout` (zero disables it).
pub(crate) async fn connect<T: Transport>(
    transport: &T,
    topic: &Topic,
    timeout: Duration,
) -> Result<OpenedChannel<T::Connection>, ConnectionError> {
    let result = if timeout.is_zero() {
        transport.open_channel(topic).await
    } else {
        match tokio::time::timeout(timeout, transport.open_channel(topic)).await {
            Ok(result) => result,
            Err(_) => {
                return Err(ConnectionError::Timeout {
                    topic: topic.clone(),
                    after: timeout,
                });
            }
        }
    };
    result.map_err(|e| e.into_connection_error(topic))
}

/// Invoke every listener with `event`. A failing or panicking listener is
/// logged and skipped; the rest still run. Returns the number of failures.
pub(crate) fn deliver(topic: &Topic, listeners: &[Listener], event: &ChangeEvent) -> usize {
    let mut failures = 0;
    for (index, listener) in listeners.iter().enumerate() {
        let failure = match catch_unwind(AssertUnwindSafe(|| listener(event))) {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => DispatchFailure::Error(err),
            Err(payload) => DispatchFailure::Panic(panic_message(payload.as_ref())),
        };
        failures += 1;
        error!(topic = %topic, listener = index, error = %failure, "dispatch failure");
    }
    failures
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChangeKind;
    use crate::handle::listener;
    use crate::loopback::{LoopbackConnection, LoopbackTransport};
    use std::sync::{Arc, Mutex};

    fn topic(s: &str) -> Topic {
        Topic::new(s).unwrap()
    }

    fn idle_pump(_events: mpsc::Receiver<ChangeEvent>) -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    #[tokio::test]
    async fn open_is_idempotent_while_pending() {
        let mut registry = ChannelRegistry::<LoopbackConnection>::new();
        let t = topic("a");

        let first = registry.open(&t);
        assert!(matches!(first, OpenStep::Connect { .. }));
        let second = registry.open(&t);
        assert!(matches!(second, OpenStep::Wait { .. }));
        assert_eq!(registry.stats()[0].waiting, 2);
    }

    #[tokio::test]
    async fn settle_with_no_waiters_closes_connection() {
        let transport = LoopbackTransport::new();
        let mut registry = ChannelRegistry::<LoopbackConnection>::new();
        let t = topic("a");

        let OpenStep::Connect {
            incarnation,
            generation,
            ..
        } = registry.open(&t)
        else {
            panic!("expected connect");
        };
        registry.withdraw(&t, incarnation);

        let opened = connect(&transport, &t, Duration::from_secs(1)).await;
        registry.settle(&t, generation, opened, idle_pump);

        assert!(!registry.is_open(&t));
        assert!(registry.stats().is_empty());
        assert_eq!(transport.opens(&t), 1);
        assert_eq!(transport.closes(&t), 1);
    }

    #[tokio::test]
    async fn failed_open_is_not_cached() {
        let transport = LoopbackTransport::new();
        transport.fail_next_open(&topic("a"));
        let mut registry = ChannelRegistry::<LoopbackConnection>::new();
        let t = topic("a");

        let OpenStep::Connect {
            generation,
            mut settled,
            ..
        } = registry.open(&t)
        else {
            panic!("expected connect");
        };
        let opened = connect(&transport, &t, Duration::from_secs(1)).await;
        registry.settle(&t, generation, opened, idle_pump);

        let outcome = settled.wait_for(Option::is_some).await.unwrap().clone();
        assert!(matches!(outcome, Some(Err(ConnectionError::Transport { .. }))));
        assert!(registry.stats().is_empty());
        assert!(matches!(registry.open(&t), OpenStep::Connect { .. }));
    }

    #[tokio::test]
    async fn stale_generation_is_closed_on_arrival() {
        let transport = LoopbackTransport::new();
        let mut registry = ChannelRegistry::<LoopbackConnection>::new();
        let t = topic("a");

        let OpenStep::Connect { generation, .. } = registry.open(&t) else {
            panic!("expected connect");
        };
        assert_eq!(registry.close_all(), 1);

        let opened = connect(&transport, &t, Duration::from_secs(1)).await;
        registry.settle(&t, generation, opened, idle_pump);
        assert_eq!(transport.open_channels(), 0);
        assert_eq!(transport.closes(&t), 1);
    }

    #[tokio::test]
    async fn timeout_surfaces_as_connection_error() {
        let transport = LoopbackTransport::new();
        transport.set_open_delay(Duration::from_millis(200));
        let t = topic("slow");

        let err = connect(&transport, &t, Duration::from_millis(10))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectionError::Timeout { .. }));
    }

    #[test]
    fn deliver_isolates_failures() {
        let t = topic("a");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        let s3 = seen.clone();
        let listeners = vec![
            listener(move |_| {
                s1.lock().unwrap().push(1);
                Ok(())
            }),
            listener(|_| anyhow::bail!("listener two is broken")),
            listener(|_| panic!("listener three panics")),
            listener(move |_| {
                s3.lock().unwrap().push(4);
                Ok(())
            }),
        ];

        let event = ChangeEvent::new(t.clone(), ChangeKind::Update, serde_json::Value::Null);
        assert_eq!(deliver(&t, &listeners, &event), 2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 4]);
    }

    #[test]
    fn panic_messages() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert_eq!(panic_message(&7u8), "non-string panic payload");
    }
}
