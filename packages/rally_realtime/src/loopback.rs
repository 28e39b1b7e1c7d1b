//! In-memory transport.
//!
//! Delivers events published locally to the channel for their topic. It keeps
//! per-topic open/close counts so callers can observe exactly how the
//! coordinator drives the transport, and it can be told to refuse, stall, or
//! sever channels.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;
use crate::event::ChangeEvent;
use crate::topic::Topic;
use crate::transport::{Connection, DEFAULT_EVENT_CAPACITY, OpenedChannel, Transport};

#[derive(Default)]
struct LoopbackState {
    channels: HashMap<Topic, (u64, mpsc::Sender<ChangeEvent>)>,
    opens: HashMap<Topic, usize>,
    closes: HashMap<Topic, usize>,
    fail_next: HashSet<Topic>,
    open_delay: Duration,
}

/// Transport that lives entirely inside the process
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<LoopbackState>>,
    next_id: Arc<AtomicU64>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        // A panic while holding this lock leaves only counters behind.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver `event` on the open channel for `topic`. Returns false when no
    /// channel is open or its buffer is full.
    pub fn publish(&self, topic: &Topic, event: ChangeEvent) -> bool {
        let state = self.lock();
        match state.channels.get(topic) {
            Some((_, tx)) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Drop the channel for `topic` as if the remote end went away.
    pub fn sever(&self, topic: &Topic) -> bool {
        self.lock().channels.remove(topic).is_some()
    }

    /// Make the next `open_channel` for `topic` fail.
    pub fn fail_next_open(&self, topic: &Topic) {
        self.lock().fail_next.insert(topic.clone());
    }

    /// Delay every subsequent handshake by `delay`.
    pub fn set_open_delay(&self, delay: Duration) {
        self.lock().open_delay = delay;
    }

    /// Number of successful opens for `topic`
    pub fn opens(&self, topic: &Topic) -> usize {
        self.lock().opens.get(topic).copied().unwrap_or(0)
    }

    /// Number of closes requested for `topic`
    pub fn closes(&self, topic: &Topic) -> usize {
        self.lock().closes.get(topic).copied().unwrap_or(0)
    }

    pub fn is_open(&self, topic: &Topic) -> bool {
        self.lock().channels.contains_key(topic)
    }

    /// Number of channels currently open
    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }
}

impl Transport for LoopbackTransport {
    type Connection = LoopbackConnection;

    async fn open_channel(
        &self,
        topic: &Topic,
    ) -> Result<OpenedChannel<LoopbackConnection>, TransportError> {
        let delay = self.lock().open_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.fail_next.remove(topic) {
            return Err(TransportError::Refused(format!("loopback refused {topic}")));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(DEFAULT_EVENT_CAPACITY);
        if state.channels.insert(topic.clone(), (id, tx)).is_some() {
            // The registry never opens a topic twice; keep the newest anyway.
            debug!(topic = %topic, "loopback replaced an existing channel");
        }
        *state.opens.entry(topic.clone()).or_default() += 1;

        Ok(OpenedChannel {
            connection: LoopbackConnection {
                id,
                topic: topic.clone(),
                state: self.state.clone(),
            },
            events: rx,
        })
    }
}

/// Connection handed out by [`LoopbackTransport`]
pub struct LoopbackConnection {
    id: u64,
    topic: Topic,
    state: Arc<Mutex<LoopbackState>>,
}

impl Connection for LoopbackConnection {
    fn close(self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(state.channels.get(&self.topic), Some((id, _)) if *id == self.id) {
            state.channels.remove(&self.topic);
        }
        *state.closes.entry(self.topic).or_default() += 1;
    }
}
