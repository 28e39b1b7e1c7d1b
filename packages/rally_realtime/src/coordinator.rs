use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::{CoordinatorConfig, MisusePolicy};
use crate::counter::RefCounter;
use crate::error::{ConnectionError, MisuseError};
use crate::event::ChangeEvent;
use crate::handle::{HandleId, Listener, SubscriptionHandle};
use crate::registry::{self, ChannelPhase, ChannelRegistry, ChannelStats, OpenStep};
use crate::topic::Topic;
use crate::transport::Transport;

static NEXT_COORDINATOR: AtomicU64 = AtomicU64::new(1);

/// Buffered connection errors per receiver before it starts lagging
const ERROR_CAPACITY: usize = 64;

/// Bookkeeping guarded by a single lock that is never held across an await
struct State<T: Transport> {
    registry: ChannelRegistry<T::Connection>,
    counter: RefCounter,
    handles: HashMap<HandleId, Topic>,
    next_handle: u64,
}

impl<T: Transport> State<T> {
    fn issue(&mut self, coordinator: u64, topic: &Topic) -> SubscriptionHandle {
        let id = HandleId(self.next_handle);
        self.next_handle += 1;
        self.handles.insert(id, topic.clone());
        SubscriptionHandle {
            coordinator,
            id,
            topic: topic.clone(),
        }
    }

    /// Register a listener on an already-open (or just-settled) channel.
    fn attach(
        &mut self,
        coordinator: u64,
        topic: &Topic,
        incarnation: Option<u64>,
        listener: Listener,
    ) -> Result<SubscriptionHandle, ConnectionError> {
        let id = HandleId(self.next_handle);
        self.registry.register(topic, incarnation, id, listener)?;
        let handle = self.issue(coordinator, topic);
        let count = self.counter.increment(topic);
        debug!(topic = %topic, handle = %handle.id, count, "subscribed");
        Ok(handle)
    }

    fn release(&mut self, coordinator: u64, handle: &SubscriptionHandle) -> Result<(), MisuseError> {
        if handle.coordinator != coordinator || handle.id.0 >= self.next_handle {
            return Err(MisuseError::UnknownHandle {
                id: handle.id,
                topic: handle.topic.clone(),
            });
        }
        let Some(topic) = self.handles.remove(&handle.id) else {
            return Err(MisuseError::AlreadyReleased {
                id: handle.id,
                topic: handle.topic.clone(),
            });
        };

        self.registry.remove_listener(&topic, handle.id);
        let count = self.counter.decrement(&topic)?;
        debug!(topic = %topic, handle = %handle.id, count, "unsubscribed");
        if count == 0 {
            self.registry.close_if_idle(&topic);
        }
        Ok(())
    }
}

struct Inner<T: Transport> {
    id: u64,
    transport: Arc<T>,
    config: CoordinatorConfig,
    state: Mutex<State<T>>,
    errors: broadcast::Sender<ConnectionError>,
}

impl<T: Transport> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // Listeners never run under this lock, so poisoning can only come
        // from a bug in the bookkeeping itself. Cleanup must still work.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn report_misuse(&self, misuse: &MisuseError) {
        warn!(code = misuse.error_code(), "subscription misuse: {}", misuse);
        if self.config.misuse_policy == MisusePolicy::Panic {
            panic!("subscription misuse: {misuse}");
        }
    }

    fn deliver(&self, topic: &Topic, generation: Option<u64>, event: &ChangeEvent) -> usize {
        let listeners = self.lock().registry.snapshot(topic, generation);
        if listeners.is_empty() {
            return 0;
        }
        let failures = registry::deliver(topic, &listeners, event);
        self.lock().registry.record_delivery(topic, failures);
        listeners.len() - failures
    }
}

impl<T: Transport> Drop for Inner<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        let closed = state.registry.close_all();
        if closed > 0 {
            debug!(closed, "coordinator dropped with open channels");
        }
    }
}

/// Withdraws a waiting subscriber's interest in a pending open unless it
/// completed registration. Runs when a `subscribe` future is dropped
/// mid-handshake.
struct PendingInterest<'a, T: Transport> {
    inner: &'a Inner<T>,
    topic: &'a Topic,
    incarnation: u64,
    armed: bool,
}

impl<T: Transport> Drop for PendingInterest<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.inner
                .lock()
                .registry
                .withdraw(self.topic, self.incarnation);
        }
    }
}

/// Process-wide subscription coordinator.
///
/// Multiplexes any number of consumers onto at most one transport channel
/// per topic. Cloning is cheap and every clone shares the same registry; the
/// channels close when [`clear_all`](Self::clear_all) runs or the last clone
/// is dropped.
///
/// # Example
///
/// ```no_run
/// use rally_realtime::{Coordinator, CoordinatorConfig, LoopbackTransport, Topic, listener};
///
/// # async fn example() -> anyhow::Result<()> {
/// let coordinator = Coordinator::new(LoopbackTransport::new(), CoordinatorConfig::default());
/// let topic = Topic::builder("messages").filter("conversation_id", 42).build()?;
///
/// let handle = coordinator
///     .subscribe(topic, listener(|event| {
///         println!("{:?} {}", event.kind, event.record);
///         Ok(())
///     }))
///     .await?;
///
/// coordinator.unsubscribe(&handle)?;
/// # Ok(())
/// # }
/// ```
pub struct Coordinator<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Coordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Coordinator<T> {
    pub fn new(transport: T, config: CoordinatorConfig) -> Self {
        let id = NEXT_COORDINATOR.fetch_add(1, Ordering::SeqCst);
        debug!(coordinator = id, open_timeout = ?config.open_timeout(), "coordinator created");
        Self {
            inner: Arc::new(Inner {
                id,
                transport: Arc::new(transport),
                config,
                state: Mutex::new(State {
                    registry: ChannelRegistry::new(),
                    counter: RefCounter::new(),
                    handles: HashMap::new(),
                    next_handle: 1,
                }),
                errors: broadcast::channel(ERROR_CAPACITY).0,
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Register `listener` for `topic`.
    ///
    /// The first subscriber on a topic opens the transport channel; later
    /// ones share it (and wait for it if the open is still in flight). On
    /// failure no handle is issued and no count is taken, so calling again
    /// retries the open.
    ///
    /// Dropping the returned future before it resolves withdraws the
    /// request; a channel nobody wants by the time its open settles is
    /// closed straight away.
    pub async fn subscribe(
        &self,
        topic: Topic,
        listener: Listener,
    ) -> Result<SubscriptionHandle, ConnectionError> {
        let inner = &*self.inner;
        let (incarnation, mut settled) = {
            let mut state = inner.lock();
            match state.registry.open(&topic) {
                OpenStep::Ready => return state.attach(inner.id, &topic, None, listener),
                OpenStep::Wait {
                    incarnation,
                    settled,
                } => (incarnation, settled),
                OpenStep::Connect {
                    incarnation,
                    generation,
                    settled,
                } => {
                    self.spawn_connect(topic.clone(), generation);
                    (incarnation, settled)
                }
            }
        };

        let mut pending = PendingInterest {
            inner,
            topic: &topic,
            incarnation,
            armed: true,
        };

        let outcome = match settled.wait_for(Option::is_some).await {
            Ok(settlement) => settlement.clone().unwrap_or(Ok(())),
            Err(_) => Err(ConnectionError::Cancelled {
                topic: topic.clone(),
            }),
        };

        match outcome {
            Ok(()) => {
                pending.armed = false;
                // Fails with `Cancelled` if teardown ran between settlement
                // and now.
                inner
                    .lock()
                    .attach(inner.id, &topic, Some(incarnation), listener)
            }
            Err(err) => {
                debug!(topic = %topic, error = %err, "subscribe failed");
                Err(err)
            }
        }
    }

    fn spawn_connect(&self, topic: Topic, generation: u64) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result =
                registry::connect(inner.transport.as_ref(), &topic, inner.config.open_timeout())
                    .await;

            let weak = Arc::downgrade(&inner);
            let mut state = inner.lock();
            state.registry.settle(&topic, generation, result, |events| {
                tokio::spawn(pump(weak, topic.clone(), generation, events))
            });
        });
    }

    /// Release a subscription. The last release on a topic closes its
    /// channel.
    ///
    /// Releasing a handle twice, or one from another coordinator, changes
    /// nothing; the misuse is logged and returned.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), MisuseError> {
        let result = self.inner.lock().release(self.inner.id, handle);
        if let Err(misuse) = &result {
            self.inner.report_misuse(misuse);
        }
        result
    }

    /// Release a handle held by a binding. Returns `Ok(false)` if teardown
    /// already flushed it; the check and the release share one lock.
    pub(crate) fn release_bound(&self, handle: &SubscriptionHandle) -> Result<bool, MisuseError> {
        let result = {
            let mut state = self.inner.lock();
            if handle.coordinator == self.inner.id && !state.handles.contains_key(&handle.id) {
                return Ok(false);
            }
            state.release(self.inner.id, handle)
        };
        match result {
            Ok(()) => Ok(true),
            Err(misuse) => {
                self.inner.report_misuse(&misuse);
                Err(misuse)
            }
        }
    }

    /// Connection errors raised outside any `subscribe` call, such as a
    /// channel dropped by the transport. Only errors sent after this call
    /// are received.
    pub fn connection_errors(&self) -> broadcast::Receiver<ConnectionError> {
        self.inner.errors.subscribe()
    }

    /// Whether `handle` is still registered
    pub fn is_live(&self, handle: &SubscriptionHandle) -> bool {
        handle.coordinator == self.inner.id && self.inner.lock().handles.contains_key(&handle.id)
    }

    /// Deliver `event` to the current listeners of `topic`, in registration
    /// order. Returns how many listeners handled it without failing.
    pub fn dispatch(&self, topic: &Topic, event: &ChangeEvent) -> usize {
        self.inner.deliver(topic, None, event)
    }

    /// Number of topics with at least one live handle
    pub fn active_topic_count(&self) -> usize {
        self.inner.lock().counter.live_topics()
    }

    /// Number of unreleased handles across all topics
    pub fn handle_count(&self) -> usize {
        self.inner.lock().handles.len()
    }

    /// Topic → live handle count
    pub fn debug_info(&self) -> BTreeMap<Topic, usize> {
        self.inner.lock().counter.snapshot()
    }

    pub fn is_channel_open(&self, topic: &Topic) -> bool {
        self.inner.lock().registry.is_open(topic)
    }

    pub fn channel_phase(&self, topic: &Topic) -> Option<ChannelPhase> {
        self.inner.lock().registry.phase(topic)
    }

    /// Whether `handle` is live and its channel is currently delivering.
    /// False while a dropped channel waits to be reopened.
    pub fn is_receiving(&self, handle: &SubscriptionHandle) -> bool {
        if handle.coordinator != self.inner.id {
            return false;
        }
        let state = self.inner.lock();
        state.handles.contains_key(&handle.id) && state.registry.is_open(&handle.topic)
    }

    pub fn channel_stats(&self) -> Vec<ChannelStats> {
        self.inner.lock().registry.stats()
    }

    /// Close every channel and forget every handle, regardless of counts.
    /// Safe to call at any time, any number of times.
    pub fn clear_all(&self) {
        let mut state = self.inner.lock();
        let channels = state.registry.close_all();
        let handles = state.handles.len();
        state.counter.reset();
        state.handles.clear();
        info!(channels, handles, "cleared all subscriptions");
    }
}

/// Forward one connection's events to its listeners until the transport
/// ends the stream or the registry aborts this task.
async fn pump<T: Transport>(
    inner: Weak<Inner<T>>,
    topic: Topic,
    generation: u64,
    mut events: mpsc::Receiver<ChangeEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.deliver(&topic, Some(generation), &event);
    }

    if let Some(inner) = inner.upgrade() {
        if inner.lock().registry.mark_dropped(&topic, generation) {
            let err = ConnectionError::Dropped { topic };
            warn!(topic = %err.topic(), code = err.error_code(), "{}", err);
            // No receivers is fine: the phase is still visible through stats.
            let _ = inner.errors.send(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChangeKind;
    use crate::handle::listener;
    use crate::loopback::LoopbackTransport;
    use std::time::Duration;

    fn topic(s: &str) -> Topic {
        Topic::new(s).unwrap()
    }

    fn setup() -> (LoopbackTransport, Coordinator<LoopbackTransport>) {
        let transport = LoopbackTransport::new();
        let config = CoordinatorConfig::default().with_misuse_policy(MisusePolicy::Log);
        let coordinator = Coordinator::new(transport.clone(), config);
        (transport, coordinator)
    }

    fn noop() -> Listener {
        listener(|_| Ok(()))
    }

    fn recording(tag: &'static str, tx: mpsc::UnboundedSender<(&'static str, ChangeEvent)>) -> Listener {
        listener(move |event| {
            let _ = tx.send((tag, event.clone()));
            Ok(())
        })
    }

    #[tokio::test]
    async fn shared_topic_opens_once() {
        let (transport, coordinator) = setup();
        let t = topic("messages:1");

        let h1 = coordinator.subscribe(t.clone(), noop()).await.unwrap();
        let h2 = coordinator.subscribe(t.clone(), noop()).await.unwrap();
        assert_ne!(h1.id(), h2.id());
        assert_eq!(transport.opens(&t), 1);
        assert_eq!(coordinator.debug_info().get(&t), Some(&2));

        coordinator.unsubscribe(&h1).unwrap();
        assert!(transport.is_open(&t));
        coordinator.unsubscribe(&h2).unwrap();
        assert!(!transport.is_open(&t));
        assert_eq!(transport.closes(&t), 1);
        assert_eq!(coordinator.active_topic_count(), 0);
    }

    #[tokio::test]
    async fn dispatch_in_registration_order() {
        let (_transport, coordinator) = setup();
        let t = topic("A");
        let (tx, mut rx) = mpsc::unbounded_channel();

        coordinator
            .subscribe(t.clone(), recording("L1", tx.clone()))
            .await
            .unwrap();
        coordinator
            .subscribe(t.clone(), recording("L2", tx))
            .await
            .unwrap();

        let event = ChangeEvent::new(t.clone(), ChangeKind::Insert, serde_json::json!({"id": 1}));
        assert_eq!(coordinator.dispatch(&t, &event), 2);

        assert_eq!(rx.try_recv().unwrap(), ("L1", event.clone()));
        assert_eq!(rx.try_recv().unwrap(), ("L2", event));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_events_reach_listeners() {
        let (transport, coordinator) = setup();
        let t = topic("sessions:9");
        let (tx, mut rx) = mpsc::unbounded_channel();
        coordinator
            .subscribe(t.clone(), recording("L", tx))
            .await
            .unwrap();

        for i in 0..3 {
            let event = ChangeEvent::new(t.clone(), ChangeKind::Update, serde_json::json!({"seq": i}));
            assert!(transport.publish(&t, event));
        }
        for i in 0..3 {
            let (_, event) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.record["seq"], i);
        }
    }

    #[tokio::test]
    async fn double_unsubscribe_is_detected() {
        let (_transport, coordinator) = setup();
        let t = topic("a");
        let h1 = coordinator.subscribe(t.clone(), noop()).await.unwrap();
        let _h2 = coordinator.subscribe(t.clone(), noop()).await.unwrap();

        coordinator.unsubscribe(&h1).unwrap();
        assert!(matches!(
            coordinator.unsubscribe(&h1),
            Err(MisuseError::AlreadyReleased { .. })
        ));
        assert_eq!(coordinator.debug_info().get(&t), Some(&1));
        assert!(coordinator.is_channel_open(&t));
    }

    #[tokio::test]
    async fn foreign_handle_is_rejected() {
        let (_t1, a) = setup();
        let (_t2, b) = setup();
        let t = topic("a");
        let handle = a.subscribe(t.clone(), noop()).await.unwrap();

        assert!(matches!(
            b.unsubscribe(&handle),
            Err(MisuseError::UnknownHandle { .. })
        ));
        assert!(a.is_live(&handle));
        assert!(!b.is_live(&handle));
    }

    #[tokio::test]
    #[should_panic(expected = "subscription misuse")]
    async fn panic_policy_is_loud() {
        let transport = LoopbackTransport::new();
        let coordinator = Coordinator::new(
            transport,
            CoordinatorConfig::default().with_misuse_policy(MisusePolicy::Panic),
        );
        let handle = coordinator.subscribe(topic("a"), noop()).await.unwrap();
        coordinator.unsubscribe(&handle).unwrap();
        let _ = coordinator.unsubscribe(&handle);
    }

    #[tokio::test]
    async fn failed_open_issues_nothing_and_retries() {
        let (transport, coordinator) = setup();
        let t = topic("a");
        transport.fail_next_open(&t);

        let err = coordinator.subscribe(t.clone(), noop()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Transport { .. }));
        assert!(err.is_retryable());
        assert_eq!(coordinator.handle_count(), 0);
        assert_eq!(coordinator.active_topic_count(), 0);
        assert!(coordinator.channel_stats().is_empty());

        coordinator.subscribe(t.clone(), noop()).await.unwrap();
        assert_eq!(transport.opens(&t), 1);
        assert_eq!(coordinator.active_topic_count(), 1);
    }

    #[tokio::test]
    async fn open_timeout_is_bounded() {
        let transport = LoopbackTransport::new();
        transport.set_open_delay(Duration::from_millis(500));
        let coordinator = Coordinator::new(
            transport.clone(),
            CoordinatorConfig::default().with_open_timeout(Duration::from_millis(20)),
        );
        let t = topic("slow");

        let err = coordinator.subscribe(t.clone(), noop()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout { .. }));
        assert_eq!(coordinator.handle_count(), 0);

        transport.set_open_delay(Duration::ZERO);
        coordinator.subscribe(t, noop()).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_subscribers_share_pending_open() {
        let transport = LoopbackTransport::new();
        transport.set_open_delay(Duration::from_millis(30));
        let coordinator = Coordinator::new(transport.clone(), CoordinatorConfig::default());
        let t = topic("a");

        let (a, b) = tokio::join!(
            coordinator.subscribe(t.clone(), noop()),
            coordinator.subscribe(t.clone(), noop())
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(transport.opens(&t), 1);
        assert_eq!(coordinator.debug_info().get(&t), Some(&2));
        assert_eq!(coordinator.channel_stats()[0].waiting, 0);
    }

    #[tokio::test]
    async fn cancelled_subscribe_closes_on_settlement() {
        let transport = LoopbackTransport::new();
        transport.set_open_delay(Duration::from_millis(50));
        let coordinator = Coordinator::new(transport.clone(), CoordinatorConfig::default());
        let t = topic("a");

        let attempt =
            tokio::time::timeout(Duration::from_millis(5), coordinator.subscribe(t.clone(), noop()))
                .await;
        assert!(attempt.is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(transport.opens(&t), 1);
        assert_eq!(transport.closes(&t), 1);
        assert_eq!(transport.open_channels(), 0);
        assert!(coordinator.channel_stats().is_empty());
    }

    #[tokio::test]
    async fn clear_all_during_pending_open_cancels() {
        let transport = LoopbackTransport::new();
        transport.set_open_delay(Duration::from_millis(50));
        let coordinator = Coordinator::new(transport.clone(), CoordinatorConfig::default());
        let t = topic("a");

        let pending = {
            let coordinator = coordinator.clone();
            let t = t.clone();
            tokio::spawn(async move { coordinator.subscribe(t, noop()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.clear_all();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::Cancelled { .. }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.open_channels(), 0);
        assert_eq!(transport.closes(&t), 1);
    }

    #[tokio::test]
    async fn dropped_channel_reopens_on_next_subscribe() {
        let (transport, coordinator) = setup();
        let t = topic("a");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let h1 = coordinator
            .subscribe(t.clone(), recording("first", tx.clone()))
            .await
            .unwrap();

        transport.sever(&t);
        tokio::time::timeout(Duration::from_secs(1), async {
            while coordinator.is_channel_open(&t) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(coordinator.debug_info().get(&t), Some(&1));
        assert_eq!(coordinator.channel_phase(&t), Some(ChannelPhase::Dropped));
        assert!(coordinator.is_live(&h1));
        assert!(!coordinator.is_receiving(&h1));

        let _h2 = coordinator
            .subscribe(t.clone(), recording("second", tx))
            .await
            .unwrap();
        assert_eq!(transport.opens(&t), 2);
        assert!(coordinator.is_receiving(&h1));

        let event = ChangeEvent::new(t.clone(), ChangeKind::Delete, serde_json::Value::Null);
        assert!(transport.publish(&t, event));
        let (first, _) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "first");
    }

    #[tokio::test]
    async fn listener_may_unsubscribe_itself() {
        let (transport, coordinator) = setup();
        let t = topic("a");
        let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

        let inner_coordinator = coordinator.clone();
        let inner_slot = slot.clone();
        let handle = coordinator
            .subscribe(
                t.clone(),
                listener(move |_| {
                    if let Some(handle) = inner_slot.lock().unwrap().take() {
                        inner_coordinator.unsubscribe(&handle)?;
                    }
                    Ok(())
                }),
            )
            .await
            .unwrap();
        *slot.lock().unwrap() = Some(handle);

        let event = ChangeEvent::new(t.clone(), ChangeKind::Insert, serde_json::Value::Null);
        assert_eq!(coordinator.dispatch(&t, &event), 1);
        assert!(!transport.is_open(&t));
        assert_eq!(coordinator.dispatch(&t, &event), 0);
    }

    #[tokio::test]
    async fn dropping_last_clone_closes_channels() {
        let (transport, coordinator) = setup();
        coordinator.subscribe(topic("a"), noop()).await.unwrap();
        coordinator.subscribe(topic("b"), noop()).await.unwrap();
        assert_eq!(transport.open_channels(), 2);

        drop(coordinator);
        assert_eq!(transport.open_channels(), 0);
    }

    #[tokio::test]
    async fn dropped_channel_is_reported() {
        let (transport, coordinator) = setup();
        let t = topic("a");
        let mut errors = coordinator.connection_errors();
        coordinator.subscribe(t.clone(), noop()).await.unwrap();

        transport.sever(&t);
        let err = tokio::time::timeout(Duration::from_secs(1), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err, ConnectionError::Dropped { topic: t.clone() });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn release_after_teardown_is_quiet() {
        let transport = LoopbackTransport::new();
        let coordinator = Coordinator::new(
            transport,
            CoordinatorConfig::default().with_misuse_policy(MisusePolicy::Panic),
        );
        let t = topic("a");
        let kept = coordinator.subscribe(t.clone(), noop()).await.unwrap();
        let flushed = coordinator.subscribe(t.clone(), noop()).await.unwrap();

        assert_eq!(coordinator.release_bound(&kept), Ok(true));
        coordinator.clear_all();
        assert_eq!(coordinator.release_bound(&flushed), Ok(false));
        assert_eq!(coordinator.active_topic_count(), 0);
    }
}
