//! Lifecycle binding
//!
//! Bridges consumer activation/deactivation and process-level teardown into
//! coordinator calls, so consumers never manage transport lifecycle
//! themselves. A consumer (a screen, a widget, a CLI watcher) owns one
//! [`UnitBinding`]; the process owns one [`LifecycleBinder`] with at most one
//! teardown listener.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::error::{ConnectionError, MisuseError};
use crate::handle::{HandleState, Listener, SubscriptionHandle};
use crate::topic::Topic;
use crate::transport::Transport;

/// Why the whole process is flushing its subscriptions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownReason {
    /// The page/window is about to close
    PageClose,
    /// The app is navigating away from everything that holds subscriptions
    Navigation,
    /// The process is shutting down
    Shutdown,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PageClose => write!(f, "page close"),
            Self::Navigation => write!(f, "navigation"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

struct TeardownListener {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the process-wide teardown listener and hands out per-consumer
/// bindings.
pub struct LifecycleBinder<T: Transport> {
    coordinator: Coordinator<T>,
    teardown: Mutex<Option<TeardownListener>>,
}

impl<T: Transport> LifecycleBinder<T> {
    pub fn new(coordinator: Coordinator<T>) -> Self {
        Self {
            coordinator,
            teardown: Mutex::new(None),
        }
    }

    pub fn coordinator(&self) -> &Coordinator<T> {
        &self.coordinator
    }

    /// A fresh, unbound binding for one consumer
    pub fn unit(&self) -> UnitBinding<T> {
        UnitBinding {
            coordinator: self.coordinator.clone(),
            state: watch::channel(HandleState::Unbound).0,
            handle: None,
        }
    }

    fn teardown_slot(&self) -> MutexGuard<'_, Option<TeardownListener>> {
        self.teardown.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install the process-wide teardown listener: when `signal` resolves,
    /// every subscription is flushed with [`Coordinator::clear_all`].
    ///
    /// Only one listener may be installed at a time; install it once at
    /// startup and remove it at shutdown.
    pub fn install_teardown<F>(&self, signal: F) -> Result<(), MisuseError>
    where
        F: Future<Output = TeardownReason> + Send + 'static,
    {
        let mut slot = self.teardown_slot();
        if slot.is_some() {
            let misuse = MisuseError::TeardownAlreadyInstalled;
            warn!(code = misuse.error_code(), "{}", misuse);
            return Err(misuse);
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let coordinator = self.coordinator.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("teardown listener removed");
                }
                reason = signal => {
                    info!(%reason, "process teardown, flushing subscriptions");
                    coordinator.clear_all();
                }
            }
        });

        *slot = Some(TeardownListener { cancel, task });
        debug!("teardown listener installed");
        Ok(())
    }

    /// Remove the teardown listener. Returns false if none was installed.
    pub fn remove_teardown(&self) -> bool {
        match self.teardown_slot().take() {
            Some(listener) => {
                listener.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether the teardown listener is installed and has not fired yet
    pub fn teardown_pending(&self) -> bool {
        self.teardown_slot()
            .as_ref()
            .is_some_and(|listener| !listener.task.is_finished())
    }

    /// Flush every subscription now, without waiting for a signal
    pub fn teardown_now(&self, reason: TeardownReason) {
        info!(%reason, "process teardown requested, flushing subscriptions");
        self.coordinator.clear_all();
    }
}

impl<T: Transport> Drop for LifecycleBinder<T> {
    fn drop(&mut self) {
        self.remove_teardown();
    }
}

/// Resets a binding left in `Subscribing` when its activation future is
/// dropped before completing.
struct ActivationGuard<'a> {
    state: &'a watch::Sender<HandleState>,
    done: bool,
}

impl Drop for ActivationGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.state.send_replace(HandleState::Unbound);
        }
    }
}

/// One consumer's subscription across its active lifetime.
///
/// [`activate`](Self::activate) on mount, [`deactivate`](Self::deactivate) on
/// unmount. Dropping the binding deactivates it.
pub struct UnitBinding<T: Transport> {
    coordinator: Coordinator<T>,
    state: watch::Sender<HandleState>,
    handle: Option<SubscriptionHandle>,
}

impl<T: Transport> UnitBinding<T> {
    /// Current state. An active subscription reads as `Interrupted` while its
    /// channel is dropped, and as `Released` once teardown has flushed it.
    pub fn state(&self) -> HandleState {
        let state = *self.state.borrow();
        match (&self.handle, state) {
            (Some(handle), HandleState::Active) if !self.coordinator.is_receiving(handle) => {
                if self.coordinator.is_live(handle) {
                    HandleState::Interrupted
                } else {
                    HandleState::Released
                }
            }
            _ => state,
        }
    }

    /// Follow lifecycle transitions from another task, including the
    /// `Subscribing` phase while [`activate`](Self::activate) is pending.
    /// Channel drops are not published here; see
    /// [`Coordinator::connection_errors`].
    pub fn watch_state(&self) -> watch::Receiver<HandleState> {
        self.state.subscribe()
    }

    pub fn handle(&self) -> Option<&SubscriptionHandle> {
        self.handle.as_ref()
    }

    /// Subscribe `listener` to `topic` for as long as this unit is active.
    ///
    /// Activating an already-active binding releases the previous
    /// subscription first. If the returned future is dropped before it
    /// completes, the binding returns to `Unbound` and the coordinator
    /// withdraws the pending request.
    pub async fn activate(
        &mut self,
        topic: Topic,
        listener: Listener,
    ) -> Result<(), ConnectionError> {
        if self.handle.is_some() {
            debug!(topic = %topic, "re-activating bound unit, releasing previous subscription");
            self.deactivate();
        }

        self.state.send_replace(HandleState::Subscribing);
        let mut guard = ActivationGuard {
            state: &self.state,
            done: false,
        };

        let result = self.coordinator.subscribe(topic, listener).await;
        guard.done = true;
        match result {
            Ok(handle) => {
                self.handle = Some(handle);
                self.state.send_replace(HandleState::Active);
                Ok(())
            }
            Err(err) => {
                self.state.send_replace(HandleState::Unbound);
                Err(err)
            }
        }
    }

    /// Release the subscription. Runs the release at most once per
    /// activation; returns whether a release happened.
    pub fn deactivate(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            if *self.state.borrow() == HandleState::Subscribing {
                self.state.send_replace(HandleState::Unbound);
            }
            return false;
        };

        self.state.send_replace(HandleState::Releasing);
        match self.coordinator.release_bound(&handle) {
            Ok(true) => {}
            Ok(false) => debug!(handle = %handle, "subscription already flushed by teardown"),
            Err(misuse) => debug!(handle = %handle, code = misuse.error_code(), "release rejected"),
        }
        self.state.send_replace(HandleState::Released);
        true
    }
}

impl<T: Transport> Drop for UnitBinding<T> {
    fn drop(&mut self) {
        self.deactivate();
    }
}
