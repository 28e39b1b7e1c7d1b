//! Rally Realtime - reference-counted live subscription management
//!
//! Many consumers (screens, widgets, watchers) want live change events for
//! overlapping topics. This crate multiplexes their interest onto at most one
//! transport channel per topic, opens the channel for the first consumer,
//! closes it after the last one leaves, and flushes everything on
//! process-wide teardown.
//!
//! It has no knowledge of any particular backend: transports plug in through
//! the [`Transport`] trait. [`LoopbackTransport`] is an in-memory
//! implementation.
//!
//! # Example
//!
//! ```no_run
//! use rally_realtime::{
//!     Coordinator, CoordinatorConfig, LifecycleBinder, LoopbackTransport, TeardownReason,
//!     Topic, listener,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coordinator = Coordinator::new(LoopbackTransport::new(), CoordinatorConfig::default());
//!     let binder = LifecycleBinder::new(coordinator);
//!
//!     // Flush every subscription on Ctrl-C
//!     binder.install_teardown(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!         TeardownReason::Shutdown
//!     })?;
//!
//!     // One binding per consumer: activate on mount...
//!     let mut inbox = binder.unit();
//!     let topic = Topic::builder("messages").filter("conversation_id", 42).build()?;
//!     inbox
//!         .activate(topic, listener(|event| {
//!             println!("{:?}: {}", event.kind, event.record);
//!             Ok(())
//!         }))
//!         .await?;
//!
//!     // ...and deactivate on unmount.
//!     inbox.deactivate();
//!     binder.remove_teardown();
//!     Ok(())
//! }
//! ```

mod config;
mod coordinator;
mod counter;
mod error;
mod event;
mod handle;
mod lifecycle;
pub mod loopback;
mod registry;
mod topic;
pub mod transport;

pub use config::{CoordinatorConfig, MisusePolicy};
pub use coordinator::Coordinator;
pub use counter::RefCounter;
pub use error::{ConnectionError, DispatchFailure, MisuseError, TopicError, TransportError};
pub use event::{ChangeEvent, ChangeKind};
pub use handle::{HandleId, HandleState, Listener, SubscriptionHandle, listener};
pub use lifecycle::{LifecycleBinder, TeardownReason, UnitBinding};
pub use loopback::LoopbackTransport;
pub use registry::{ChannelPhase, ChannelStats};
pub use topic::{Topic, TopicBuilder};
pub use transport::{Connection, OpenedChannel, Transport};
