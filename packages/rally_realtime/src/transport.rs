//! The transport collaborator.
//!
//! Only the channel registry talks to a [`Transport`]. Implementations hand
//! back one [`Connection`] per topic along with the receiving end of that
//! topic's event stream; the registry pumps the stream into listeners and
//! calls [`Connection::close`] when the last consumer goes away.

use std::future::Future;

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::event::ChangeEvent;
use crate::topic::Topic;

/// Default capacity for a channel's event stream
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A real-time messaging client able to open one channel per topic.
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    /// Establish a channel for `topic`. May involve an asynchronous handshake.
    fn open_channel(
        &self,
        topic: &Topic,
    ) -> impl Future<Output = Result<OpenedChannel<Self::Connection>, TransportError>> + Send;
}

/// A live channel on the transport.
pub trait Connection: Send + 'static {
    /// Tear the channel down. Must not block; implementations signal their
    /// background task and return.
    fn close(self);
}

/// Result of a successful [`Transport::open_channel`].
///
/// When `events` yields `None` while the registry still holds the
/// connection, the channel is treated as dropped by the transport.
pub struct OpenedChannel<C> {
    pub connection: C,
    pub events: mpsc::Receiver<ChangeEvent>,
}
