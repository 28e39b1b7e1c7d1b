//! WebSocket transport: one socket, many Phoenix channels.
//!
//! A background task owns the socket. Opening a channel sends a `Join`
//! command and waits for the server's reply; closing sends `Leave`. Inbound
//! change frames are routed to the joined channel's event stream by wire
//! topic. When the socket ends every event stream is dropped, which the
//! coordinator sees as the channels going away.

use std::collections::HashMap;
use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use rally_realtime::transport::DEFAULT_EVENT_CAPACITY;
use rally_realtime::{ChangeEvent, Connection, OpenedChannel, Topic, Transport, TransportError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::phoenix::{self, ChannelSpec, Frame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Commands ────────────────────────────────────────────────────────────────

enum Command {
    Join {
        topic: Topic,
        events: mpsc::Sender<ChangeEvent>,
        reply: oneshot::Sender<Result<String, TransportError>>,
    },
    Leave {
        wire: String,
        join_ref: String,
    },
}

// ── Transport handle ────────────────────────────────────────────────────────

pub struct WsTransport {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl WsTransport {
    /// Dial the endpoint and spawn the connection task.
    pub async fn connect(endpoint: &EndpointConfig) -> anyhow::Result<Self> {
        let url = endpoint.socket_url();
        let (socket, response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        info!(url = %endpoint.url, status = %response.status(), "Realtime socket connected");

        let (commands, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let heartbeat = endpoint.heartbeat_interval().map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        tokio::spawn(connection_task(
            socket,
            rx,
            heartbeat,
            endpoint.api_key.clone(),
            shutdown.clone(),
        ));

        Ok(Self { commands, shutdown })
    }

    /// Close the socket. Open channels see their event streams end.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Transport for WsTransport {
    type Connection = WsChannel;

    fn open_channel(
        &self,
        topic: &Topic,
    ) -> impl Future<Output = Result<OpenedChannel<WsChannel>, TransportError>> + Send {
        let commands = self.commands.clone();
        let topic = topic.clone();
        async move {
            let (events_tx, events) = mpsc::channel(DEFAULT_EVENT_CAPACITY);
            let (reply, reply_rx) = oneshot::channel();
            commands
                .send(Command::Join {
                    topic: topic.clone(),
                    events: events_tx,
                    reply,
                })
                .map_err(|_| TransportError::Closed)?;

            let join_ref = reply_rx.await.map_err(|_| TransportError::Closed)??;
            Ok(OpenedChannel {
                connection: WsChannel {
                    wire: phoenix::wire_topic(&topic),
                    join_ref,
                    commands,
                },
                events,
            })
        }
    }
}

/// A joined channel. Closing it leaves the channel on the server.
pub struct WsChannel {
    wire: String,
    join_ref: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl Connection for WsChannel {
    fn close(self) {
        let _ = self.commands.send(Command::Leave {
            wire: self.wire,
            join_ref: self.join_ref,
        });
    }
}

// ── Connection task ─────────────────────────────────────────────────────────

struct Joined {
    topic: Topic,
    spec: ChannelSpec,
    join_ref: String,
    events: mpsc::Sender<ChangeEvent>,
    /// Present until the server answers the join
    reply: Option<oneshot::Sender<Result<String, TransportError>>>,
}

struct Session {
    socket: Socket,
    channels: HashMap<String, Joined>,
    access_token: Option<String>,
    next_ref: u64,
}

impl Session {
    fn make_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(frame).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn leave(&mut self, wire: &str, join_ref: &str) {
        let reference = self.make_ref();
        if let Err(e) = self.send(&Frame::leave(wire, &reference, join_ref)).await {
            warn!(topic = %wire, "Failed to send leave: {}", e);
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join {
                topic,
                events,
                reply,
            } => {
                let wire = phoenix::wire_topic(&topic);
                let join_ref = self.make_ref();
                let frame = Frame::join(&topic, &join_ref, self.access_token.as_deref());
                if let Err(e) = self.send(&frame).await {
                    let _ = reply.send(Err(e));
                    return;
                }
                debug!(topic = %topic, join_ref = %join_ref, "Join sent");
                self.channels.insert(
                    wire,
                    Joined {
                        spec: ChannelSpec::parse(&topic),
                        topic,
                        join_ref,
                        events,
                        reply: Some(reply),
                    },
                );
            }
            Command::Leave { wire, join_ref } => {
                let current = self
                    .channels
                    .get(&wire)
                    .is_some_and(|joined| joined.join_ref == join_ref);
                if current {
                    self.channels.remove(&wire);
                    self.leave(&wire, &join_ref).await;
                    debug!(topic = %wire, "Left channel");
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame.event.as_str() {
            phoenix::EVENT_REPLY => self.handle_reply(frame).await,
            phoenix::EVENT_ERROR | phoenix::EVENT_CLOSE => {
                let ours = self.channels.get(&frame.topic).is_some_and(|joined| {
                    frame.join_ref.is_none() || frame.join_ref.as_deref() == Some(&joined.join_ref)
                });
                if !ours {
                    return;
                }
                if let Some(mut joined) = self.channels.remove(&frame.topic) {
                    warn!(topic = %joined.topic, event = %frame.event, "Channel closed by server");
                    if let Some(reply) = joined.reply.take() {
                        let _ = reply.send(Err(TransportError::Refused(frame.event.clone())));
                    }
                }
            }
            _ => {
                let Some(joined) = self.channels.get(&frame.topic) else {
                    return;
                };
                if joined.reply.is_some() {
                    return;
                }
                let Some(event) = phoenix::parse_change(&joined.topic, &joined.spec, &frame)
                else {
                    return;
                };
                match joined.events.try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(topic = %joined.topic, "Event stream full, dropping event");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(topic = %joined.topic, "Event stream receiver gone");
                    }
                }
            }
        }
    }

    async fn handle_reply(&mut self, frame: Frame) {
        let Some(joined) = self.channels.get_mut(&frame.topic) else {
            return;
        };
        if frame.reference.as_deref() != Some(joined.join_ref.as_str()) {
            return;
        }
        let Some(reply) = joined.reply.take() else {
            return;
        };

        let join_ref = joined.join_ref.clone();
        match frame.reply_status() {
            Ok(()) => {
                if reply.send(Ok(join_ref.clone())).is_err() {
                    // The opener gave up waiting; nobody owns this channel.
                    self.channels.remove(&frame.topic);
                    self.leave(&frame.topic, &join_ref).await;
                } else {
                    info!(topic = %frame.topic, "Channel joined");
                }
            }
            Err(reason) => {
                self.channels.remove(&frame.topic);
                warn!(topic = %frame.topic, reason = %reason, "Join refused");
                let _ = reply.send(Err(TransportError::Refused(reason)));
            }
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn connection_task(
    socket: Socket,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut heartbeat: Option<Interval>,
    access_token: Option<String>,
    shutdown: CancellationToken,
) {
    let mut session = Session {
        socket,
        channels: HashMap::new(),
        access_token,
        next_ref: 0,
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = session.socket.close(None).await;
                break;
            }
            command = commands.recv() => match command {
                Some(command) => session.handle_command(command).await,
                // Every handle and channel is gone.
                None => {
                    let _ = session.socket.close(None).await;
                    break;
                }
            },
            message = session.socket.next() => match message {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(text.as_str()) {
                    Ok(frame) => session.handle_frame(frame).await,
                    Err(e) => warn!("Unparseable frame: {}", e),
                },
                Some(Ok(Message::Close(close))) => {
                    info!(?close, "Realtime socket closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Realtime socket error: {}", e);
                    break;
                }
                None => break,
            },
            _ = next_tick(&mut heartbeat) => {
                let reference = session.make_ref();
                if let Err(e) = session.send(&Frame::heartbeat(&reference)).await {
                    warn!("Heartbeat failed: {}", e);
                    break;
                }
            }
        }
    }

    info!(
        channels = session.channels.len(),
        "Realtime connection task exiting"
    );
}
