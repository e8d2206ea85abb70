//! WebSocket relay with topic-based routing and presence.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── Topic (document:<id>) ── PresenceRegistry
//!             ├── RelayServer ──┤          │
//! Client B ──┘                 │          └── broadcast fan-out
//!                              │                 │
//!                              │      ┌──────────┼───────────┐
//!                              │      ▼          ▼           ▼
//!                              │   Client A   Client B    Client C
//!                              └── Hub (one topic per document)
//! ```
//!
//! A connection holds at most one topic. Its presence entry lives exactly as
//! long as the connection does: `Unsubscribe`, a close frame or a dropped
//! socket all untrack it and publish a fresh full sync.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::hub::{Hub, Topic, TopicMessage};
use crate::protocol::{Frame, ProtocolError};

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum subscribers per topic
    pub max_subscribers_per_topic: usize,
    /// Broadcast channel capacity per topic
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_subscribers_per_topic: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_topics: usize,
}

/// Errors that end a relay connection.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

type TopicLink = (Arc<Topic>, broadcast::Receiver<Arc<TopicMessage>>);

/// The relay server. Clones share the same hub and statistics.
#[derive(Clone)]
pub struct RelayServer {
    config: RelayConfig,
    hub: Hub,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    /// Create a new relay with the given configuration.
    pub fn new(config: RelayConfig) -> Self {
        let hub = Hub::new(config.broadcast_capacity).with_max_subscribers(config.max_subscribers_per_topic);
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Bind to the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), RelayError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let subscriber = Uuid::new_v4();
        let mut subscription: Option<TopicLink> = None;

        let result = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = self.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }

                                let frame = match Frame::decode(&data) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        continue;
                                    }
                                };

                                let replies = self.handle_frame(frame, subscriber, &mut subscription).await;
                                for reply in replies {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Outgoing topic message
                    msg = async {
                        if let Some((_, ref mut rx)) = subscription {
                            rx.recv().await
                        } else {
                            // No topic yet, wait forever
                            std::future::pending().await
                        }
                    } => {
                        let frame = match msg {
                            Ok(message) => match &*message {
                                TopicMessage::Broadcast { origin, .. } if *origin == subscriber => continue,
                                TopicMessage::Broadcast { message, .. } => Frame::Broadcast { message: message.clone() },
                                TopicMessage::PresenceSync(state) => Frame::PresenceSync { state: state.clone() },
                            },
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Subscriber {subscriber} ({addr}) lagged by {n} messages");
                                if let Some((topic, _)) = &subscription {
                                    topic.record_dropped(n);
                                }
                                continue;
                            }
                            Err(RecvError::Closed) => break,
                        };
                        ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                    }
                }
            }
            Ok::<(), RelayError>(())
        }
        .await;

        // Cleanup: leave the topic, which untracks presence
        if let Some((topic, _)) = subscription.take() {
            self.hub.leave(topic.name(), &subscriber).await;
        }

        let topic_count = self.hub.topic_count().await;
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_topics = topic_count;
        }

        result
    }

    /// Apply one client frame. Returns the frames to send back.
    async fn handle_frame(
        &self,
        frame: Frame,
        subscriber: Uuid,
        subscription: &mut Option<TopicLink>,
    ) -> Vec<Frame> {
        match frame {
            Frame::Subscribe { topic } => {
                if subscription.is_some() {
                    return vec![Frame::Rejected { reason: "already subscribed".into() }];
                }
                match self.hub.join(&topic, subscriber).await {
                    Ok(joined) => {
                        log::info!("Subscriber {subscriber} joined {topic}");
                        *subscription = Some((joined.topic, joined.receiver));
                        let topic_count = self.hub.topic_count().await;
                        self.stats.write().await.active_topics = topic_count;
                        vec![Frame::Subscribed { topic }, Frame::PresenceSync { state: joined.presence }]
                    }
                    Err(e) => {
                        log::warn!("Rejected subscriber {subscriber}: {e}");
                        vec![Frame::Rejected { reason: e.to_string() }]
                    }
                }
            }

            Frame::Track { entry } => {
                if let Some((topic, _)) = subscription {
                    topic.track(subscriber, entry).await;
                }
                Vec::new()
            }

            Frame::Untrack => {
                if let Some((topic, _)) = subscription {
                    topic.untrack(&subscriber).await;
                }
                Vec::new()
            }

            Frame::Broadcast { message } => {
                if let Some((topic, _)) = subscription {
                    log::trace!("{} from {subscriber} on {}", message.event, topic.name());
                    topic.publish(subscriber, message);
                }
                Vec::new()
            }

            Frame::Unsubscribe => {
                if let Some((topic, _)) = subscription.take() {
                    self.hub.leave(topic.name(), &subscriber).await;
                    log::info!("Subscriber {subscriber} left {}", topic.name());
                }
                Vec::new()
            }

            other => {
                log::debug!("Ignoring unexpected frame from client: {other:?}");
                Vec::new()
            }
        }
    }
}
