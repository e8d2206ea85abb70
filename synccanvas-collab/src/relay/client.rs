//! WebSocket transport for connecting sessions to a relay server.
//!
//! Provides:
//! - Subscription handshake (`Subscribe` → `Subscribed` | `Rejected`)
//! - Command forwarding (track, untrack, broadcast, unsubscribe)
//! - A single reconnect-and-resubscribe attempt after connection loss
//!
//! Commands issued while disconnected are dropped, not replayed: broadcasts
//! are ephemeral and the session re-tracks presence once the transport
//! reports the subscription established again.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::channel::{ChannelCommand, ChannelError, ChannelEvent, ChannelLink, LinkEndpoint, Transport};
use crate::protocol::Frame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How a connection ended.
#[derive(Debug, PartialEq)]
enum LinkOutcome {
    /// The channel left the topic or went away.
    Unsubscribed,
    /// The socket dropped.
    Lost,
    /// The relay withdrew the subscription.
    Rejected(String),
}

/// [`Transport`] over a WebSocket connection to a relay server.
#[derive(Debug, Clone)]
pub struct RelayTransport {
    url: String,
    reconnect_delay: Duration,
}

impl RelayTransport {
    /// Transport for the relay at `url` (e.g. `ws://127.0.0.1:9090`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: Duration::from_secs(1),
        }
    }

    /// Wait before the reconnect attempt.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    /// Connect and complete the subscription handshake.
    async fn connect(&self, topic: &str) -> Result<WsStream, ChannelError> {
        let (mut ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        let subscribe = Frame::Subscribe { topic: topic.to_string() }.encode()?;
        ws.send(Message::Binary(subscribe.into()))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => match Frame::decode(&data)? {
                    Frame::Subscribed { .. } => {
                        log::info!("Subscribed to {topic} via {}", self.url);
                        return Ok(ws);
                    }
                    Frame::Rejected { reason } => return Err(ChannelError::Rejected(reason)),
                    other => log::debug!("Ignoring {other:?} before subscription"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ChannelError::Connect("connection closed during handshake".into()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ChannelError::Transport(e.to_string())),
            }
        }
    }

    /// Drive one subscription across at most one reconnect per loss.
    async fn run(self, topic: String, mut ws: WsStream, mut endpoint: LinkEndpoint) {
        let _ = endpoint.events.send(ChannelEvent::Subscribed);

        loop {
            match pump(ws, &mut endpoint).await {
                LinkOutcome::Unsubscribed => {
                    log::debug!("Left {topic}");
                    return;
                }
                LinkOutcome::Rejected(reason) => {
                    log::warn!("Relay dropped subscription to {topic}: {reason}");
                    let _ = endpoint.events.send(ChannelEvent::Closed);
                    return;
                }
                LinkOutcome::Lost => {
                    log::warn!("Lost connection for {topic}, reconnecting in {:?}", self.reconnect_delay);
                    if endpoint.events.send(ChannelEvent::Reconnecting).is_err() {
                        return;
                    }
                    tokio::time::sleep(self.reconnect_delay).await;

                    match self.connect(&topic).await {
                        Ok(new_ws) => {
                            if !drain_stale(&mut endpoint) {
                                return;
                            }
                            ws = new_ws;
                            let _ = endpoint.events.send(ChannelEvent::Subscribed);
                        }
                        Err(e) => {
                            log::warn!("Resubscribe to {topic} failed: {e}");
                            let _ = endpoint.events.send(ChannelEvent::Closed);
                            return;
                        }
                    }
                }
            }
        }
    }
}

impl Transport for RelayTransport {
    async fn subscribe(&self, topic: &str) -> Result<ChannelLink, ChannelError> {
        let ws = self.connect(topic).await?;
        let (link, endpoint) = ChannelLink::pair();
        tokio::spawn(self.clone().run(topic.to_string(), ws, endpoint));
        Ok(link)
    }
}

/// Discard commands queued while disconnected. Returns false if the channel
/// asked to leave in the meantime.
fn drain_stale(endpoint: &mut LinkEndpoint) -> bool {
    let mut dropped = 0usize;
    loop {
        match endpoint.commands.try_recv() {
            Ok(ChannelCommand::Unsubscribe) | Err(TryRecvError::Disconnected) => return false,
            Ok(_) => dropped += 1,
            Err(TryRecvError::Empty) => break,
        }
    }
    if dropped > 0 {
        log::debug!("Dropped {dropped} command(s) issued while disconnected");
    }
    true
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<(), ChannelError> {
    let bytes = frame.encode()?;
    sink.send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| ChannelError::Transport(e.to_string()))
}

/// Forward commands and frames until the connection ends.
async fn pump(ws: WsStream, endpoint: &mut LinkEndpoint) -> LinkOutcome {
    let (mut sink, mut source): (WsSink, WsSource) = ws.split();

    loop {
        tokio::select! {
            command = endpoint.commands.recv() => {
                let frame = match command {
                    Some(ChannelCommand::Track(entry)) => Frame::Track { entry },
                    Some(ChannelCommand::Untrack) => Frame::Untrack,
                    Some(ChannelCommand::Send(message)) => Frame::Broadcast { message },
                    Some(ChannelCommand::Unsubscribe) | None => {
                        let _ = send_frame(&mut sink, &Frame::Unsubscribe).await;
                        let _ = sink.close().await;
                        return LinkOutcome::Unsubscribed;
                    }
                };
                if let Err(e) = send_frame(&mut sink, &frame).await {
                    log::warn!("Send failed: {e}");
                    return LinkOutcome::Lost;
                }
            }

            msg = source.next() => {
                let event = match msg {
                    Some(Ok(Message::Binary(data))) => match Frame::decode(&data) {
                        Ok(Frame::Broadcast { message }) => ChannelEvent::Broadcast(message),
                        Ok(Frame::PresenceSync { state }) => ChannelEvent::PresenceSync(state),
                        Ok(Frame::Rejected { reason }) => return LinkOutcome::Rejected(reason),
                        Ok(other) => {
                            log::debug!("Ignoring unexpected frame from relay: {other:?}");
                            continue;
                        }
                        Err(e) => {
                            log::warn!("Dropping undecodable frame from relay: {e}");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => return LinkOutcome::Lost,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {e}");
                        return LinkOutcome::Lost;
                    }
                };
                if endpoint.events.send(event).is_err() {
                    // Nobody is listening any more.
                    let _ = send_frame(&mut sink, &Frame::Unsubscribe).await;
                    let _ = sink.close().await;
                    return LinkOutcome::Unsubscribed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accept one WebSocket, answer its Subscribe with `reply`, then hand
    /// the socket back.
    async fn accept_and_reply(listener: &TcpListener, reply: Frame) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                assert!(matches!(Frame::decode(&data).unwrap(), Frame::Subscribe { .. }));
            }
            other => panic!("expected Subscribe, got {other:?}"),
        }
        ws.send(Message::Binary(reply.encode().unwrap().into())).await.unwrap();
        ws
    }

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn test_rejected_handshake_is_error() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let _ws = accept_and_reply(&listener, Frame::Rejected { reason: "full".into() }).await;
        });

        let result = RelayTransport::new(url).subscribe("document:1").await;
        assert!(matches!(result, Err(ChannelError::Rejected(reason)) if reason == "full"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, url) = listener().await;
        drop(listener);
        let result = RelayTransport::new(url).subscribe("document:1").await;
        assert!(matches!(result, Err(ChannelError::Connect(_))));
    }

    #[tokio::test]
    async fn test_reconnects_once_then_resubscribes() {
        let (listener, url) = listener().await;
        let transport = RelayTransport::new(url).with_reconnect_delay(Duration::from_millis(20));

        let server = tokio::spawn(async move {
            let ws = accept_and_reply(&listener, Frame::Subscribed { topic: "document:1".into() }).await;
            drop(ws);
            let mut ws = accept_and_reply(&listener, Frame::Subscribed { topic: "document:1".into() }).await;
            // Keep the second connection open until the client leaves.
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Binary(data) = msg {
                    if Frame::decode(&data).unwrap() == Frame::Unsubscribe {
                        break;
                    }
                }
            }
        });

        let mut link = transport.subscribe("document:1").await.unwrap();
        assert_eq!(link.events.recv().await, Some(ChannelEvent::Subscribed));
        assert_eq!(link.events.recv().await, Some(ChannelEvent::Reconnecting));
        assert_eq!(link.events.recv().await, Some(ChannelEvent::Subscribed));

        link.commands.send(ChannelCommand::Unsubscribe).unwrap();
        tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_reconnect_reports_closed() {
        let (listener, url) = listener().await;
        let transport = RelayTransport::new(url).with_reconnect_delay(Duration::from_millis(100));

        let server = tokio::spawn(async move {
            let ws = accept_and_reply(&listener, Frame::Subscribed { topic: "document:1".into() }).await;
            drop(ws);
            // Listener goes away with the task, so the retry is refused.
        });

        let mut link = transport.subscribe("document:1").await.unwrap();
        server.await.unwrap();

        assert_eq!(link.events.recv().await, Some(ChannelEvent::Subscribed));
        assert_eq!(link.events.recv().await, Some(ChannelEvent::Reconnecting));
        assert_eq!(link.events.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(link.events.recv().await, None);
    }

    #[test]
    fn test_drain_stale_stops_on_unsubscribe() {
        let (link, mut endpoint) = ChannelLink::pair();
        link.commands.send(ChannelCommand::Untrack).unwrap();
        assert!(drain_stale(&mut endpoint));

        link.commands.send(ChannelCommand::Untrack).unwrap();
        link.commands.send(ChannelCommand::Unsubscribe).unwrap();
        assert!(!drain_stale(&mut endpoint));
    }
}
