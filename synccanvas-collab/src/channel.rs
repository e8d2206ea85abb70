//! Per-document broadcast channel with presence.
//!
//! A [`Channel`] is the client half of one topic subscription. The transport
//! half lives behind a [`ChannelLink`]: commands flow out (track, untrack,
//! send, unsubscribe) and events flow in (status, presence sync, broadcast).
//!
//! ```text
//!            ChannelSender ──► commands ──►┐
//!  Channel                                 │  Transport (Hub, RelayTransport, …)
//!   handlers ◄── dispatcher ◄── events ◄───┘
//! ```
//!
//! Handlers are registered before or after [`Channel::subscribe`] and run on
//! the dispatcher task, one event at a time, in receipt order. They must not
//! register or dispose handlers of the same channel from inside a callback.

use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::presence::{PresenceEntry, PresenceState};
use crate::protocol::{BroadcastMessage, ProtocolError};

/// Outgoing request from a channel to its transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCommand {
    Track(PresenceEntry),
    Untrack,
    Send(BroadcastMessage),
    Unsubscribe,
}

/// Incoming notification from a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Subscription established (first time or after a reconnect).
    Subscribed,
    /// Connection lost; the transport is trying to resubscribe.
    Reconnecting,
    PresenceSync(PresenceState),
    Broadcast(BroadcastMessage),
    /// Transport gave up. No further events follow.
    Closed,
}

/// Subscription status as seen by status handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Reconnecting,
    Closed,
}

/// Client half of a transport subscription.
pub struct ChannelLink {
    pub commands: mpsc::UnboundedSender<ChannelCommand>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Transport half of a [`ChannelLink`].
pub struct LinkEndpoint {
    pub commands: mpsc::UnboundedReceiver<ChannelCommand>,
    pub events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelLink {
    /// Connected link and endpoint.
    pub fn pair() -> (ChannelLink, LinkEndpoint) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            ChannelLink { commands: command_tx, events: event_rx },
            LinkEndpoint { commands: command_rx, events: event_tx },
        )
    }
}

/// Topic-based publish/subscribe with presence.
///
/// Implementations must not deliver a subscriber's own broadcasts back to
/// it, and must send a full [`ChannelEvent::PresenceSync`] to every
/// subscriber after any presence change.
pub trait Transport: Send + Sync {
    fn subscribe(&self, topic: &str) -> impl Future<Output = Result<ChannelLink, ChannelError>> + Send;
}

/// Channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("subscription rejected: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("channel closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

type BroadcastHandler = Box<dyn Fn(&BroadcastMessage) + Send>;
type PresenceHandler = Box<dyn Fn(&PresenceState) + Send>;
type StatusHandler = Box<dyn Fn(ChannelStatus) + Send>;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    broadcast: BTreeMap<u64, (String, BroadcastHandler)>,
    presence: BTreeMap<u64, PresenceHandler>,
    status: BTreeMap<u64, StatusHandler>,
    closed: bool,
}

impl Handlers {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove(&mut self, id: u64) {
        self.broadcast.remove(&id);
        self.presence.remove(&id);
        self.status.remove(&id);
    }

    fn clear(&mut self) {
        self.broadcast.clear();
        self.presence.clear();
        self.status.clear();
    }

    fn dispatch(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::Broadcast(message) => {
                for (event, handler) in self.broadcast.values() {
                    if message.is(event) {
                        handler(message);
                    }
                }
            }
            ChannelEvent::PresenceSync(state) => {
                for handler in self.presence.values() {
                    handler(state);
                }
            }
            ChannelEvent::Subscribed => self.dispatch_status(ChannelStatus::Subscribed),
            ChannelEvent::Reconnecting => self.dispatch_status(ChannelStatus::Reconnecting),
            ChannelEvent::Closed => self.dispatch_status(ChannelStatus::Closed),
        }
    }

    fn dispatch_status(&self, status: ChannelStatus) {
        for handler in self.status.values() {
            handler(status);
        }
    }
}

fn lock(handlers: &Mutex<Handlers>) -> MutexGuard<'_, Handlers> {
    handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Disposer for a registered handler. Dropping it removes the handler.
#[must_use = "dropping a Subscription removes its handler"]
pub struct Subscription {
    handlers: Weak<Mutex<Handlers>>,
    id: u64,
}

impl Subscription {
    /// A subscription for a handler that was never registered.
    pub(crate) fn inert() -> Self {
        Self { handlers: Weak::new(), id: 0 }
    }

    /// Remove the handler now.
    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            lock(&handlers).remove(self.id);
        }
    }
}

/// Cloneable sending half of a channel.
#[derive(Clone)]
pub struct ChannelSender {
    commands: mpsc::UnboundedSender<ChannelCommand>,
}

impl ChannelSender {
    /// Fire-and-forget broadcast of `payload` as JSON under `event`.
    pub fn send<P: Serialize>(&self, event: &str, payload: &P) -> Result<(), ChannelError> {
        let message = BroadcastMessage::new(event, payload)?;
        self.send_message(message)
    }

    pub fn send_message(&self, message: BroadcastMessage) -> Result<(), ChannelError> {
        self.command(ChannelCommand::Send(message))
    }

    /// Announce presence. Transports hold the entry until the subscription
    /// is established.
    pub fn track(&self, entry: PresenceEntry) -> Result<(), ChannelError> {
        self.command(ChannelCommand::Track(entry))
    }

    pub fn untrack(&self) -> Result<(), ChannelError> {
        self.command(ChannelCommand::Untrack)
    }

    fn command(&self, command: ChannelCommand) -> Result<(), ChannelError> {
        self.commands.send(command).map_err(|_| ChannelError::Closed)
    }
}

/// One topic subscription and its registered handlers.
pub struct Channel {
    topic: String,
    handlers: Arc<Mutex<Handlers>>,
    sender: ChannelSender,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Channel {
    pub fn new(topic: impl Into<String>, link: ChannelLink) -> Self {
        Self {
            topic: topic.into(),
            handlers: Arc::new(Mutex::new(Handlers::default())),
            sender: ChannelSender { commands: link.commands },
            events: Some(link.events),
            dispatcher: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    /// Invoke `handler` for each received broadcast named `event`.
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&BroadcastMessage) + Send + 'static,
    {
        let mut handlers = lock(&self.handlers);
        let id = handlers.next_id();
        handlers.broadcast.insert(id, (event.to_string(), Box::new(handler)));
        self.subscription(id)
    }

    /// Invoke `handler` with the full presence set after every change.
    pub fn on_presence_sync<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PresenceState) + Send + 'static,
    {
        let mut handlers = lock(&self.handlers);
        let id = handlers.next_id();
        handlers.presence.insert(id, Box::new(handler));
        self.subscription(id)
    }

    pub fn on_status<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ChannelStatus) + Send + 'static,
    {
        let mut handlers = lock(&self.handlers);
        let id = handlers.next_id();
        handlers.status.insert(id, Box::new(handler));
        self.subscription(id)
    }

    fn subscription(&self, id: u64) -> Subscription {
        Subscription {
            handlers: Arc::downgrade(&self.handlers),
            id,
        }
    }

    /// Start delivering events to handlers. Events that arrived earlier are
    /// delivered first. Calling this twice has no effect.
    pub fn subscribe(&mut self) {
        let Some(events) = self.events.take() else {
            return;
        };
        let handlers = self.handlers.clone();
        let topic = self.topic.clone();
        self.dispatcher = Some(tokio::spawn(dispatch(events, handlers, topic)));
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.handlers).closed
    }

    /// Leave the topic. Once this returns no handler runs again. Broadcasts
    /// already handed to the transport are not recalled.
    pub fn unsubscribe(&mut self) {
        {
            let mut handlers = lock(&self.handlers);
            if handlers.closed {
                return;
            }
            handlers.closed = true;
            handlers.clear();
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
        self.events = None;
        let _ = self.sender.command(ChannelCommand::Unsubscribe);
        log::debug!("Unsubscribed from {}", self.topic);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

async fn dispatch(
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    handlers: Arc<Mutex<Handlers>>,
    topic: String,
) {
    while let Some(event) = events.recv().await {
        let handlers = lock(&handlers);
        if handlers.closed {
            return;
        }
        handlers.dispatch(&event);
        if event == ChannelEvent::Closed {
            return;
        }
    }

    // Transport dropped its endpoint without saying goodbye.
    let handlers = lock(&handlers);
    if !handlers.closed {
        log::warn!("Transport for {topic} went away");
        handlers.dispatch_status(ChannelStatus::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_on_filters_by_event_name() {
        let (link, endpoint) = ChannelLink::pair();
        let mut channel = Channel::new("document:x", link);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = channel.on("cursor_move", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        channel.subscribe();

        let other = BroadcastMessage { event: "document_change".into(), payload: "{}".into() };
        let cursor = BroadcastMessage { event: "cursor_move".into(), payload: "{}".into() };
        endpoint.events.send(ChannelEvent::Broadcast(other)).unwrap();
        endpoint.events.send(ChannelEvent::Broadcast(cursor)).unwrap();
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_delivery() {
        let (link, endpoint) = ChannelLink::pair();
        let mut channel = Channel::new("document:x", link);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sub = channel.on_presence_sync(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        channel.subscribe();

        endpoint.events.send(ChannelEvent::PresenceSync(PresenceState::new())).unwrap();
        settle().await;
        sub.dispose();
        endpoint.events.send(ChannelEvent::PresenceSync(PresenceState::new())).unwrap();
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_before_subscribe_are_buffered() {
        let (link, endpoint) = ChannelLink::pair();
        endpoint.events.send(ChannelEvent::Subscribed).unwrap();

        let mut channel = Channel::new("document:x", link);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let _sub = channel.on_status(move |status| log.lock().unwrap().push(status));
        channel.subscribe();
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![ChannelStatus::Subscribed]);
    }

    #[tokio::test]
    async fn test_sender_emits_commands() {
        let (link, mut endpoint) = ChannelLink::pair();
        let channel = Channel::new("document:x", link);
        let sender = channel.sender();
        let entry = PresenceEntry::new(Identity::new(Uuid::new_v4(), "Alice", "a@example.com"));

        sender.track(entry.clone()).unwrap();
        sender.send("cursor_move", &serde_json::json!({ "pos": 1 })).unwrap();
        sender.untrack().unwrap();

        assert_eq!(endpoint.commands.recv().await, Some(ChannelCommand::Track(entry)));
        match endpoint.commands.recv().await {
            Some(ChannelCommand::Send(message)) => {
                assert_eq!(message.event, "cursor_move");
                assert_eq!(message.payload, r#"{"pos":1}"#);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(endpoint.commands.recv().await, Some(ChannelCommand::Untrack));
    }

    #[tokio::test]
    async fn test_unsubscribe_silences_handlers_and_notifies_transport() {
        let (link, mut endpoint) = ChannelLink::pair();
        let mut channel = Channel::new("document:x", link);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = channel.on_presence_sync(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        channel.subscribe();
        channel.unsubscribe();
        channel.unsubscribe();

        let _ = endpoint.events.send(ChannelEvent::PresenceSync(PresenceState::new()));
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(channel.is_closed());
        assert_eq!(endpoint.commands.recv().await, Some(ChannelCommand::Unsubscribe));
        assert!(matches!(channel.sender().untrack(), Ok(()) | Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_endpoint_drop_reports_closed() {
        let (link, endpoint) = ChannelLink::pair();
        let mut channel = Channel::new("document:x", link);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let _sub = channel.on_status(move |status| log.lock().unwrap().push(status));
        channel.subscribe();

        drop(endpoint);
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![ChannelStatus::Closed]);
        assert!(matches!(channel.sender().untrack(), Err(ChannelError::Closed)));
    }
}
