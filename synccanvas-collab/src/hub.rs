//! In-process topic hub: fan-out plus authoritative presence per topic.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers of a
//! topic. Each subscriber gets an independent receiver that buffers up to
//! `capacity` messages; a subscriber that falls further behind loses the
//! oldest messages instead of slowing the sender down.
//!
//! The hub is both a [`Transport`] for sessions living in the same process
//! and the routing core of the WebSocket relay server.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::channel::{ChannelCommand, ChannelError, ChannelEvent, ChannelLink, LinkEndpoint, Transport};
use crate::presence::{PresenceEntry, PresenceRegistry, PresenceState};
use crate::protocol::BroadcastMessage;

/// What a topic fans out.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicMessage {
    /// A subscriber's broadcast. Receivers skip their own `origin`.
    Broadcast { origin: Uuid, message: BroadcastMessage },
    /// Full presence set after a change.
    PresenceSync(PresenceState),
}

/// Statistics for monitoring topic health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers: usize,
    pub present_users: usize,
}

/// Atomic counters, updated without taking the topic lock.
#[derive(Default)]
struct AtomicTopicStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

#[derive(Default)]
struct Members {
    subscribers: HashSet<Uuid>,
    presence: PresenceRegistry,
}

/// One document topic.
pub struct Topic {
    name: String,
    sender: broadcast::Sender<Arc<TopicMessage>>,
    members: RwLock<Members>,
    capacity: usize,
    stats: AtomicTopicStats,
}

impl Topic {
    /// Create a topic buffering up to `capacity` messages per subscriber.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            sender,
            members: RwLock::new(Members::default()),
            capacity,
            stats: AtomicTopicStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish a subscriber's broadcast. Returns the number of receivers
    /// (including the origin, which filters itself out).
    pub fn publish(&self, origin: Uuid, message: BroadcastMessage) -> usize {
        let count = self
            .sender
            .send(Arc::new(TopicMessage::Broadcast { origin, message }))
            .unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Track presence for a subscriber and publish the new full set.
    pub async fn track(&self, subscriber: Uuid, entry: PresenceEntry) {
        let mut members = self.members.write().await;
        if !members.subscribers.contains(&subscriber) {
            log::warn!("Ignoring track from non-subscriber {subscriber} on {}", self.name);
            return;
        }
        log::info!("{} ({}) is present on {}", entry.identity.display_name, entry.user_id(), self.name);
        members.presence.track(subscriber, entry);
        // Published under the lock so syncs leave in the order changes happen.
        self.publish_presence(&members);
    }

    /// Withdraw a subscriber's presence. Publishes only if it was tracked.
    pub async fn untrack(&self, subscriber: &Uuid) {
        let mut members = self.members.write().await;
        if let Some(entry) = members.presence.untrack(subscriber) {
            log::info!("{} left presence on {}", entry.user_id(), self.name);
            self.publish_presence(&members);
        }
    }

    fn publish_presence(&self, members: &Members) {
        let _ = self
            .sender
            .send(Arc::new(TopicMessage::PresenceSync(members.presence.state())));
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Current presence set.
    pub async fn presence(&self) -> PresenceState {
        self.members.read().await.presence.state()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.members.read().await.subscribers.len()
    }

    /// Count messages a lagging receiver lost.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn stats(&self) -> TopicStats {
        let members = self.members.read().await;
        TopicStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            subscribers: members.subscribers.len(),
            present_users: members.presence.state().len(),
        }
    }
}

/// Result of joining a topic.
pub struct Joined {
    pub topic: Arc<Topic>,
    pub receiver: broadcast::Receiver<Arc<TopicMessage>>,
    /// Presence at the moment `receiver` was created. Every later change
    /// arrives through `receiver`.
    pub presence: PresenceState,
}

/// Hub errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HubError {
    #[error("topic {topic} is full ({limit} subscribers)")]
    TopicFull { topic: String, limit: usize },
}

/// Topic registry: maps topic names to topics.
///
/// Cloning is cheap and clones share the same topics.
#[derive(Clone)]
pub struct Hub {
    topics: Arc<RwLock<HashMap<String, Arc<Topic>>>>,
    default_capacity: usize,
    max_subscribers: usize,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Hub {
    /// Create a hub whose topics buffer `default_capacity` messages per
    /// subscriber, with no subscriber limit.
    pub fn new(default_capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
            max_subscribers: usize::MAX,
        }
    }

    /// Limit subscribers per topic for [`Transport::subscribe`].
    pub fn with_max_subscribers(mut self, max_subscribers: usize) -> Self {
        self.max_subscribers = max_subscribers;
        self
    }

    /// Get or create a topic.
    pub async fn get_or_create(&self, name: &str) -> Arc<Topic> {
        // Fast path: read lock
        {
            let topics = self.topics.read().await;
            if let Some(topic) = topics.get(name) {
                return topic.clone();
            }
        }

        // Slow path: write lock to create
        let mut topics = self.topics.write().await;
        // Double-check after acquiring write lock
        if let Some(topic) = topics.get(name) {
            return topic.clone();
        }

        let topic = Arc::new(Topic::new(name, self.default_capacity));
        topics.insert(name.to_string(), topic.clone());
        topic
    }

    /// Add `subscriber` to topic `name`, creating the topic if needed.
    pub async fn join(&self, name: &str, subscriber: Uuid) -> Result<Joined, HubError> {
        self.join_with_limit(name, subscriber, self.max_subscribers).await
    }

    /// Like [`join`](Self::join) with an explicit subscriber limit.
    pub async fn join_with_limit(&self, name: &str, subscriber: Uuid, limit: usize) -> Result<Joined, HubError> {
        // Held across the join so a concurrent leave cannot drop the topic
        // between lookup and insertion.
        let mut topics = self.topics.write().await;
        let topic = topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(name, self.default_capacity)))
            .clone();

        let mut members = topic.members.write().await;
        if members.subscribers.len() >= limit && !members.subscribers.contains(&subscriber) {
            let is_empty = members.subscribers.is_empty();
            drop(members);
            if is_empty {
                topics.remove(name);
            }
            return Err(HubError::TopicFull { topic: name.to_string(), limit });
        }
        members.subscribers.insert(subscriber);
        let receiver = topic.sender.subscribe();
        let presence = members.presence.state();
        drop(members);

        log::debug!("Subscriber {subscriber} joined {name}");
        Ok(Joined { topic, receiver, presence })
    }

    /// Remove `subscriber` from topic `name`, untracking its presence.
    /// Empty topics are removed. Returns true if the topic was removed.
    pub async fn leave(&self, name: &str, subscriber: &Uuid) -> bool {
        let mut topics = self.topics.write().await;
        let Some(topic) = topics.get(name).cloned() else {
            return false;
        };

        let mut members = topic.members.write().await;
        members.subscribers.remove(subscriber);
        if let Some(entry) = members.presence.untrack(subscriber) {
            log::info!("{} left presence on {name}", entry.user_id());
            topic.publish_presence(&members);
        }
        let now_empty = members.subscribers.is_empty();
        drop(members);

        log::debug!("Subscriber {subscriber} left {name}");
        if now_empty {
            topics.remove(name);
            log::debug!("Removed empty topic {name}");
        }
        now_empty
    }

    pub async fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.read().await.get(name).cloned()
    }

    /// Get the number of active topics.
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    /// Get all active topic names.
    pub async fn active_topics(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }
}

impl Transport for Hub {
    async fn subscribe(&self, topic: &str) -> Result<ChannelLink, ChannelError> {
        let subscriber = Uuid::new_v4();
        let joined = self
            .join(topic, subscriber)
            .await
            .map_err(|e| ChannelError::Rejected(e.to_string()))?;

        let (link, endpoint) = ChannelLink::pair();
        tokio::spawn(run_link(self.clone(), subscriber, joined, endpoint));
        Ok(link)
    }
}

/// Pump one in-process subscription until either side goes away.
async fn run_link(hub: Hub, subscriber: Uuid, joined: Joined, mut endpoint: LinkEndpoint) {
    let Joined { topic, mut receiver, presence } = joined;
    let _ = endpoint.events.send(ChannelEvent::Subscribed);
    let _ = endpoint.events.send(ChannelEvent::PresenceSync(presence));

    loop {
        tokio::select! {
            command = endpoint.commands.recv() => {
                match command {
                    Some(ChannelCommand::Track(entry)) => topic.track(subscriber, entry).await,
                    Some(ChannelCommand::Untrack) => topic.untrack(&subscriber).await,
                    Some(ChannelCommand::Send(message)) => {
                        topic.publish(subscriber, message);
                    }
                    Some(ChannelCommand::Unsubscribe) | None => break,
                }
            }

            received = receiver.recv() => {
                let event = match received {
                    Ok(message) => match &*message {
                        TopicMessage::Broadcast { origin, .. } if *origin == subscriber => continue,
                        TopicMessage::Broadcast { message, .. } => ChannelEvent::Broadcast(message.clone()),
                        TopicMessage::PresenceSync(state) => ChannelEvent::PresenceSync(state.clone()),
                    },
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Subscriber {subscriber} on {} lagged by {n} messages", topic.name());
                        topic.record_dropped(n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if endpoint.events.send(event).is_err() {
                    break;
                }
            }
        }
    }

    hub.leave(topic.name(), &subscriber).await;
}
