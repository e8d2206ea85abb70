//! Collaboration session: one client's attachment to one document.
//!
//! ```text
//!   Detached ── attach(doc, identity) ──► Subscribing ── Subscribed ──► Attached
//!      ▲                                      ▲                            │
//!      │                                      └──────── Reconnecting ──────┤
//!      └──────────────────────────── detach() ─────────────────────────────┘
//! ```
//!
//! A [`SessionHandle`] owns its channel and every handler it registered.
//! Presence is tracked each time the transport reports the subscription
//! established, so reconnects re-announce the local identity without help
//! from the caller. Incoming state is published through `watch` channels.

use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::channel::{Channel, ChannelError, ChannelSender, ChannelStatus, Subscription, Transport};
use crate::cursor::{RemoteCursor, RemoteCursorMap};
use crate::identity::{CursorColor, Identity};
use crate::presence::{self, PresenceEntry, PresenceState};
use crate::protocol::{self, BroadcastMessage, DocumentChange, DocumentChangeEvent, CURSOR_MOVE, DOCUMENT_CHANGE};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Detached,
    Subscribing,
    Attached,
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Debounce window for autosave, in milliseconds.
    pub autosave_delay_ms: u64,
    /// Only expose remote cursors of users in the latest presence sync.
    pub prune_departed_cursors: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autosave_delay_ms: 1500,
            prune_departed_cursors: true,
        }
    }
}

impl SessionConfig {
    pub fn autosave_delay(&self) -> Duration {
        Duration::from_millis(self.autosave_delay_ms)
    }
}

/// Last-seen cursors and the users of the latest presence sync, kept apart
/// so a cursor that arrives before its owner's presence is not lost.
#[derive(Default)]
struct CursorBook {
    seen: RemoteCursorMap,
    present: HashSet<Uuid>,
}

/// State shared between the handle and the channel handlers.
struct SessionShared {
    identity: Identity,
    document_id: Uuid,
    prune_departed_cursors: bool,
    sender: ChannelSender,
    state: watch::Sender<SessionState>,
    online_users: watch::Sender<Vec<Identity>>,
    remote_cursors: watch::Sender<Vec<RemoteCursor>>,
    cursors: Mutex<CursorBook>,
}

impl SessionShared {
    fn cursors(&self) -> MutexGuard<'_, CursorBook> {
        self.cursors.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_cursors(&self, book: &CursorBook) {
        let view = if self.prune_departed_cursors {
            book.seen.visible(&book.present)
        } else {
            book.seen.to_vec()
        };
        self.remote_cursors.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }

    fn apply_status(&self, status: ChannelStatus) {
        match status {
            ChannelStatus::Subscribed => {
                self.state.send_replace(SessionState::Attached);
                log::info!(
                    "{} attached to document {}",
                    self.identity.display_name,
                    self.document_id
                );
                if let Err(e) = self.sender.track(PresenceEntry::new(self.identity.clone())) {
                    log::warn!("Could not track presence on document {}: {e}", self.document_id);
                }
            }
            ChannelStatus::Reconnecting => {
                log::info!("Channel for document {} reconnecting", self.document_id);
                self.state.send_replace(SessionState::Subscribing);
            }
            ChannelStatus::Closed => {
                log::warn!("Channel for document {} closed by transport", self.document_id);
            }
        }
    }

    fn apply_presence(&self, state: &PresenceState) {
        let online = presence::others(state, self.identity.user_id);
        log::debug!("Presence on document {}: {} other user(s)", self.document_id, online.len());
        self.online_users.send_replace(online);

        let mut book = self.cursors();
        book.present = state.keys().copied().collect();
        self.publish_cursors(&book);
    }

    fn apply_cursor(&self, message: &BroadcastMessage) {
        let cursor: RemoteCursor = match message.decode_payload() {
            Ok(cursor) => cursor,
            Err(e) => {
                log::warn!("Dropping malformed cursor event on document {}: {e}", self.document_id);
                return;
            }
        };
        if cursor.user_id == self.identity.user_id {
            return;
        }
        log::trace!("Cursor of {} at {}", cursor.user_id, cursor.pos);

        let mut book = self.cursors();
        book.seen.upsert(cursor);
        self.publish_cursors(&book);
    }
}

/// A live attachment of one identity to one document.
///
/// Dropping the handle detaches it.
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    channel: Option<Channel>,
    subscriptions: Vec<Subscription>,
}

impl SessionHandle {
    /// Subscribe to the document's topic and start tracking presence once
    /// the subscription is established.
    ///
    /// Every attach draws a fresh cursor color; the color carried by
    /// `identity` is replaced. [`SessionHandle::identity`] returns the one in
    /// use.
    pub async fn attach<T: Transport>(
        transport: &T,
        document_id: Uuid,
        identity: Identity,
        config: &SessionConfig,
    ) -> Result<Self, ChannelError> {
        let identity = identity.with_color(CursorColor::random());
        let topic = protocol::topic_for(document_id);
        log::debug!("{} subscribing to {topic}", identity.display_name);
        let link = transport.subscribe(&topic).await?;
        let mut channel = Channel::new(topic, link);

        let shared = Arc::new(SessionShared {
            identity,
            document_id,
            prune_departed_cursors: config.prune_departed_cursors,
            sender: channel.sender(),
            state: watch::Sender::new(SessionState::Subscribing),
            online_users: watch::Sender::new(Vec::new()),
            remote_cursors: watch::Sender::new(Vec::new()),
            cursors: Mutex::new(CursorBook::default()),
        });

        let subscriptions = vec![
            channel.on_status({
                let shared = shared.clone();
                move |status| shared.apply_status(status)
            }),
            channel.on_presence_sync({
                let shared = shared.clone();
                move |state| shared.apply_presence(state)
            }),
            channel.on(CURSOR_MOVE, {
                let shared = shared.clone();
                move |message| shared.apply_cursor(message)
            }),
        ];
        channel.subscribe();

        Ok(Self {
            shared,
            channel: Some(channel),
            subscriptions,
        })
    }

    pub fn document_id(&self) -> Uuid {
        self.shared.document_id
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    /// Broadcast the local edit to the other participants. No-op once
    /// detached.
    pub fn broadcast_change(&self, change: DocumentChange) {
        if self.channel.is_none() {
            return;
        }
        let event = DocumentChangeEvent {
            user_id: self.shared.identity.user_id,
            change,
        };
        if let Err(e) = self.shared.sender.send(DOCUMENT_CHANGE, &event) {
            log::debug!("document_change for {} not sent: {e}", self.shared.document_id);
        }
    }

    /// Broadcast the local selection offset. No-op once detached.
    pub fn broadcast_cursor(&self, pos: usize) {
        if self.channel.is_none() {
            return;
        }
        let identity = &self.shared.identity;
        let cursor = RemoteCursor {
            user_id: identity.user_id,
            user_name: identity.display_name.clone(),
            color: identity.color,
            pos,
        };
        if let Err(e) = self.shared.sender.send(CURSOR_MOVE, &cursor) {
            log::debug!("cursor_move for {} not sent: {e}", self.shared.document_id);
        }
    }

    /// Invoke `handler` for each remote `document_change`. Changes authored
    /// by the local user and malformed payloads never reach it.
    pub fn on_document_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(DocumentChangeEvent) + Send + 'static,
    {
        let Some(channel) = &self.channel else {
            return Subscription::inert();
        };
        let local_user = self.shared.identity.user_id;
        let document_id = self.shared.document_id;
        channel.on(DOCUMENT_CHANGE, move |message| {
            match message.decode_payload::<DocumentChangeEvent>() {
                Ok(event) if event.user_id == local_user => {}
                Ok(event) => handler(event),
                Err(e) => log::warn!("Dropping malformed document change on {document_id}: {e}"),
            }
        })
    }

    /// Other users currently attached, ordered by attach time.
    pub fn online_users(&self) -> Vec<Identity> {
        self.shared.online_users.borrow().clone()
    }

    pub fn watch_online_users(&self) -> watch::Receiver<Vec<Identity>> {
        self.shared.online_users.subscribe()
    }

    /// Latest cursor of every other user, least recently moved first.
    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        self.shared.remote_cursors.borrow().clone()
    }

    pub fn watch_remote_cursors(&self) -> watch::Receiver<Vec<RemoteCursor>> {
        self.shared.remote_cursors.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Leave the document. Presence is withdrawn, every handler is dropped
    /// and the exposed lists are cleared. Calling it again does nothing.
    pub fn detach(&mut self) {
        let Some(mut channel) = self.channel.take() else {
            return;
        };
        channel.unsubscribe();
        self.subscriptions.clear();

        *self.shared.cursors() = CursorBook::default();
        self.shared.online_users.send_replace(Vec::new());
        self.shared.remote_cursors.send_replace(Vec::new());
        self.shared.state.send_replace(SessionState::Detached);
        log::info!(
            "{} detached from document {}",
            self.shared.identity.display_name,
            self.shared.document_id
        );
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Holds at most one session and swaps it on re-attachment.
pub struct SessionManager<T: Transport> {
    transport: T,
    config: SessionConfig,
    active: Option<SessionHandle>,
}

impl<T: Transport> SessionManager<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            active: None,
        }
    }

    /// Attach to `document_id`, fully detaching any current session first.
    pub async fn attach(&mut self, document_id: Uuid, identity: Identity) -> Result<&SessionHandle, ChannelError> {
        self.detach();
        let handle = SessionHandle::attach(&self.transport, document_id, identity, &self.config).await?;
        Ok(self.active.insert(handle))
    }

    pub fn detach(&mut self) {
        if let Some(mut handle) = self.active.take() {
            handle.detach();
        }
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.active.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.active.as_ref().map_or(SessionState::Detached, SessionHandle::state)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}
