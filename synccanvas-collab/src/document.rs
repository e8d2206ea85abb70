//! An open document as an editor sees it.
//!
//! Ties the pieces of one editing surface together:
//!
//! ```text
//!            load once
//!  DocumentStore ─────► OpenDocument ── apply_edit / rename ──┬─► SessionHandle (broadcast)
//!        ▲                   │                                └─► AutosaveCoordinator
//!        └── debounced save ─┘
//!                            └── refresh_cursors ◄── SessionHandle::remote_cursors
//!                                        │
//!                                        ▼
//!                                CursorProjection
//! ```

use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::autosave::{AutosaveCoordinator, SaveNotice};
use crate::channel::{ChannelError, Subscription, Transport};
use crate::cursor::{CursorProjection, Transaction};
use crate::identity::Identity;
use crate::protocol::{DocumentChange, DocumentChangeEvent};
use crate::session::{SessionConfig, SessionHandle, SessionState};
use crate::store::{DocumentSnapshot, DocumentStore, StoreError};

/// Errors opening a document.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("failed to load document: {0}")]
    Store(#[from] StoreError),
    #[error("failed to join document channel: {0}")]
    Channel(#[from] ChannelError),
}

/// A document loaded for editing with its collaboration session attached.
pub struct OpenDocument<S: DocumentStore> {
    snapshot: DocumentSnapshot,
    session: SessionHandle,
    autosave: AutosaveCoordinator<S>,
    projection: CursorProjection,
}

impl<S: DocumentStore> OpenDocument<S> {
    /// Load the snapshot, then attach to the document's channel.
    pub async fn open<T: Transport>(
        transport: &T,
        store: Arc<S>,
        document_id: Uuid,
        identity: Identity,
        config: &SessionConfig,
    ) -> Result<Self, OpenError> {
        let snapshot = store.load_document(document_id).await?;
        let session = SessionHandle::attach(transport, document_id, identity, config).await?;
        let autosave = AutosaveCoordinator::new(store, document_id, config.autosave_delay());
        let projection = CursorProjection::new(snapshot.content.chars().count());
        log::info!("Opened document {document_id} ({:?})", snapshot.title);

        Ok(Self {
            snapshot,
            session,
            autosave,
            projection,
        })
    }

    pub fn id(&self) -> Uuid {
        self.snapshot.id
    }

    pub fn title(&self) -> &str {
        &self.snapshot.title
    }

    pub fn content(&self) -> &str {
        &self.snapshot.content
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn projection(&self) -> &CursorProjection {
        &self.projection
    }

    /// A local edit: remap remote markers, broadcast the new content and
    /// schedule a save.
    pub fn apply_edit(&mut self, transaction: &Transaction, content: impl Into<String>) {
        if self.is_closed() {
            return;
        }
        self.snapshot.content = content.into();
        self.projection.apply(transaction);
        let doc_len = self.snapshot.content.chars().count();
        if self.projection.doc_len() != doc_len {
            self.projection.reset_doc_len(doc_len);
        }

        self.broadcast_snapshot();
        self.autosave.note_change(&self.snapshot.title, &self.snapshot.content);
    }

    /// Change the title, broadcast it and schedule a save.
    pub fn rename(&mut self, title: impl Into<String>) {
        if self.is_closed() {
            return;
        }
        self.snapshot.title = title.into();
        self.broadcast_snapshot();
        self.autosave.note_change(&self.snapshot.title, &self.snapshot.content);
    }

    fn broadcast_snapshot(&self) {
        self.session
            .broadcast_change(DocumentChange::full(&self.snapshot.title, &self.snapshot.content));
    }

    /// Replace local content with a remote snapshot. Nothing is broadcast or
    /// saved; the author's client does both.
    pub fn apply_remote(&mut self, event: &DocumentChangeEvent) {
        if let Some(title) = &event.change.title {
            self.snapshot.title = title.clone();
        }
        if let Some(content) = &event.change.content {
            self.snapshot.content = content.clone();
            self.projection.reset_doc_len(content.chars().count());
        }
    }

    /// Broadcast the local selection.
    pub fn select(&self, pos: usize) {
        self.session.broadcast_cursor(pos);
    }

    /// Rebuild the projected markers from the session's remote cursors.
    pub fn refresh_cursors(&mut self) {
        let cursors = self.session.remote_cursors();
        let tr = Transaction::new(self.projection.doc_len()).with_remote_cursors(cursors);
        self.projection.apply(&tr);
    }

    /// Forward remote document changes to `handler`.
    pub fn on_remote_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(DocumentChangeEvent) + Send + 'static,
    {
        self.session.on_document_change(handler)
    }

    /// Take the save notice receiver (can only be called once).
    pub fn take_save_notices(&mut self) -> Option<mpsc::UnboundedReceiver<SaveNotice>> {
        self.autosave.take_notices()
    }

    pub fn has_pending_save(&self) -> bool {
        self.autosave.has_pending()
    }

    pub fn is_closed(&self) -> bool {
        self.session.state() == SessionState::Detached
    }

    /// Cancel the pending save and leave the channel. Writes already
    /// started are not interrupted.
    pub fn close(&mut self) {
        self.autosave.cancel();
        self.session.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn identity(name: &str) -> Identity {
        Identity::new(Uuid::new_v4(), name, format!("{name}@example.com"))
    }

    #[tokio::test]
    async fn test_open_missing_document_fails() {
        let hub = Hub::default();
        let store = Arc::new(MemoryStore::new());
        let result =
            OpenDocument::open(&hub, store, Uuid::new_v4(), identity("Alice"), &SessionConfig::default()).await;
        assert!(matches!(result, Err(OpenError::Store(StoreError::NotFound(_)))));
        assert_eq!(hub.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_open_loads_snapshot_once() {
        let hub = Hub::default();
        let store = Arc::new(MemoryStore::new());
        let id = store.create("Plan", "<p>hello</p>").await;

        let doc = OpenDocument::open(&hub, store, id, identity("Alice"), &SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(doc.id(), id);
        assert_eq!(doc.title(), "Plan");
        assert_eq!(doc.content(), "<p>hello</p>");
        assert_eq!(doc.projection().doc_len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_and_rename_save_latest_pair() {
        let hub = Hub::default();
        let store = Arc::new(MemoryStore::new());
        let id = store.create("Plan", "").await;
        let config = SessionConfig::default();

        let mut doc = OpenDocument::open(&hub, store.clone(), id, identity("Alice"), &config).await.unwrap();
        let mut notices = doc.take_save_notices().unwrap();

        doc.apply_edit(&Transaction::new(0).insert(0, 2), "hi");
        doc.rename("Plan B");
        assert!(doc.has_pending_save());

        assert!(matches!(notices.recv().await, Some(SaveNotice::Saved { .. })));
        let saved = store.get(id).await.unwrap();
        assert_eq!((saved.title.as_str(), saved.content.as_str()), ("Plan B", "hi"));
        assert_eq!(store.writes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_edits_broadcast_title_and_content() {
        let hub = Hub::default();
        let store = Arc::new(MemoryStore::new());
        let id = store.create("Plan", "").await;
        let config = SessionConfig::default();

        let mut doc = OpenDocument::open(&hub, store, id, identity("Alice"), &config).await.unwrap();
        let peer = SessionHandle::attach(&hub, id, identity("Bob"), &config).await.unwrap();
        let (tx, mut changes) = mpsc::unbounded_channel();
        let _sub = peer.on_document_change(move |event| {
            let _ = tx.send(event.change);
        });

        doc.apply_edit(&Transaction::new(0).insert(0, 2), "hi");
        doc.rename("Plan B");

        for expected in [DocumentChange::full("Plan", "hi"), DocumentChange::full("Plan B", "hi")] {
            let change = tokio::time::timeout(Duration::from_secs(2), changes.recv()).await.unwrap();
            assert_eq!(change, Some(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_save() {
        let hub = Hub::default();
        let store = Arc::new(MemoryStore::new());
        let id = store.create("Plan", "").await;

        let mut doc = OpenDocument::open(&hub, store.clone(), id, identity("Alice"), &SessionConfig::default())
            .await
            .unwrap();
        doc.apply_edit(&Transaction::new(0).insert(0, 1), "x");
        doc.close();
        assert!(doc.is_closed());

        doc.apply_edit(&Transaction::new(1).insert(1, 1), "xy");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.writes().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_remote_keeps_markers_in_range() {
        let hub = Hub::default();
        let store = Arc::new(MemoryStore::new());
        let id = store.create("Plan", "0123456789").await;
        let mut doc = OpenDocument::open(&hub, store, id, identity("Alice"), &SessionConfig::default())
            .await
            .unwrap();

        let remote = DocumentChangeEvent {
            user_id: Uuid::new_v4(),
            change: DocumentChange { title: None, content: Some("0123".into()) },
        };
        doc.apply_remote(&remote);
        assert_eq!(doc.content(), "0123");
        assert_eq!(doc.title(), "Plan");
        assert_eq!(doc.projection().doc_len(), 4);
    }
}
