//! Durable document storage interface.
//!
//! The collaboration core only reads a snapshot once when a document opens
//! and writes full snapshots when autosave fires. Real backends live outside
//! this crate; [`MemoryStore`] is the in-process implementation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A persisted document as loaded at open time.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub updated_at: SystemTime,
}

/// Fields to overwrite on save. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentPatch {
    pub title: Option<String>,
    pub content: Option<String>,
}

impl DocumentPatch {
    pub fn full(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            content: Some(content.into()),
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("document {0} not found")]
    NotFound(Uuid),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Durable snapshot storage. Last write wins.
pub trait DocumentStore: Send + Sync + 'static {
    fn load_document(&self, id: Uuid) -> impl Future<Output = Result<DocumentSnapshot, StoreError>> + Send;

    fn save_document(
        &self,
        id: Uuid,
        patch: DocumentPatch,
    ) -> impl Future<Output = Result<DocumentSnapshot, StoreError>> + Send;
}

/// In-process store with a write log.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<Uuid, DocumentSnapshot>>,
    writes: RwLock<Vec<(Uuid, DocumentPatch)>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new document and return its id.
    pub async fn create(&self, title: impl Into<String>, content: impl Into<String>) -> Uuid {
        let id = Uuid::new_v4();
        self.insert(DocumentSnapshot {
            id,
            title: title.into(),
            content: content.into(),
            updated_at: SystemTime::now(),
        })
        .await;
        id
    }

    pub async fn insert(&self, snapshot: DocumentSnapshot) {
        self.documents.write().await.insert(snapshot.id, snapshot);
    }

    pub async fn get(&self, id: Uuid) -> Option<DocumentSnapshot> {
        self.documents.read().await.get(&id).cloned()
    }

    /// Every successful save, oldest first.
    pub async fn writes(&self) -> Vec<(Uuid, DocumentPatch)> {
        self.writes.read().await.clone()
    }

    /// Make every following save fail with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl DocumentStore for MemoryStore {
    async fn load_document(&self, id: Uuid) -> Result<DocumentSnapshot, StoreError> {
        self.get(id).await.ok_or(StoreError::NotFound(id))
    }

    async fn save_document(&self, id: Uuid, patch: DocumentPatch) -> Result<DocumentSnapshot, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("store unavailable".into()));
        }

        let mut documents = self.documents.write().await;
        let document = documents.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if let Some(title) = &patch.title {
            document.title = title.clone();
        }
        if let Some(content) = &patch.content {
            document.content = content.clone();
        }
        document.updated_at = SystemTime::now();
        let saved = document.clone();
        drop(documents);

        self.writes.write().await.push((id, patch));
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_missing_document() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert_eq!(store.load_document(id).await, Err(StoreError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_save_patches_only_given_fields() {
        let store = MemoryStore::new();
        let id = store.create("Draft", "<p>one</p>").await;

        let patch = DocumentPatch { title: None, content: Some("<p>two</p>".into()) };
        let saved = store.save_document(id, patch.clone()).await.unwrap();

        assert_eq!(saved.title, "Draft");
        assert_eq!(saved.content, "<p>two</p>");
        assert_eq!(store.load_document(id).await.unwrap(), saved);
        assert_eq!(store.writes().await, vec![(id, patch)]);
    }

    #[tokio::test]
    async fn test_failing_store_rejects_saves() {
        let store = MemoryStore::new();
        let id = store.create("Draft", "").await;
        store.set_failing(true);

        let result = store.save_document(id, DocumentPatch::full("T", "C")).await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert!(store.writes().await.is_empty());

        store.set_failing(false);
        assert!(store.save_document(id, DocumentPatch::full("T", "C")).await.is_ok());
    }
}
