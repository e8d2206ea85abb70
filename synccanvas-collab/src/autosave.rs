//! Debounced persistence of local edits.
//!
//! Every [`note_change`](AutosaveCoordinator::note_change) replaces the
//! pending snapshot and restarts the timer. When the timer fires the latest
//! snapshot is written once. Writes are not serialized against each other: a
//! slow write may still be running when the next one starts, and the store
//! keeps whichever lands last.
//!
//! ```text
//! note_change ─┬─ pending = (title, content), generation += 1
//!              └─ restart timer ──(delay)──► generation unchanged?
//!                                                │ yes
//!                                                ▼
//!                                 save_document(pending) ──► SaveNotice
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::store::{DocumentPatch, DocumentStore, StoreError};

/// Outcome of one autosave write.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveNotice {
    Saved { document_id: Uuid, at: SystemTime },
    Failed { document_id: Uuid, error: StoreError },
}

#[derive(Default)]
struct State {
    pending: Option<DocumentPatch>,
    generation: u64,
    cancelled: bool,
    timer: Option<JoinHandle<()>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Debounces edits of one document into single snapshot writes.
pub struct AutosaveCoordinator<S: DocumentStore> {
    store: Arc<S>,
    document_id: Uuid,
    delay: Duration,
    state: Arc<Mutex<State>>,
    in_flight: Arc<AtomicUsize>,
    notice_tx: mpsc::UnboundedSender<SaveNotice>,
    notice_rx: Option<mpsc::UnboundedReceiver<SaveNotice>>,
}

impl<S: DocumentStore> AutosaveCoordinator<S> {
    pub fn new(store: Arc<S>, document_id: Uuid, delay: Duration) -> Self {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        Self {
            store,
            document_id,
            delay,
            state: Arc::new(Mutex::new(State::default())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            notice_tx,
            notice_rx: Some(notice_rx),
        }
    }

    /// Take the notice receiver (can only be called once).
    pub fn take_notices(&mut self) -> Option<mpsc::UnboundedReceiver<SaveNotice>> {
        self.notice_rx.take()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Record the latest full snapshot and restart the debounce timer.
    /// Ignored after [`cancel`](Self::cancel).
    pub fn note_change(&self, title: impl Into<String>, content: impl Into<String>) {
        let mut state = lock(&self.state);
        if state.cancelled {
            log::debug!("Autosave for {} cancelled, dropping change", self.document_id);
            return;
        }

        state.pending = Some(DocumentPatch::full(title, content));
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let generation = state.generation;
        let shared = self.state.clone();
        let store = self.store.clone();
        let document_id = self.document_id;
        let delay = self.delay;
        let in_flight = self.in_flight.clone();
        let notice_tx = self.notice_tx.clone();

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let patch = {
                let mut state = lock(&shared);
                if state.cancelled || state.generation != generation {
                    return;
                }
                // From here on the write belongs to nobody: later edits and
                // cancel() leave it running.
                state.timer = None;
                state.pending.take()
            };
            let Some(patch) = patch else {
                return;
            };

            in_flight.fetch_add(1, Ordering::SeqCst);
            let notice = match store.save_document(document_id, patch).await {
                Ok(saved) => {
                    log::debug!("Autosaved document {document_id}");
                    SaveNotice::Saved { document_id, at: saved.updated_at }
                }
                Err(error) => {
                    log::error!("Autosave of document {document_id} failed: {error}");
                    SaveNotice::Failed { document_id, error }
                }
            };
            in_flight.fetch_sub(1, Ordering::SeqCst);
            let _ = notice_tx.send(notice);
        }));
    }

    /// Drop the pending snapshot and stop the timer. Writes already started
    /// run to completion. Later calls to `note_change` are ignored.
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        state.pending = None;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        log::debug!("Autosave for {} cancelled", self.document_id);
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.state).cancelled
    }

    /// Whether a snapshot is waiting for its timer.
    pub fn has_pending(&self) -> bool {
        lock(&self.state).pending.is_some()
    }

    /// Number of writes currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl<S: DocumentStore> Drop for AutosaveCoordinator<S> {
    fn drop(&mut self) {
        self.cancel();
    }
}
