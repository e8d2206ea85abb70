//! Debounced persistence, driven with paused tokio time.

use std::sync::Arc;
use std::time::Duration;
use synccanvas_collab::{
    AutosaveCoordinator, DocumentPatch, Hub, Identity, MemoryStore, OpenDocument, SaveNotice, SessionConfig,
    Transaction,
};
use uuid::Uuid;

const DELAY: Duration = Duration::from_millis(1500);

fn identity(name: &str) -> Identity {
    Identity::new(Uuid::new_v4(), name, format!("{name}@example.com"))
}

#[tokio::test(start_paused = true)]
async fn test_second_change_inside_window_wins() {
    let store = Arc::new(MemoryStore::new());
    let id = store.create("T0", "C0").await;
    let mut autosave = AutosaveCoordinator::new(store.clone(), id, DELAY);
    let mut notices = autosave.take_notices().unwrap();

    autosave.note_change("T1", "C1");
    tokio::time::sleep(Duration::from_millis(200)).await;
    autosave.note_change("T2", "C2");
    tokio::time::sleep(DELAY + Duration::from_millis(100)).await;

    assert_eq!(store.writes().await, vec![(id, DocumentPatch::full("T2", "C2"))]);
    assert!(matches!(notices.try_recv(), Ok(SaveNotice::Saved { .. })));
    assert!(notices.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_timer_restarts_on_every_change() {
    let store = Arc::new(MemoryStore::new());
    let id = store.create("T0", "C0").await;
    let autosave = AutosaveCoordinator::new(store.clone(), id, DELAY);

    // 1.4 s apart: each change lands inside the previous window.
    for i in 0..4 {
        autosave.note_change(format!("T{i}"), format!("C{i}"));
        tokio::time::sleep(Duration::from_millis(1400)).await;
        assert!(store.writes().await.is_empty(), "saved early after change {i}");
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.writes().await, vec![(id, DocumentPatch::full("T3", "C3"))]);
}

#[tokio::test(start_paused = true)]
async fn test_separate_windows_write_separately() {
    let store = Arc::new(MemoryStore::new());
    let id = store.create("T0", "C0").await;
    let autosave = AutosaveCoordinator::new(store.clone(), id, DELAY);

    autosave.note_change("T1", "C1");
    tokio::time::sleep(DELAY * 2).await;
    autosave.note_change("T2", "C2");
    tokio::time::sleep(DELAY * 2).await;

    let writes = store.writes().await;
    assert_eq!(writes.len(), 2);
    assert_eq!(store.get(id).await.unwrap().content, "C2");
}

#[tokio::test(start_paused = true)]
async fn test_close_with_pending_timer_never_writes() {
    let hub = Hub::default();
    let store = Arc::new(MemoryStore::new());
    let id = store.create("Plan", "").await;

    let mut doc = OpenDocument::open(&hub, store.clone(), id, identity("Alice"), &SessionConfig::default())
        .await
        .unwrap();
    doc.apply_edit(&Transaction::new(0).insert(0, 5), "hello");
    assert!(doc.has_pending_save());

    doc.close();
    tokio::time::sleep(DELAY * 3).await;

    assert!(store.writes().await.is_empty());
    assert_eq!(store.get(id).await.unwrap().content, "");
}

#[tokio::test(start_paused = true)]
async fn test_failed_save_then_recovery() {
    let hub = Hub::default();
    let store = Arc::new(MemoryStore::new());
    let id = store.create("Plan", "").await;
    let config = SessionConfig {
        autosave_delay_ms: 500,
        ..SessionConfig::default()
    };

    let mut doc = OpenDocument::open(&hub, store.clone(), id, identity("Alice"), &config).await.unwrap();
    let mut notices = doc.take_save_notices().unwrap();

    store.set_failing(true);
    doc.apply_edit(&Transaction::new(0).insert(0, 1), "a");
    match notices.recv().await {
        Some(SaveNotice::Failed { document_id, .. }) => assert_eq!(document_id, id),
        other => panic!("expected failure notice, got {other:?}"),
    }

    // Editing continues; the next cycle saves the then-current content.
    store.set_failing(false);
    doc.apply_edit(&Transaction::new(1).insert(1, 1), "ab");
    assert!(matches!(notices.recv().await, Some(SaveNotice::Saved { .. })));
    assert_eq!(store.get(id).await.unwrap().content, "ab");
}
