//! Persistence integration tests.
//!
//! Verifies:
//! - Document save/load roundtrip through the store
//! - Restart: stop the server, start a new one on the same data, data survives
//! - Writes from a client land in storage before the echo arrives
//! - Multiple documents stay isolated

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use workshop_core::{initial_document, WorkshopStatus};
use workshop_sync::protocol::DEFAULT_DOCUMENT_PATH;
use workshop_sync::{
    ClientConfig, DocumentStore, RemoteStore, ServerConfig, StoreConfig, StoreError, SyncServer,
    WorkshopConfig, WorkshopController,
};

const WAIT: Duration = Duration::from_secs(5);

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Open a persistent server on `dir`. RocksDB keeps its lock until the
/// previous server's connections have wound down, so retry for a while.
async fn open_server(dir: &Path) -> Arc<SyncServer> {
    let mut last: Option<StoreError> = None;
    for _ in 0..40 {
        match SyncServer::new(ServerConfig::for_testing(Some(dir.to_path_buf()))) {
            Ok(server) => return Arc::new(server),
            Err(e) => last = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("storage never became available: {last:?}");
}

async fn serve(server: &Arc<SyncServer>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let serving = server.clone();
    let task = tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (format!("ws://127.0.0.1:{port}"), task)
}

async fn controller(url: &str, path: &str) -> WorkshopController<RemoteStore> {
    let config = ClientConfig {
        document_path: path.to_string(),
        ..ClientConfig::for_testing(url)
    };
    let store = RemoteStore::connect(config).await.unwrap();
    let c = WorkshopController::start(store, WorkshopConfig::default()).await;
    tokio::time::timeout(WAIT, c.wait_until_ready()).await.unwrap();
    c
}

// ─── Document Save/Load Roundtrip ────────────────────────────────────────────

#[test]
fn test_document_roundtrip_via_store() {
    let dir = tempdir().unwrap();
    let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

    let mut doc = initial_document();
    doc.status = WorkshopStatus::InProgress;
    doc.current_stage = 2;

    let meta = store.save_document(DEFAULT_DOCUMENT_PATH, &doc).unwrap();
    assert_eq!(meta.version, 1);
    assert!(meta.compressed_size > 0);

    let meta = store.save_document(DEFAULT_DOCUMENT_PATH, &doc).unwrap();
    assert_eq!(meta.version, 2);

    assert_eq!(store.load_document(DEFAULT_DOCUMENT_PATH).unwrap(), doc);
    assert_eq!(store.list_documents().unwrap(), vec![DEFAULT_DOCUMENT_PATH.to_string()]);
}

// ─── Restart ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_data_survives_restart() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("db");

    let server = open_server(&db).await;
    let (url, task) = serve(&server).await;
    let note = {
        let c = controller(&url, DEFAULT_DOCUMENT_PATH).await;
        c.add_participant("Eric").unwrap();
        tokio::time::timeout(WAIT, c.wait_for(|d| !d.participants.is_empty()))
            .await
            .unwrap();
        let note = c.add_sticky_note("Refund takes too long").unwrap();
        tokio::time::timeout(WAIT, c.wait_for(|d| d.sticky_notes.iter().any(|n| n.id == note)))
            .await
            .unwrap();
        note
    };
    task.abort();
    drop(server);

    let server = open_server(&db).await;
    let (url, _task) = serve(&server).await;
    let c = controller(&url, DEFAULT_DOCUMENT_PATH).await;

    let doc = c.state();
    assert_eq!(doc.participants.len(), 1);
    assert_eq!(doc.participants[0].name, "Eric");
    assert!(doc.sticky_notes.iter().any(|n| n.id == note));
}

#[tokio::test]
async fn test_write_is_persisted_before_echo() {
    let dir = tempdir().unwrap();
    let server = open_server(&dir.path().join("db")).await;
    let (url, _task) = serve(&server).await;

    let c = controller(&url, DEFAULT_DOCUMENT_PATH).await;
    c.set_is_voting(true);
    tokio::time::timeout(WAIT, c.wait_for(|d| d.is_voting)).await.unwrap();

    let store = server.store().unwrap();
    assert!(store.load_document(DEFAULT_DOCUMENT_PATH).unwrap().is_voting);
    // Created on join, then one write.
    assert_eq!(store.load_metadata(DEFAULT_DOCUMENT_PATH).unwrap().version, 2);
    assert_eq!(server.stats().await.persist_failures, 0);
}

// ─── Isolation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_documents_are_isolated() {
    let dir = tempdir().unwrap();
    let server = open_server(&dir.path().join("db")).await;
    let (url, _task) = serve(&server).await;

    let morning = controller(&url, "workshops/morning").await;
    let afternoon = controller(&url, "workshops/afternoon").await;

    morning.set_current_stage(3u32);
    tokio::time::timeout(WAIT, morning.wait_for(|d| d.current_stage == 3))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(afternoon.state().current_stage, 1);
    let store = server.store().unwrap();
    assert_eq!(store.load_document("workshops/afternoon").unwrap().current_stage, 1);

    let mut paths = store.list_documents().unwrap();
    paths.sort();
    assert_eq!(paths, vec!["workshops/afternoon".to_string(), "workshops/morning".to_string()]);
}
