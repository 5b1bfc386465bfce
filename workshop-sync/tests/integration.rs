//! End-to-end tests: a real server, real WebSocket clients, real controllers.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use workshop_core::{initial_document, MatrixQuadrant, WorkshopDocument, WorkshopStatus};
use workshop_core::patch::fields;
use workshop_sync::protocol::{MessageType, PeerInfo, SyncMessage, DEFAULT_DOCUMENT_PATH};
use workshop_sync::{
    ClientConfig, ConnectionState, LocalBackend, RemoteStore, ServerConfig, SyncServer,
    WorkshopConfig, WorkshopController, WorkshopStore,
};

const WAIT: Duration = Duration::from_secs(5);

/// Start an in-memory server on a free port.
async fn start_test_server() -> (String, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(ServerConfig::for_testing(None)).unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (format!("ws://127.0.0.1:{port}"), server)
}

async fn remote(url: &str, name: &str) -> RemoteStore {
    let config = ClientConfig {
        peer_name: name.to_string(),
        ..ClientConfig::for_testing(url)
    };
    RemoteStore::connect(config).await.unwrap()
}

async fn remote_controller(url: &str, name: &str) -> WorkshopController<RemoteStore> {
    let c = WorkshopController::start(remote(url, name).await, WorkshopConfig::default()).await;
    timeout(WAIT, c.wait_until_ready()).await.unwrap();
    c
}

async fn wait_for<S, F>(c: &WorkshopController<S>, predicate: F) -> Arc<WorkshopDocument>
where
    S: WorkshopStore,
    F: FnMut(&WorkshopDocument) -> bool,
{
    timeout(WAIT, c.wait_for(predicate))
        .await
        .expect("document never reached the expected state")
}

#[tokio::test]
async fn test_load_creates_missing_document() {
    let (url, server) = start_test_server().await;
    assert!(server.document(DEFAULT_DOCUMENT_PATH).await.is_none());

    let store = remote(&url, "Ava").await;
    assert_eq!(store.connection_state().await, ConnectionState::Connected);
    assert!(!store.writes_immediately());

    let doc = store.load().await;
    assert_eq!(doc, initial_document());
    assert_eq!(server.document(DEFAULT_DOCUMENT_PATH).await.unwrap(), initial_document());
}

#[tokio::test]
async fn test_save_then_load_round_trip() {
    let (url, _server) = start_test_server().await;
    let store = remote(&url, "Ava").await;
    let before = store.load().await;

    let mut patch = fields::CURRENT_STAGE.patch(3);
    patch.merge(fields::STATUS.patch(WorkshopStatus::InProgress));
    store.save(patch).await;
    assert_eq!(store.patches_sent(), 1);

    let reader = remote(&url, "Mia").await;
    let c = WorkshopController::start(reader, WorkshopConfig::default()).await;
    let after = wait_for(&c, |d| d.current_stage == 3).await;

    assert_eq!(after.status, WorkshopStatus::InProgress);
    assert_eq!(after.sticky_notes, before.sticky_notes);
    assert_eq!(after.participants, before.participants);
    assert_eq!(after.is_voting, before.is_voting);
}

#[tokio::test]
async fn test_replicated_write_arrives_only_through_echo() {
    let (url, _server) = start_test_server().await;
    let c = remote_controller(&url, "Eric").await;
    assert!(!c.is_loading());

    c.set_current_stage(2u32);
    // Nothing applied locally yet.
    assert_eq!(c.state().current_stage, 1);

    let doc = wait_for(&c, |d| d.current_stage == 2).await;
    assert_eq!(doc.current_stage, 2);
}

#[tokio::test]
async fn test_distinct_fields_do_not_clobber() {
    let (url, server) = start_test_server().await;
    let a = remote_controller(&url, "Eric").await;
    let b = remote_controller(&url, "Ava").await;

    // Neither has seen the other's write when issuing its own.
    a.set_current_stage(2u32);
    b.set_is_voting(true);

    let merged = |d: &WorkshopDocument| d.current_stage == 2 && d.is_voting;
    wait_for(&a, merged).await;
    wait_for(&b, merged).await;

    let doc = server.document(DEFAULT_DOCUMENT_PATH).await.unwrap();
    assert_eq!(doc.current_stage, 2);
    assert!(doc.is_voting);
}

#[tokio::test]
async fn test_group_drafts_are_independent() {
    let (url, _server) = start_test_server().await;
    let a = remote_controller(&url, "Eric").await;
    let b = remote_controller(&url, "Ava").await;

    let intent = a.add_intent("Billing").unwrap();
    wait_for(&b, |d| d.intent(&intent).is_some()).await;

    a.select_intent("group-a", Some(&intent));
    b.select_intent("group-b", Some(&intent));

    let both = |d: &WorkshopDocument| {
        d.flowchart_editor.get("group-a").is_some() && d.flowchart_editor.get("group-b").is_some()
    };
    let doc = wait_for(&a, both).await;
    assert_eq!(
        doc.flowchart_editor.draft_for("group-b").selected_intent_id.as_deref(),
        Some(intent.as_str())
    );
}

#[tokio::test]
async fn test_votes_over_the_wire() {
    let (url, _server) = start_test_server().await;
    let c = remote_controller(&url, "Ava").await;

    let intent = c.add_intent("Billing").unwrap();
    wait_for(&c, |d| d.intent(&intent).is_some()).await;
    c.select_intent("group-1", Some(&intent));
    wait_for(&c, |d| d.flowchart_editor.get("group-1").is_some()).await;
    c.add_flow_step(
        "group-1",
        workshop_core::FlowStepActor::User,
        "I was charged twice",
        None,
        Vec::new(),
    );
    wait_for(&c, |d| !d.flowchart_editor.draft_for("group-1").current_steps.is_empty()).await;
    c.save_flowchart("group-1");
    let doc = wait_for(&c, |d| d.flowcharts.len() == 1).await;
    let id = doc.flowcharts[0].id.clone();

    c.place_flowchart(&id, Some(MatrixQuadrant::Q1));
    wait_for(&c, |d| d.flowcharts[0].matrix_position == Some(MatrixQuadrant::Q1)).await;

    c.set_is_voting(true);
    wait_for(&c, |d| d.is_voting).await;

    // Each vote is computed from the in-memory copy, so wait for its echo.
    for expected in 1..=3u32 {
        assert!(c.vote(&id));
        wait_for(&c, |d| d.flowcharts[0].votes == expected).await;
    }
    assert!(!c.vote(&id));
    assert_eq!(c.votes_remaining(), 0);
}

#[tokio::test]
async fn test_no_callbacks_after_shutdown() {
    let (url, _server) = start_test_server().await;
    let a = remote_controller(&url, "Eric").await;
    let b = remote_controller(&url, "Ava").await;

    b.shutdown();
    a.set_current_stage(3u32);
    wait_for(&a, |d| d.current_stage == 3).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(b.state().current_stage, 1);
}

#[tokio::test]
async fn test_local_handles_behave_like_tabs() {
    let dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::open(dir.path());
    let a = WorkshopController::start(backend.handle(), WorkshopConfig::default()).await;
    let b = WorkshopController::start(backend.handle(), WorkshopConfig::default()).await;

    let note = a.add_sticky_note("Where is my order?").unwrap();
    // The writer sees its own write at once.
    assert!(a.state().sticky_notes.iter().any(|n| n.id == note));

    a.flush().await;
    let doc = wait_for(&b, |d| d.sticky_notes.iter().any(|n| n.id == note)).await;
    assert_eq!(doc.sticky_notes.len(), 4);
}

#[tokio::test]
async fn test_ping_pong() {
    let (url, _server) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let ping = SyncMessage::ping(Uuid::new_v4()).encode().unwrap();
    ws.send(Message::Binary(ping.into())).await.unwrap();

    let reply = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let msg = SyncMessage::decode(&reply.into_data()).unwrap();
    assert_eq!(msg.msg_type, MessageType::Pong);
}

#[tokio::test]
async fn test_raw_join_gets_snapshot() {
    let (url, server) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let join = SyncMessage::join("workshops/other", &PeerInfo::new("raw"))
        .unwrap()
        .encode()
        .unwrap();
    ws.send(Message::Binary(join.into())).await.unwrap();

    let reply = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let msg = SyncMessage::decode(&reply.into_data()).unwrap();
    assert_eq!(msg.msg_type, MessageType::Snapshot);
    assert_eq!(msg.path, "workshops/other");
    assert_eq!(msg.document().unwrap(), initial_document());
    assert_eq!(server.peer_count("workshops/other").await, 1);
}
