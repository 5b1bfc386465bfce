//! WebSocket client for the sync server, exposed as a [`WorkshopStore`].
//!
//! The client joins one document path, keeps the newest snapshot the
//! server sent, and forwards patches. It never applies its own writes;
//! they come back as snapshots like everyone else's.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use workshop_core::{initial_document, DocumentPatch, WorkshopDocument};

use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage, DEFAULT_DOCUMENT_PATH};
use crate::store::{ChangeCallback, ChangeFeed, Subscription, WorkshopStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Document to follow
    pub document_path: String,
    pub peer_name: String,
    /// How long `load` waits for the first snapshot
    pub load_timeout: Duration,
    /// Outgoing message buffer
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            document_path: DEFAULT_DOCUMENT_PATH.to_string(),
            peer_name: "anonymous".to_string(),
            load_timeout: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Short load timeout.
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            load_timeout: Duration::from_secs(2),
            ..Self::new(server_url)
        }
    }
}

pub struct RemoteStore {
    peer_info: PeerInfo,
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    /// Patches sent by this client
    clock: AtomicU64,
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    feed: Arc<ChangeFeed>,
    reader: JoinHandle<()>,
}

impl RemoteStore {
    /// Connect and join `config.document_path`. The server creates the
    /// document if it does not exist yet.
    pub async fn connect(config: ClientConfig) -> Result<Self, ProtocolError> {
        let peer_info = PeerInfo::new(config.peer_name.clone());
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let (ws_stream, _) = tokio_tungstenite::connect_async(config.server_url.as_str())
            .await
            .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (outgoing_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(config.channel_capacity.max(1));
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let join = SyncMessage::join(config.document_path.clone(), &peer_info)?.encode()?;
        outgoing_tx
            .send(join)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let feed = Arc::new(ChangeFeed::new(config.channel_capacity));
        *state.write().await = ConnectionState::Connected;

        // Reader task: turn snapshots into published documents
        let reader = {
            let feed = feed.clone();
            let state = state.clone();
            let path = config.document_path.clone();
            tokio::spawn(async move {
                let mut last_version: Option<u64> = None;
                while let Some(msg) = ws_reader.next().await {
                    let data = match msg {
                        Ok(Message::Binary(data)) => data,
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => continue,
                    };
                    let sync_msg = match SyncMessage::decode(&data) {
                        Ok(m) => m,
                        Err(e) => {
                            log::warn!("Dropping undecodable message: {e}");
                            continue;
                        }
                    };
                    if sync_msg.msg_type != MessageType::Snapshot || sync_msg.path != path {
                        continue;
                    }
                    if last_version.is_some_and(|v| sync_msg.clock < v) {
                        log::debug!("Ignoring stale snapshot v{}", sync_msg.clock);
                        continue;
                    }
                    match sync_msg.document() {
                        Ok(doc) => {
                            last_version = Some(sync_msg.clock);
                            feed.publish(Arc::new(doc));
                        }
                        Err(e) => log::error!("Bad snapshot for {path}: {e}"),
                    }
                }
                *state.write().await = ConnectionState::Disconnected;
                log::warn!("Disconnected from sync server ({path})");
            })
        };

        log::info!(
            "Connected to {} as {} ({})",
            config.server_url,
            peer_info.name,
            peer_info.peer_id
        );

        Ok(Self {
            peer_info,
            config,
            state,
            clock: AtomicU64::new(0),
            outgoing_tx,
            feed,
            reader,
        })
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn document_path(&self) -> &str {
        &self.config.document_path
    }

    /// Number of patches sent so far.
    pub fn patches_sent(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    async fn send_patch(&self, patch: &DocumentPatch) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let msg = SyncMessage::patch(
            self.peer_info.peer_id,
            self.config.document_path.clone(),
            clock,
            patch,
        )?;
        self.outgoing_tx
            .send(msg.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

impl WorkshopStore for RemoteStore {
    async fn load(&self) -> WorkshopDocument {
        let mut rx = self.feed.receiver();
        if let Some(doc) = self.feed.latest_document() {
            return (*doc).clone();
        }
        match tokio::time::timeout(self.config.load_timeout, rx.recv()).await {
            Ok(Ok(published)) => (*published.doc).clone(),
            Ok(Err(e)) => {
                log::error!("Snapshot feed failed while loading: {e}");
                self.feed
                    .latest_document()
                    .map_or_else(initial_document, |doc| (*doc).clone())
            }
            Err(_) => {
                log::error!(
                    "No snapshot for {} within {:?}; using initial document",
                    self.config.document_path,
                    self.config.load_timeout
                );
                initial_document()
            }
        }
    }

    async fn save(&self, patch: DocumentPatch) {
        if let Err(e) = self.send_patch(&patch).await {
            log::error!("Failed to send {:?}: {e}", patch.field_names());
        }
    }

    fn subscribe(&self, on_change: ChangeCallback) -> Subscription {
        self.feed.subscribe(ChangeFeed::latest, on_change)
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
