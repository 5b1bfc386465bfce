//! WebSocket sync server: the replicated home of workshop documents.
//!
//! ```text
//! Client A ──┐                                   ┌──► Client A
//!             ├─ Patch ─► Room (path) ─ Snapshot ─┤
//! Client B ──┘             │                     └──► Client B
//!                          └── DocumentStore (RocksDB)
//! ```
//!
//! Each room owns the authoritative document for one path. A patch is
//! merged field by field, persisted, and the resulting full document is
//! sent to every peer in the room, including the writer. All three steps
//! happen under the room lock so peers and storage see versions in order.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use workshop_core::{initial_document, DocumentPatch, WorkshopDocument};

use crate::broadcast::BroadcastGroup;
use crate::protocol::{MessageType, PeerInfo, SyncMessage, DOCUMENT_PREFIX};
use crate::store::{DocumentStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Joins outside this path prefix are refused
    pub document_prefix: String,
    /// Rooms held in memory at once
    pub max_rooms: usize,
    /// Snapshots buffered per peer before a slow peer skips ahead
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            document_prefix: DOCUMENT_PREFIX.to_string(),
            max_rooms: 64,
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Any free local port, small buffers, in-memory unless `storage_path`
    /// is given.
    pub fn for_testing(storage_path: Option<PathBuf>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 10,
            document_prefix: DOCUMENT_PREFIX.to_string(),
            max_rooms: 8,
            broadcast_capacity: 64,
            storage_path,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub patches_applied: u64,
    pub persisted_writes: u64,
    pub persist_failures: u64,
}

struct DocumentRoom {
    doc: WorkshopDocument,
    version: u64,
    broadcast: Arc<BroadcastGroup>,
}

impl DocumentRoom {
    fn snapshot(&self, path: &str) -> Result<Arc<Vec<u8>>, BoxError> {
        let encoded = SyncMessage::snapshot(path, self.version, &self.doc)?.encode()?;
        Ok(Arc::new(encoded))
    }
}

/// State shared by every connection task.
struct Shared {
    config: ServerConfig,
    rooms: RwLock<HashMap<String, DocumentRoom>>,
    stats: RwLock<ServerStats>,
    store: Option<Arc<DocumentStore>>,
}

impl Shared {
    /// Write the room's document to storage, if any. Failures are logged
    /// and counted; the in-memory document stays authoritative.
    async fn persist(&self, path: &str, doc: &WorkshopDocument) {
        let Some(store) = &self.store else { return };
        let result = store.save_document(path, doc);
        let mut stats = self.stats.write().await;
        match result {
            Ok(_) => stats.persisted_writes += 1,
            Err(e) => {
                stats.persist_failures += 1;
                log::error!("Failed to persist {path}: {e}");
            }
        }
    }

    /// A room for `path`: stored document if there is one, otherwise a
    /// fresh initial document, which is persisted right away.
    async fn open_room(&self, path: &str) -> DocumentRoom {
        let stored = self.store.as_ref().and_then(|s| match s.load_document(path) {
            Ok(doc) => {
                let version = s.load_metadata(path).map_or(0, |m| m.version);
                Some((doc, version))
            }
            Err(StoreError::NotFound(_)) => None,
            Err(e) => {
                log::error!("Failed to load {path}: {e}; recreating");
                None
            }
        });

        let broadcast = Arc::new(BroadcastGroup::new(self.config.broadcast_capacity));
        match stored {
            Some((doc, version)) => {
                log::info!("Loaded {path} v{version} from storage");
                DocumentRoom { doc, version, broadcast }
            }
            None => {
                log::info!("Creating {path}");
                let doc = initial_document();
                self.persist(path, &doc).await;
                DocumentRoom { doc, version: 1, broadcast }
            }
        }
    }

    fn accepts_path(&self, path: &str) -> bool {
        let prefix = self.config.document_prefix.as_str();
        path.len() > prefix.len() && path.starts_with(prefix)
    }

    /// Rooms with no peers can be dropped once storage holds their
    /// document. Without storage the room is the only copy.
    async fn evict_idle(&self, rooms: &mut HashMap<String, DocumentRoom>) {
        if self.store.is_none() {
            return;
        }
        let mut idle = Vec::new();
        for (path, room) in rooms.iter() {
            if room.broadcast.peer_count().await == 0 {
                idle.push(path.clone());
            }
        }
        for path in idle {
            rooms.remove(&path);
            log::debug!("Closed idle room {path}");
        }
    }

    /// Add a peer to the room at `path`. Returns its broadcast receiver and
    /// the current snapshot, or `None` if the path is refused or the room
    /// is full.
    async fn join(
        &self,
        path: &str,
        info: PeerInfo,
    ) -> Result<Option<(broadcast::Receiver<Arc<Vec<u8>>>, Arc<Vec<u8>>)>, BoxError> {
        if !self.accepts_path(path) {
            log::warn!(
                "Refusing {} on {path}: outside {}",
                info.peer_id,
                self.config.document_prefix
            );
            return Ok(None);
        }

        let mut rooms = self.rooms.write().await;
        if !rooms.contains_key(path) {
            if rooms.len() >= self.config.max_rooms {
                self.evict_idle(&mut rooms).await;
            }
            if rooms.len() >= self.config.max_rooms {
                log::warn!("Room limit reached, refusing {} on {path}", info.peer_id);
                return Ok(None);
            }
            let room = self.open_room(path).await;
            rooms.insert(path.to_string(), room);
        }
        let room_count = rooms.len();
        let Some(room) = rooms.get_mut(path) else {
            return Ok(None);
        };

        if room.broadcast.peer_count().await >= self.config.max_peers_per_room {
            log::warn!("Room {path} is full, rejecting {}", info.peer_id);
            return Ok(None);
        }

        let rx = room.broadcast.add_peer(info).await;
        let snapshot = room.snapshot(path)?;
        drop(rooms);

        self.stats.write().await.active_rooms = room_count;
        Ok(Some((rx, snapshot)))
    }

    async fn apply_patch(&self, path: &str, patch: &DocumentPatch) -> Result<(), BoxError> {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(path) else {
            log::warn!("Patch for unknown document {path}");
            return Ok(());
        };

        room.doc.apply_patch(patch);
        room.version += 1;
        self.persist(path, &room.doc).await;
        let snapshot = room.snapshot(path)?;
        let receivers = room.broadcast.broadcast_raw(snapshot);
        log::debug!(
            "Applied {:?} to {path} v{}, sent to {receivers} peers",
            patch.field_names(),
            room.version
        );
        drop(rooms);

        self.stats.write().await.patches_applied += 1;
        Ok(())
    }

    /// Remove a peer. The last peer out closes the room when storage
    /// holds its document.
    async fn leave(&self, path: &str, peer_id: &Uuid) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(path) else { return };
        room.broadcast.remove_peer(peer_id).await;
        if self.store.is_some() && room.broadcast.peer_count().await == 0 {
            rooms.remove(path);
            log::debug!("Closed room {path}");
        }
        let room_count = rooms.len();
        drop(rooms);

        self.stats.write().await.active_rooms = room_count;
    }
}

pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a server, opening storage if `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(DocumentStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)),
            None => None,
        };
        Ok(Self::with_store(config, store))
    }

    /// In-memory server on the default address.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), None)
    }

    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    fn with_store(config: ServerConfig, store: Option<Arc<DocumentStore>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
                store,
            }),
        }
    }

    /// Load every stored document into a room so reconnecting peers find
    /// it in memory.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.shared.store else {
            return Ok(0);
        };

        let paths = store.list_documents()?;
        let mut recovered = 0;
        for path in &paths {
            let room = self.shared.open_room(path).await;
            self.shared.rooms.write().await.insert(path.clone(), room);
            recovered += 1;
        }

        let rooms = self.shared.rooms.read().await.len();
        self.shared.stats.write().await.active_rooms = rooms;
        log::info!("Recovery complete: {recovered}/{} documents restored", paths.len());
        Ok(recovered)
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} documents from persistent storage");
        }
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<Shared>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Set on Join
        let mut peer: Option<(Uuid, String)> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let data = match msg {
                            Some(Ok(Message::Binary(data))) => data,
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };
                        {
                            let mut s = shared.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }

                        match sync_msg.msg_type {
                            MessageType::Join => {
                                if peer.is_some() {
                                    log::warn!("Duplicate join from {addr}");
                                    continue;
                                }
                                let info = sync_msg.peer_info().unwrap_or_else(|_| {
                                    PeerInfo::with_id(sync_msg.peer_id, "Anonymous")
                                });
                                let name = info.name.clone();
                                let Some((rx, snapshot)) = shared.join(&sync_msg.path, info).await? else {
                                    ws_sender.send(Message::Close(None)).await?;
                                    break;
                                };
                                broadcast_rx = Some(rx);
                                peer = Some((sync_msg.peer_id, sync_msg.path.clone()));
                                ws_sender.send(Message::Binary(snapshot.to_vec().into())).await?;
                                log::info!("Peer {name} ({}) joined {}", sync_msg.peer_id, sync_msg.path);
                            }

                            MessageType::Patch => {
                                let Some((_, path)) = &peer else {
                                    log::warn!("Patch before join from {addr}");
                                    continue;
                                };
                                if &sync_msg.path != path {
                                    log::warn!("Patch for {} from peer joined to {path}", sync_msg.path);
                                    continue;
                                }
                                match sync_msg.document_patch() {
                                    Ok(patch) => shared.apply_patch(path, &patch).await?,
                                    Err(e) => log::warn!("Bad patch from {addr}: {e}"),
                                }
                            }

                            MessageType::Ping => {
                                let pong = SyncMessage::pong(sync_msg.peer_id).encode()?;
                                ws_sender.send(Message::Binary(pong.into())).await?;
                            }

                            other => {
                                log::debug!("Unhandled message type: {other:?}");
                            }
                        }
                    }

                    msg = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match msg {
                            Ok(data) => {
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Peer at {addr} lagged by {n} snapshots");
                                if let Some((_, path)) = &peer {
                                    if let Some(room) = shared.rooms.read().await.get(path) {
                                        room.broadcast.record_skipped(n);
                                    }
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        if let Some((peer_id, path)) = &peer {
            shared.leave(path, peer_id).await;
            log::info!("Peer {peer_id} left {path}");
        }
        {
            let mut s = shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        if let Some(store) = &shared.store {
            if let Err(e) = store.sync() {
                log::warn!("Storage sync failed: {e}");
            }
        }

        result
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.shared.store.as_ref()
    }

    /// The authoritative document at `path`, if a room is open for it.
    pub async fn document(&self, path: &str) -> Option<WorkshopDocument> {
        self.shared.rooms.read().await.get(path).map(|r| r.doc.clone())
    }

    pub async fn peer_count(&self, path: &str) -> usize {
        match self.shared.rooms.read().await.get(path) {
            Some(room) => room.broadcast.peer_count().await,
            None => 0,
        }
    }
}
