//! Binary protocol between `RemoteStore` clients and the `SyncServer`.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ path     │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ variable │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `Snapshot` and `Patch` payloads are JSON so the document keeps the same
//! camelCase layout on the wire as on disk. `Join` carries bincode `PeerInfo`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use workshop_core::{DocumentPatch, WorkshopDocument};

/// Where the shared workshop document lives unless configured otherwise.
pub const DEFAULT_DOCUMENT_PATH: &str = "workshops/main_workshop_state";

/// Document paths a server accepts by default all start with this.
pub const DOCUMENT_PREFIX: &str = "workshops/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks to follow a document; the server answers with a Snapshot
    Join = 1,
    /// Full document, server → client; `clock` is the document version
    Snapshot = 2,
    /// Partial write, client → server
    Patch = 3,
    /// Heartbeat ping
    Ping = 4,
    /// Heartbeat pong
    Pong = 5,
}

/// Client identity announced on join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Document path, e.g. `workshops/main_workshop_state`
    pub path: String,
    /// Per-client write counter on Patch, document version on Snapshot
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn join(path: impl Into<String>, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Join,
            peer_id: info.peer_id,
            path: path.into(),
            clock: 0,
            payload,
        })
    }

    /// Full document broadcast. Sent by the server, so `peer_id` is nil.
    pub fn snapshot(
        path: impl Into<String>,
        version: u64,
        doc: &WorkshopDocument,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(doc)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Snapshot,
            peer_id: Uuid::nil(),
            path: path.into(),
            clock: version,
            payload,
        })
    }

    pub fn patch(
        peer_id: Uuid,
        path: impl Into<String>,
        clock: u64,
        patch: &DocumentPatch,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(patch)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Patch,
            peer_id,
            path: path.into(),
            clock,
            payload,
        })
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            peer_id,
            path: String::new(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            peer_id,
            path: String::new(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }

    pub fn document(&self) -> Result<WorkshopDocument, ProtocolError> {
        if self.msg_type != MessageType::Snapshot {
            return Err(ProtocolError::InvalidMessageType);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn document_patch(&self) -> Result<DocumentPatch, ProtocolError> {
        if self.msg_type != MessageType::Patch {
            return Err(ProtocolError::InvalidMessageType);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionFailed(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
