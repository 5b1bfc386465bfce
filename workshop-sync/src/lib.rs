//! # workshop-sync: keeping every participant's workshop document in step
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐  save(patch)  ┌──────────────┐   WebSocket   ┌─────────────┐
//! │ WorkshopController │ ────────────► │ WorkshopStore│ ◄───────────► │ SyncServer  │
//! │ (per participant)  │ ◄──────────── │ Local/Remote │  Binary Proto │ (authority) │
//! └────────────────────┘  full docs    └──────────────┘               └──────┬──────┘
//!                                                                            │
//!                                                                    ┌───────┴───────┐
//!                                                                    │ DocumentStore │
//!                                                                    │ (RocksDB)     │
//!                                                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`controller`]: in-memory document, user actions, ordered writes
//! - [`store`]: the store trait, the local JSON file store, RocksDB storage
//! - [`client`]: [`RemoteStore`], a store backed by the sync server
//! - [`server`]: WebSocket sync server with one room per document path
//! - [`protocol`]: binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: snapshot fan-out within a room

pub mod broadcast;
pub mod client;
pub mod controller;
pub mod protocol;
pub mod server;
pub mod store;

pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ClientConfig, ConnectionState, RemoteStore};
pub use controller::{WorkshopConfig, WorkshopController};
pub use protocol::{
    MessageType, PeerInfo, ProtocolError, SyncMessage, DEFAULT_DOCUMENT_PATH, DOCUMENT_PREFIX,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use store::{
    ChangeCallback, DocumentMetadata, DocumentStore, LocalBackend, LocalStore, StoreConfig,
    StoreError, Subscription, WorkshopStore,
};
