//! Persistence adapters.
//!
//! A [`WorkshopStore`] loads the shared document, saves partial writes and
//! notifies subscribers with full documents. Two adapters exist:
//!
//! - [`LocalStore`]: a JSON file on this machine. Handles opened from the
//!   same [`LocalBackend`] see every write; the writer sees its own before
//!   the save returns.
//! - [`RemoteStore`](crate::client::RemoteStore): a connection to a
//!   [`SyncServer`](crate::server::SyncServer). Every write, including this
//!   client's own, comes back as a snapshot.
//!
//! [`DocumentStore`] is the server-side RocksDB backing for remote documents.

pub mod local;
pub mod rocks;

pub use local::{LocalBackend, LocalStore, LOCAL_STATE_KEY};
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use workshop_core::{DocumentPatch, WorkshopDocument};

/// Called with the full document whenever a store sees a change.
pub type ChangeCallback = Arc<dyn Fn(Arc<WorkshopDocument>) + Send + Sync>;

/// Both adapters report every write, the caller's own included, through
/// [`subscribe`](WorkshopStore::subscribe). They differ in when.
pub trait WorkshopStore: Send + Sync + 'static {
    /// Whether [`save_now`](WorkshopStore::save_now) is available. Such a
    /// store finishes the write, and notifies this handle's subscribers,
    /// before `save_now` returns.
    fn writes_immediately(&self) -> bool {
        false
    }

    /// Write `patch` from the calling thread. Only meaningful when
    /// [`writes_immediately`](WorkshopStore::writes_immediately) holds.
    fn save_now(&self, patch: &DocumentPatch) {
        log::error!(
            "Store cannot write {:?} immediately; dropping it",
            patch.field_names()
        );
    }

    /// The current document. Never fails: an unreadable or missing document
    /// is logged and the initial document is returned instead.
    fn load(&self) -> impl Future<Output = WorkshopDocument> + Send;

    /// Merge `patch` into the stored document. Failures are logged.
    fn save(&self, patch: DocumentPatch) -> impl Future<Output = ()> + Send;

    /// Start receiving full documents. If the store already knows the
    /// current document, `on_change` runs once before this returns.
    fn subscribe(&self, on_change: ChangeCallback) -> Subscription;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Document not found
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(path) => write!(f, "Document not found: {path}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}

/// One subscriber's end of a [`ChangeFeed`].
///
/// Documents carry the feed sequence number they were published under;
/// anything not newer than the last delivered document is dropped, so a
/// late delivery never rolls the subscriber back.
pub(crate) struct Listener {
    active: AtomicBool,
    /// Last delivered sequence number. Held while the callback runs.
    last_seq: Mutex<u64>,
    on_change: ChangeCallback,
}

impl Listener {
    fn new(on_change: ChangeCallback) -> Self {
        Self {
            active: AtomicBool::new(true),
            last_seq: Mutex::new(0),
            on_change,
        }
    }

    /// Hand `doc` to the callback unless it is stale or the subscription
    /// ended. Sequence 0 marks a document read outside the feed and is
    /// always delivered.
    pub(crate) fn deliver(&self, seq: u64, doc: Arc<WorkshopDocument>) -> bool {
        let mut last = self.last_seq.lock().unwrap_or_else(|e| e.into_inner());
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        if seq != 0 && seq <= *last {
            log::trace!("Dropping document #{seq}, already at #{}", *last);
            return false;
        }
        *last = (*last).max(seq);
        (self.on_change)(doc);
        true
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        // Wait out a callback already in flight.
        drop(self.last_seq.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

/// A live change subscription. Dropping it unsubscribes.
///
/// Once [`unsubscribe`](Subscription::unsubscribe) returns, the callback is
/// not running and will not run again. Calling it from inside the callback
/// deadlocks.
pub struct Subscription {
    listener: Arc<Listener>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.listener.is_active()
    }

    pub fn unsubscribe(mut self) {
        self.stop();
    }

    pub(crate) fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    fn stop(&mut self) {
        self.listener.stop();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// A document as published on a [`ChangeFeed`].
#[derive(Clone)]
pub(crate) struct Published {
    pub(crate) seq: u64,
    pub(crate) doc: Arc<WorkshopDocument>,
}

/// In-process fan-out of full documents, shared by both adapters.
///
/// Callers serialize their `publish` calls, so sequence numbers follow
/// the order documents were produced in.
pub(crate) struct ChangeFeed {
    sender: broadcast::Sender<Published>,
    latest: RwLock<Option<Published>>,
    next_seq: AtomicU64,
}

impl ChangeFeed {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            latest: RwLock::new(None),
            next_seq: AtomicU64::new(1),
        }
    }

    pub(crate) fn latest(&self) -> Option<Published> {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn latest_document(&self) -> Option<Arc<WorkshopDocument>> {
        self.latest().map(|p| p.doc)
    }

    /// Publish `doc` and return its sequence number.
    pub(crate) fn publish(&self, doc: Arc<WorkshopDocument>) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let published = Published { seq, doc };
        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = Some(published.clone());
        // No receivers is fine.
        let _ = self.sender.send(published);
        seq
    }

    pub(crate) fn receiver(&self) -> broadcast::Receiver<Published> {
        self.sender.subscribe()
    }

    /// Deliver every document published from now on. Whatever `current`
    /// yields is delivered first, before this returns; it runs after the
    /// receiver exists so nothing published meanwhile is lost.
    pub(crate) fn subscribe<F>(&self, current: F, on_change: ChangeCallback) -> Subscription
    where
        F: FnOnce(&Self) -> Option<Published>,
    {
        let mut rx = self.sender.subscribe();
        let listener = Arc::new(Listener::new(on_change));

        if let Some(Published { seq, doc }) = current(self) {
            listener.deliver(seq, doc);
        }

        let task = {
            let listener = listener.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(Published { seq, doc }) => {
                            listener.deliver(seq, doc);
                            if !listener.is_active() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Subscriber lagged, skipped {n} documents");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        Subscription {
            listener,
            task: Some(task),
        }
    }
}
