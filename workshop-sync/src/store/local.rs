//! Single-machine store: one JSON file, many handles.
//!
//! Each [`LocalStore`] handle behaves like a browser tab on the same
//! machine. A save rewrites the file and notifies every handle. The
//! writing handle is notified before the save returns.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use workshop_core::{initial_document, DocumentPatch, WorkshopDocument};

use super::{
    ChangeCallback, ChangeFeed, Listener, Published, StoreError, Subscription, WorkshopStore,
};

/// File stem of the state file.
pub const LOCAL_STATE_KEY: &str = "workshop_global_state";

const FEED_CAPACITY: usize = 64;

pub struct LocalBackend {
    path: PathBuf,
    write_lock: Mutex<()>,
    feed: ChangeFeed,
}

impl LocalBackend {
    /// Use `<dir>/workshop_global_state.json`. The file is created on the
    /// first save.
    pub fn open(dir: impl AsRef<Path>) -> Arc<Self> {
        Self::at(dir.as_ref().join(format!("{LOCAL_STATE_KEY}.json")))
    }

    pub fn at(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            feed: ChangeFeed::new(FEED_CAPACITY),
        })
    }

    /// A new handle on the shared file.
    pub fn handle(self: &Arc<Self>) -> LocalStore {
        LocalStore {
            backend: self.clone(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<WorkshopDocument, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    /// Read, falling back to the initial document.
    fn read_or_initial(&self) -> WorkshopDocument {
        match self.read() {
            Ok(doc) => doc,
            Err(StoreError::NotFound(_)) => {
                log::debug!("No state at {}, starting fresh", self.path.display());
                initial_document()
            }
            Err(e) => {
                log::error!("Failed to read {}: {e}; starting fresh", self.path.display());
                initial_document()
            }
        }
    }

    fn write(&self, doc: &WorkshopDocument) -> Result<(), StoreError> {
        let json =
            serde_json::to_vec(doc).map_err(|e| StoreError::SerializationError(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write-then-rename so readers never see half a file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Merge `patch` into the file and publish the result. Returns the
    /// feed sequence number and the document written.
    fn save(&self, patch: &DocumentPatch) -> Result<(u64, Arc<WorkshopDocument>), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let next = Arc::new(self.read_or_initial().patched(patch));
        self.write(&next)?;
        let seq = self.feed.publish(next.clone());
        Ok((seq, next))
    }
}

/// One handle on a [`LocalBackend`].
pub struct LocalStore {
    backend: Arc<LocalBackend>,
    listeners: Mutex<Vec<Weak<Listener>>>,
}

impl LocalStore {
    /// Shorthand for a backend with a single handle.
    pub fn open(dir: impl AsRef<Path>) -> Self {
        LocalBackend::open(dir).handle()
    }

    pub fn backend(&self) -> &Arc<LocalBackend> {
        &self.backend
    }

    fn live_listeners(&self) -> Vec<Arc<Listener>> {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|l| l.upgrade().is_some_and(|l| l.is_active()));
        listeners.iter().filter_map(Weak::upgrade).collect()
    }
}

impl WorkshopStore for LocalStore {
    fn writes_immediately(&self) -> bool {
        true
    }

    fn save_now(&self, patch: &DocumentPatch) {
        match self.backend.save(patch) {
            Ok((seq, doc)) => {
                for listener in self.live_listeners() {
                    listener.deliver(seq, doc.clone());
                }
            }
            Err(e) => log::error!(
                "Failed to save {:?} to {}: {e}",
                patch.field_names(),
                self.backend.path.display()
            ),
        }
    }

    async fn load(&self) -> WorkshopDocument {
        self.backend.read_or_initial()
    }

    async fn save(&self, patch: DocumentPatch) {
        self.save_now(&patch);
    }

    fn subscribe(&self, on_change: ChangeCallback) -> Subscription {
        let backend = &self.backend;
        let subscription = backend.feed.subscribe(
            |feed: &ChangeFeed| {
                feed.latest().or_else(|| {
                    Some(Published {
                        seq: 0,
                        doc: Arc::new(backend.read_or_initial()),
                    })
                })
            },
            on_change,
        );
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(subscription.listener()));
        subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use workshop_core::patch::fields;
    use workshop_core::WorkshopStatus;

    #[tokio::test]
    async fn test_missing_file_loads_initial() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        assert_eq!(store.load().await, initial_document());
        assert!(store.writes_immediately());
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_initial() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        fs::write(store.backend().path(), b"{not json").unwrap();
        assert_eq!(store.load().await, initial_document());
    }

    #[tokio::test]
    async fn test_save_merges_into_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());

        store.save(fields::CURRENT_STAGE.patch(2)).await;
        store.save(fields::STATUS.patch(WorkshopStatus::InProgress)).await;

        let reopened = LocalStore::open(dir.path());
        let doc = reopened.load().await;
        assert_eq!(doc.current_stage, 2);
        assert_eq!(doc.status, WorkshopStatus::InProgress);
        assert_eq!(doc.sticky_notes, initial_document().sticky_notes);
    }

    #[tokio::test]
    async fn test_every_handle_notified_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(dir.path());
        let writer = backend.handle();
        let reader = backend.handle();

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();
        let (reader_tx, mut reader_rx) = mpsc::unbounded_channel();
        let _w = writer.subscribe(Arc::new(move |doc: Arc<WorkshopDocument>| {
            let _ = writer_tx.send(doc);
        }));
        let _r = reader.subscribe(Arc::new(move |doc: Arc<WorkshopDocument>| {
            let _ = reader_tx.send(doc);
        }));

        // Both start with the current document.
        assert!(writer_rx.recv().await.is_some());
        assert!(reader_rx.recv().await.is_some());

        writer.save_now(&fields::IS_VOTING.patch(true));
        // The writer has it before save_now returns.
        assert!(writer_rx.try_recv().unwrap().is_voting);

        let seen = tokio::time::timeout(Duration::from_secs(2), reader_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(seen.is_voting);

        // The feed's copy of the same write is not delivered again.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(writer_rx.try_recv().is_err());
        assert!(reader_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscription_not_notified() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = store.subscribe(Arc::new(move |doc: Arc<WorkshopDocument>| {
            let _ = tx.send(doc);
        }));
        assert!(rx.try_recv().is_ok());
        drop(sub);

        store.save_now(&fields::IS_VOTING.patch(true));
        assert!(rx.try_recv().is_err());
        assert!(store.live_listeners().is_empty());
    }
}
