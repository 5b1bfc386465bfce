//! Snapshot fan-out for one document room.
//!
//! Every accepted patch produces one encoded snapshot that goes to every
//! peer in the room, the writer included. Peers that fall more than
//! `capacity` snapshots behind skip ahead; only the newest snapshot matters
//! since each one carries the whole document.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::PeerInfo;

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub snapshots_sent: u64,
    pub snapshots_skipped: u64,
    pub active_peers: usize,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    snapshots_sent: AtomicU64,
    snapshots_skipped: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            snapshots_sent: AtomicU64::new(0),
            snapshots_skipped: AtomicU64::new(0),
        }
    }

    /// Register a peer. The receiver sees every snapshot sent after this call.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Send pre-encoded snapshot bytes to all peers. Returns the receiver count.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.snapshots_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record snapshots a lagging peer never saw.
    pub fn record_skipped(&self, count: u64) {
        self.snapshots_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            snapshots_sent: self.snapshots_sent.load(Ordering::Relaxed),
            snapshots_skipped: self.snapshots_skipped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_remove_peer() {
        let group = BroadcastGroup::new(16);
        let peer = PeerInfo::new("Mia");
        let id = peer.peer_id;

        let _rx = group.add_peer(peer).await;
        assert!(group.has_peer(&id).await);
        assert_eq!(group.peer_count().await, 1);
        let names: Vec<String> = group.peers().await.into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["Mia".to_string()]);

        let removed = group.remove_peer(&id).await.unwrap();
        assert_eq!(removed.name, "Mia");
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_every_peer_receives_snapshot() {
        let group = BroadcastGroup::new(16);
        let mut writer_rx = group.add_peer(PeerInfo::new("writer")).await;
        let mut other_rx = group.add_peer(PeerInfo::new("other")).await;

        let count = group.broadcast_raw(Arc::new(vec![1, 2, 3]));
        assert_eq!(count, 2);

        assert_eq!(*writer_rx.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(*other_rx.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_lagging_peer_skips_ahead() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(PeerInfo::new("slow")).await;

        for i in 0..5u8 {
            group.broadcast_raw(Arc::new(vec![i]));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_skipped(n),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(*rx.recv().await.unwrap(), vec![3]);
        assert_eq!(*rx.recv().await.unwrap(), vec![4]);

        let stats = group.stats().await;
        assert_eq!(stats.snapshots_sent, 5);
        assert_eq!(stats.snapshots_skipped, 3);
    }

    #[tokio::test]
    async fn test_broadcast_without_peers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast_raw(Arc::new(vec![0])), 0);
        assert_eq!(group.capacity(), 4);
    }
}
