//! Fan-out of tree events to every connected session.
//!
//! Uses a tokio broadcast channel: each session holds an independent
//! receiver buffering up to `capacity` frames. Frames are encoded once and
//! shared. Each frame records the session it came from so that session can
//! skip it; the tree never echoes a patch back to its sender.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, TreeMessage};

/// One connected session.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub session_id: Uuid,
    pub addr: Option<SocketAddr>,
    pub connected_at: u64,
}

impl PeerInfo {
    pub fn new(addr: Option<SocketAddr>) -> Self {
        Self::with_id(Uuid::new_v4(), addr)
    }

    pub fn with_id(session_id: Uuid, addr: Option<SocketAddr>) -> Self {
        Self {
            session_id,
            addr,
            connected_at: devtree_core::unix_ts(),
        }
    }
}

/// An encoded frame and the session that caused it.
///
/// `origin` is `None` for mutations made directly on the server tree.
#[derive(Debug)]
pub struct Envelope {
    pub origin: Option<Uuid>,
    pub frame: String,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the send path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    peers: Arc<RwLock<HashMap<Uuid, PeerInfo>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames a session may fall behind before
    /// it lags and has to be resynchronized.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Envelope>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.session_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, session_id: &Uuid) -> Option<PeerInfo> {
        let mut peers = self.peers.write().await;
        peers.remove(session_id)
    }

    /// Encode `msg` once and fan it out. Synchronous, so it can run inside a
    /// tree subscriber.
    ///
    /// Returns the number of receivers, including the origin session.
    pub fn broadcast(&self, origin: Option<Uuid>, msg: &TreeMessage) -> Result<usize, ProtocolError> {
        let frame = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(Envelope { origin, frame })))
    }

    pub fn broadcast_raw(&self, envelope: Arc<Envelope>) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, session_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(session_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devtree_core::Patch;

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let peer = PeerInfo::new(None);
        let session_id = peer.session_id;

        let _rx = group.add_peer(peer).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&session_id).await);

        group.remove_peer(&session_id).await;
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&session_id).await);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_keeps_origin() {
        let group = BroadcastGroup::new(16);
        let alice = PeerInfo::new(None);
        let bob = PeerInfo::new(None);

        let mut rx_alice = group.add_peer(alice.clone()).await;
        let mut rx_bob = group.add_peer(bob).await;

        let msg = TreeMessage::delete(&Patch::device_tombstone("fe80::1"));
        let count = group.broadcast(Some(alice.session_id), &msg).unwrap();
        // Filtering the origin out is the session's job.
        assert_eq!(count, 2);

        let a = rx_alice.recv().await.unwrap();
        let b = rx_bob.recv().await.unwrap();
        assert_eq!(a.origin, Some(alice.session_id));
        assert_eq!(TreeMessage::decode(&b.frame).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_broadcast_without_peers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast(None, &TreeMessage::Ping).unwrap(), 0);
        assert_eq!(group.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(PeerInfo::new(None)).await;
        for _ in 0..5 {
            group.broadcast(None, &TreeMessage::Ping).unwrap();
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                group.record_dropped(n);
                assert_eq!(group.stats().await.messages_dropped, n);
            }
            other => panic!("Expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peers_list() {
        let group = BroadcastGroup::new(16);
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let _rx1 = group.add_peer(PeerInfo::new(Some(addr))).await;
        let _rx2 = group.add_peer(PeerInfo::new(None)).await;

        let peers = group.peers().await;
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().any(|p| p.addr == Some(addr)));
        assert_eq!(group.capacity(), 16);
    }
}
