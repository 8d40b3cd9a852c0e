//! WebSocket server holding the authoritative tree.
//!
//! ```text
//! Session A ──┐                       ┌── Session A
//!             ├── Tree (authority) ───┤
//! Session B ──┘        │              └── Session B
//!                      ├── BroadcastGroup (fan-out, origin skipped)
//!                      └── SnapshotStore (periodic JSON snapshot)
//! ```
//!
//! A patch received from a session is applied quietly to the authoritative
//! tree and then re-broadcast to every other session. Loud mutations made
//! directly on the tree (discovery, local API) reach every session through
//! the tree's subscriber. A rejected patch is answered with `tree_error`
//! to its sender only.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use devtree_core::{Patch, SnapshotError, Tree};

use crate::broadcast::{BroadcastGroup, PeerInfo};
use crate::protocol::{ProtocolError, TreeMessage};
use crate::storage::SnapshotStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Frames a session may fall behind before it is resynchronized
    pub broadcast_capacity: usize,
    /// Seconds between snapshot writes (only written when dirty)
    pub save_interval_secs: u64,
    /// Snapshot file (None = in-memory only)
    pub snapshot_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            broadcast_capacity: 256,
            save_interval_secs: 60,
            snapshot_path: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub applied_patches: u64,
    pub rejected_patches: u64,
    pub resyncs: u64,
    pub persisted_snapshots: u64,
}

/// Everything a connection task needs.
#[derive(Clone)]
struct Shared {
    tree: Arc<Mutex<Tree>>,
    broadcast: Arc<BroadcastGroup>,
    stats: Arc<RwLock<ServerStats>>,
    store: Option<Arc<SnapshotStore>>,
}

pub struct SyncServer {
    config: ServerConfig,
    shared: Shared,
}

impl SyncServer {
    /// Wrap `tree` as the authoritative tree.
    ///
    /// Loud mutations on it are broadcast to every session and mark the
    /// snapshot dirty.
    pub fn new(config: ServerConfig, mut tree: Tree) -> Self {
        let broadcast = Arc::new(BroadcastGroup::new(config.broadcast_capacity));
        let store = config
            .snapshot_path
            .as_ref()
            .map(|path| Arc::new(SnapshotStore::new(path.clone())));

        let fan_out = broadcast.clone();
        let dirty = store.clone();
        tree.subscribe(move |event| {
            if let Some(store) = &dirty {
                store.mark_dirty();
            }
            if let Err(e) = fan_out.broadcast(None, &TreeMessage::from_event(event)) {
                log::error!("Failed to broadcast local change: {e}");
            }
        });

        Self {
            config,
            shared: Shared {
                tree: Arc::new(Mutex::new(tree)),
                broadcast,
                stats: Arc::new(RwLock::new(ServerStats::default())),
                store,
            },
        }
    }

    /// Create with default configuration and an empty tree.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Tree::new())
    }

    /// The authoritative tree. Mutating it through its loud API publishes
    /// to all sessions.
    pub fn tree(&self) -> Arc<Mutex<Tree>> {
        self.shared.tree.clone()
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        if let Some(store) = self.shared.store.clone() {
            let shared = self.shared.clone();
            let every = Duration::from_secs(self.config.save_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if store.is_dirty() {
                        if let Err(e) = Self::persist(&shared, &store).await {
                            log::error!("Periodic snapshot to {} failed: {e}", store.path().display());
                        }
                    }
                }
            });
        }

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
        shared: Shared,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let peer = PeerInfo::new(Some(addr));
        let session_id = peer.session_id;
        let mut broadcast_rx = shared.broadcast.add_peer(peer).await;
        log::info!("Session {session_id} opened from {addr}");

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let outcome: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = shared.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += text.len() as u64;
                                }
                                match TreeMessage::decode(text.as_str()) {
                                    Ok(message) => {
                                        if let Some(reply) = Self::handle_message(message, session_id, &shared).await {
                                            ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                                        }
                                    }
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                    }
                                }
                            }

                            Some(Ok(Message::Binary(_))) => {
                                log::warn!("Session {session_id}: {}", ProtocolError::UnexpectedFrame);
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    envelope = broadcast_rx.recv() => {
                        match envelope {
                            Ok(envelope) => {
                                // Never echo a patch back to its sender.
                                if envelope.origin == Some(session_id) {
                                    continue;
                                }
                                ws_sender.send(Message::Text(envelope.frame.clone().into())).await?;
                            }
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Session {session_id} lagged by {n} frames, resending tree");
                                shared.broadcast.record_dropped(n);
                                shared.stats.write().await.resyncs += 1;
                                let init = TreeMessage::TreeInit(shared.tree.lock().await.snapshot());
                                ws_sender.send(Message::Text(init.encode()?.into())).await?;
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        shared.broadcast.remove_peer(&session_id).await;
        shared.stats.write().await.active_connections -= 1;
        log::info!("Session {session_id} closed");
        outcome
    }

    /// Handle one decoded event. Returns the reply for the sender, if any.
    async fn handle_message(message: TreeMessage, session_id: Uuid, shared: &Shared) -> Option<TreeMessage> {
        match message {
            TreeMessage::TreeRequestInit => {
                log::debug!("Session {session_id} requested init");
                Some(TreeMessage::TreeInit(shared.tree.lock().await.snapshot()))
            }

            TreeMessage::TreeUpdate(raw) => Self::apply_remote(raw, false, session_id, shared).await,
            TreeMessage::TreeDelete(raw) => Self::apply_remote(raw, true, session_id, shared).await,

            TreeMessage::Ping => Some(TreeMessage::Pong),
            TreeMessage::Pong => None,

            other => {
                log::debug!("Session {session_id} sent unexpected {}", other.name());
                None
            }
        }
    }

    /// Quietly apply a session's patch, then relay it to everyone else.
    async fn apply_remote(
        raw: serde_json::Value,
        delete: bool,
        session_id: Uuid,
        shared: &Shared,
    ) -> Option<TreeMessage> {
        let outcome = match Patch::from_value(raw) {
            Ok(patch) => {
                let mut tree = shared.tree.lock().await;
                let applied = if delete {
                    tree.apply_deletion(&patch)
                } else {
                    tree.apply_update(&patch)
                };
                // Relay while still holding the tree so sessions see patches
                // in the order the authority applied them.
                applied.map(|()| {
                    let relay = if delete {
                        TreeMessage::delete(&patch)
                    } else {
                        TreeMessage::update(&patch)
                    };
                    if let Err(e) = shared.broadcast.broadcast(Some(session_id), &relay) {
                        log::error!("Failed to relay patch from {session_id}: {e}");
                    }
                    if let Some(store) = &shared.store {
                        store.mark_dirty();
                    }
                })
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                shared.stats.write().await.applied_patches += 1;
                None
            }
            Err(e) => {
                log::warn!("Rejected patch from session {session_id}: {e}");
                shared.stats.write().await.rejected_patches += 1;
                Some(TreeMessage::error(&e))
            }
        }
    }

    async fn persist(shared: &Shared, store: &SnapshotStore) -> Result<(), SnapshotError> {
        // Mutations mark the store dirty under the tree lock, so clearing the
        // flag here pairs it exactly with the snapshot taken.
        let (snapshot, was_dirty) = {
            let tree = shared.tree.lock().await;
            let was_dirty = store.take_dirty();
            (tree.snapshot(), was_dirty)
        };
        if let Err(e) = store.save(&snapshot) {
            if was_dirty {
                store.mark_dirty();
            }
            return Err(e);
        }
        shared.stats.write().await.persisted_snapshots += 1;
        Ok(())
    }

    /// Write the snapshot now. Returns `false` when no snapshot path is set.
    pub async fn save_snapshot(&self) -> Result<bool, SnapshotError> {
        match &self.shared.store {
            Some(store) => Self::persist(&self.shared, store).await.map(|()| true),
            None => Ok(false),
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.shared.broadcast
    }

    pub fn store(&self) -> Option<&Arc<SnapshotStore>> {
        self.shared.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devtree_core::{EndpointParams, ErrorKind};
    use serde_json::json;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.save_interval_secs, 60);
        assert!(config.snapshot_path.is_none());
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:3000");
        assert!(server.store().is_none());
        assert!(!server.save_snapshot().await.unwrap());
        assert_eq!(server.tree().lock().await.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_local_mutation_is_broadcast() {
        let server = SyncServer::with_defaults();
        let mut rx = server.broadcast().subscribe();

        server.tree().lock().await.add_device("fe80::42", "Doomsday").unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.origin, None);
        assert!(matches!(
            TreeMessage::decode(&envelope.frame).unwrap(),
            TreeMessage::TreeUpdate(_)
        ));
    }

    #[tokio::test]
    async fn test_remote_patch_relayed_with_origin() {
        let server = SyncServer::with_defaults();
        let mut rx = server.broadcast().subscribe();
        let session = Uuid::new_v4();

        let raw = json!({ "devices": { "fe80::42": { "name": "Doomsday", "last_update": 1 } } });
        let reply = SyncServer::handle_message(TreeMessage::TreeUpdate(raw), session, &server.shared).await;
        assert!(reply.is_none());

        // Quiet apply: exactly one frame, the relay, tagged with the sender.
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.origin, Some(session));
        assert!(rx.try_recv().is_err());
        assert_eq!(server.tree().lock().await.device("fe80::42").unwrap().name(), "Doomsday");
        assert_eq!(server.stats().await.applied_patches, 1);
    }

    #[tokio::test]
    async fn test_rejected_patch_answers_sender_only() {
        let server = SyncServer::with_defaults();
        let mut rx = server.broadcast().subscribe();

        let raw = json!({ "devices": { "fe80::42": { "name": "No timestamp" } } });
        let reply = SyncServer::handle_message(TreeMessage::TreeUpdate(raw), Uuid::new_v4(), &server.shared).await;
        match reply {
            Some(TreeMessage::TreeError(report)) => assert_eq!(report.kind, ErrorKind::MalformedPatch),
            other => panic!("Expected tree_error, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(server.tree().lock().await.device_count(), 0);
        assert_eq!(server.stats().await.rejected_patches, 1);
    }

    #[tokio::test]
    async fn test_request_init_returns_snapshot() {
        let server = SyncServer::with_defaults();
        server
            .tree()
            .lock()
            .await
            .add_endpoint("fe80::1", 2, &EndpointParams::sensor(3, "power").with_device_name("Plug"))
            .unwrap();

        let reply = SyncServer::handle_message(TreeMessage::TreeRequestInit, Uuid::new_v4(), &server.shared).await;
        match reply {
            Some(TreeMessage::TreeInit(snapshot)) => assert!(snapshot.devices.contains_key("fe80::1")),
            other => panic!("Expected tree_init, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let server = SyncServer::with_defaults();
        let reply = SyncServer::handle_message(TreeMessage::Ping, Uuid::new_v4(), &server.shared).await;
        assert_eq!(reply, Some(TreeMessage::Pong));
    }

    #[tokio::test]
    async fn test_save_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            snapshot_path: Some(dir.path().join("devicetree.json")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config, Tree::new());
        server.tree().lock().await.add_device("fe80::42", "Doomsday").unwrap();
        assert!(server.store().unwrap().is_dirty());

        assert!(server.save_snapshot().await.unwrap());
        assert!(!server.store().unwrap().is_dirty());
        assert_eq!(server.stats().await.persisted_snapshots, 1);

        let loaded = Tree::load(dir.path().join("devicetree.json"), Default::default()).unwrap();
        assert!(loaded.device("fe80::42").is_some());
    }

    #[tokio::test]
    async fn test_remote_patch_marks_dirty_before_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            snapshot_path: Some(dir.path().join("devicetree.json")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config, Tree::new());
        let raw = json!({ "devices": { "fe80::42": { "name": "Doomsday", "last_update": 1 } } });
        SyncServer::handle_message(TreeMessage::TreeUpdate(raw), Uuid::new_v4(), &server.shared).await;
        assert!(server.store().unwrap().is_dirty());

        assert!(server.save_snapshot().await.unwrap());
        assert!(!server.store().unwrap().is_dirty());
    }

    #[tokio::test]
    async fn test_blank_change_never_relayed_as_tombstone() {
        let server = SyncServer::with_defaults();
        server.tree().lock().await.add_endpoint(
            "fe80::1",
            2,
            &EndpointParams::sensor(3, "power").with_device_name("Plug"),
        )
        .unwrap();
        let mut rx = server.broadcast().subscribe();

        for raw in [
            json!({ "devices": { "fe80::1": { "endpoints": {} } } }),
            json!({ "devices": { "fe80::1": { "name": null } } }),
            json!({ "devices": { "fe80::1": { "endpoints": { "2": { "minvalue": null } } } } }),
        ] {
            let reply = SyncServer::handle_message(TreeMessage::TreeUpdate(raw), Uuid::new_v4(), &server.shared).await;
            assert!(matches!(reply, Some(TreeMessage::TreeError(_))));
        }
        assert!(rx.try_recv().is_err());

        // An explicit null value is relayed as a value, not an endpoint tombstone.
        let raw = json!({ "devices": { "fe80::1": { "endpoints": { "2": { "last_value": null, "last_update": 9 } } } } });
        let reply = SyncServer::handle_message(TreeMessage::TreeUpdate(raw.clone()), Uuid::new_v4(), &server.shared).await;
        assert!(reply.is_none());
        let envelope = rx.recv().await.unwrap();
        assert_eq!(TreeMessage::decode(&envelope.frame).unwrap(), TreeMessage::TreeUpdate(raw));
        assert!(server.tree().lock().await.endpoint_by_id("fe80::1.2").unwrap().last_value().is_null());
    }
}
