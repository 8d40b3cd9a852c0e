//! WebSocket client keeping a local replica of the server's tree.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Quiet application of patches relayed by the server
//! - Publishing of loud mutations made on the replica
//! - Offline queue for mutations made while disconnected
//!
//! On connect, queued mutations are replayed first and `tree_request_init`
//! follows, so the snapshot the server answers with already contains them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use devtree_core::{ErrorReport, Patch, Tree, TreeError};

use crate::protocol::{ProtocolError, TreeMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// The replica was replaced by a server snapshot
    Initialized { devices: usize, views: usize },
    /// A relayed update was applied to the replica
    RemoteUpdate(Patch),
    /// A relayed deletion was applied to the replica
    RemoteDelete(Patch),
    /// The server rejected one of our patches
    Rejected(ErrorReport),
    /// A relayed patch did not apply; a fresh snapshot was requested
    Resync(ErrorReport),
    Pong,
}

/// Frames produced while disconnected, replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedFrame>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedFrame {
    frame: String,
    #[allow(dead_code)]
    timestamp: std::time::Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns `false` when the queue is full.
    pub fn enqueue(&mut self, frame: String) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedFrame {
            frame,
            timestamp: std::time::Instant::now(),
        });
        true
    }

    pub fn drain(&mut self) -> Vec<String> {
        self.queue.drain(..).map(|q| q.frame).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|q| q.frame.len()).sum()
    }
}

/// Where outgoing frames go: the live writer task, or the offline queue.
///
/// Guarded by a std mutex because the replica's subscriber runs
/// synchronously inside tree mutations.
struct Outbox {
    link: Option<mpsc::UnboundedSender<String>>,
    queue: OfflineQueue,
}

impl Outbox {
    fn send_live(&mut self, frame: String) -> bool {
        match &self.link {
            Some(link) => link.send(frame).is_ok(),
            None => false,
        }
    }

    fn send_or_queue(&mut self, frame: String) -> bool {
        match &self.link {
            Some(link) => match link.send(frame) {
                Ok(()) => true,
                Err(mpsc::error::SendError(frame)) => {
                    self.link = None;
                    self.queue.enqueue(frame)
                }
            },
            None => self.queue.enqueue(frame),
        }
    }
}

fn send_live(outbox: &StdMutex<Outbox>, msg: &TreeMessage) -> Result<(), ProtocolError> {
    let frame = msg.encode()?;
    let mut outbox = outbox.lock().map_err(|_| ProtocolError::ConnectionClosed)?;
    if outbox.send_live(frame) {
        Ok(())
    } else {
        Err(ProtocolError::ConnectionClosed)
    }
}

pub struct SyncClient {
    server_url: String,
    replica: Arc<Mutex<Tree>>,
    state: Arc<RwLock<ConnectionState>>,
    outbox: Arc<StdMutex<Outbox>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, replica: Tree) -> Self {
        Self::with_queue_capacity(server_url, replica, 10_000)
    }

    /// Create a client whose loud replica mutations are published to the
    /// server, or queued (up to `max_queued`) while offline.
    pub fn with_queue_capacity(server_url: impl Into<String>, mut replica: Tree, max_queued: usize) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let outbox = Arc::new(StdMutex::new(Outbox {
            link: None,
            queue: OfflineQueue::new(max_queued),
        }));

        let publish = outbox.clone();
        replica.subscribe(move |event| {
            let frame = match TreeMessage::from_event(event).encode() {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("Failed to encode local change: {e}");
                    return;
                }
            };
            match publish.lock() {
                Ok(mut outbox) => {
                    if !outbox.send_or_queue(frame) {
                        log::warn!("Offline queue full, dropping local change");
                    }
                }
                Err(_) => log::error!("Outbox poisoned, dropping local change"),
            }
        });

        Self {
            server_url: server_url.into(),
            replica: Arc::new(Mutex::new(replica)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outbox,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, replay queued mutations and request the server's tree.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionFailed(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing frames to the socket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        {
            let mut outbox = self
                .outbox
                .lock()
                .map_err(|_| ProtocolError::ConnectionClosed)?;
            let queued = outbox.queue.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued changes", queued.len());
            }
            for frame in queued {
                let _ = out_tx.send(frame);
            }
            let _ = out_tx.send(TreeMessage::TreeRequestInit.encode()?);
            outbox.link = Some(out_tx);
        }

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.try_send(SyncEvent::Connected);

        // Reader task: apply what the server sends
        let replica = self.replica.clone();
        let state = self.state.clone();
        let outbox = self.outbox.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match TreeMessage::decode(text.as_str()) {
                        Ok(message) => {
                            if let Some(event) = Self::handle_message(message, &replica, &outbox).await {
                                if event_tx.try_send(event).is_err() {
                                    log::trace!("Event channel full or closed");
                                }
                            }
                        }
                        Err(e) => log::warn!("Failed to decode server message: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            if let Ok(mut outbox) = outbox.lock() {
                outbox.link = None;
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.try_send(SyncEvent::Disconnected);
            log::info!("Disconnected from server");
        });

        Ok(())
    }

    async fn handle_message(
        message: TreeMessage,
        replica: &Mutex<Tree>,
        outbox: &StdMutex<Outbox>,
    ) -> Option<SyncEvent> {
        match message {
            TreeMessage::TreeInit(snapshot) => {
                let mut tree = replica.lock().await;
                match tree.hydrate(&snapshot) {
                    Ok(()) => {
                        log::info!("Replica initialized with {} devices", tree.device_count());
                        Some(SyncEvent::Initialized {
                            devices: tree.device_count(),
                            views: tree.view_count(),
                        })
                    }
                    Err(e) => {
                        log::error!("Server snapshot rejected: {e}");
                        None
                    }
                }
            }

            TreeMessage::TreeUpdate(raw) => Self::apply_remote(raw, false, replica, outbox).await,
            TreeMessage::TreeDelete(raw) => Self::apply_remote(raw, true, replica, outbox).await,

            TreeMessage::TreeError(report) => {
                log::warn!("Server rejected a change: {:?}: {}", report.kind, report.detail);
                Some(SyncEvent::Rejected(report))
            }

            TreeMessage::Ping => {
                let _ = send_live(outbox, &TreeMessage::Pong);
                None
            }
            TreeMessage::Pong => Some(SyncEvent::Pong),
            TreeMessage::TreeRequestInit => None,
        }
    }

    /// Quietly apply a relayed patch. A patch that does not fit the replica
    /// means it drifted, so the whole tree is requested again.
    async fn apply_remote(
        raw: serde_json::Value,
        delete: bool,
        replica: &Mutex<Tree>,
        outbox: &StdMutex<Outbox>,
    ) -> Option<SyncEvent> {
        let result: Result<Patch, TreeError> = match Patch::from_value(raw) {
            Ok(patch) => {
                let mut tree = replica.lock().await;
                let applied = if delete {
                    tree.apply_deletion(&patch)
                } else {
                    tree.apply_update(&patch)
                };
                applied.map(|()| patch)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(patch) if delete => Some(SyncEvent::RemoteDelete(patch)),
            Ok(patch) => Some(SyncEvent::RemoteUpdate(patch)),
            Err(e) => {
                log::info!("Relayed patch did not apply ({e}), requesting resync");
                if let Err(send_err) = send_live(outbox, &TreeMessage::TreeRequestInit) {
                    log::warn!("Could not request resync: {send_err}");
                }
                Some(SyncEvent::Resync(ErrorReport::from(&e)))
            }
        }
    }

    /// Drop the connection. Later mutations are queued.
    pub async fn disconnect(&self) {
        if let Ok(mut outbox) = self.outbox.lock() {
            outbox.link = None;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Run `f` against the replica. Loud mutations made inside are
    /// published (or queued while offline).
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut Tree) -> R) -> R {
        let mut tree = self.replica.lock().await;
        f(&mut tree)
    }

    pub fn replica(&self) -> Arc<Mutex<Tree>> {
        self.replica.clone()
    }

    pub async fn request_init(&self) -> Result<(), ProtocolError> {
        send_live(&self.outbox, &TreeMessage::TreeRequestInit)
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        send_live(&self.outbox, &TreeMessage::Ping)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn offline_queue_len(&self) -> usize {
        self.outbox.lock().map(|o| o.queue.len()).unwrap_or(0)
    }
}
