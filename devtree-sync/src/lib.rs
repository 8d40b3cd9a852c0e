//! # devtree-sync: replication of the device tree over WebSocket
//!
//! One server holds the authoritative [`devtree_core::Tree`]; any number of
//! clients hold replicas and exchange JSON patches with it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (replica)   │     JSON events     │ (authority) │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Tree        │                     │ Tree        │
//! │ (local)     │                     │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ SnapshotStore │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON event frames (`tree_update`, `tree_delete`, ...)
//! - [`broadcast`]: Fan-out to sessions, skipping the origin
//! - [`server`]: WebSocket server owning the authoritative tree
//! - [`client`]: WebSocket client with replica and offline queue
//! - [`storage`]: Periodic JSON snapshots

pub mod protocol;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod storage;

pub use protocol::{ProtocolError, TreeMessage};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope, PeerInfo};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use storage::SnapshotStore;
