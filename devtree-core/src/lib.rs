//! Device tree model and patch codec.
//!
//! A [`Tree`] holds devices (keyed by ip), their endpoints (keyed by eid) and
//! dashboard views (keyed by UUID). Replicas of a tree are kept in step by
//! exchanging [`Patch`] documents: loud mutations publish a minimal patch to
//! the tree's subscribers, and receivers apply it quietly.

pub mod bounds;
pub mod device;
pub mod discovery;
pub mod emitter;
pub mod endpoint;
pub mod error;
pub mod patch;
pub mod snapshot;
pub mod tree;
pub mod view;

pub use bounds::{Bounds, BoundsTable};
pub use device::Device;
pub use discovery::{DiscoveredDevice, DiscoveredEndpoint, MergeReport};
pub use emitter::{SubscriptionId, TreeEvent};
pub use endpoint::{Endpoint, EndpointKind, EndpointParams, Function, SensorFields};
pub use error::{ErrorKind, ErrorReport, SnapshotError, TreeError};
pub use patch::{Change, DeviceChange, EndpointChange, Entry, Patch, ViewChange};
pub use snapshot::TreeSnapshot;
pub use tree::{DeviceMut, EndpointMut, Tree, ViewMut};
pub use view::View;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds.
pub fn unix_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
