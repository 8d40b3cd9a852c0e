//! Patch documents exchanged between trees.
//!
//! Wire shape (update and deletion documents share it):
//! ```text
//! { devices?: { <ip>: DevicePatch }, views?: { <id>: ViewPatch } }
//! DevicePatch   = {} | { name?, last_update?, endpoints?: { <eid>: EndpointPatch | {} } }
//! EndpointPatch = { last_update, last_value, params?, minvalue?, maxvalue? }
//! ViewPatch     = {} | { id?, name, devices }
//! ```
//!
//! An empty object at a device, view or endpoint key is a tombstone and
//! deletes that entity. Any other object creates or updates it.

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::endpoint::EndpointParams;
use crate::error::TreeError;

/// One keyed entry of a patch: a tombstone or a change document.
///
/// A change that serializes to `{}` would read back as a tombstone, so a
/// non-empty object that decodes to a blank change is rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry<T> {
    Tombstone,
    Change(T),
}

impl<T> Entry<T> {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Entry::Tombstone)
    }

    pub fn change(&self) -> Option<&T> {
        match self {
            Entry::Tombstone => None,
            Entry::Change(c) => Some(c),
        }
    }
}

impl<T: Serialize> Serialize for Entry<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Entry::Tombstone => Map::new().serialize(serializer),
            Entry::Change(change) => change.serialize(serializer),
        }
    }
}

/// A change document that can carry nothing at all.
pub trait Change {
    /// True when the change would serialize to `{}`.
    fn is_blank(&self) -> bool;
}

impl<'de, T: DeserializeOwned + Change> Deserialize<'de> for Entry<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Object(map) if map.is_empty() => Ok(Entry::Tombstone),
            other => {
                let change = T::deserialize(other).map_err(D::Error::custom)?;
                if change.is_blank() {
                    return Err(D::Error::custom("change carries no fields; only {} deletes"));
                }
                Ok(Entry::Change(change))
            }
        }
    }
}

/// Keeps an explicit `null` as `Some(Value::Null)`; an absent field stays `None`.
fn present_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// Field changes for one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoints: BTreeMap<String, Entry<EndpointChange>>,
}

impl Change for DeviceChange {
    fn is_blank(&self) -> bool {
        self.name.is_none() && self.last_update.is_none() && self.endpoints.is_empty()
    }
}

impl DeviceChange {
    pub fn with_endpoint(mut self, eid: u32, entry: Entry<EndpointChange>) -> Self {
        self.endpoints.insert(eid.to_string(), entry);
        self
    }
}

/// Field changes for one endpoint. `params` is only present on creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<u64>,
    #[serde(default, deserialize_with = "present_value", skip_serializing_if = "Option::is_none")]
    pub last_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<EndpointParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minvalue: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxvalue: Option<f64>,
}

impl Change for EndpointChange {
    fn is_blank(&self) -> bool {
        self.last_update.is_none()
            && self.last_value.is_none()
            && self.params.is_none()
            && self.minvalue.is_none()
            && self.maxvalue.is_none()
    }
}

/// Full state of a view. Views are always patched as a whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "endpoints")]
    pub devices: Option<Vec<String>>,
}

impl Change for ViewChange {
    fn is_blank(&self) -> bool {
        self.id.is_none() && self.name.is_none() && self.devices.is_none()
    }
}

/// A patch document.
///
/// Keys are kept as raw strings so that unparseable ids surface as errors
/// of the operation applying the patch rather than as decode failures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub devices: BTreeMap<String, Entry<DeviceChange>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub views: BTreeMap<String, Entry<ViewChange>>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.views.is_empty()
    }

    pub fn device(ip: impl Into<String>, entry: Entry<DeviceChange>) -> Self {
        let mut patch = Self::new();
        patch.devices.insert(ip.into(), entry);
        patch
    }

    pub fn view(id: Uuid, entry: Entry<ViewChange>) -> Self {
        let mut patch = Self::new();
        patch.views.insert(id.to_string(), entry);
        patch
    }

    pub fn device_tombstone(ip: impl Into<String>) -> Self {
        Self::device(ip, Entry::Tombstone)
    }

    pub fn endpoint_tombstone(ip: impl Into<String>, eid: u32) -> Self {
        Self::device(
            ip,
            Entry::Change(DeviceChange::default().with_endpoint(eid, Entry::Tombstone)),
        )
    }

    pub fn view_tombstone(id: Uuid) -> Self {
        Self::view(id, Entry::Tombstone)
    }

    /// Decode a patch from a JSON document.
    pub fn from_value(value: Value) -> Result<Self, TreeError> {
        serde_json::from_value(value).map_err(|e| TreeError::MalformedPatch(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, TreeError> {
        serde_json::from_str(json).map_err(|e| TreeError::MalformedPatch(e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
