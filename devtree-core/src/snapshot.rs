//! On-disk snapshot of a whole tree.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::bounds::BoundsTable;
use crate::device::Device;
use crate::endpoint::{parse_eid, Endpoint, EndpointParams};
use crate::error::{SnapshotError, TreeError};
use crate::patch::EndpointChange;
use crate::view::View;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceRecord>,
    #[serde(default)]
    pub views: BTreeMap<String, ViewRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    pub last_update: u64,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    #[serde(rename = "type")]
    pub datatype: Value,
    pub function: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "zero")]
    pub last_value: Value,
    #[serde(default)]
    pub last_update: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minvalue: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxvalue: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRecord {
    pub name: String,
    #[serde(default, alias = "endpoints")]
    pub devices: Vec<String>,
}

fn zero() -> Value {
    Value::from(0)
}

impl From<&Endpoint> for EndpointRecord {
    fn from(ep: &Endpoint) -> Self {
        Self {
            datatype: Value::from(ep.datatype()),
            function: ep.function().as_str().to_string(),
            description: ep.description().to_string(),
            last_value: ep.last_value().clone(),
            last_update: ep.last_update(),
            minvalue: ep.minvalue(),
            maxvalue: ep.maxvalue(),
            unit: ep.unit().map(str::to_string),
        }
    }
}

impl EndpointRecord {
    pub fn to_endpoint(&self, ip: &str, eid: u32, bounds: &BoundsTable) -> Result<Endpoint, TreeError> {
        let params = EndpointParams {
            datatype: Some(self.datatype.clone()),
            function: Some(self.function.clone()),
            description: Some(self.description.clone()),
            minvalue: self.minvalue,
            maxvalue: self.maxvalue,
            unit: self.unit.clone(),
            name: None,
        };
        let mut endpoint = Endpoint::new(ip, eid, &params, bounds, self.last_update)?;
        endpoint.apply_update(&EndpointChange {
            last_value: Some(self.last_value.clone()),
            ..EndpointChange::default()
        });
        Ok(endpoint)
    }
}

impl From<&Device> for DeviceRecord {
    fn from(device: &Device) -> Self {
        Self {
            name: device.name().to_string(),
            last_update: device.last_update(),
            endpoints: device
                .endpoints()
                .map(|ep| (ep.eid().to_string(), EndpointRecord::from(ep)))
                .collect(),
        }
    }
}

impl DeviceRecord {
    pub fn to_device(&self, ip: &str, bounds: &BoundsTable) -> Result<Device, TreeError> {
        let mut device = Device::new(ip, self.name.clone(), self.last_update)?;
        for (key, record) in &self.endpoints {
            let eid = parse_eid(key)?;
            device.insert_endpoint(record.to_endpoint(ip, eid, bounds)?)?;
        }
        Ok(device)
    }
}

impl From<&View> for ViewRecord {
    fn from(view: &View) -> Self {
        Self {
            name: view.name().to_string(),
            devices: view.endpoints().to_vec(),
        }
    }
}

impl TreeSnapshot {
    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Write the snapshot to `path`.
    ///
    /// The document goes to a sibling temp file first and is renamed over the
    /// target, so readers never see a half-written snapshot.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        let path = path.as_ref();
        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");

        let mut file = fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        log::debug!("Wrote snapshot to {} ({} bytes)", path.display(), json.len());
        Ok(())
    }
}

pub(crate) fn parse_view_id(raw: &str) -> Result<uuid::Uuid, TreeError> {
    uuid::Uuid::parse_str(raw).map_err(|_| TreeError::InvalidId(format!("view id '{raw}' is not a UUID")))
}

impl ViewRecord {
    pub fn to_view(&self, id: &str) -> Result<View, TreeError> {
        Ok(View::with_id(parse_view_id(id)?, self.name.clone(), self.devices.clone()))
    }
}
