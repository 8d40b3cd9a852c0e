//! Devices and the endpoints they own.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::bounds::BoundsTable;
use crate::endpoint::{endpoint_id, parse_eid, Endpoint, EndpointParams};
use crate::error::TreeError;
use crate::patch::{DeviceChange, EndpointChange, Entry};

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    ip: String,
    name: String,
    last_update: u64,
    endpoints: BTreeMap<u32, Endpoint>,
}

/// Endpoint-level work validated against a device but not yet committed.
#[derive(Debug)]
pub(crate) enum StagedEndpoint<'c> {
    Update(u32, &'c EndpointChange),
    Create(Endpoint),
    Remove(u32),
}

impl Device {
    pub fn new(ip: impl Into<String>, name: impl Into<String>, now: u64) -> Result<Self, TreeError> {
        let ip = ip.into();
        if ip.is_empty() {
            return Err(TreeError::RequiredFieldMissing("ip".into()));
        }
        Ok(Self {
            ip,
            name: name.into(),
            last_update: now,
            endpoints: BTreeMap::new(),
        })
    }

    /// Construct a device from a creation change received from a peer.
    ///
    /// The change must carry `name` and `last_update`.
    pub(crate) fn from_change(
        ip: &str,
        change: &DeviceChange,
        bounds: &BoundsTable,
        now: u64,
    ) -> Result<Self, TreeError> {
        let (Some(name), Some(last_update)) = (&change.name, change.last_update) else {
            return Err(TreeError::MalformedPatch(format!(
                "cannot create device {ip} without name and last_update"
            )));
        };
        let mut device = Self::new(ip, name.clone(), last_update)?;
        let staged = device.stage_update(change, bounds, now)?;
        device.commit_update(change, staged);
        Ok(device)
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    pub fn endpoint(&self, eid: u32) -> Option<&Endpoint> {
        self.endpoints.get(&eid)
    }

    pub fn has_endpoint(&self, eid: u32) -> bool {
        self.endpoints.contains_key(&eid)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn for_each_endpoint(&self, mut f: impl FnMut(&Endpoint)) {
        self.endpoints.values().for_each(|ep| f(ep));
    }

    fn header_change(&self) -> DeviceChange {
        DeviceChange {
            name: Some(self.name.clone()),
            last_update: Some(self.last_update),
            endpoints: BTreeMap::new(),
        }
    }

    /// Full creation change: header plus every endpoint's creation change.
    pub fn creation_change(&self) -> DeviceChange {
        let mut change = self.header_change();
        for (eid, ep) in &self.endpoints {
            change
                .endpoints
                .insert(eid.to_string(), Entry::Change(ep.creation_change()));
        }
        change
    }

    fn endpoint_mut_or_missing(&mut self, eid: u32) -> Result<&mut Endpoint, TreeError> {
        let ip = &self.ip;
        self.endpoints
            .get_mut(&eid)
            .ok_or_else(|| TreeError::NotFound(endpoint_id(ip, eid)))
    }

    // Pure mutators. They return the change they caused; publishing is the
    // caller's business.

    pub fn touch(&mut self, now: u64) -> DeviceChange {
        self.last_update = now;
        self.header_change()
    }

    pub fn rename(&mut self, name: impl Into<String>, now: u64) -> DeviceChange {
        self.name = name.into();
        self.touch(now)
    }

    pub fn create_endpoint(
        &mut self,
        eid: u32,
        params: &EndpointParams,
        bounds: &BoundsTable,
        now: u64,
    ) -> Result<DeviceChange, TreeError> {
        if self.endpoints.contains_key(&eid) {
            return Err(TreeError::DuplicateEntity(endpoint_id(&self.ip, eid)));
        }
        let endpoint = Endpoint::new(&self.ip, eid, params, bounds, now)?;
        let change = DeviceChange::default().with_endpoint(eid, Entry::Change(endpoint.creation_change()));
        self.endpoints.insert(eid, endpoint);
        Ok(change)
    }

    pub fn insert_endpoint(&mut self, endpoint: Endpoint) -> Result<(), TreeError> {
        if endpoint.ip() != self.ip {
            return Err(TreeError::InvalidId(format!(
                "endpoint {} does not belong to device {}",
                endpoint.id(),
                self.ip
            )));
        }
        if self.endpoints.contains_key(&endpoint.eid()) {
            return Err(TreeError::DuplicateEntity(endpoint.id()));
        }
        self.endpoints.insert(endpoint.eid(), endpoint);
        Ok(())
    }

    pub fn take_endpoint(&mut self, eid: u32) -> Result<Endpoint, TreeError> {
        self.endpoints
            .remove(&eid)
            .ok_or_else(|| TreeError::NotFound(endpoint_id(&self.ip, eid)))
    }

    /// Set an endpoint's value. The device timestamp moves along with it, so
    /// the change carries the device header too.
    pub fn set_endpoint_value(&mut self, eid: u32, value: Value, now: u64) -> Result<DeviceChange, TreeError> {
        let state = self.endpoint_mut_or_missing(eid)?.set_last_value(value, now);
        Ok(self.touch(now).with_endpoint(eid, Entry::Change(state)))
    }

    pub fn set_endpoint_minvalue(&mut self, eid: u32, minvalue: f64) -> Result<DeviceChange, TreeError> {
        let state = self.endpoint_mut_or_missing(eid)?.set_minvalue(minvalue)?;
        Ok(DeviceChange::default().with_endpoint(eid, Entry::Change(state)))
    }

    pub fn set_endpoint_maxvalue(&mut self, eid: u32, maxvalue: f64) -> Result<DeviceChange, TreeError> {
        let state = self.endpoint_mut_or_missing(eid)?.set_maxvalue(maxvalue)?;
        Ok(DeviceChange::default().with_endpoint(eid, Entry::Change(state)))
    }

    /// Quiet apply of an update change. Never emits.
    pub fn apply_update(&mut self, change: &DeviceChange, bounds: &BoundsTable) -> Result<(), TreeError> {
        let staged = self.stage_update(change, bounds, crate::unix_ts())?;
        self.commit_update(change, staged);
        Ok(())
    }

    /// Quiet apply of a deletion change: tombstoned endpoints are removed,
    /// anything else is ignored. Removing an absent endpoint is a no-op.
    pub fn apply_deletion(&mut self, change: &DeviceChange) -> Result<(), TreeError> {
        let eids = self.stage_deletion(change)?;
        self.commit_deletion(&eids);
        Ok(())
    }

    /// Validate an update change and pre-build the endpoints it creates.
    pub(crate) fn stage_update<'c>(
        &self,
        change: &'c DeviceChange,
        bounds: &BoundsTable,
        now: u64,
    ) -> Result<Vec<StagedEndpoint<'c>>, TreeError> {
        let mut seen = BTreeSet::new();
        let mut staged = Vec::with_capacity(change.endpoints.len());
        for (key, entry) in &change.endpoints {
            let eid = parse_eid(key)?;
            if !seen.insert(eid) {
                return Err(TreeError::MalformedPatch(format!(
                    "endpoint {} listed twice",
                    endpoint_id(&self.ip, eid)
                )));
            }
            staged.push(match entry {
                Entry::Tombstone => StagedEndpoint::Remove(eid),
                Entry::Change(ep) if self.endpoints.contains_key(&eid) => StagedEndpoint::Update(eid, ep),
                Entry::Change(ep) => StagedEndpoint::Create(Endpoint::from_change(&self.ip, eid, ep, bounds, now)?),
            });
        }
        Ok(staged)
    }

    pub(crate) fn commit_update(&mut self, change: &DeviceChange, staged: Vec<StagedEndpoint<'_>>) {
        if let Some(name) = &change.name {
            self.name = name.clone();
        }
        if let Some(ts) = change.last_update {
            self.last_update = ts;
        }
        for step in staged {
            match step {
                StagedEndpoint::Update(eid, ep) => {
                    if let Some(endpoint) = self.endpoints.get_mut(&eid) {
                        endpoint.apply_update(ep);
                    }
                }
                StagedEndpoint::Create(endpoint) => {
                    self.endpoints.insert(endpoint.eid(), endpoint);
                }
                StagedEndpoint::Remove(eid) => {
                    self.endpoints.remove(&eid);
                }
            }
        }
    }

    pub(crate) fn stage_deletion(&self, change: &DeviceChange) -> Result<Vec<u32>, TreeError> {
        let mut eids = Vec::new();
        for (key, entry) in &change.endpoints {
            let eid = parse_eid(key)?;
            if entry.is_tombstone() {
                eids.push(eid);
            }
        }
        Ok(eids)
    }

    pub(crate) fn commit_deletion(&mut self, eids: &[u32]) {
        for eid in eids {
            self.endpoints.remove(eid);
        }
    }
}
