//! The aggregate root: all devices and views of one replica.
//!
//! Every public mutation on [`Tree`] and on its handles ([`DeviceMut`],
//! [`EndpointMut`], [`ViewMut`]) is loud: it changes state and publishes the
//! minimal patch to the tree's subscribers. [`Tree::apply_update`],
//! [`Tree::apply_deletion`] and [`Tree::hydrate`] are quiet and never publish.

use serde_json::Value;
use std::collections::btree_map::Entry as Slot;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::Path;
use uuid::Uuid;

use crate::bounds::BoundsTable;
use crate::device::{Device, StagedEndpoint};
use crate::emitter::{Emitter, SubscriptionId, TreeEvent};
use crate::endpoint::{endpoint_id, parse_eid, split_endpoint_id, Endpoint, EndpointParams};
use crate::error::{SnapshotError, TreeError};
use crate::patch::{DeviceChange, Entry, Patch};
use crate::snapshot::{parse_view_id, DeviceRecord, TreeSnapshot, ViewRecord};
use crate::view::View;

#[derive(Debug, Default)]
pub struct Tree {
    devices: BTreeMap<String, Device>,
    views: BTreeMap<Uuid, View>,
    bounds: BoundsTable,
    emitter: Emitter,
}

enum StagedDevice<'p> {
    Remove,
    Create(Device),
    Merge(&'p DeviceChange, Vec<StagedEndpoint<'p>>),
    Prune(Vec<u32>),
}

enum StagedView {
    Remove,
    Put(View),
}

/// A patch that passed validation and can be committed without failing.
#[derive(Default)]
struct StagedPatch<'p> {
    devices: Vec<(&'p str, StagedDevice<'p>)>,
    views: Vec<(Uuid, StagedView)>,
}

fn publish(emitter: &mut Emitter, event: TreeEvent) -> Patch {
    let patch = event.patch().clone();
    emitter.emit(event);
    patch
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bounds(bounds: BoundsTable) -> Self {
        Self {
            bounds,
            ..Self::default()
        }
    }

    pub fn from_snapshot(snapshot: &TreeSnapshot, bounds: BoundsTable) -> Result<Self, TreeError> {
        let mut tree = Self::with_bounds(bounds);
        tree.hydrate(snapshot)?;
        Ok(tree)
    }

    pub fn load(path: impl AsRef<Path>, bounds: BoundsTable) -> Result<Self, SnapshotError> {
        let snapshot = TreeSnapshot::load(path)?;
        Ok(Self::from_snapshot(&snapshot, bounds)?)
    }

    pub fn bounds(&self) -> &BoundsTable {
        &self.bounds
    }

    // ---- subscribers ----

    /// Register a handler for loud mutations. Handlers run synchronously
    /// inside the mutating call.
    pub fn subscribe(&mut self, handler: impl FnMut(&TreeEvent) + Send + 'static) -> SubscriptionId {
        self.emitter.subscribe(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.emitter.len()
    }

    // ---- lookups ----

    pub fn device(&self, ip: &str) -> Option<&Device> {
        self.devices.get(ip)
    }

    pub fn device_mut(&mut self, ip: &str) -> Option<DeviceMut<'_>> {
        let Tree {
            devices,
            bounds,
            emitter,
            ..
        } = self;
        devices.get_mut(ip).map(|device| DeviceMut {
            device,
            bounds,
            emitter,
        })
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn view(&self, id: Uuid) -> Option<&View> {
        self.views.get(&id)
    }

    pub fn view_mut(&mut self, id: Uuid) -> Option<ViewMut<'_>> {
        let Tree { views, emitter, .. } = self;
        views.get_mut(&id).map(|view| ViewMut { view, emitter })
    }

    pub fn views(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Resolve a composite `"<ip>.<eid>"` id. Missing device or endpoint
    /// yields `None`.
    pub fn endpoint_by_id(&self, id: &str) -> Option<&Endpoint> {
        let (ip, eid) = split_endpoint_id(id)?;
        self.devices.get(ip)?.endpoint(eid)
    }

    pub fn endpoint_mut(&mut self, id: &str) -> Option<EndpointMut<'_>> {
        let (ip, eid) = split_endpoint_id(id)?;
        let Tree { devices, emitter, .. } = self;
        let device = devices.get_mut(ip)?;
        device
            .has_endpoint(eid)
            .then(|| EndpointMut { device, emitter, eid })
    }

    pub fn for_each(&self, mut f: impl FnMut(&Device)) {
        self.devices.values().for_each(|d| f(d));
    }

    /// Devices exposing every listed eid.
    pub fn devices_with_endpoints(&self, eids: &[u32]) -> Vec<&Device> {
        self.devices
            .values()
            .filter(|d| eids.iter().all(|eid| d.has_endpoint(*eid)))
            .collect()
    }

    /// A view's endpoints in display order, skipping dangling references.
    pub fn view_endpoints(&self, id: Uuid) -> Option<Vec<&Endpoint>> {
        let view = self.views.get(&id)?;
        Some(
            view.endpoints()
                .iter()
                .filter_map(|r| self.endpoint_by_id(r))
                .collect(),
        )
    }

    // ---- loud mutations ----

    pub fn add_device(&mut self, ip: impl Into<String>, name: impl Into<String>) -> Result<&Device, TreeError> {
        let device = Device::new(ip, name, crate::unix_ts())?;
        match self.devices.entry(device.ip().to_string()) {
            Slot::Occupied(e) => Err(TreeError::DuplicateEntity(e.key().clone())),
            Slot::Vacant(slot) => {
                log::debug!("Adding device {} ({})", device.ip(), device.name());
                let patch = Patch::device(device.ip(), Entry::Change(device.creation_change()));
                publish(&mut self.emitter, TreeEvent::Update(patch));
                Ok(slot.insert(device))
            }
        }
    }

    pub fn remove_device(&mut self, ip: &str) -> Result<Device, TreeError> {
        let device = self
            .devices
            .remove(ip)
            .ok_or_else(|| TreeError::NotFound(ip.to_string()))?;
        log::debug!("Removed device {ip}");
        publish(&mut self.emitter, TreeEvent::Delete(Patch::device_tombstone(ip)));
        Ok(device)
    }

    /// Add an endpoint, creating its device first when needed. A new device
    /// takes its name from `params.name`.
    pub fn add_endpoint(&mut self, ip: &str, eid: u32, params: &EndpointParams) -> Result<&Endpoint, TreeError> {
        let now = crate::unix_ts();
        let change = match self.devices.get_mut(ip) {
            Some(device) => device.create_endpoint(eid, params, &self.bounds, now)?,
            None => {
                let name = params
                    .name
                    .clone()
                    .ok_or_else(|| TreeError::RequiredFieldMissing(format!("name of new device {ip}")))?;
                let mut device = Device::new(ip, name, now)?;
                device.create_endpoint(eid, params, &self.bounds, now)?;
                let change = device.creation_change();
                self.devices.insert(ip.to_string(), device);
                change
            }
        };
        log::debug!("Added endpoint {}", endpoint_id(ip, eid));
        publish(&mut self.emitter, TreeEvent::Update(Patch::device(ip, Entry::Change(change))));
        self.devices
            .get(ip)
            .and_then(|d| d.endpoint(eid))
            .ok_or_else(|| TreeError::NotFound(endpoint_id(ip, eid)))
    }

    pub fn remove_endpoint(&mut self, ip: &str, eid: u32) -> Result<Endpoint, TreeError> {
        let mut device = self
            .device_mut(ip)
            .ok_or_else(|| TreeError::NotFound(ip.to_string()))?;
        let endpoint = device.device.take_endpoint(eid)?;
        publish(device.emitter, TreeEvent::Delete(Patch::endpoint_tombstone(ip, eid)));
        Ok(endpoint)
    }

    pub fn add_view(&mut self, name: impl Into<String>, endpoints: Vec<String>) -> &View {
        let view = View::new(name, endpoints);
        let patch = Patch::view(view.id(), Entry::Change(view.change()));
        publish(&mut self.emitter, TreeEvent::Update(patch));
        self.views.entry(view.id()).or_insert(view)
    }

    pub fn add_view_with_id(
        &mut self,
        id: Uuid,
        name: impl Into<String>,
        endpoints: Vec<String>,
    ) -> Result<&View, TreeError> {
        if self.views.contains_key(&id) {
            return Err(TreeError::DuplicateEntity(id.to_string()));
        }
        let view = View::with_id(id, name, endpoints);
        publish(&mut self.emitter, TreeEvent::Update(Patch::view(id, Entry::Change(view.change()))));
        Ok(self.views.entry(id).or_insert(view))
    }

    pub fn remove_view(&mut self, id: Uuid) -> Result<View, TreeError> {
        let view = self
            .views
            .remove(&id)
            .ok_or_else(|| TreeError::NotFound(id.to_string()))?;
        publish(&mut self.emitter, TreeEvent::Delete(Patch::view_tombstone(id)));
        Ok(view)
    }

    /// Remove every device and view, publishing one deletion patch that
    /// tombstones all of them.
    pub fn reset(&mut self) -> Patch {
        let mut patch = Patch::new();
        for ip in self.devices.keys() {
            patch.devices.insert(ip.clone(), Entry::Tombstone);
        }
        for id in self.views.keys() {
            patch.views.insert(id.to_string(), Entry::Tombstone);
        }
        log::info!("Resetting tree ({} devices, {} views)", self.devices.len(), self.views.len());
        self.devices.clear();
        self.views.clear();
        publish(&mut self.emitter, TreeEvent::Delete(patch))
    }

    /// Record a reported value for the endpoint with composite id `id`.
    pub fn record_value(&mut self, id: &str, value: Value) -> Result<Patch, TreeError> {
        self.endpoint_mut(id)
            .ok_or_else(|| TreeError::NotFound(id.to_string()))?
            .set_last_value(value)
    }

    // ---- quiet application ----

    /// Apply an update patch received from a peer. All or nothing.
    pub fn apply_update(&mut self, patch: &Patch) -> Result<(), TreeError> {
        let staged = self.stage_update(patch)?;
        self.commit(staged);
        Ok(())
    }

    /// Apply a deletion patch received from a peer. Only tombstones delete;
    /// deleting something already gone is a no-op.
    pub fn apply_deletion(&mut self, patch: &Patch) -> Result<(), TreeError> {
        let staged = self.stage_deletion(patch)?;
        self.commit(staged);
        Ok(())
    }

    fn stage_update<'p>(&self, patch: &'p Patch) -> Result<StagedPatch<'p>, TreeError> {
        let now = crate::unix_ts();
        let mut staged = StagedPatch::default();
        for (ip, entry) in &patch.devices {
            let step = match (entry, self.devices.get(ip)) {
                (Entry::Tombstone, _) => StagedDevice::Remove,
                (Entry::Change(change), Some(device)) => {
                    StagedDevice::Merge(change, device.stage_update(change, &self.bounds, now)?)
                }
                (Entry::Change(change), None) => {
                    StagedDevice::Create(Device::from_change(ip, change, &self.bounds, now)?)
                }
            };
            staged.devices.push((ip.as_str(), step));
        }
        for (key, entry) in &patch.views {
            let id = parse_view_id(key)?;
            let step = match (entry, self.views.get(&id)) {
                (Entry::Tombstone, _) => StagedView::Remove,
                (Entry::Change(change), Some(view)) => {
                    let mut next = view.clone();
                    next.apply_update(change)?;
                    StagedView::Put(next)
                }
                (Entry::Change(change), None) => StagedView::Put(View::from_change(id, change)?),
            };
            staged.views.push((id, step));
        }
        Ok(staged)
    }

    fn stage_deletion<'p>(&self, patch: &'p Patch) -> Result<StagedPatch<'p>, TreeError> {
        let mut staged = StagedPatch::default();
        for (ip, entry) in &patch.devices {
            match (entry, self.devices.get(ip)) {
                (Entry::Tombstone, _) => staged.devices.push((ip.as_str(), StagedDevice::Remove)),
                (Entry::Change(change), Some(device)) => {
                    let eids = device.stage_deletion(change)?;
                    staged.devices.push((ip.as_str(), StagedDevice::Prune(eids)));
                }
                (Entry::Change(change), None) => {
                    for key in change.endpoints.keys() {
                        parse_eid(key)?;
                    }
                }
            }
        }
        for (key, entry) in &patch.views {
            let id = parse_view_id(key)?;
            if entry.is_tombstone() {
                staged.views.push((id, StagedView::Remove));
            }
        }
        Ok(staged)
    }

    fn commit(&mut self, staged: StagedPatch<'_>) {
        for (ip, step) in staged.devices {
            match step {
                StagedDevice::Remove => {
                    self.devices.remove(ip);
                }
                StagedDevice::Create(device) => {
                    self.devices.insert(ip.to_string(), device);
                }
                StagedDevice::Merge(change, endpoints) => {
                    if let Some(device) = self.devices.get_mut(ip) {
                        device.commit_update(change, endpoints);
                    }
                }
                StagedDevice::Prune(eids) => {
                    if let Some(device) = self.devices.get_mut(ip) {
                        device.commit_deletion(&eids);
                    }
                }
            }
        }
        for (id, step) in staged.views {
            match step {
                StagedView::Remove => {
                    self.views.remove(&id);
                }
                StagedView::Put(view) => {
                    self.views.insert(id, view);
                }
            }
        }
    }

    // ---- persistence ----

    /// Replace the whole content from a snapshot. Quiet, and all or nothing;
    /// subscribers stay registered.
    pub fn hydrate(&mut self, snapshot: &TreeSnapshot) -> Result<(), TreeError> {
        let mut devices = BTreeMap::new();
        for (ip, record) in &snapshot.devices {
            devices.insert(ip.clone(), record.to_device(ip, &self.bounds)?);
        }
        let mut views = BTreeMap::new();
        for (id, record) in &snapshot.views {
            let view = record.to_view(id)?;
            views.insert(view.id(), view);
        }
        self.devices = devices;
        self.views = views;
        Ok(())
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            devices: self
                .devices
                .iter()
                .map(|(ip, d)| (ip.clone(), DeviceRecord::from(d)))
                .collect(),
            views: self
                .views
                .iter()
                .map(|(id, v)| (id.to_string(), ViewRecord::from(v)))
                .collect(),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.snapshot()).unwrap_or_default()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        self.snapshot().save(path)
    }
}

/// Loud handle on one device.
pub struct DeviceMut<'a> {
    device: &'a mut Device,
    bounds: &'a BoundsTable,
    emitter: &'a mut Emitter,
}

impl DeviceMut<'_> {
    fn publish_update(&mut self, change: DeviceChange) -> Patch {
        let patch = Patch::device(self.device.ip(), Entry::Change(change));
        publish(self.emitter, TreeEvent::Update(patch))
    }

    /// Bump `last_update` and publish the device header.
    pub fn update(&mut self) -> Patch {
        let change = self.device.touch(crate::unix_ts());
        self.publish_update(change)
    }

    pub fn rename(&mut self, name: impl Into<String>) -> Patch {
        let change = self.device.rename(name, crate::unix_ts());
        self.publish_update(change)
    }

    pub fn add_endpoint(&mut self, eid: u32, params: &EndpointParams) -> Result<Patch, TreeError> {
        let change = self
            .device
            .create_endpoint(eid, params, self.bounds, crate::unix_ts())?;
        Ok(self.publish_update(change))
    }

    pub fn remove_endpoint(&mut self, eid: u32) -> Result<Patch, TreeError> {
        self.device.take_endpoint(eid)?;
        let patch = Patch::endpoint_tombstone(self.device.ip(), eid);
        Ok(publish(self.emitter, TreeEvent::Delete(patch)))
    }

    pub fn endpoint_mut(&mut self, eid: u32) -> Option<EndpointMut<'_>> {
        self.device.has_endpoint(eid).then(|| EndpointMut {
            device: &mut *self.device,
            emitter: &mut *self.emitter,
            eid,
        })
    }
}

impl Deref for DeviceMut<'_> {
    type Target = Device;

    fn deref(&self) -> &Device {
        &*self.device
    }
}

/// Loud handle on one endpoint.
pub struct EndpointMut<'a> {
    device: &'a mut Device,
    emitter: &'a mut Emitter,
    eid: u32,
}

impl EndpointMut<'_> {
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.device.endpoint(self.eid)
    }

    fn publish_update(&mut self, change: DeviceChange) -> Patch {
        let patch = Patch::device(self.device.ip(), Entry::Change(change));
        publish(self.emitter, TreeEvent::Update(patch))
    }

    /// Set the value. The owning device's timestamp is bumped as well, and
    /// both travel in one patch.
    pub fn set_last_value(&mut self, value: Value) -> Result<Patch, TreeError> {
        let change = self
            .device
            .set_endpoint_value(self.eid, value, crate::unix_ts())?;
        Ok(self.publish_update(change))
    }

    pub fn set_minvalue(&mut self, minvalue: f64) -> Result<Patch, TreeError> {
        let change = self.device.set_endpoint_minvalue(self.eid, minvalue)?;
        Ok(self.publish_update(change))
    }

    pub fn set_maxvalue(&mut self, maxvalue: f64) -> Result<Patch, TreeError> {
        let change = self.device.set_endpoint_maxvalue(self.eid, maxvalue)?;
        Ok(self.publish_update(change))
    }
}

/// Loud handle on one view. Every change publishes the full view.
pub struct ViewMut<'a> {
    view: &'a mut View,
    emitter: &'a mut Emitter,
}

impl ViewMut<'_> {
    pub fn set_name(&mut self, name: impl Into<String>) -> Patch {
        let change = self.view.set_name(name);
        publish(self.emitter, TreeEvent::Update(Patch::view(self.view.id(), Entry::Change(change))))
    }

    pub fn set_endpoints(&mut self, endpoints: Vec<String>) -> Patch {
        let change = self.view.set_endpoints(endpoints);
        publish(self.emitter, TreeEvent::Update(Patch::view(self.view.id(), Entry::Change(change))))
    }
}

impl Deref for ViewMut<'_> {
    type Target = View;

    fn deref(&self) -> &View {
        &*self.view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn recording(tree: &mut Tree) -> Arc<Mutex<Vec<TreeEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        tree.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        events
    }

    fn seeded() -> Tree {
        let mut tree = Tree::new();
        tree.add_endpoint(
            "fe80::1",
            2,
            &EndpointParams::sensor(3, "power").with_device_name("Plug"),
        )
        .unwrap();
        tree
    }

    #[test]
    fn test_add_device_duplicate() {
        let mut tree = Tree::new();
        tree.add_device("fe80::42", "Doomsday").unwrap();
        assert_eq!(
            tree.add_device("fe80::42", "Again").unwrap_err(),
            TreeError::DuplicateEntity("fe80::42".into())
        );
    }

    #[test]
    fn test_add_device_emits_header() {
        let mut tree = Tree::new();
        let events = recording(&mut tree);
        let ts = tree.add_device("fe80::42", "Doomsday").unwrap().last_update();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].patch().to_value(),
            json!({ "devices": { "fe80::42": { "name": "Doomsday", "last_update": ts } } })
        );
    }

    #[test]
    fn test_remove_missing_device() {
        let mut tree = Tree::new();
        assert_eq!(
            tree.remove_device("fe80::9").unwrap_err(),
            TreeError::NotFound("fe80::9".into())
        );
    }

    #[test]
    fn test_add_endpoint_requires_device_name() {
        let mut tree = Tree::new();
        let events = recording(&mut tree);
        let err = tree
            .add_endpoint("fe80::1", 2, &EndpointParams::sensor(3, "power"))
            .unwrap_err();
        assert!(matches!(err, TreeError::RequiredFieldMissing(_)));
        assert_eq!(tree.device_count(), 0);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_add_endpoint_creates_device_in_one_patch() {
        let mut tree = Tree::new();
        let events = recording(&mut tree);
        tree.add_endpoint(
            "fe80::1",
            2,
            &EndpointParams::sensor(3, "power").with_device_name("Plug"),
        )
        .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let device = events[0].patch().devices["fe80::1"].change().unwrap();
        assert_eq!(device.name.as_deref(), Some("Plug"));
        assert!(device.endpoints["2"].change().unwrap().params.is_some());
    }

    #[test]
    fn test_invalid_endpoint_leaves_no_device() {
        let mut tree = Tree::new();
        let mut params = EndpointParams::sensor(3, "power").with_device_name("Plug");
        params.function = None;
        assert!(tree.add_endpoint("fe80::1", 2, &params).is_err());
        assert!(tree.device("fe80::1").is_none());
    }

    #[test]
    fn test_endpoint_by_id() {
        let tree = seeded();
        assert_eq!(tree.endpoint_by_id("fe80::1.2").unwrap().eid(), 2);
        assert!(tree.endpoint_by_id("fe80::1.3").is_none());
        assert!(tree.endpoint_by_id("fe80::9.2").is_none());
        assert!(tree.endpoint_by_id("garbage").is_none());
    }

    #[test]
    fn test_record_value() {
        let mut tree = seeded();
        let patch = tree.record_value("fe80::1.2", json!(230)).unwrap();
        assert_eq!(tree.endpoint_by_id("fe80::1.2").unwrap().last_value(), &json!(230));
        assert!(patch.devices["fe80::1"].change().unwrap().last_update.is_some());
        assert!(matches!(
            tree.record_value("fe80::1.9", json!(1)),
            Err(TreeError::NotFound(_))
        ));
    }

    #[test]
    fn test_quiet_apply_emits_nothing() {
        let mut source = seeded();
        let mut replica = Tree::new();
        let events = recording(&mut replica);

        let patch = Patch::device("fe80::1", Entry::Change(source.device("fe80::1").unwrap().creation_change()));
        replica.apply_update(&patch).unwrap();
        replica.apply_deletion(&source.reset()).unwrap();

        assert!(events.lock().unwrap().is_empty());
        assert_eq!(replica.device_count(), 0);
    }

    #[test]
    fn test_atomic_rejection() {
        let mut tree = seeded();
        let before = tree.to_json();
        let patch = Patch::from_value(json!({
            "devices": {
                "fe80::1": { "name": "Changed", "last_update": 1 },
                "fe80::2": { "name": "Half" }
            }
        }))
        .unwrap();
        let err = tree.apply_update(&patch).unwrap_err();
        assert!(matches!(err, TreeError::MalformedPatch(_)));
        assert_eq!(tree.to_json(), before);
    }

    #[test]
    fn test_bad_view_key_rejects_patch() {
        let mut tree = seeded();
        let before = tree.to_json();
        let patch = Patch::from_value(json!({
            "devices": { "fe80::1": {} },
            "views": { "not-a-uuid": {} }
        }))
        .unwrap();
        assert!(matches!(tree.apply_deletion(&patch), Err(TreeError::InvalidId(_))));
        assert_eq!(tree.to_json(), before);
    }

    #[test]
    fn test_view_partial_patch_rejected() {
        let mut tree = Tree::new();
        let id = tree.add_view("FooBarz", vec![]).id();
        let patch = Patch::from_value(json!({ "views": { id.to_string(): { "name": "x" } } })).unwrap();
        assert!(matches!(tree.apply_update(&patch), Err(TreeError::MalformedPatch(_))));
        assert_eq!(tree.view(id).unwrap().name(), "FooBarz");
    }

    #[test]
    fn test_view_endpoints_skip_dangling() {
        let mut tree = seeded();
        let id = tree
            .add_view("Mixed", vec!["fe80::1.2".into(), "fe80::7.1".into()])
            .id();
        let endpoints = tree.view_endpoints(id).unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].id(), "fe80::1.2");
    }

    #[test]
    fn test_devices_with_endpoints() {
        let mut tree = seeded();
        tree.add_endpoint("fe80::2", 1, &EndpointParams::actor(1, "relay").with_device_name("Relay"))
            .unwrap();
        tree.add_endpoint("fe80::2", 2, &EndpointParams::sensor(3, "power")).unwrap();

        let ips: Vec<_> = tree.devices_with_endpoints(&[1, 2]).iter().map(|d| d.ip()).collect();
        assert_eq!(ips, vec!["fe80::2"]);
        assert_eq!(tree.devices_with_endpoints(&[2]).len(), 2);
    }

    #[test]
    fn test_reset_tombstones_everything() {
        let mut tree = seeded();
        let id = tree.add_view("V", vec![]).id();
        let patch = tree.reset();
        assert!(patch.devices["fe80::1"].is_tombstone());
        assert!(patch.views[&id.to_string()].is_tombstone());
        assert_eq!(tree.device_count() + tree.view_count(), 0);
    }

    #[test]
    fn test_hydrate_keeps_subscribers_and_is_quiet() {
        let source = seeded();
        let mut tree = Tree::new();
        let events = recording(&mut tree);
        tree.hydrate(&source.snapshot()).unwrap();
        assert_eq!(tree.to_json(), source.to_json());
        assert_eq!(tree.subscriber_count(), 1);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devicetree.json");
        let mut tree = seeded();
        tree.add_view("Kitchen", vec!["fe80::1.2".into()]);
        tree.save(&path).unwrap();

        let loaded = Tree::load(&path, BoundsTable::default()).unwrap();
        assert_eq!(loaded.to_json(), tree.to_json());
    }
}
