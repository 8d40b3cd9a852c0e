//! Merging discovery results into a tree.

use serde::Deserialize;
use std::collections::BTreeSet;

use crate::endpoint::{endpoint_id, Endpoint, EndpointParams};
use crate::error::TreeError;
use crate::tree::Tree;

/// A device as reported by a discovery run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DiscoveredDevice {
    pub ip: String,
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<DiscoveredEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DiscoveredEndpoint {
    pub eid: u32,
    #[serde(flatten)]
    pub params: EndpointParams,
}

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub device_added: bool,
    pub renamed: bool,
    pub endpoints_added: Vec<u32>,
}

impl MergeReport {
    pub fn is_noop(&self) -> bool {
        !self.device_added && !self.renamed && self.endpoints_added.is_empty()
    }
}

impl Tree {
    /// Loudly merge a discovered device: add it when unknown, rename it when
    /// the name differs, add endpoints it does not have yet. Known endpoints
    /// keep their state.
    ///
    /// Every new endpoint is validated before anything changes.
    pub fn merge_discovered(&mut self, found: &DiscoveredDevice) -> Result<MergeReport, TreeError> {
        let now = crate::unix_ts();
        let known = self.device(&found.ip);
        let missing: Vec<&DiscoveredEndpoint> = found
            .endpoints
            .iter()
            .filter(|ep| known.map_or(true, |d| !d.has_endpoint(ep.eid)))
            .collect();
        let mut seen = BTreeSet::new();
        for ep in &found.endpoints {
            if !seen.insert(ep.eid) {
                return Err(TreeError::DuplicateEntity(endpoint_id(&found.ip, ep.eid)));
            }
        }
        for ep in &missing {
            Endpoint::new(&found.ip, ep.eid, &ep.params, self.bounds(), now)?;
        }

        let mut report = MergeReport::default();
        match self.device_mut(&found.ip) {
            Some(mut device) if device.name() != found.name => {
                device.rename(found.name.clone());
                report.renamed = true;
            }
            Some(_) => {}
            None => {
                self.add_device(found.ip.clone(), found.name.clone())?;
                report.device_added = true;
            }
        }
        for ep in missing {
            if let Some(mut device) = self.device_mut(&found.ip) {
                device.add_endpoint(ep.eid, &ep.params)?;
                report.endpoints_added.push(ep.eid);
            }
        }

        if !report.is_noop() {
            log::info!(
                "Merged discovered device {} (added: {}, renamed: {}, endpoints: {:?})",
                found.ip,
                report.device_added,
                report.renamed,
                report.endpoints_added
            );
        }
        Ok(report)
    }
}
