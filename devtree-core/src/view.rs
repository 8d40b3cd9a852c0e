//! Views: named, ordered lists of endpoint references for dashboards.
//!
//! References are plain composite ids and may point at endpoints that do
//! not exist. A view is always patched as a whole.

use uuid::Uuid;

use crate::error::TreeError;
use crate::patch::ViewChange;

#[derive(Debug, Clone, PartialEq)]
pub struct View {
    id: Uuid,
    name: String,
    endpoints: Vec<String>,
}

impl View {
    pub fn new(name: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name, endpoints)
    }

    pub fn with_id(id: Uuid, name: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self {
            id,
            name: name.into(),
            endpoints,
        }
    }

    pub(crate) fn from_change(id: Uuid, change: &ViewChange) -> Result<Self, TreeError> {
        let mut view = Self::with_id(id, String::new(), Vec::new());
        view.apply_update(change)?;
        Ok(view)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Full state, the only shape a view is ever patched with.
    pub fn change(&self) -> ViewChange {
        ViewChange {
            id: Some(self.id),
            name: Some(self.name.clone()),
            devices: Some(self.endpoints.clone()),
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> ViewChange {
        self.name = name.into();
        self.change()
    }

    pub fn set_endpoints(&mut self, endpoints: Vec<String>) -> ViewChange {
        self.endpoints = endpoints;
        self.change()
    }

    /// Quiet apply. Both `name` and the reference list are required.
    pub fn apply_update(&mut self, change: &ViewChange) -> Result<(), TreeError> {
        if change.id.is_some_and(|id| id != self.id) {
            return Err(TreeError::MalformedPatch(format!(
                "view patch for {} carries a different id",
                self.id
            )));
        }
        let (Some(name), Some(devices)) = (&change.name, &change.devices) else {
            return Err(TreeError::MalformedPatch(format!(
                "view {} must be patched with both name and devices",
                self.id
            )));
        };
        self.name = name.clone();
        self.endpoints = devices.clone();
        Ok(())
    }
}
