//! Default display bounds for sensor endpoints.
//!
//! Sensors announced without `minvalue`/`maxvalue` take their bounds from
//! this table, keyed by endpoint id. The built-in data covers the standard
//! endpoint ids; deployments can load overrides from JSON:
//!
//! ```json
//! { "per_eid": { "2": { "min": 0, "max": 7200 } }, "fallback": { "min": 0, "max": 100 } }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::SnapshotError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundsTable {
    #[serde(default)]
    per_eid: BTreeMap<u32, Bounds>,
    #[serde(default = "BoundsTable::default_fallback")]
    fallback: Bounds,
}

impl Default for BoundsTable {
    fn default() -> Self {
        let mut per_eid = BTreeMap::new();
        per_eid.insert(2, Bounds::new(0.0, 3600.0)); // power meter
        per_eid.insert(3, Bounds::new(10.0, 35.0)); // temperature
        per_eid.insert(4, Bounds::new(0.0, 1.0)); // button
        per_eid.insert(5, Bounds::new(0.0, 100.0)); // humidity
        per_eid.insert(44, Bounds::new(0.0, 100.0)); // pt100 inflow
        per_eid.insert(45, Bounds::new(0.0, 100.0)); // pt100 outflow
        Self {
            per_eid,
            fallback: Self::default_fallback(),
        }
    }
}

impl BoundsTable {
    fn default_fallback() -> Bounds {
        Bounds::new(0.0, 100.0)
    }

    /// A table with no per-eid entries.
    pub fn empty(fallback: Bounds) -> Self {
        Self {
            per_eid: BTreeMap::new(),
            fallback,
        }
    }

    pub fn lookup(&self, eid: u32) -> Bounds {
        self.per_eid.get(&eid).copied().unwrap_or(self.fallback)
    }

    pub fn insert(&mut self, eid: u32, bounds: Bounds) -> Option<Bounds> {
        self.per_eid.insert(eid, bounds)
    }

    pub fn fallback(&self) -> Bounds {
        self.fallback
    }

    /// Load a table from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
