//! Endpoints: one measurable or controllable quantity on a device.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::bounds::BoundsTable;
use crate::error::TreeError;
use crate::patch::EndpointChange;

/// Seconds without a value after which an endpoint counts as stale.
pub const STALE_AFTER_SECS: u64 = 600;

/// Separator between device ip and eid in composite endpoint ids.
pub const ID_SEPARATOR: char = '.';

/// Build the composite id `"<ip>.<eid>"`.
pub fn endpoint_id(ip: &str, eid: u32) -> String {
    format!("{ip}{ID_SEPARATOR}{eid}")
}

/// Split a composite id into device ip and eid.
///
/// Splits on the last separator so that dotted IPv4 addresses resolve too.
pub fn split_endpoint_id(id: &str) -> Option<(&str, u32)> {
    let (ip, eid) = id.rsplit_once(ID_SEPARATOR)?;
    Some((ip, eid.parse().ok()?))
}

pub fn parse_eid(raw: &str) -> Result<u32, TreeError> {
    raw.trim()
        .parse()
        .map_err(|_| TreeError::InvalidId(format!("eid '{raw}' is not an integer")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Function {
    Sensor,
    Actor,
    Infrastructure,
}

impl Function {
    pub fn as_str(&self) -> &'static str {
        match self {
            Function::Sensor => "sensor",
            Function::Actor => "actor",
            Function::Infrastructure => "infrastructure",
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Function {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sensor" => Ok(Function::Sensor),
            "actor" => Ok(Function::Actor),
            "infrastructure" => Ok(Function::Infrastructure),
            other => Err(TreeError::InvalidType(format!("unknown function '{other}'"))),
        }
    }
}

/// Sensor-only attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorFields {
    pub minvalue: f64,
    pub maxvalue: f64,
    pub unit: Option<String>,
}

/// Per-function payload of an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointKind {
    Sensor(SensorFields),
    Actor,
    Infrastructure,
}

impl EndpointKind {
    pub fn function(&self) -> Function {
        match self {
            EndpointKind::Sensor(_) => Function::Sensor,
            EndpointKind::Actor => Function::Actor,
            EndpointKind::Infrastructure => Function::Infrastructure,
        }
    }
}

/// Static description of an endpoint as announced by discovery or carried
/// in a creation patch.
///
/// Kept loosely typed so that construction can report which field is
/// missing or of the wrong type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointParams {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minvalue: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxvalue: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Device name, used when adding an endpoint creates its device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl EndpointParams {
    pub fn new(function: Function, datatype: u8, description: impl Into<String>) -> Self {
        Self {
            datatype: Some(Value::from(datatype)),
            function: Some(function.as_str().to_string()),
            description: Some(description.into()),
            ..Self::default()
        }
    }

    pub fn sensor(datatype: u8, description: impl Into<String>) -> Self {
        Self::new(Function::Sensor, datatype, description)
    }

    pub fn actor(datatype: u8, description: impl Into<String>) -> Self {
        Self::new(Function::Actor, datatype, description)
    }

    pub fn infrastructure(datatype: u8, description: impl Into<String>) -> Self {
        Self::new(Function::Infrastructure, datatype, description)
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_bounds(mut self, minvalue: f64, maxvalue: f64) -> Self {
        self.minvalue = Some(minvalue);
        self.maxvalue = Some(maxvalue);
        self
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn parse_datatype(&self) -> Result<u8, TreeError> {
        let raw = self
            .datatype
            .as_ref()
            .ok_or_else(|| TreeError::RequiredFieldMissing("type".into()))?;
        let parsed = match raw {
            Value::Number(n) => n.as_u64().and_then(|v| u8::try_from(v).ok()),
            // Discovery tools report the datatype as a decimal string.
            Value::String(s) => s.trim().parse::<u8>().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| TreeError::InvalidType(format!("type {raw} is not a small integer")))
    }

    fn parse_function(&self) -> Result<Function, TreeError> {
        self.function
            .as_deref()
            .ok_or_else(|| TreeError::RequiredFieldMissing("function".into()))?
            .parse()
    }
}

/// An endpoint owned by a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    ip: String,
    eid: u32,
    datatype: u8,
    description: String,
    last_value: Value,
    last_update: u64,
    kind: EndpointKind,
}

impl Endpoint {
    /// Construct an endpoint from its announced params.
    ///
    /// Sensors announced without both bounds take them from `bounds`.
    pub fn new(
        ip: &str,
        eid: u32,
        params: &EndpointParams,
        bounds: &BoundsTable,
        now: u64,
    ) -> Result<Self, TreeError> {
        if ip.is_empty() {
            return Err(TreeError::RequiredFieldMissing("ip".into()));
        }
        let datatype = params.parse_datatype()?;
        let kind = match params.parse_function()? {
            Function::Sensor => {
                let (minvalue, maxvalue) = match (params.minvalue, params.maxvalue) {
                    (Some(min), Some(max)) => (min, max),
                    _ => {
                        let b = bounds.lookup(eid);
                        (b.min, b.max)
                    }
                };
                EndpointKind::Sensor(SensorFields {
                    minvalue,
                    maxvalue,
                    unit: params.unit.clone(),
                })
            }
            Function::Actor => EndpointKind::Actor,
            Function::Infrastructure => EndpointKind::Infrastructure,
        };

        Ok(Self {
            ip: ip.to_string(),
            eid,
            datatype,
            description: params.description.clone().unwrap_or_default(),
            last_value: Value::from(0),
            last_update: now,
            kind,
        })
    }

    /// Construct from a creation change received from a peer.
    pub(crate) fn from_change(
        ip: &str,
        eid: u32,
        change: &EndpointChange,
        bounds: &BoundsTable,
        now: u64,
    ) -> Result<Self, TreeError> {
        let params = change.params.as_ref().ok_or_else(|| {
            TreeError::MalformedPatch(format!(
                "cannot create endpoint {} without params",
                endpoint_id(ip, eid)
            ))
        })?;
        let mut endpoint = Self::new(ip, eid, params, bounds, now)?;
        endpoint.apply_update(change);
        Ok(endpoint)
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn eid(&self) -> u32 {
        self.eid
    }

    pub fn id(&self) -> String {
        endpoint_id(&self.ip, self.eid)
    }

    pub fn datatype(&self) -> u8 {
        self.datatype
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn function(&self) -> Function {
        self.kind.function()
    }

    pub fn kind(&self) -> &EndpointKind {
        &self.kind
    }

    pub fn is_sensor(&self) -> bool {
        matches!(self.kind, EndpointKind::Sensor(_))
    }

    pub fn last_value(&self) -> &Value {
        &self.last_value
    }

    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    pub fn minvalue(&self) -> Option<f64> {
        self.sensor().map(|s| s.minvalue)
    }

    pub fn maxvalue(&self) -> Option<f64> {
        self.sensor().map(|s| s.maxvalue)
    }

    pub fn unit(&self) -> Option<&str> {
        self.sensor().and_then(|s| s.unit.as_deref())
    }

    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_update)
    }

    pub fn is_stale(&self, now: u64) -> bool {
        self.age(now) > STALE_AFTER_SECS
    }

    fn sensor(&self) -> Option<&SensorFields> {
        match &self.kind {
            EndpointKind::Sensor(s) => Some(s),
            _ => None,
        }
    }

    fn sensor_mut(&mut self, field: &str) -> Result<&mut SensorFields, TreeError> {
        let id = self.id();
        match &mut self.kind {
            EndpointKind::Sensor(s) => Ok(s),
            other => Err(TreeError::InvalidType(format!(
                "{field} is sensor-only, endpoint {id} is {}",
                other.function()
            ))),
        }
    }

    /// The resolved static description, as sent in creation patches.
    pub fn params(&self) -> EndpointParams {
        let mut params = EndpointParams::new(self.function(), self.datatype, self.description.clone());
        if let EndpointKind::Sensor(s) = &self.kind {
            params.minvalue = Some(s.minvalue);
            params.maxvalue = Some(s.maxvalue);
            params.unit = s.unit.clone();
        }
        params
    }

    /// Current value state; sensors also carry their bounds.
    pub fn state_change(&self) -> EndpointChange {
        EndpointChange {
            last_update: Some(self.last_update),
            last_value: Some(self.last_value.clone()),
            params: None,
            minvalue: self.minvalue(),
            maxvalue: self.maxvalue(),
        }
    }

    pub fn creation_change(&self) -> EndpointChange {
        EndpointChange {
            last_update: Some(self.last_update),
            last_value: Some(self.last_value.clone()),
            params: Some(self.params()),
            minvalue: None,
            maxvalue: None,
        }
    }

    // Pure mutators: each returns the change it caused and never publishes.

    pub fn set_last_value(&mut self, value: Value, now: u64) -> EndpointChange {
        self.last_value = value;
        self.last_update = now;
        self.state_change()
    }

    pub fn set_minvalue(&mut self, minvalue: f64) -> Result<EndpointChange, TreeError> {
        self.sensor_mut("minvalue")?.minvalue = minvalue;
        Ok(self.state_change())
    }

    pub fn set_maxvalue(&mut self, maxvalue: f64) -> Result<EndpointChange, TreeError> {
        self.sensor_mut("maxvalue")?.maxvalue = maxvalue;
        Ok(self.state_change())
    }

    /// Quiet apply of a change received from a peer.
    ///
    /// Bounds are ignored for non-sensors; `params` is ignored because type
    /// and function never change after creation.
    pub fn apply_update(&mut self, change: &EndpointChange) {
        if let Some(value) = &change.last_value {
            self.last_value = value.clone();
        }
        if let Some(ts) = change.last_update {
            self.last_update = ts;
        }
        if let EndpointKind::Sensor(s) = &mut self.kind {
            if let Some(min) = change.minvalue {
                s.minvalue = min;
            }
            if let Some(max) = change.maxvalue {
                s.maxvalue = max;
            }
        }
    }
}
