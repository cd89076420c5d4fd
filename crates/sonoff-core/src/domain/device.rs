//! Device model: switch states, outlet records and the `params` bag.
//!
//! A device reports its state as a JSON object called `params`.  Its
//! switching part comes in exactly one of two shapes:
//!
//! ```json
//! {"switch": "on"}
//! {"switches": [{"switch": "on", "outlet": 0}, {"switch": "off", "outlet": 1}]}
//! ```
//!
//! The two shapes are mutually exclusive and are discriminated purely by
//! which key is present, so they are modelled as the [`Switching`] enum
//! rather than as separate device types.  Every other key (telemetry such as
//! `power` or `rssi`, `controlType`, firmware flags, ...) is kept verbatim so
//! it can be echoed back to the device unchanged.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Device identifier as reported in the `deviceid` field, e.g. `"100060af40"`.
pub type DeviceId = String;

const KEY_SWITCH: &str = "switch";
const KEY_SWITCHES: &str = "switches";
const KEY_CONTROL_TYPE: &str = "controlType";

/// Errors raised while interpreting a `params` object.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamsError {
    /// `params` carried both `switch` and `switches`.
    #[error("params carry both `switch` and `switches`")]
    ConflictingModels,

    /// A switch value other than `"on"` / `"off"`.
    #[error("invalid switch state: {0}")]
    InvalidSwitch(String),

    /// The `switches` array could not be read as outlet records.
    #[error("invalid outlet record: {0}")]
    InvalidOutletRecord(String),

    /// Two outlet records share the same index.
    #[error("duplicate outlet index {0}")]
    DuplicateOutlet(u8),
}

/// On/off state of one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    /// Wire representation (`"on"` / `"off"`).
    pub fn as_str(self) -> &'static str {
        match self {
            SwitchState::On => "on",
            SwitchState::Off => "off",
        }
    }
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on {
            SwitchState::On
        } else {
            SwitchState::Off
        }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwitchState {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("on") {
            Ok(SwitchState::On)
        } else if s.eq_ignore_ascii_case("off") {
            Ok(SwitchState::Off)
        } else {
            Err(ParamsError::InvalidSwitch(s.to_string()))
        }
    }
}

/// One entry of a multi-outlet `switches` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutletState {
    pub switch: SwitchState,
    pub outlet: u8,
}

impl OutletState {
    pub fn new(outlet: u8, switch: SwitchState) -> Self {
        Self { switch, outlet }
    }
}

/// Which switching shape a device uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchModel {
    Single,
    Multi,
}

/// The switching part of a `params` bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Switching {
    /// Single relay (`"switch": "on"`).
    Single(SwitchState),
    /// Multi-outlet device; sorted by outlet index, indices unique.
    Multi(Vec<OutletState>),
}

impl Switching {
    pub fn model(&self) -> SwitchModel {
        match self {
            Switching::Single(_) => SwitchModel::Single,
            Switching::Multi(_) => SwitchModel::Multi,
        }
    }

    /// Outlet indices present; empty for single-switch devices.
    pub fn outlet_indices(&self) -> BTreeSet<u8> {
        match self {
            Switching::Single(_) => BTreeSet::new(),
            Switching::Multi(outlets) => outlets.iter().map(|o| o.outlet).collect(),
        }
    }

    /// State of `outlet`, if this is a multi-outlet model that has it.
    pub fn outlet(&self, outlet: u8) -> Option<SwitchState> {
        match self {
            Switching::Single(_) => None,
            Switching::Multi(outlets) => outlets
                .iter()
                .find(|o| o.outlet == outlet)
                .map(|o| o.switch),
        }
    }

    /// Sets the state of one existing outlet; `false` for a single-switch
    /// model or a missing outlet.
    pub fn set_outlet(&mut self, outlet: u8, state: SwitchState) -> bool {
        match self {
            Switching::Single(_) => false,
            Switching::Multi(outlets) => match outlets.iter_mut().find(|o| o.outlet == outlet) {
                Some(record) => {
                    record.switch = state;
                    true
                }
                None => false,
            },
        }
    }

    /// Applies a partial report: reported outlets are updated or added and
    /// the others are kept.  Any other combination replaces `self`.
    pub fn overlay(&mut self, reported: Switching) {
        match (self, reported) {
            (Switching::Multi(outlets), Switching::Multi(reported)) => {
                for record in reported {
                    match outlets.iter_mut().find(|o| o.outlet == record.outlet) {
                        Some(existing) => existing.switch = record.switch,
                        None => outlets.push(record),
                    }
                }
                outlets.sort_by_key(|o| o.outlet);
            }
            (this, reported) => *this = reported,
        }
    }

    /// Flattens the model into `(outlet, state)` pairs; single-switch
    /// devices yield one pair with no outlet.
    pub fn states(&self) -> Vec<(Option<u8>, SwitchState)> {
        match self {
            Switching::Single(state) => vec![(None, *state)],
            Switching::Multi(outlets) => outlets.iter().map(|o| (Some(o.outlet), o.switch)).collect(),
        }
    }
}

/// Typed view over the numeric telemetry a device may report.
///
/// Values arrive either as JSON numbers or as numeric strings (power
/// monitoring models send `"power": "12.34"`); both are accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Telemetry {
    pub power: Option<f64>,
    pub current: Option<f64>,
    pub voltage: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub signal_strength: Option<f64>,
}

/// The `params` bag of a device: switching model plus every other field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Params {
    switching: Option<Switching>,
    fields: Map<String, Value>,
}

impl Params {
    /// Params for a single-switch device.
    pub fn single(state: SwitchState) -> Self {
        Self {
            switching: Some(Switching::Single(state)),
            fields: Map::new(),
        }
    }

    /// Params for a multi-outlet device.
    ///
    /// # Errors
    ///
    /// Returns [`ParamsError::DuplicateOutlet`] if two records share an index.
    pub fn multi(outlets: Vec<OutletState>) -> Result<Self, ParamsError> {
        Ok(Self {
            switching: Some(Switching::Multi(normalize_outlets(outlets)?)),
            fields: Map::new(),
        })
    }

    /// Adds (or replaces) an opaque field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn switching(&self) -> Option<&Switching> {
        self.switching.as_ref()
    }

    pub fn model(&self) -> Option<SwitchModel> {
        self.switching.as_ref().map(Switching::model)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns `true` when neither switching data nor any field is present.
    pub fn is_empty(&self) -> bool {
        self.switching.is_none() && self.fields.is_empty()
    }

    /// The device's `controlType`, when reported.
    pub fn control_type(&self) -> Option<u64> {
        self.fields.get(KEY_CONTROL_TYPE).and_then(Value::as_u64)
    }

    pub fn telemetry(&self) -> Telemetry {
        Telemetry {
            power: self.numeric("power"),
            current: self.numeric("current"),
            voltage: self.numeric("voltage"),
            temperature: self.numeric("currentTemperature"),
            humidity: self.numeric("currentHumidity"),
            signal_strength: self.numeric("rssi"),
        }
    }

    /// Sets the single-switch state.
    ///
    /// Returns `false` (and leaves the params untouched) on a multi-outlet
    /// model.  Params without any switching data adopt the single model.
    pub fn set_switch(&mut self, state: SwitchState) -> bool {
        match &mut self.switching {
            Some(Switching::Multi(_)) => false,
            slot => {
                *slot = Some(Switching::Single(state));
                true
            }
        }
    }

    /// Sets the state of one existing outlet; `false` if there is no such
    /// outlet.
    pub fn set_outlet(&mut self, outlet: u8, state: SwitchState) -> bool {
        self.switching
            .as_mut()
            .map_or(false, |switching| switching.set_outlet(outlet, state))
    }

    /// Removes and returns the switching data, leaving only the opaque fields.
    pub fn take_switching(&mut self) -> Option<Switching> {
        self.switching.take()
    }

    /// Field-level merge: every field of `other` overwrites ours, and its
    /// switching data (if any) replaces ours.
    pub fn merge(&mut self, other: Params) {
        if let Some(switching) = other.switching {
            self.switching = Some(switching);
        }
        self.fields.extend(other.fields);
    }

    /// Partial-report merge: fields overwrite ours and reported outlets are
    /// overlaid on ours (see [`Switching::overlay`]).
    pub fn overlay(&mut self, other: Params) {
        match (self.switching.as_mut(), other.switching) {
            (Some(mine), Some(reported)) => mine.overlay(reported),
            (None, Some(reported)) => self.switching = Some(reported),
            (_, None) => {}
        }
        self.fields.extend(other.fields);
    }

    fn numeric(&self, key: &str) -> Option<f64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<Switching> for Params {
    fn from(switching: Switching) -> Self {
        Self {
            switching: Some(switching),
            fields: Map::new(),
        }
    }
}

impl TryFrom<Map<String, Value>> for Params {
    type Error = ParamsError;

    fn try_from(mut fields: Map<String, Value>) -> Result<Self, Self::Error> {
        let single = fields.remove(KEY_SWITCH);
        let multi = fields.remove(KEY_SWITCHES);

        let switching = match (single, multi) {
            (Some(_), Some(_)) => return Err(ParamsError::ConflictingModels),
            (Some(value), None) => Some(Switching::Single(parse_switch(value)?)),
            (None, Some(value)) => Some(Switching::Multi(parse_outlets(value)?)),
            (None, None) => None,
        };

        Ok(Self { switching, fields })
    }
}

impl From<Params> for Map<String, Value> {
    fn from(params: Params) -> Self {
        let mut map = params.fields;
        match params.switching {
            Some(Switching::Single(state)) => {
                map.insert(KEY_SWITCH.to_string(), Value::String(state.as_str().to_string()));
            }
            Some(Switching::Multi(outlets)) => {
                let records = outlets
                    .iter()
                    .map(|o| json!({ "switch": o.switch.as_str(), "outlet": o.outlet }))
                    .collect();
                map.insert(KEY_SWITCHES.to_string(), Value::Array(records));
            }
            None => {}
        }
        map
    }
}

fn parse_switch(value: Value) -> Result<SwitchState, ParamsError> {
    match value {
        Value::String(s) => s.parse(),
        other => Err(ParamsError::InvalidSwitch(other.to_string())),
    }
}

fn parse_outlets(value: Value) -> Result<Vec<OutletState>, ParamsError> {
    let outlets: Vec<OutletState> = serde_json::from_value(value)
        .map_err(|e| ParamsError::InvalidOutletRecord(e.to_string()))?;
    normalize_outlets(outlets)
}

fn normalize_outlets(mut outlets: Vec<OutletState>) -> Result<Vec<OutletState>, ParamsError> {
    outlets.sort_by_key(|o| o.outlet);
    if let Some(pair) = outlets.windows(2).find(|w| w[0].outlet == w[1].outlet) {
        return Err(ParamsError::DuplicateOutlet(pair[0].outlet));
    }
    Ok(outlets)
}

/// Last-known state of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub online: bool,
    pub params: Params,
    /// Device apikey learned from its own frames.
    pub apikey: Option<String>,
    /// Friendly name from configuration.
    pub name: Option<String>,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>, params: Params) -> Self {
        Self {
            id: id.into(),
            online: true,
            params,
            apikey: None,
            name: None,
        }
    }

    pub fn model(&self) -> Option<SwitchModel> {
        self.params.model()
    }

    /// Friendly name if configured, otherwise the device id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Entity id the host framework uses for a device or one of its outlets.
///
/// Outlets are numbered from 1 in entity ids while the wire uses 0-based
/// indices: outlet 0 of `100040e943` is `switch.100040e943_1`.
pub fn entity_id(device_id: &str, outlet: Option<u8>) -> String {
    match outlet {
        Some(index) => format!("switch.{device_id}_{}", u16::from(index) + 1),
        None => format!("switch.{device_id}"),
    }
}
