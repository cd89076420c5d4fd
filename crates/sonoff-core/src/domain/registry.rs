//! Device registry: the last-known state of every device seen in a session.
//!
//! The registry is shared between the frame reader (which records device
//! reports) and the command dispatcher (which applies optimistic updates), so
//! every method takes `&self` and synchronizes internally.  Reads return
//! clones; no reference into the map ever escapes the lock.
//!
//! A device keeps the switching model (single vs. multi-outlet) it was first
//! seen with; reports of the other model are rejected.  The outlet set of a
//! multi-outlet device may grow as outlets are reported.
//!
//! [`DeviceRegistry::apply_report`] folds a whole device report in under one
//! lock acquisition, so readers never observe a half-applied report.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};

use super::device::{Device, DeviceId, Params, SwitchModel, SwitchState, Switching};

/// Errors returned by [`DeviceRegistry`] write operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The report uses a different switching model than the stored device.
    #[error("device {device_id} switching model changed from {stored:?} to {reported:?}")]
    ModelMismatch {
        device_id: DeviceId,
        stored: SwitchModel,
        reported: SwitchModel,
    },
}

/// One device report as received from the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    pub params: Params,
    /// Apikey the device sent along with the report.
    pub apikey: Option<String>,
    /// Name attached to the device if this report creates it.
    pub name: Option<String>,
}

/// What [`DeviceRegistry::apply_report`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// First sighting; the device was created online.
    Created,
    /// Existing device updated.  `came_online` is set when it had been
    /// marked offline.
    Updated { came_online: bool },
}

/// Thread-safe map from device id to [`Device`].
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<DeviceId, Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceId, Device>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates or replaces a device's params.
    ///
    /// An existing device's params are replaced wholesale, keeping its
    /// apikey and name.  Returns `true` if the device was newly created.
    ///
    /// # Errors
    ///
    /// [`RegistryError::ModelMismatch`] if the stored and reported params
    /// both carry switching data of different models.
    pub fn upsert(&self, id: &str, params: Params, online: bool) -> Result<bool, RegistryError> {
        let mut devices = self.lock();
        match devices.get_mut(id) {
            Some(device) => {
                check_compatible(id, &device.params, &params)?;
                device.params = params;
                device.online = online;
                debug!(device_id = id, "Device state replaced");
                Ok(false)
            }
            None => {
                let mut device = Device::new(id, params);
                device.online = online;
                devices.insert(id.to_string(), device);
                debug!(device_id = id, "Device registered");
                Ok(true)
            }
        }
    }

    /// Folds one device report into the registry.
    ///
    /// - Unknown device: created online with the report's params.
    /// - Report with `switch`, or with `switches` covering every stored
    ///   outlet: params replaced wholesale.
    /// - Report with `switches` for only some stored outlets, or with no
    ///   switching data: overlaid on the stored params.
    ///
    /// The device is marked online and the reported apikey recorded.
    ///
    /// # Errors
    ///
    /// [`RegistryError::ModelMismatch`] if the report contradicts the stored
    /// switching model; the device is left untouched.
    pub fn apply_report(&self, id: &str, report: Report) -> Result<ReportOutcome, RegistryError> {
        let Report {
            params,
            apikey,
            name,
        } = report;
        let mut devices = self.lock();
        let Some(device) = devices.get_mut(id) else {
            let mut device = Device::new(id, params);
            device.apikey = apikey;
            device.name = name;
            devices.insert(id.to_string(), device);
            debug!(device_id = id, "Device registered");
            return Ok(ReportOutcome::Created);
        };

        check_compatible(id, &device.params, &params)?;
        let replace = match (device.params.switching(), params.switching()) {
            (_, None) => false,
            (Some(stored @ Switching::Multi(_)), Some(reported @ Switching::Multi(_))) => reported
                .outlet_indices()
                .is_superset(&stored.outlet_indices()),
            _ => true,
        };
        if replace {
            device.params = params;
        } else {
            device.params.overlay(params);
        }
        if apikey.is_some() {
            device.apikey = apikey;
        }
        let came_online = !std::mem::replace(&mut device.online, true);
        debug!(device_id = id, replace, "Device report applied");
        Ok(ReportOutcome::Updated { came_online })
    }

    /// Merges a partial report into an existing device.
    ///
    /// Returns `Ok(false)` if the device is unknown.
    ///
    /// # Errors
    ///
    /// Same as [`upsert`](Self::upsert) when the report carries switching data.
    pub fn merge_params(&self, id: &str, params: Params) -> Result<bool, RegistryError> {
        let mut devices = self.lock();
        let Some(device) = devices.get_mut(id) else {
            return Ok(false);
        };
        if params.switching().is_some() {
            check_compatible(id, &device.params, &params)?;
        }
        device.params.merge(params);
        Ok(true)
    }

    /// Sets the state of a single-switch device.
    ///
    /// No-op returning `false` when the device is unknown or multi-outlet.
    pub fn set_switch_state(&self, id: &str, state: SwitchState) -> bool {
        let mut devices = self.lock();
        let Some(device) = devices.get_mut(id) else {
            debug!(device_id = id, "Ignoring switch update for unknown device");
            return false;
        };
        let applied = device.params.set_switch(state);
        if !applied {
            warn!(device_id = id, "Ignoring single-switch update for multi-outlet device");
        }
        applied
    }

    /// Sets one outlet of a multi-outlet device, leaving the rest unchanged.
    ///
    /// No-op returning `false` when the device or outlet is unknown, or the
    /// device is single-switch.
    pub fn set_outlet_state(&self, id: &str, outlet: u8, state: SwitchState) -> bool {
        let mut devices = self.lock();
        let Some(device) = devices.get_mut(id) else {
            debug!(device_id = id, outlet, "Ignoring outlet update for unknown device");
            return false;
        };
        let applied = device.params.set_outlet(outlet, state);
        if !applied {
            warn!(device_id = id, outlet, "Ignoring update for missing outlet");
        }
        applied
    }

    /// Marks a device online or offline; returns the previous value.
    pub fn set_online(&self, id: &str, online: bool) -> Option<bool> {
        let mut devices = self.lock();
        let device = devices.get_mut(id)?;
        Some(std::mem::replace(&mut device.online, online))
    }

    /// Records the apikey a device reported about itself.
    pub fn set_apikey(&self, id: &str, apikey: impl Into<String>) -> bool {
        match self.lock().get_mut(id) {
            Some(device) => {
                device.apikey = Some(apikey.into());
                true
            }
            None => false,
        }
    }

    /// Attaches a friendly name to a device.
    pub fn set_name(&self, id: &str, name: impl Into<String>) -> bool {
        match self.lock().get_mut(id) {
            Some(device) => {
                device.name = Some(name.into());
                true
            }
            None => false,
        }
    }

    /// Snapshot of one device.
    pub fn get(&self, id: &str) -> Option<Device> {
        self.lock().get(id).cloned()
    }

    /// Snapshot of every device, sorted by id.
    pub fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.lock().values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn check_compatible(id: &str, stored: &Params, reported: &Params) -> Result<(), RegistryError> {
    let (Some(old), Some(new)) = (stored.switching(), reported.switching()) else {
        return Ok(());
    };
    if old.model() != new.model() {
        return Err(RegistryError::ModelMismatch {
            device_id: id.to_string(),
            stored: old.model(),
            reported: new.model(),
        });
    }
    Ok(())
}
