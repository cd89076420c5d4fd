//! Event reconciler: folds inbound frames into the session registry.
//!
//! Frames are handled strictly in receive order by the connection task.  Each
//! `update` frame is applied with one [`DeviceRegistry::apply_report`] call:
//!
//! | Registry state      | Params carry                                  | Effect            |
//! |---------------------|-----------------------------------------------|-------------------|
//! | device unknown      | anything                                      | first sighting    |
//! | known               | `switch`, or `switches` covering every outlet | replaced          |
//! | known, multi-outlet | `switches` for some outlets                   | outlets overlaid  |
//! | known               | no switching data                             | fields merged     |
//!
//! A hello from an unknown device is also a first sighting, with empty
//! params.  A report that contradicts the device's established model is
//! dropped with a warning.  Every reported switch or outlet then produces a
//! [`DeviceEvent::StateChanged`].

use sonoff_core::protocol::{HelloFrame, UpdateFrame};
use sonoff_core::{DeviceRegistry, Frame, Params, Report, ReportOutcome, Switching};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::events::DeviceEvent;

/// Applies inbound frames to a registry and publishes the resulting events.
#[derive(Debug, Clone)]
pub struct EventReconciler {
    events: broadcast::Sender<DeviceEvent>,
    /// Friendly name attached to devices on first sighting.
    default_name: Option<String>,
}

impl EventReconciler {
    pub fn new(events: broadcast::Sender<DeviceEvent>) -> Self {
        Self {
            events,
            default_name: None,
        }
    }

    pub fn with_default_name(mut self, name: Option<String>) -> Self {
        self.default_name = name;
        self
    }

    /// Reconciles one frame and broadcasts its events.  Returns how many
    /// events were produced.
    ///
    /// Publishing never blocks: with no subscribers the events are dropped,
    /// and slow subscribers lose the oldest events.
    pub fn handle_frame(&self, registry: &DeviceRegistry, frame: Frame) -> usize {
        let events = self.reconcile(registry, frame);
        let count = events.len();
        for event in events {
            // An error only means nobody is subscribed right now.
            let _ = self.events.send(event);
        }
        count
    }

    /// Reconciles one frame and returns the events it produced.
    pub fn reconcile(&self, registry: &DeviceRegistry, frame: Frame) -> Vec<DeviceEvent> {
        match frame {
            Frame::Update(update) => self.reconcile_update(registry, update),
            Frame::Hello(hello) => self.reconcile_hello(registry, hello),
            Frame::UserOnline(_) => {
                debug!("Ignoring userOnline frame from device");
                Vec::new()
            }
            Frame::Unknown { action, .. } => {
                debug!(action = %action, "Ignoring frame with unhandled action");
                Vec::new()
            }
        }
    }

    fn reconcile_update(&self, registry: &DeviceRegistry, update: UpdateFrame) -> Vec<DeviceEvent> {
        let UpdateFrame {
            device_id,
            apikey,
            params,
            ..
        } = update;
        let reported = params
            .switching()
            .map(Switching::states)
            .unwrap_or_default();
        let report = Report {
            params: params.clone(),
            apikey,
            name: self.default_name.clone(),
        };

        let mut events = match registry.apply_report(&device_id, report) {
            Ok(outcome) => outcome_events(&device_id, outcome, params),
            Err(e) => {
                warn!(device_id = %device_id, "Dropping inconsistent report: {e}");
                return Vec::new();
            }
        };
        events.extend(reported.into_iter().map(|(outlet, state)| {
            debug!(device_id = %device_id, ?outlet, %state, "Device reported state");
            DeviceEvent::StateChanged {
                device_id: device_id.clone(),
                outlet,
                state,
            }
        }));
        events
    }

    fn reconcile_hello(&self, registry: &DeviceRegistry, hello: HelloFrame) -> Vec<DeviceEvent> {
        if !hello.is_ok() {
            warn!(device_id = %hello.deviceid, error = hello.error, "Device replied with an error code");
            return Vec::new();
        }
        debug!(device_id = %hello.deviceid, "Hello from device");
        let report = Report {
            params: Params::default(),
            apikey: hello.apikey,
            name: self.default_name.clone(),
        };
        match registry.apply_report(&hello.deviceid, report) {
            Ok(outcome) => outcome_events(&hello.deviceid, outcome, Params::default()),
            Err(e) => {
                warn!(device_id = %hello.deviceid, "Dropping hello: {e}");
                Vec::new()
            }
        }
    }
}

/// Sighting and availability events for an applied report.
fn outcome_events(device_id: &str, outcome: ReportOutcome, params: Params) -> Vec<DeviceEvent> {
    let online = || DeviceEvent::AvailabilityChanged {
        device_id: device_id.to_string(),
        online: true,
    };
    match outcome {
        ReportOutcome::Created => {
            info!(device_id, "New device seen");
            vec![
                DeviceEvent::DeviceSeen {
                    device_id: device_id.to_string(),
                    params,
                },
                online(),
            ]
        }
        ReportOutcome::Updated { came_online: true } => vec![online()],
        ReportOutcome::Updated { came_online: false } => Vec::new(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sonoff_core::{decode_frame, OutletState, Params, SwitchModel, SwitchState};

    fn reconciler() -> (EventReconciler, broadcast::Receiver<DeviceEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (EventReconciler::new(tx), rx)
    }

    fn update(device_id: &str, params: Params) -> Frame {
        Frame::Update(UpdateFrame {
            user_agent: sonoff_core::protocol::UserAgent::Device,
            device_id: device_id.to_string(),
            apikey: None,
            self_apikey: None,
            sequence: None,
            params,
            control_type: None,
            ts: None,
        })
    }

    fn four_outlets(state: SwitchState) -> Params {
        Params::multi((0..4).map(|i| OutletState::new(i, state)).collect()).unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<DeviceEvent>) -> Vec<DeviceEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_first_update_emits_exactly_one_device_seen() {
        // Arrange
        let (reconciler, mut rx) = reconciler();
        let registry = DeviceRegistry::new();
        let params = Params::single(SwitchState::Off);

        // Act
        let count = reconciler.handle_frame(&registry, update("100060af40", params.clone()));

        // Assert
        let events = drain(&mut rx);
        assert_eq!(count, 3);
        let seen: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, DeviceEvent::DeviceSeen { .. }))
            .collect();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            events,
            vec![
                DeviceEvent::DeviceSeen {
                    device_id: "100060af40".to_string(),
                    params: params.clone(),
                },
                DeviceEvent::AvailabilityChanged {
                    device_id: "100060af40".to_string(),
                    online: true,
                },
                DeviceEvent::StateChanged {
                    device_id: "100060af40".to_string(),
                    outlet: None,
                    state: SwitchState::Off,
                },
            ]
        );
        assert_eq!(registry.get("100060af40").unwrap().params, params);
    }

    #[test]
    fn test_second_update_is_not_a_new_sighting() {
        let (reconciler, mut rx) = reconciler();
        let registry = DeviceRegistry::new();
        reconciler.handle_frame(&registry, update("a", Params::single(SwitchState::Off)));
        drain(&mut rx);

        reconciler.handle_frame(&registry, update("a", Params::single(SwitchState::On)));

        assert_eq!(
            drain(&mut rx),
            vec![DeviceEvent::StateChanged {
                device_id: "a".to_string(),
                outlet: None,
                state: SwitchState::On,
            }]
        );
    }

    #[test]
    fn test_last_writer_wins() {
        // Arrange
        let (reconciler, _rx) = reconciler();
        let registry = DeviceRegistry::new();
        reconciler.handle_frame(&registry, update("a", four_outlets(SwitchState::Off)));

        // Act: an optimistic apply followed by an authoritative report
        registry.set_outlet_state("a", 0, SwitchState::On);
        reconciler.handle_frame(&registry, update("a", four_outlets(SwitchState::Off)));

        // Assert
        let device = registry.get("a").unwrap();
        assert_eq!(device.params, four_outlets(SwitchState::Off));
    }

    #[test]
    fn test_subset_report_updates_only_reported_outlets() {
        let (reconciler, mut rx) = reconciler();
        let registry = DeviceRegistry::new();
        reconciler.handle_frame(&registry, update("a", four_outlets(SwitchState::Off)));
        drain(&mut rx);
        let partial = Params::multi(vec![OutletState::new(2, SwitchState::On)])
            .unwrap()
            .with_field("rssi", json!(-40));

        reconciler.handle_frame(&registry, update("a", partial));

        let device = registry.get("a").unwrap();
        let switching = device.params.switching().unwrap();
        assert_eq!(switching.outlet(2), Some(SwitchState::On));
        assert_eq!(switching.outlet_indices().len(), 4);
        assert_eq!(switching.outlet(3), Some(SwitchState::Off));
        assert_eq!(device.params.field("rssi"), Some(&json!(-40)));
        assert_eq!(
            drain(&mut rx),
            vec![DeviceEvent::StateChanged {
                device_id: "a".to_string(),
                outlet: Some(2),
                state: SwitchState::On,
            }]
        );
    }

    #[test]
    fn test_telemetry_only_report_is_merged() {
        let (reconciler, mut rx) = reconciler();
        let registry = DeviceRegistry::new();
        reconciler.handle_frame(&registry, update("a", Params::single(SwitchState::On)));
        drain(&mut rx);

        reconciler.handle_frame(
            &registry,
            update("a", Params::default().with_field("power", json!("5.5"))),
        );

        let device = registry.get("a").unwrap();
        assert_eq!(device.params.model(), Some(SwitchModel::Single));
        assert_eq!(device.params.telemetry().power, Some(5.5));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_model_mismatch_is_dropped() {
        let (reconciler, mut rx) = reconciler();
        let registry = DeviceRegistry::new();
        reconciler.handle_frame(&registry, update("a", Params::single(SwitchState::On)));
        drain(&mut rx);

        let count = reconciler.handle_frame(&registry, update("a", four_outlets(SwitchState::Off)));

        assert_eq!(count, 0);
        assert_eq!(registry.get("a").unwrap().model(), Some(SwitchModel::Single));
    }

    #[test]
    fn test_hello_learns_apikey_of_known_device() {
        let (reconciler, _rx) = reconciler();
        let registry = DeviceRegistry::new();
        registry.upsert("100060af40", Params::single(SwitchState::Off), true).unwrap();
        let hello = decode_frame(
            r#"{"error":0,"apikey":"09a15816","sequence":"1","deviceid":"100060af40"}"#,
        )
        .unwrap();

        let events = reconciler.reconcile(&registry, hello);

        assert!(events.is_empty());
        assert_eq!(
            registry.get("100060af40").unwrap().apikey.as_deref(),
            Some("09a15816")
        );
    }

    #[test]
    fn test_hello_from_unknown_device_is_first_sighting() {
        // Arrange
        let (reconciler, _rx) = reconciler();
        let registry = DeviceRegistry::new();
        let hello = decode_frame(r#"{"error":0,"apikey":"k","deviceid":"x"}"#).unwrap();

        // Act
        let events = reconciler.reconcile(&registry, hello);

        // Assert
        assert_eq!(
            events,
            vec![
                DeviceEvent::DeviceSeen {
                    device_id: "x".to_string(),
                    params: Params::default(),
                },
                DeviceEvent::AvailabilityChanged {
                    device_id: "x".to_string(),
                    online: true,
                },
            ]
        );
        let device = registry.get("x").unwrap();
        assert!(device.params.is_empty());
        assert_eq!(device.apikey.as_deref(), Some("k"));
    }

    #[test]
    fn test_update_after_hello_sighting_fills_in_state() {
        let (reconciler, mut rx) = reconciler();
        let registry = DeviceRegistry::new();
        let hello = decode_frame(r#"{"error":0,"deviceid":"x"}"#).unwrap();
        reconciler.handle_frame(&registry, hello);
        drain(&mut rx);

        reconciler.handle_frame(&registry, update("x", Params::single(SwitchState::Off)));

        assert_eq!(
            drain(&mut rx),
            vec![DeviceEvent::StateChanged {
                device_id: "x".to_string(),
                outlet: None,
                state: SwitchState::Off,
            }]
        );
        assert_eq!(registry.get("x").unwrap().model(), Some(SwitchModel::Single));
    }

    #[test]
    fn test_hello_with_error_code_creates_nothing() {
        let (reconciler, _rx) = reconciler();
        let registry = DeviceRegistry::new();
        let hello = decode_frame(r#"{"error":403,"deviceid":"x"}"#).unwrap();

        assert!(reconciler.reconcile(&registry, hello).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_full_report_after_subset_first_sighting_replaces_state() {
        // Arrange: the first report mentions only outlet 2
        let (reconciler, mut rx) = reconciler();
        let registry = DeviceRegistry::new();
        let subset = Params::multi(vec![OutletState::new(2, SwitchState::On)]).unwrap();
        reconciler.handle_frame(&registry, update("a", subset));
        drain(&mut rx);

        // Act
        let count = reconciler.handle_frame(&registry, update("a", four_outlets(SwitchState::Off)));

        // Assert
        assert_eq!(count, 4);
        assert_eq!(registry.get("a").unwrap().params, four_outlets(SwitchState::Off));
        let events = drain(&mut rx);
        assert!(events.iter().all(|e| matches!(
            e,
            DeviceEvent::StateChanged { state: SwitchState::Off, .. }
        )));
    }

    #[test]
    fn test_unknown_action_is_ignored() {
        let (reconciler, _rx) = reconciler();
        let registry = DeviceRegistry::new();
        let frame = Frame::Unknown {
            action: "query".to_string(),
            body: json!({"deviceid": "a"}),
        };

        assert!(reconciler.reconcile(&registry, frame).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_default_name_applied_on_first_sighting() {
        let (tx, _rx) = broadcast::channel(8);
        let reconciler = EventReconciler::new(tx).with_default_name(Some("Porch".to_string()));
        let registry = DeviceRegistry::new();

        reconciler.handle_frame(&registry, update("a", Params::single(SwitchState::On)));

        assert_eq!(registry.get("a").unwrap().display_name(), "Porch");
    }

    #[test]
    fn test_offline_device_comes_back_online() {
        let (reconciler, mut rx) = reconciler();
        let registry = DeviceRegistry::new();
        reconciler.handle_frame(&registry, update("a", Params::single(SwitchState::On)));
        registry.set_online("a", false);
        drain(&mut rx);

        reconciler.handle_frame(&registry, update("a", Params::single(SwitchState::On)));

        let events = drain(&mut rx);
        assert!(events.contains(&DeviceEvent::AvailabilityChanged {
            device_id: "a".to_string(),
            online: true,
        }));
        assert!(registry.get("a").unwrap().online);
    }
}
