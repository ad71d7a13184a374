//! Domain services running on the router against the default simulated vehicle.

use std::fs;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use vhal_broker::services::diagnostic::{DiagnosticFrame, DiagnosticListener, FrameKind};
use vhal_broker::services::input::{InputDisplay, InputListener, KeyAction, KeyEvent};
use vhal_broker::services::power::{PowerEventListener, PowerRequestState, PowerStateRequest};
use vhal_broker::services::property::PropertyHalListener;
use vhal_broker::services::user::{ConcurrencyPolicy, InitialUserInfoRequestType, UsersInfo};
use vhal_broker::services::vms::{
    VmsAvailability, VmsClient, VmsLayer, VmsLayerDependency, VmsMessage,
};
use vhal_broker::sim::defaults::{HVAC_AREA, MAX_BRIGHTNESS, STORED_FREEZE_FRAME_TS, VENDOR_TICK_COUNTER};
use vhal_broker::{ServiceSet, SimulatedVehicle, VehicleHal};
use vhal_common::config::BrokerConfig;
use vhal_common::hal::{HalError, StatusCode};
use vhal_common::property::ids;
use vhal_common::property::{AreaId, GLOBAL_AREA, PropertyId, PropertyValue};

const VMS_CORE_ID: i32 = 4242;

struct Broker {
    vehicle: Arc<SimulatedVehicle>,
    hal: Arc<VehicleHal>,
    services: ServiceSet,
}

fn broker() -> Broker {
    let config = BrokerConfig::default();
    let vehicle = Arc::new(SimulatedVehicle::with_defaults());
    let services = ServiceSet::new(&config, VMS_CORE_ID).unwrap();
    let hal = VehicleHal::new(vehicle.clone(), services.as_list(), &config.transport).unwrap();
    hal.init().unwrap();
    Broker {
        vehicle,
        hal,
        services,
    }
}

fn writes_of(vehicle: &SimulatedVehicle, prop: PropertyId) -> Vec<PropertyValue> {
    vehicle
        .set_log()
        .into_iter()
        .filter(|v| v.prop == prop)
        .collect()
}

#[test]
fn test_broker_built_from_config_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("broker.toml");
    fs::write(
        &path,
        "[user]\nallow_concurrent_requests = true\n\n[simulation]\nemulate_user_hal = true\n",
    )
    .unwrap();
    let config = BrokerConfig::load_validated(&path).unwrap();

    let vehicle = Arc::new(SimulatedVehicle::from_config(&config.simulation));
    let services = ServiceSet::new(&config, VMS_CORE_ID).unwrap();
    let hal = VehicleHal::new(vehicle, services.as_list(), &config.transport).unwrap();
    hal.init().unwrap();

    let user = services.user.as_ref().unwrap();
    assert_eq!(user.pending_requests().policy(), ConcurrencyPolicy::Unrestricted);

    let (tx, rx) = mpsc::channel();
    user.get_initial_user_info(
        InitialUserInfoRequestType::ColdBoot,
        config.user.timeout(),
        &UsersInfo::default(),
        Box::new(move |status, _| {
            let _ = tx.send(status);
        }),
    )
    .unwrap();
    let status = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(status.to_string(), "OK");
    hal.release();
}

// ─── Ownership ──────────────────────────────────────────────────────

#[test]
fn test_standard_ownership() {
    let b = broker();
    assert_eq!(b.hal.owner_of(ids::AP_POWER_STATE_REQ).as_deref(), Some("power"));
    assert_eq!(b.hal.owner_of(ids::HW_KEY_INPUT).as_deref(), Some("input"));
    assert_eq!(b.hal.owner_of(ids::SWITCH_USER).as_deref(), Some("user"));
    assert_eq!(b.hal.owner_of(ids::OBD2_LIVE_FRAME).as_deref(), Some("diagnostic"));
    assert_eq!(b.hal.owner_of(ids::VEHICLE_MAP_SERVICE).as_deref(), Some("vms"));
    assert_eq!(b.hal.owner_of(ids::HVAC_FAN_SPEED).as_deref(), Some("property"));
    assert_eq!(b.hal.owner_of(VENDOR_TICK_COUNTER).as_deref(), Some("property"));

    let passthrough: Vec<PropertyId> = b
        .services
        .property
        .property_list()
        .iter()
        .map(|d| d.prop)
        .collect();
    assert!(passthrough.contains(&ids::INFO_VIN));
    assert!(!passthrough.contains(&ids::AP_POWER_STATE_REQ));
}

// ─── Power ──────────────────────────────────────────────────────────

#[derive(Default)]
struct PowerRecorder {
    requests: Mutex<Vec<PowerStateRequest>>,
    brightness: Mutex<Vec<i32>>,
}

impl PowerEventListener for PowerRecorder {
    fn on_power_state_request(&self, request: PowerStateRequest) {
        self.requests.lock().push(request);
    }

    fn on_display_brightness_change(&self, percent: i32) {
        self.brightness.lock().push(percent);
    }
}

#[test]
fn test_power_requests_queued_until_listener() {
    let b = broker();
    assert!(b.services.power.is_power_state_supported());
    assert!(b.services.power.is_display_brightness_supported());

    b.vehicle.inject_event(
        PropertyValue::new(ids::AP_POWER_STATE_REQ).with_int32s(vec![1, 2]),
    );
    b.vehicle
        .inject_event(PropertyValue::int32(ids::DISPLAY_BRIGHTNESS, GLOBAL_AREA, MAX_BRIGHTNESS));
    b.hal.sync_dispatch();

    let recorder = Arc::new(PowerRecorder::default());
    b.services.power.set_listener(recorder.clone());

    let requests = recorder.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].state, PowerRequestState::ShutdownPrepare);
    assert!(requests[0].can_sleep());
    assert_eq!(*recorder.brightness.lock(), vec![100]);
}

#[test]
fn test_power_reports_and_brightness() {
    let b = broker();
    b.services.power.send_wait_for_vhal().unwrap();
    b.services.power.send_shutdown_postpone(5000).unwrap();
    let reports = writes_of(&b.vehicle, ids::AP_POWER_STATE_REPORT);
    assert_eq!(reports[0].value.int32_values, vec![1, 0]);
    assert_eq!(reports[1].value.int32_values, vec![4, 5000]);

    b.services.power.set_display_brightness(50).unwrap();
    b.services.power.set_display_brightness(150).unwrap();
    let brightness = writes_of(&b.vehicle, ids::DISPLAY_BRIGHTNESS);
    assert_eq!(brightness[0].first_int32(), Some(MAX_BRIGHTNESS / 2));
    assert_eq!(brightness[1].first_int32(), Some(MAX_BRIGHTNESS));

    assert_eq!(
        b.services.power.current_power_state().unwrap().state,
        PowerRequestState::On
    );
    assert_eq!(b.services.power.boot_reason().unwrap(), 0);
}

// ─── Input ──────────────────────────────────────────────────────────

#[derive(Default)]
struct KeyRecorder(Mutex<Vec<KeyEvent>>);

impl InputListener for KeyRecorder {
    fn on_key_event(&self, event: KeyEvent) {
        self.0.lock().push(event);
    }
}

fn key(action: i32, code: i32, display: i32, ts: i64) -> PropertyValue {
    PropertyValue::new(ids::HW_KEY_INPUT)
        .with_int32s(vec![action, code, display])
        .at(ts)
}

#[test]
fn test_key_press_with_repeats() {
    let b = broker();
    assert!(b.services.input.is_key_input_supported());
    let recorder = Arc::new(KeyRecorder::default());
    b.services.input.set_listener(recorder.clone());

    b.vehicle.emit(vec![key(0, 66, 0, 100), key(0, 66, 0, 200)]);
    b.vehicle.inject_event(key(1, 66, 0, 300));
    b.vehicle.inject_event(key(0, 4, 1, 400));
    b.hal.sync_dispatch();

    let events = recorder.0.lock().clone();
    assert_eq!(events.len(), 4);
    assert_eq!(
        events.iter().map(|e| e.repeat_count).collect::<Vec<_>>(),
        vec![0, 1, 0, 0]
    );
    assert_eq!(events[2].action, KeyAction::Up);
    assert_eq!(events[2].down_time_ns, 100);
    assert_eq!(events[2].event_time_ns, 300);
    assert_eq!(events[3].display, InputDisplay::Cluster);
}

// ─── Diagnostics ────────────────────────────────────────────────────

#[derive(Default)]
struct FrameRecorder(Mutex<Vec<DiagnosticFrame>>);

impl DiagnosticListener for FrameRecorder {
    fn on_diagnostic_frames(&self, frames: Vec<DiagnosticFrame>) {
        self.0.lock().extend(frames);
    }
}

#[test]
fn test_live_and_freeze_frames() {
    let b = broker();
    let diagnostic = &b.services.diagnostic;

    let live = diagnostic.live_frame().unwrap();
    assert_eq!(live.kind, FrameKind::Live);
    assert_eq!(live.int_sensors.get(&0), Some(&0));
    assert_eq!(live.float_sensors.get(&4), Some(&850.0));
    assert_eq!(live.float_sensors.len(), 1);

    assert_eq!(
        diagnostic.freeze_frame_timestamps().unwrap(),
        vec![STORED_FREEZE_FRAME_TS]
    );
    let freeze = diagnostic.freeze_frame(STORED_FREEZE_FRAME_TS).unwrap();
    assert_eq!(freeze.kind, FrameKind::Freeze);
    assert_eq!(freeze.dtc, "P0301");
    assert_eq!(freeze.timestamp_ns, STORED_FREEZE_FRAME_TS);
    assert_eq!(freeze.float_sensors.get(&4), Some(&3200.0));

    diagnostic.clear_freeze_frames(&[]).unwrap();
    assert!(diagnostic.freeze_frame_timestamps().unwrap().is_empty());
    assert!(diagnostic.freeze_frame(STORED_FREEZE_FRAME_TS).is_err());
}

#[test]
fn test_live_frames_streamed() {
    let b = broker();
    let recorder = Arc::new(FrameRecorder::default());
    b.services.diagnostic.set_listener(recorder.clone());
    b.services.diagnostic.subscribe_live_frames(0.0).unwrap();

    b.vehicle
        .inject_event(vhal_broker::sim::defaults::live_frame(2, 1500.0));
    b.hal.sync_dispatch();

    let frames = recorder.0.lock().clone();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].int_sensors.get(&0), Some(&2));
    assert_eq!(frames[0].float_sensors.get(&4), Some(&1500.0));
}

// ─── Generic properties ─────────────────────────────────────────────

#[derive(Default)]
struct PropertyRecorder {
    changes: Mutex<Vec<PropertyValue>>,
    errors: Mutex<Vec<(PropertyId, AreaId, StatusCode)>>,
}

impl PropertyHalListener for PropertyRecorder {
    fn on_property_change(&self, values: Vec<PropertyValue>) {
        self.changes.lock().extend(values);
    }

    fn on_property_set_error(&self, prop: PropertyId, area: AreaId, status: StatusCode) {
        self.errors.lock().push((prop, area, status));
    }
}

#[test]
fn test_passthrough_get_and_validated_set() {
    let b = broker();
    let property = &b.services.property;

    let vin = property.get_property(ids::INFO_VIN, GLOBAL_AREA).unwrap();
    assert_eq!(vin.value.string_value, "1VHALSIM000000001");

    assert!(matches!(
        property.set_property(&PropertyValue::int32(ids::HVAC_FAN_SPEED, HVAC_AREA, 9)),
        Err(HalError::InvalidArgument { .. })
    ));
    assert!(writes_of(&b.vehicle, ids::HVAC_FAN_SPEED).is_empty());

    property
        .set_property(&PropertyValue::int32(ids::HVAC_FAN_SPEED, HVAC_AREA, 5))
        .unwrap();
    assert_eq!(
        b.vehicle
            .value(ids::HVAC_FAN_SPEED, HVAC_AREA)
            .and_then(|v| v.first_int32()),
        Some(5)
    );

    assert!(matches!(
        property.get_property(ids::AP_POWER_STATE_REQ, GLOBAL_AREA),
        Err(HalError::Unsupported(_))
    ));
    assert!(property.read_permission(ids::PERF_VEHICLE_SPEED).is_some());
}

#[test]
fn test_passthrough_events_validated() {
    let b = broker();
    let recorder = Arc::new(PropertyRecorder::default());
    b.services.property.set_listener(recorder.clone());
    b.services
        .property
        .subscribe_property(ids::HVAC_FAN_SPEED, 0.0)
        .unwrap();
    b.services
        .property
        .subscribe_property(VENDOR_TICK_COUNTER, 0.0)
        .unwrap();

    b.vehicle.emit(vec![
        PropertyValue::int32(ids::HVAC_FAN_SPEED, HVAC_AREA, 9),
        PropertyValue::int32(ids::HVAC_FAN_SPEED, HVAC_AREA, 2),
    ]);
    b.vehicle.tick();
    b.hal.sync_dispatch();

    let changes = recorder.changes.lock().clone();
    let fan: Vec<_> = changes
        .iter()
        .filter(|v| v.prop == ids::HVAC_FAN_SPEED)
        .filter_map(|v| v.first_int32())
        .collect();
    assert_eq!(fan, vec![2]);
    assert!(changes.iter().any(|v| v.prop == VENDOR_TICK_COUNTER));
}

#[test]
fn test_passthrough_set_error_reported() {
    let b = broker();
    let recorder = Arc::new(PropertyRecorder::default());
    b.services.property.set_listener(recorder.clone());
    b.services
        .property
        .subscribe_property(ids::HVAC_FAN_SPEED, 0.0)
        .unwrap();

    b.vehicle
        .inject_set_error(StatusCode::NotAvailable, ids::HVAC_FAN_SPEED, HVAC_AREA);
    b.hal.sync_dispatch();
    assert_eq!(
        *recorder.errors.lock(),
        vec![(ids::HVAC_FAN_SPEED, HVAC_AREA, StatusCode::NotAvailable)]
    );
}

// ─── VMS ────────────────────────────────────────────────────────────

#[derive(Default)]
struct VmsRecorder {
    data: Mutex<Vec<(VmsLayer, i32, Vec<u8>)>>,
    availability: Mutex<Vec<VmsAvailability>>,
}

impl VmsClient for VmsRecorder {
    fn on_vms_message(&self, layer: VmsLayer, publisher_id: i32, payload: &[u8]) {
        self.data.lock().push((layer, publisher_id, payload.to_vec()));
    }

    fn on_layers_availability_changed(&self, availability: &VmsAvailability) {
        self.availability.lock().push(availability.clone());
    }
}

fn vms_sent(vehicle: &SimulatedVehicle) -> Vec<VmsMessage> {
    writes_of(vehicle, ids::VEHICLE_MAP_SERVICE)
        .iter()
        .map(|v| VmsMessage::decode(v).unwrap())
        .collect()
}

#[test]
fn test_vms_session_handshake() {
    let b = broker();
    assert!(b.services.vms.is_supported());
    assert_eq!(
        vms_sent(&b.vehicle),
        vec![VmsMessage::StartSession {
            core_id: VMS_CORE_ID,
            client_id: -1,
        }]
    );

    b.vehicle.clear_set_log();
    b.vehicle.inject_event(
        VmsMessage::StartSession {
            core_id: 7,
            client_id: 99,
        }
        .encode(),
    );
    b.hal.sync_dispatch();

    assert_eq!(b.services.vms.hal_client_id(), Some(99));
    let sent = vms_sent(&b.vehicle);
    assert_eq!(
        sent[0],
        VmsMessage::StartSession {
            core_id: VMS_CORE_ID,
            client_id: 99,
        }
    );
    assert!(matches!(sent[1], VmsMessage::SubscriptionsChange(_)));
}

#[test]
fn test_vms_publish_only_when_vehicle_subscribed() {
    let b = broker();
    let vms = &b.services.vms;
    let layer = VmsLayer::new(3, 0, 1);

    assert!(!vms.publish(12, layer, vec![1, 2, 3]).unwrap());

    b.vehicle.inject_event(VmsMessage::Subscribe(layer).encode());
    b.hal.sync_dispatch();
    assert_eq!(vms.hal_subscriptions(), vec![layer]);

    b.vehicle.clear_set_log();
    assert!(vms.publish(12, layer, vec![1, 2, 3]).unwrap());
    assert_eq!(
        vms_sent(&b.vehicle),
        vec![VmsMessage::Data {
            layer,
            publisher_id: 12,
            payload: vec![1, 2, 3],
        }]
    );
}

#[test]
fn test_vms_vehicle_data_reaches_subscribed_clients() {
    let b = broker();
    let vms = &b.services.vms;
    let layer = VmsLayer::new(5, 1, 2);
    let subscribed = Arc::new(VmsRecorder::default());
    let idle = Arc::new(VmsRecorder::default());
    let id = vms.register_client(subscribed.clone());
    vms.register_client(idle.clone());

    b.vehicle.clear_set_log();
    vms.subscribe(id, layer).unwrap();
    match vms_sent(&b.vehicle).as_slice() {
        [VmsMessage::SubscriptionsChange(state)] => assert_eq!(state.layers, vec![layer]),
        other => panic!("unexpected messages {other:?}"),
    }

    b.vehicle.inject_event(
        VmsMessage::Offering {
            publisher_id: 3,
            offerings: vec![VmsLayerDependency {
                layer,
                dependencies: Vec::new(),
            }],
        }
        .encode(),
    );
    b.vehicle.inject_event(
        VmsMessage::Data {
            layer,
            publisher_id: 3,
            payload: b"map".to_vec(),
        }
        .encode(),
    );
    b.hal.sync_dispatch();

    assert_eq!(*subscribed.data.lock(), vec![(layer, 3, b"map".to_vec())]);
    assert!(idle.data.lock().is_empty());
    // Availability goes to every client.
    assert_eq!(idle.availability.lock().len(), 1);
    assert_eq!(vms.availability().associated_layers[0].publisher_ids, vec![3]);

    assert!(matches!(
        vms.subscribe(999, layer),
        Err(HalError::InvalidRequest(_))
    ));
}

#[test]
fn test_vms_publisher_ids() {
    let b = broker();
    b.vehicle.clear_set_log();
    for info in [b"alpha".to_vec(), b"beta".to_vec(), b"alpha".to_vec()] {
        b.vehicle.inject_event(
            VmsMessage::PublisherIdRequest {
                publisher_info: info,
            }
            .encode(),
        );
    }
    b.hal.sync_dispatch();

    let ids: Vec<i32> = vms_sent(&b.vehicle)
        .into_iter()
        .filter_map(|m| match m {
            VmsMessage::PublisherIdResponse { publisher_id } => Some(publisher_id),
            _ => None,
        })
        .collect();
    assert_eq!(ids, vec![1, 2, 1]);
}
