//! Router integration tests: ownership, subscriptions, fan-out, reconnect.

mod common;

use std::sync::Arc;

use common::{PROP_A, PROP_B, PROP_STATIC, RecordingService, fast_transport, scenario_vehicle};
use vhal_broker::{HalService, SimulatedVehicle, VehicleHal};
use vhal_common::hal::{HalError, StatusCode};
use vhal_common::property::{PropertyValue, SubscribeFlags};

fn two_service_hal() -> (
    Arc<SimulatedVehicle>,
    Arc<VehicleHal>,
    Arc<RecordingService>,
    Arc<RecordingService>,
) {
    let vehicle = scenario_vehicle();
    let a = RecordingService::explicit("a", &[PROP_A]);
    let b = RecordingService::explicit("b", &[PROP_B, PROP_STATIC]);
    let services: Vec<Arc<dyn HalService>> = vec![a.clone(), b.clone()];
    let hal = VehicleHal::new(vehicle.clone(), services, &fast_transport()).unwrap();
    hal.init().unwrap();
    (vehicle, hal, a, b)
}

#[test]
fn test_batch_fans_out_to_owners() {
    let (vehicle, hal, a, b) = two_service_hal();
    a.ctx().subscribe_property(PROP_A, 0.0).unwrap();
    b.ctx().subscribe_property(PROP_B, 5.0).unwrap();

    vehicle.emit(vec![
        PropertyValue::int32(PROP_A, 0, 11),
        PropertyValue::int32(PROP_B, 0, 22),
    ]);
    hal.sync_dispatch();

    let a_events = a.events();
    let b_events = b.events();
    assert_eq!(a_events.len(), 1);
    assert_eq!(a_events[0].prop, PROP_A);
    assert_eq!(a_events[0].first_int32(), Some(11));
    assert_eq!(b_events.len(), 1);
    assert_eq!(b_events[0].prop, PROP_B);
    assert_eq!(b_events[0].first_int32(), Some(22));
    // One call per service for the whole batch.
    assert_eq!(a.batches.lock().len(), 1);
    assert_eq!(b.batches.lock().len(), 1);
}

#[test]
fn test_sample_rate_clamped() {
    let (vehicle, hal, _a, b) = two_service_hal();
    b.ctx().subscribe_property(PROP_B, 50.0).unwrap();
    assert_eq!(hal.subscriptions()[&PROP_B].sample_rate, 10.0);
    assert_eq!(vehicle.subscription(PROP_B).map(|(rate, _)| rate), Some(10.0));

    b.ctx().subscribe_property(PROP_B, 0.1).unwrap();
    assert_eq!(hal.subscriptions()[&PROP_B].sample_rate, 1.0);
}

#[test]
fn test_identical_subscription_not_reissued() {
    let (vehicle, _hal, a, _b) = two_service_hal();
    a.ctx().subscribe_property(PROP_A, 0.0).unwrap();
    a.ctx().subscribe_property(PROP_A, 0.0).unwrap();
    assert_eq!(vehicle.subscribe_calls(), 1);

    a.ctx()
        .subscribe_with_flags(
            PROP_A,
            0.0,
            SubscribeFlags::EVENTS_FROM_CAR | SubscribeFlags::EVENTS_FROM_ANDROID,
        )
        .unwrap();
    assert_eq!(vehicle.subscribe_calls(), 2);
}

#[test]
fn test_static_property_not_subscribable() {
    let (_vehicle, hal, _a, b) = two_service_hal();
    assert!(!hal.is_property_subscribable(PROP_STATIC));
    assert!(matches!(
        b.ctx().subscribe_property(PROP_STATIC, 0.0),
        Err(HalError::NotSubscribable(PROP_STATIC))
    ));
    assert!(hal.subscriptions().is_empty());
}

#[test]
fn test_non_owner_rejected() {
    let (_vehicle, _hal, a, b) = two_service_hal();
    assert!(matches!(
        a.ctx().subscribe_property(PROP_B, 1.0),
        Err(HalError::NotOwner { .. })
    ));
    assert!(matches!(
        b.ctx().set_property(&PropertyValue::int32(PROP_A, 0, 5)),
        Err(HalError::NotOwner { .. })
    ));
    assert!(matches!(
        a.ctx().get_property(0x0999, 0),
        Err(HalError::Unsupported(0x0999))
    ));
}

#[test]
fn test_get_and_set_through_owner() {
    let (vehicle, _hal, a, _b) = two_service_hal();
    a.ctx().set_property(&PropertyValue::int32(PROP_A, 0, 42)).unwrap();
    assert_eq!(vehicle.set_log().len(), 1);
    assert_eq!(a.ctx().get_property(PROP_A, 0).unwrap().first_int32(), Some(42));
}

#[test]
fn test_transient_get_recovers() {
    let (vehicle, _hal, a, _b) = two_service_hal();
    vehicle.inject_status(PROP_A, StatusCode::TryAgain.into(), 3);
    assert_eq!(a.ctx().get_property(PROP_A, 0).unwrap().first_int32(), Some(1));
}

#[test]
fn test_transient_get_exhausts_budget() {
    let (vehicle, _hal, a, _b) = two_service_hal();
    vehicle.inject_status(PROP_A, StatusCode::TryAgain.into(), 1000);
    assert!(matches!(
        a.ctx().get_property(PROP_A, 0),
        Err(HalError::NotAvailable {
            status: StatusCode::TryAgain,
            ..
        })
    ));
}

#[test]
fn test_invalid_arg_not_retried() {
    let (vehicle, _hal, a, _b) = two_service_hal();
    vehicle.inject_status(PROP_A, StatusCode::InvalidArg.into(), 1);
    assert!(matches!(
        a.ctx().set_property(&PropertyValue::int32(PROP_A, 0, 1)),
        Err(HalError::InvalidArgument { prop: PROP_A, .. })
    ));
    // The fault was consumed by exactly one attempt.
    a.ctx().set_property(&PropertyValue::int32(PROP_A, 0, 1)).unwrap();
}

#[test]
fn test_ownership_conflict_fails_init() {
    let vehicle = scenario_vehicle();
    let services: Vec<Arc<dyn HalService>> = vec![
        RecordingService::explicit("first", &[PROP_A]),
        RecordingService::explicit("second", &[PROP_A]),
    ];
    let hal = VehicleHal::new(vehicle, services, &fast_transport()).unwrap();
    match hal.init() {
        Err(HalError::OwnershipConflict {
            prop,
            first,
            second,
        }) => {
            assert_eq!(prop, PROP_A);
            assert_eq!(first, "first");
            assert_eq!(second, "second");
        }
        other => panic!("expected ownership conflict, got {other:?}"),
    }
}

#[test]
fn test_wildcard_gets_leftovers_only() {
    let vehicle = scenario_vehicle();
    let explicit = RecordingService::explicit("explicit", &[PROP_A, 0x0777]);
    let wildcard = RecordingService::wildcard("wildcard");
    let services: Vec<Arc<dyn HalService>> = vec![wildcard.clone(), explicit.clone()];
    let hal = VehicleHal::new(vehicle, services, &fast_transport()).unwrap();
    hal.init().unwrap();

    assert_eq!(*explicit.owned.lock(), vec![PROP_A]);
    let mut leftovers = wildcard.owned.lock().clone();
    leftovers.sort_unstable();
    assert_eq!(leftovers, vec![PROP_B, PROP_STATIC]);
    assert_eq!(hal.owner_of(PROP_A).as_deref(), Some("explicit"));
    assert_eq!(hal.owner_of(PROP_B).as_deref(), Some("wildcard"));
}

#[test]
fn test_descriptor_fetch_failure_is_fatal() {
    let vehicle = scenario_vehicle();
    vehicle.set_disconnected(true);
    let services: Vec<Arc<dyn HalService>> = vec![RecordingService::explicit("a", &[PROP_A])];
    let hal = VehicleHal::new(vehicle, services, &fast_transport()).unwrap();
    assert!(matches!(hal.init(), Err(HalError::InitFailed(_))));
}

#[test]
fn test_reconnect_reissues_subscriptions() {
    let (old_vehicle, hal, a, b) = two_service_hal();
    a.ctx().subscribe_property(PROP_A, 0.0).unwrap();
    b.ctx().subscribe_property(PROP_B, 50.0).unwrap();

    let new_vehicle = scenario_vehicle();
    hal.reconnect(new_vehicle.clone()).unwrap();

    assert_eq!(new_vehicle.subscribed_props(), vec![PROP_A, PROP_B]);
    assert_eq!(new_vehicle.subscribe_calls(), 1);
    assert_eq!(new_vehicle.subscription(PROP_B).map(|(rate, _)| rate), Some(10.0));

    // The old channel dropped its subscriptions and stays silent.
    assert!(old_vehicle.subscribed_props().is_empty());
    let before = a.events().len();
    old_vehicle.inject_event(PropertyValue::int32(PROP_A, 0, 1234));
    hal.sync_dispatch();
    assert_eq!(a.events().len(), before);

    // Events now flow from the new channel.
    new_vehicle.inject_event(PropertyValue::int32(PROP_A, 0, 99));
    hal.sync_dispatch();
    assert_eq!(a.events().last().and_then(|v| v.first_int32()), Some(99));
    assert_eq!(a.events().len(), before + 1);
}

#[test]
fn test_unreachable_old_channel_cannot_deliver_after_reconnect() {
    let (old_vehicle, hal, a, _b) = two_service_hal();
    a.ctx().subscribe_property(PROP_A, 0.0).unwrap();

    // Unsubscribe on the old channel fails, so it keeps its subscription.
    old_vehicle.set_disconnected(true);
    let new_vehicle = scenario_vehicle();
    hal.reconnect(new_vehicle.clone()).unwrap();
    assert_eq!(old_vehicle.subscribed_props(), vec![PROP_A]);

    old_vehicle.inject_event(PropertyValue::int32(PROP_A, 0, 1234));
    old_vehicle.inject_set_error(StatusCode::InternalError, PROP_A, 0);
    hal.sync_dispatch();
    assert!(a.events().iter().all(|v| v.first_int32() != Some(1234)));
    assert!(a.set_errors.lock().is_empty());

    new_vehicle.inject_event(PropertyValue::int32(PROP_A, 0, 7));
    hal.sync_dispatch();
    assert_eq!(a.events().last().and_then(|v| v.first_int32()), Some(7));
}

#[test]
fn test_set_error_routed_to_owner() {
    let (vehicle, hal, a, b) = two_service_hal();
    a.ctx().subscribe_property(PROP_A, 0.0).unwrap();

    vehicle.inject_set_error(StatusCode::InternalError, PROP_A, 0);
    hal.sync_dispatch();

    assert_eq!(
        *a.set_errors.lock(),
        vec![(PROP_A, 0, StatusCode::InternalError)]
    );
    assert!(b.set_errors.lock().is_empty());
}

#[test]
fn test_write_to_read_only_property_denied() {
    let (_vehicle, _hal, _a, b) = two_service_hal();
    assert!(matches!(
        b.ctx().set_property(&PropertyValue::int32(PROP_B, 0, 1)),
        Err(HalError::PropertyAccess {
            status: StatusCode::AccessDenied,
            ..
        })
    ));
}

#[test]
fn test_release_stops_everything() {
    let (vehicle, hal, a, b) = two_service_hal();
    a.ctx().subscribe_property(PROP_A, 0.0).unwrap();
    hal.release();

    assert!(*a.released.lock());
    assert!(*b.released.lock());
    assert!(vehicle.subscribed_props().is_empty());
    assert!(hal.subscriptions().is_empty());
    assert!(matches!(
        a.ctx().get_property(PROP_A, 0),
        Err(HalError::NotInitialized(_))
    ));
}

#[test]
fn test_context_outlives_router() {
    let (_vehicle, hal, a, _b) = two_service_hal();
    hal.release();
    drop(hal);
    assert!(matches!(
        a.ctx().get_property(PROP_A, 0),
        Err(HalError::Disconnected)
    ));
}

#[test]
fn test_dump_lists_services_and_subscriptions() {
    let (_vehicle, hal, a, _b) = two_service_hal();
    a.ctx().subscribe_property(PROP_A, 0.0).unwrap();
    let mut out = String::new();
    hal.dump(&mut out).unwrap();
    assert!(out.contains("service 'a': 1 properties"));
    assert!(out.contains("service 'b': 2 properties"));
    assert!(out.contains("Subscriptions: 1"));
}
