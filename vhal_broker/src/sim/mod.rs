//! In-process simulated vehicle.
//!
//! Implements [`VehicleChannel`] on top of a property table so the broker can
//! run without hardware. Beyond the channel contract it offers fault
//! injection and inspection hooks for tests:
//!
//! ```text
//!             VehicleChannel                    test hooks
//! router ──► get / set / subscribe ──┐   inject_status(prop, err, n)
//!                                    ▼   set_disconnected(bool)
//!                       ┌──────────────────────┐
//!                       │ descriptors, values, │◄── inject_event / emit / tick
//!                       │ subscriptions, faults│
//!                       └──────────┬───────────┘
//!                                  ▼
//!                ChannelCallback::on_property_event (subscribed props only)
//! ```
//!
//! Callbacks are always invoked after the internal lock is released.

pub mod defaults;
pub mod user_emulation;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, trace};
use vhal_common::config::SimulationConfig;
use vhal_common::hal::{ChannelCallback, ChannelError, ChannelResult, StatusCode, VehicleChannel};
use vhal_common::property::ids::{self, to_hex};
use vhal_common::property::{
    AreaId, ChangeMode, GLOBAL_AREA, PropertyDescriptor, PropertyId, PropertyValue,
    SubscribeFlags, SubscribeOptions,
};

use self::user_emulation::UserHalEmulator;

struct Subscription {
    callback: Arc<dyn ChannelCallback>,
    sample_rate: f32,
    flags: SubscribeFlags,
}

struct Fault {
    error: ChannelError,
    remaining: u32,
}

struct SimState {
    descriptors: BTreeMap<PropertyId, PropertyDescriptor>,
    values: HashMap<(PropertyId, AreaId), PropertyValue>,
    subscriptions: BTreeMap<PropertyId, Subscription>,
    faults: HashMap<PropertyId, Fault>,
    disconnected: bool,
    set_log: Vec<PropertyValue>,
    subscribe_calls: usize,
    freeze_frames: BTreeMap<i64, PropertyValue>,
    user_hal: Option<UserHalEmulator>,
    ticks: u64,
}

impl SimState {
    fn check(&mut self, prop: PropertyId) -> ChannelResult<&PropertyDescriptor> {
        if self.disconnected {
            return Err(ChannelError::Transport("vehicle disconnected".to_string()));
        }
        if let Some(fault) = self.faults.get_mut(&prop) {
            fault.remaining -= 1;
            let error = fault.error.clone();
            if fault.remaining == 0 {
                self.faults.remove(&prop);
            }
            return Err(error);
        }
        self.descriptors
            .get(&prop)
            .ok_or(ChannelError::Status(StatusCode::InvalidArg))
    }
}

/// Simulated vehicle.
pub struct SimulatedVehicle {
    state: Mutex<SimState>,
    start: Instant,
}

type Deliveries = Vec<(Arc<dyn ChannelCallback>, Vec<PropertyValue>)>;

impl SimulatedVehicle {
    /// Vehicle exposing `descriptors` with the given initial values.
    pub fn new(descriptors: Vec<PropertyDescriptor>, values: Vec<PropertyValue>) -> Self {
        let vehicle = Self {
            state: Mutex::new(SimState {
                descriptors: descriptors.into_iter().map(|d| (d.prop, d)).collect(),
                values: HashMap::new(),
                subscriptions: BTreeMap::new(),
                faults: HashMap::new(),
                disconnected: false,
                set_log: Vec::new(),
                subscribe_calls: 0,
                freeze_frames: BTreeMap::new(),
                user_hal: None,
                ticks: 0,
            }),
            start: Instant::now(),
        };
        {
            let mut state = vehicle.state.lock();
            for value in values {
                state.values.insert((value.prop, value.area_id), value);
            }
        }
        vehicle
    }

    /// Vehicle with the default property table and one stored freeze frame.
    pub fn with_defaults() -> Self {
        let vehicle = Self::new(defaults::descriptors(), defaults::initial_values());
        vehicle
            .state
            .lock()
            .freeze_frames
            .insert(defaults::STORED_FREEZE_FRAME_TS, defaults::stored_freeze_frame());
        vehicle
    }

    /// Default vehicle configured from the `[simulation]` section.
    pub fn from_config(config: &SimulationConfig) -> Self {
        let vehicle = Self::with_defaults();
        vehicle.set_emulate_user_hal(config.emulate_user_hal);
        info!(
            properties = vehicle.state.lock().descriptors.len(),
            emulate_user_hal = config.emulate_user_hal,
            "Simulated vehicle ready"
        );
        vehicle
    }

    /// Answer user HAL requests automatically.
    pub fn set_emulate_user_hal(&self, enabled: bool) {
        self.state.lock().user_hal = enabled.then(UserHalEmulator::new);
    }

    /// Make the next `count` get/set/subscribe calls touching `prop` fail.
    pub fn inject_status(&self, prop: PropertyId, error: ChannelError, count: u32) {
        let mut state = self.state.lock();
        if count == 0 {
            state.faults.remove(&prop);
        } else {
            state.faults.insert(
                prop,
                Fault {
                    error,
                    remaining: count,
                },
            );
        }
    }

    /// Fail every call with a transport error while set.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.state.lock().disconnected = disconnected;
    }

    /// Every value successfully written, oldest first.
    pub fn set_log(&self) -> Vec<PropertyValue> {
        self.state.lock().set_log.clone()
    }

    /// Forget the write history.
    pub fn clear_set_log(&self) {
        self.state.lock().set_log.clear();
    }

    /// Currently subscribed properties, ordered by ID.
    pub fn subscribed_props(&self) -> Vec<PropertyId> {
        self.state.lock().subscriptions.keys().copied().collect()
    }

    /// Rate and flags of the subscription on `prop`.
    pub fn subscription(&self, prop: PropertyId) -> Option<(f32, SubscribeFlags)> {
        self.state
            .lock()
            .subscriptions
            .get(&prop)
            .map(|s| (s.sample_rate, s.flags))
    }

    /// Number of successful `subscribe` calls.
    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().subscribe_calls
    }

    /// Stored value of `prop` in `area`.
    pub fn value(&self, prop: PropertyId, area: AreaId) -> Option<PropertyValue> {
        self.state.lock().values.get(&(prop, area)).cloned()
    }

    /// Nanoseconds since the vehicle was created.
    pub fn now_ns(&self) -> i64 {
        i64::try_from(self.start.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }

    /// Store `value` and notify its subscriber.
    pub fn inject_event(&self, value: PropertyValue) {
        self.emit(vec![value]);
    }

    /// Store a batch of values and notify subscribers, one batch per callback.
    ///
    /// Values without a timestamp are stamped with [`now_ns`](Self::now_ns).
    /// Values of unsubscribed properties are stored but not delivered.
    pub fn emit(&self, values: Vec<PropertyValue>) {
        let now = self.now_ns();
        let deliveries = {
            let mut state = self.state.lock();
            let mut deliveries: Deliveries = Vec::new();
            for mut value in values {
                if value.timestamp_ns == 0 {
                    value.timestamp_ns = now;
                }
                state
                    .values
                    .insert((value.prop, value.area_id), value.clone());
                if let Some(sub) = state.subscriptions.get(&value.prop) {
                    match deliveries
                        .iter_mut()
                        .find(|(callback, _)| Arc::ptr_eq(callback, &sub.callback))
                    {
                        Some((_, batch)) => batch.push(value),
                        None => deliveries.push((sub.callback.clone(), vec![value])),
                    }
                }
            }
            deliveries
        };
        for (callback, batch) in deliveries {
            trace!("Delivering {} simulated events", batch.len());
            callback.on_property_event(batch);
        }
    }

    /// Advance the simulation one step and emit every subscribed continuous
    /// property plus the vendor tick counter.
    pub fn tick(&self) {
        let updates = {
            let mut state = self.state.lock();
            state.ticks += 1;
            let t = state.ticks as f32;
            let mut updates = Vec::new();

            // Speed ramps between 0 and 30 m/s; fuel drains slowly.
            let speed = 15.0 + 15.0 * (t / 10.0).sin();
            updates.push(PropertyValue::float(ids::PERF_VEHICLE_SPEED, GLOBAL_AREA, speed));
            let fuel = state
                .values
                .get(&(ids::FUEL_LEVEL, GLOBAL_AREA))
                .and_then(PropertyValue::first_float)
                .unwrap_or(0.0);
            updates.push(PropertyValue::float(
                ids::FUEL_LEVEL,
                GLOBAL_AREA,
                (fuel - 1.5).max(0.0),
            ));
            updates.push(PropertyValue::int32(
                defaults::VENDOR_TICK_COUNTER,
                GLOBAL_AREA,
                i32::try_from(state.ticks % i32::MAX as u64).unwrap_or(0),
            ));

            updates.retain(|v| {
                state.descriptors.get(&v.prop).is_some_and(|d| {
                    d.change_mode == ChangeMode::Continuous || v.prop == defaults::VENDOR_TICK_COUNTER
                })
            });
            updates
        };
        self.emit(updates);
    }

    /// Report an asynchronous write failure of `prop` to its subscriber.
    pub fn inject_set_error(&self, status: StatusCode, prop: PropertyId, area: AreaId) {
        if let Some(callback) = self.callback_for(prop, SubscribeFlags::empty()) {
            callback.on_property_set_error(status, prop, area);
        }
    }

    fn callback_for(&self, prop: PropertyId, flag: SubscribeFlags) -> Option<Arc<dyn ChannelCallback>> {
        self.state
            .lock()
            .subscriptions
            .get(&prop)
            .filter(|s| s.flags.contains(flag))
            .map(|s| s.callback.clone())
    }
}

impl VehicleChannel for SimulatedVehicle {
    fn get_all_prop_configs(&self) -> ChannelResult<Vec<PropertyDescriptor>> {
        let state = self.state.lock();
        if state.disconnected {
            return Err(ChannelError::Transport("vehicle disconnected".to_string()));
        }
        Ok(state.descriptors.values().cloned().collect())
    }

    fn get(&self, request: &PropertyValue) -> ChannelResult<PropertyValue> {
        let mut state = self.state.lock();
        if !state.check(request.prop)?.access.is_readable() {
            return Err(StatusCode::AccessDenied.into());
        }
        match request.prop {
            ids::OBD2_FREEZE_FRAME => {
                let timestamp = request
                    .value
                    .int64_values
                    .first()
                    .ok_or(ChannelError::Status(StatusCode::InvalidArg))?;
                state
                    .freeze_frames
                    .get(timestamp)
                    .cloned()
                    .ok_or(ChannelError::Status(StatusCode::NotAvailable))
            }
            ids::OBD2_FREEZE_FRAME_INFO => {
                let mut value = PropertyValue::new(ids::OBD2_FREEZE_FRAME_INFO);
                value.value.int64_values = state.freeze_frames.keys().copied().collect();
                Ok(value)
            }
            ids::USER_IDENTIFICATION_ASSOCIATION => state
                .user_hal
                .as_ref()
                .and_then(|emulator| emulator.respond_to_get(request))
                .ok_or(ChannelError::Status(StatusCode::NotAvailable)),
            prop => state
                .values
                .get(&(prop, request.area_id))
                .cloned()
                .ok_or(ChannelError::Status(StatusCode::NotAvailable)),
        }
    }

    fn set(&self, value: &PropertyValue) -> ChannelResult<()> {
        let response = {
            let mut state = self.state.lock();
            if !state.check(value.prop)?.access.is_writable() {
                return Err(StatusCode::AccessDenied.into());
            }
            state.set_log.push(value.clone());
            if value.prop == ids::OBD2_FREEZE_FRAME_CLEAR {
                if value.value.int64_values.is_empty() {
                    state.freeze_frames.clear();
                } else {
                    for timestamp in &value.value.int64_values {
                        state.freeze_frames.remove(timestamp);
                    }
                }
            }
            state
                .values
                .insert((value.prop, value.area_id), value.clone());
            state
                .user_hal
                .as_mut()
                .and_then(|emulator| emulator.respond_to_set(value))
        };
        debug!(prop = %to_hex(value.prop), area = value.area_id, "Simulated set");

        if let Some(callback) = self.callback_for(value.prop, SubscribeFlags::EVENTS_FROM_ANDROID) {
            callback.on_property_set(value.clone());
        }
        if let Some(response) = response {
            self.inject_event(response);
        }
        Ok(())
    }

    fn subscribe(
        &self,
        callback: Arc<dyn ChannelCallback>,
        options: &[SubscribeOptions],
    ) -> ChannelResult<()> {
        let mut state = self.state.lock();
        for option in options {
            state.check(option.prop)?;
        }
        for option in options {
            state.subscriptions.insert(
                option.prop,
                Subscription {
                    callback: callback.clone(),
                    sample_rate: option.sample_rate,
                    flags: option.flags,
                },
            );
        }
        state.subscribe_calls += 1;
        Ok(())
    }

    fn unsubscribe(&self, _callback: Arc<dyn ChannelCallback>, prop: PropertyId) -> ChannelResult<()> {
        let mut state = self.state.lock();
        state.check(prop)?;
        state.subscriptions.remove(&prop);
        Ok(())
    }
}
