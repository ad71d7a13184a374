//! Application processor power management.
//!
//! The vehicle requests power transitions through `AP_POWER_STATE_REQ`
//! (`[state, param]`); the head unit reports its own state through
//! `AP_POWER_STATE_REPORT` (`[state, param]`). Display brightness travels in
//! the HAL's native range and is converted to a 0-100 percentage here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vhal_common::hal::HalError;
use vhal_common::property::ids::{self, to_hex};
use vhal_common::property::{GLOBAL_AREA, PropertyDescriptor, PropertyId, PropertyValue};

use crate::service::{HalContext, HalService, SupportedProperties};

/// Power state requested by the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerRequestState {
    /// Stay on.
    On,
    /// Prepare for shutdown or deep sleep.
    ShutdownPrepare,
    /// Abort an ongoing shutdown.
    CancelShutdown,
    /// Shutdown can complete.
    Finished,
}

impl PowerRequestState {
    /// Decode the wire value.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::On),
            1 => Some(Self::ShutdownPrepare),
            2 => Some(Self::CancelShutdown),
            3 => Some(Self::Finished),
            _ => None,
        }
    }
}

/// Parameter of a `ShutdownPrepare` request.
pub mod shutdown_param {
    /// Power off now.
    pub const SHUTDOWN_IMMEDIATELY: i32 = 1;
    /// Deep sleep allowed.
    pub const CAN_SLEEP: i32 = 2;
    /// Deep sleep not allowed.
    pub const SHUTDOWN_ONLY: i32 = 3;
    /// Enter deep sleep now.
    pub const SLEEP_IMMEDIATELY: i32 = 4;
}

/// Decoded `AP_POWER_STATE_REQ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerStateRequest {
    /// Requested state.
    pub state: PowerRequestState,
    /// State specific parameter.
    pub param: i32,
}

impl PowerStateRequest {
    /// Decode `[state, param]`.
    pub fn decode(value: &PropertyValue) -> Option<Self> {
        let ints = &value.value.int32_values;
        let state = PowerRequestState::from_raw(*ints.first()?)?;
        Some(Self {
            state,
            param: ints.get(1).copied().unwrap_or(0),
        })
    }

    /// Deep sleep is allowed for this shutdown.
    pub fn can_sleep(&self) -> bool {
        self.state == PowerRequestState::ShutdownPrepare
            && matches!(
                self.param,
                shutdown_param::CAN_SLEEP | shutdown_param::SLEEP_IMMEDIATELY
            )
    }
}

/// State reported to the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PowerReport {
    /// Booted, waiting for the vehicle.
    WaitForVhal = 1,
    /// Entering deep sleep; param is the wake-up delay.
    DeepSleepEntry = 2,
    /// Left deep sleep.
    DeepSleepExit = 3,
    /// Shutdown postponed; param is the extra time in ms.
    ShutdownPostpone = 4,
    /// Shutting down; param is the wake-up delay.
    ShutdownStart = 5,
    /// Fully on.
    On = 6,
    /// Acknowledged a shutdown request.
    ShutdownPrepare = 7,
    /// Shutdown aborted.
    ShutdownCancelled = 8,
}

/// Receives decoded power events on the dispatch thread.
pub trait PowerEventListener: Send + Sync {
    /// Vehicle asked for a power transition.
    fn on_power_state_request(&self, request: PowerStateRequest);

    /// Display brightness changed, in percent.
    fn on_display_brightness_change(&self, percent: i32);
}

enum PowerEvent {
    Request(PowerStateRequest),
    Brightness(i32),
}

struct PowerState {
    context: Option<HalContext>,
    properties: HashMap<PropertyId, PropertyDescriptor>,
    listener: Option<Arc<dyn PowerEventListener>>,
    // Events seen before a listener was attached.
    queued: Vec<PowerEvent>,
    max_brightness: i32,
}

/// Power service.
pub struct PowerHalService {
    state: Mutex<PowerState>,
}

impl PowerHalService {
    /// Service without listener; events are queued until one is set.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PowerState {
                context: None,
                properties: HashMap::new(),
                listener: None,
                queued: Vec::new(),
                max_brightness: 1,
            }),
        }
    }

    /// Attach the listener and replay queued events to it.
    pub fn set_listener(&self, listener: Arc<dyn PowerEventListener>) {
        let queued = {
            let mut state = self.state.lock();
            state.listener = Some(Arc::clone(&listener));
            std::mem::take(&mut state.queued)
        };
        for event in queued {
            deliver(listener.as_ref(), event);
        }
    }

    /// The vehicle supports the request/report handshake.
    pub fn is_power_state_supported(&self) -> bool {
        let state = self.state.lock();
        state.properties.contains_key(&ids::AP_POWER_STATE_REQ)
            && state.properties.contains_key(&ids::AP_POWER_STATE_REPORT)
    }

    /// The vehicle exposes display brightness.
    pub fn is_display_brightness_supported(&self) -> bool {
        self.state
            .lock()
            .properties
            .contains_key(&ids::DISPLAY_BRIGHTNESS)
    }

    fn context(&self) -> Result<HalContext, HalError> {
        self.state
            .lock()
            .context
            .clone()
            .ok_or_else(|| HalError::NotInitialized("power service".to_string()))
    }

    /// Send `[report, param]` to the vehicle.
    pub fn send_power_state(&self, report: PowerReport, param: i32) -> Result<(), HalError> {
        info!("Reporting power state {:?} param={}", report, param);
        let value = PropertyValue::new(ids::AP_POWER_STATE_REPORT)
            .with_int32s(vec![report as i32, param]);
        self.context()?.set_property(&value)
    }

    /// Report `WaitForVhal`.
    pub fn send_wait_for_vhal(&self) -> Result<(), HalError> {
        self.send_power_state(PowerReport::WaitForVhal, 0)
    }

    /// Report `ShutdownPostpone` asking for `postpone_ms` more.
    pub fn send_shutdown_postpone(&self, postpone_ms: i32) -> Result<(), HalError> {
        self.send_power_state(PowerReport::ShutdownPostpone, postpone_ms)
    }

    /// Report `ShutdownStart`, waking up after `wakeup_secs`.
    pub fn send_shutdown_start(&self, wakeup_secs: i32) -> Result<(), HalError> {
        self.send_power_state(PowerReport::ShutdownStart, wakeup_secs)
    }

    /// Current request held by the vehicle.
    pub fn current_power_state(&self) -> Result<PowerStateRequest, HalError> {
        let value = self
            .context()?
            .get_property(ids::AP_POWER_STATE_REQ, GLOBAL_AREA)?;
        PowerStateRequest::decode(&value).ok_or_else(|| {
            HalError::InvalidRequest(format!(
                "malformed power state request {:?}",
                value.value.int32_values
            ))
        })
    }

    /// Why the head unit booted.
    pub fn boot_reason(&self) -> Result<i32, HalError> {
        let value = self
            .context()?
            .get_property(ids::AP_POWER_BOOTUP_REASON, GLOBAL_AREA)?;
        value.first_int32().ok_or_else(|| {
            HalError::InvalidRequest("empty boot-up reason".to_string())
        })
    }

    /// Set display brightness in percent (clamped to 0-100).
    pub fn set_display_brightness(&self, percent: i32) -> Result<(), HalError> {
        let max = self.state.lock().max_brightness;
        let raw = brightness_raw(percent, max);
        debug!("Display brightness {}% -> {}", percent, raw);
        self.context()?
            .set_property(&PropertyValue::int32(ids::DISPLAY_BRIGHTNESS, GLOBAL_AREA, raw))
    }
}

impl Default for PowerHalService {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(listener: &dyn PowerEventListener, event: PowerEvent) {
    match event {
        PowerEvent::Request(request) => listener.on_power_state_request(request),
        PowerEvent::Brightness(percent) => listener.on_display_brightness_change(percent),
    }
}

fn brightness_percent(raw: i32, max: i32) -> i32 {
    let percent = (i64::from(raw) * 100 / i64::from(max.max(1))).clamp(0, 100);
    i32::try_from(percent).unwrap_or(100)
}

fn brightness_raw(percent: i32, max: i32) -> i32 {
    // |result| <= |max|, so it always fits back into i32.
    let raw = i64::from(percent.clamp(0, 100)) * i64::from(max) / 100;
    i32::try_from(raw).unwrap_or(max)
}

impl HalService for PowerHalService {
    fn name(&self) -> &str {
        "power"
    }

    fn supported_properties(&self) -> SupportedProperties {
        SupportedProperties::Explicit(vec![
            ids::AP_POWER_STATE_REQ,
            ids::AP_POWER_STATE_REPORT,
            ids::AP_POWER_BOOTUP_REASON,
            ids::DISPLAY_BRIGHTNESS,
        ])
    }

    fn take_properties(&self, context: HalContext, properties: Vec<PropertyDescriptor>) {
        let mut state = self.state.lock();
        state.context = Some(context);
        state.properties = properties.into_iter().map(|d| (d.prop, d)).collect();
    }

    fn init(&self) -> Result<(), HalError> {
        let (context, subscribe) = {
            let mut state = self.state.lock();
            if let Some(max) = state
                .properties
                .get(&ids::DISPLAY_BRIGHTNESS)
                .and_then(|d| d.area_configs.first())
                .and_then(|a| a.max_int32)
            {
                state.max_brightness = max.max(1);
            }
            let subscribe: Vec<PropertyId> = [ids::AP_POWER_STATE_REQ, ids::DISPLAY_BRIGHTNESS]
                .into_iter()
                .filter(|p| state.properties.contains_key(p))
                .collect();
            (state.context.clone(), subscribe)
        };
        let Some(context) = context else {
            return Ok(());
        };
        for prop in subscribe {
            context.subscribe_property(prop, 0.0)?;
        }
        info!("Power service initialized");
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.properties.clear();
        state.queued.clear();
    }

    fn on_events(&self, values: &[PropertyValue]) {
        let mut events = Vec::new();
        let max = self.state.lock().max_brightness;
        for value in values {
            match value.prop {
                ids::AP_POWER_STATE_REQ => match PowerStateRequest::decode(value) {
                    Some(request) => events.push(PowerEvent::Request(request)),
                    None => warn!(
                        "Malformed power state request {:?}",
                        value.value.int32_values
                    ),
                },
                ids::DISPLAY_BRIGHTNESS => match value.first_int32() {
                    Some(raw) => events.push(PowerEvent::Brightness(brightness_percent(raw, max))),
                    None => warn!("Empty display brightness event"),
                },
                other => debug!("Power service ignoring {}", to_hex(other)),
            }
        }

        let listener = {
            let mut state = self.state.lock();
            match state.listener.clone() {
                Some(listener) => listener,
                None => {
                    state.queued.extend(events);
                    return;
                }
            }
        };
        for event in events {
            deliver(listener.as_ref(), event);
        }
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let state = self.state.lock();
        writeln!(out, "*Power HAL*")?;
        writeln!(
            out,
            "  properties={} max_brightness={} queued={}",
            state.properties.len(),
            state.max_brightness,
            state.queued.len()
        )
    }
}
