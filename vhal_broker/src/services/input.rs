//! Hardware key input.
//!
//! `HW_KEY_INPUT` carries `[action, key_code, target_display]`. The display
//! field is optional and defaults to the main display.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vhal_common::hal::HalError;
use vhal_common::property::ids;
use vhal_common::property::{PropertyDescriptor, PropertyValue};

use crate::service::{HalContext, HalService, SupportedProperties};

/// Key transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Pressed (or still held, for repeats).
    Down,
    /// Released.
    Up,
}

/// Display a key event targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputDisplay {
    /// Main display.
    Main,
    /// Instrument cluster.
    Cluster,
}

/// Decoded key event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    /// Transition.
    pub action: KeyAction,
    /// Platform key code.
    pub key_code: i32,
    /// Target display.
    pub display: InputDisplay,
    /// Number of consecutive `Down` events for this key before this one.
    pub repeat_count: u32,
    /// Timestamp of the first `Down` of the current press.
    pub down_time_ns: i64,
    /// Timestamp of this event.
    pub event_time_ns: i64,
}

/// Receives key events on the dispatch thread.
pub trait InputListener: Send + Sync {
    /// A key changed state.
    fn on_key_event(&self, event: KeyEvent);
}

#[derive(Debug, Clone, Copy)]
struct KeyState {
    repeat_count: u32,
    down_time_ns: i64,
}

/// Input service.
pub struct InputHalService {
    context: Mutex<Option<HalContext>>,
    supported: Mutex<bool>,
    listener: Mutex<Option<Arc<dyn InputListener>>>,
    key_states: Mutex<HashMap<(InputDisplay, i32), KeyState>>,
}

impl InputHalService {
    /// Service without listener.
    pub fn new() -> Self {
        Self {
            context: Mutex::new(None),
            supported: Mutex::new(false),
            listener: Mutex::new(None),
            key_states: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the listener. Events without a listener are dropped.
    pub fn set_listener(&self, listener: Arc<dyn InputListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// The vehicle exposes `HW_KEY_INPUT`.
    pub fn is_key_input_supported(&self) -> bool {
        *self.supported.lock()
    }

    fn decode(&self, value: &PropertyValue) -> Option<KeyEvent> {
        let ints = &value.value.int32_values;
        if ints.len() < 2 {
            warn!("Key input event too short: {:?}", ints);
            return None;
        }
        let action = match ints[0] {
            0 => KeyAction::Down,
            1 => KeyAction::Up,
            other => {
                warn!("Unknown key action {}", other);
                return None;
            }
        };
        let display = match ints.get(2).copied().unwrap_or(0) {
            0 => InputDisplay::Main,
            1 => InputDisplay::Cluster,
            other => {
                warn!("Unknown key target display {}", other);
                return None;
            }
        };
        let key_code = ints[1];

        let mut states = self.key_states.lock();
        let (repeat_count, down_time_ns) = match action {
            KeyAction::Down => {
                let state = states
                    .entry((display, key_code))
                    .and_modify(|s| s.repeat_count += 1)
                    .or_insert(KeyState {
                        repeat_count: 0,
                        down_time_ns: value.timestamp_ns,
                    });
                (state.repeat_count, state.down_time_ns)
            }
            KeyAction::Up => match states.remove(&(display, key_code)) {
                Some(state) => (0, state.down_time_ns),
                None => (0, value.timestamp_ns),
            },
        };

        Some(KeyEvent {
            action,
            key_code,
            display,
            repeat_count,
            down_time_ns,
            event_time_ns: value.timestamp_ns,
        })
    }
}

impl Default for InputHalService {
    fn default() -> Self {
        Self::new()
    }
}

impl HalService for InputHalService {
    fn name(&self) -> &str {
        "input"
    }

    fn supported_properties(&self) -> SupportedProperties {
        SupportedProperties::Explicit(vec![ids::HW_KEY_INPUT])
    }

    fn take_properties(&self, context: HalContext, properties: Vec<PropertyDescriptor>) {
        *self.supported.lock() = properties.iter().any(|d| d.prop == ids::HW_KEY_INPUT);
        *self.context.lock() = Some(context);
    }

    fn init(&self) -> Result<(), HalError> {
        if !self.is_key_input_supported() {
            info!("Key input not supported by the vehicle");
            return Ok(());
        }
        let context = self.context.lock().clone();
        if let Some(context) = context {
            context.subscribe_property(ids::HW_KEY_INPUT, 0.0)?;
        }
        Ok(())
    }

    fn release(&self) {
        self.key_states.lock().clear();
        *self.listener.lock() = None;
    }

    fn on_events(&self, values: &[PropertyValue]) {
        let Some(listener) = self.listener.lock().clone() else {
            debug!("No input listener, dropping {} events", values.len());
            return;
        };
        for value in values.iter().filter(|v| v.prop == ids::HW_KEY_INPUT) {
            if let Some(event) = self.decode(value) {
                listener.on_key_event(event);
            }
        }
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "*Input HAL*")?;
        writeln!(
            out,
            "  supported={} keys_down={}",
            self.is_key_input_supported(),
            self.key_states.lock().len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<KeyEvent>>);

    impl InputListener for Recorder {
        fn on_key_event(&self, event: KeyEvent) {
            self.0.lock().push(event);
        }
    }

    fn key(action: i32, code: i32, ts: i64) -> PropertyValue {
        PropertyValue::new(ids::HW_KEY_INPUT)
            .with_int32s(vec![action, code, 0])
            .at(ts)
    }

    #[test]
    fn test_repeat_count_while_held() {
        let service = InputHalService::new();
        let recorder = Arc::new(Recorder::default());
        service.set_listener(recorder.clone());

        service.on_events(&[key(0, 24, 100), key(0, 24, 200), key(0, 24, 300), key(1, 24, 400)]);

        let events = recorder.0.lock();
        let repeats: Vec<u32> = events.iter().map(|e| e.repeat_count).collect();
        assert_eq!(repeats, vec![0, 1, 2, 0]);
        assert!(events.iter().all(|e| e.down_time_ns == 100));
        assert_eq!(events[3].action, KeyAction::Up);
    }

    #[test]
    fn test_malformed_events_dropped() {
        let service = InputHalService::new();
        let recorder = Arc::new(Recorder::default());
        service.set_listener(recorder.clone());

        service.on_events(&[
            PropertyValue::new(ids::HW_KEY_INPUT).with_int32s(vec![0]),
            PropertyValue::new(ids::HW_KEY_INPUT).with_int32s(vec![7, 24]),
            PropertyValue::new(ids::HW_KEY_INPUT).with_int32s(vec![0, 24, 5]),
        ]);
        assert!(recorder.0.lock().is_empty());
    }

    #[test]
    fn test_display_defaults_to_main() {
        let service = InputHalService::new();
        let recorder = Arc::new(Recorder::default());
        service.set_listener(recorder.clone());

        service.on_events(&[
            PropertyValue::new(ids::HW_KEY_INPUT).with_int32s(vec![0, 66]),
            PropertyValue::new(ids::HW_KEY_INPUT).with_int32s(vec![0, 66, 1]),
        ]);
        let events = recorder.0.lock();
        assert_eq!(events[0].display, InputDisplay::Main);
        assert_eq!(events[1].display, InputDisplay::Cluster);
        // Separate displays track separate presses.
        assert_eq!(events[1].repeat_count, 0);
    }
}
