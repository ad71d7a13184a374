//! OBD2 diagnostics.
//!
//! A diagnostic frame packs every sensor slot into one property value:
//!
//! ```text
//! int32_values  [ int sensor 0 .. num_int )
//! float_values  [ float sensor 0 .. num_float )
//! bytes         presence bitmask, bit i = int sensor i,
//!               bit num_int + j = float sensor j
//! string_value  diagnostic trouble code
//! ```
//!
//! `num_int`/`num_float` are the standard sensor counts plus the vendor
//! counts published in `config_array[0..2]` of the live frame descriptor.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use vhal_common::hal::HalError;
use vhal_common::property::ids;
use vhal_common::property::{GLOBAL_AREA, PropertyDescriptor, PropertyId, PropertyValue};

use crate::service::{HalContext, HalService, SupportedProperties};

/// Standard integer sensors.
pub const STANDARD_INT_SENSORS: usize = 32;
/// Standard float sensors.
pub const STANDARD_FLOAT_SENSORS: usize = 71;

/// Live or freeze frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Current sensor values.
    Live,
    /// Snapshot stored when a fault was detected.
    Freeze,
}

/// Decoded frame; only sensors flagged present are included.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticFrame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Capture time.
    pub timestamp_ns: i64,
    /// Present integer sensors by index.
    pub int_sensors: BTreeMap<usize, i32>,
    /// Present float sensors by index.
    pub float_sensors: BTreeMap<usize, f32>,
    /// Diagnostic trouble code, empty for live frames.
    pub dtc: String,
}

/// Sensor slot counts of this vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorLayout {
    /// Integer sensor slots.
    pub num_int: usize,
    /// Float sensor slots.
    pub num_float: usize,
}

impl Default for SensorLayout {
    fn default() -> Self {
        Self {
            num_int: STANDARD_INT_SENSORS,
            num_float: STANDARD_FLOAT_SENSORS,
        }
    }
}

impl SensorLayout {
    /// Layout including the vendor counts of `descriptor.config_array`.
    pub fn from_descriptor(descriptor: &PropertyDescriptor) -> Self {
        let vendor = |i: usize| {
            descriptor
                .config_array
                .get(i)
                .map_or(0, |n| usize::try_from(*n).unwrap_or(0))
        };
        Self {
            num_int: STANDARD_INT_SENSORS + vendor(0),
            num_float: STANDARD_FLOAT_SENSORS + vendor(1),
        }
    }

    /// Decode a frame value.
    pub fn decode(&self, kind: FrameKind, value: &PropertyValue) -> DiagnosticFrame {
        let mask = &value.value.bytes;
        let is_set = |bit: usize| mask.get(bit / 8).is_some_and(|b| b & (1 << (bit % 8)) != 0);

        let mut int_sensors = BTreeMap::new();
        for i in (0..self.num_int).filter(|i| is_set(*i)) {
            match value.value.int32_values.get(i) {
                Some(v) => {
                    int_sensors.insert(i, *v);
                }
                None => debug!("Int sensor {} flagged but missing", i),
            }
        }

        let mut float_sensors = BTreeMap::new();
        for j in (0..self.num_float).filter(|j| is_set(self.num_int + j)) {
            match value.value.float_values.get(j) {
                Some(v) => {
                    float_sensors.insert(j, *v);
                }
                None => debug!("Float sensor {} flagged but missing", j),
            }
        }

        DiagnosticFrame {
            kind,
            timestamp_ns: value.timestamp_ns,
            int_sensors,
            float_sensors,
            dtc: value.value.string_value.clone(),
        }
    }
}

/// Receives streamed frames on the dispatch thread.
pub trait DiagnosticListener: Send + Sync {
    /// One or more frames arrived.
    fn on_diagnostic_frames(&self, frames: Vec<DiagnosticFrame>);
}

#[derive(Default)]
struct DiagnosticState {
    context: Option<HalContext>,
    properties: HashMap<PropertyId, PropertyDescriptor>,
    layout: SensorLayout,
    listener: Option<Arc<dyn DiagnosticListener>>,
}

/// Diagnostic service.
#[derive(Default)]
pub struct DiagnosticHalService {
    state: Mutex<DiagnosticState>,
}

impl DiagnosticHalService {
    /// Service without listener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the frame listener.
    pub fn set_listener(&self, listener: Arc<dyn DiagnosticListener>) {
        self.state.lock().listener = Some(listener);
    }

    /// Sensor layout in use.
    pub fn layout(&self) -> SensorLayout {
        self.state.lock().layout
    }

    /// True if the vehicle exposes `prop`.
    pub fn is_supported(&self, prop: PropertyId) -> bool {
        self.state.lock().properties.contains_key(&prop)
    }

    fn context_for(&self, prop: PropertyId) -> Result<(HalContext, SensorLayout), HalError> {
        let state = self.state.lock();
        if !state.properties.contains_key(&prop) {
            return Err(HalError::Unsupported(prop));
        }
        let context = state
            .context
            .clone()
            .ok_or_else(|| HalError::NotInitialized("diagnostic service".to_string()))?;
        Ok((context, state.layout))
    }

    /// Current live frame.
    pub fn live_frame(&self) -> Result<DiagnosticFrame, HalError> {
        let (context, layout) = self.context_for(ids::OBD2_LIVE_FRAME)?;
        let value = context.get_property(ids::OBD2_LIVE_FRAME, GLOBAL_AREA)?;
        Ok(layout.decode(FrameKind::Live, &value))
    }

    /// Freeze frame stored at `timestamp_ns`.
    pub fn freeze_frame(&self, timestamp_ns: i64) -> Result<DiagnosticFrame, HalError> {
        let (context, layout) = self.context_for(ids::OBD2_FREEZE_FRAME)?;
        let mut request = PropertyValue::request(ids::OBD2_FREEZE_FRAME, GLOBAL_AREA);
        request.value.int64_values = vec![timestamp_ns];
        let value = context.get_value(&request)?;
        Ok(layout.decode(FrameKind::Freeze, &value))
    }

    /// Timestamps of every stored freeze frame.
    pub fn freeze_frame_timestamps(&self) -> Result<Vec<i64>, HalError> {
        let (context, _) = self.context_for(ids::OBD2_FREEZE_FRAME_INFO)?;
        let value = context.get_property(ids::OBD2_FREEZE_FRAME_INFO, GLOBAL_AREA)?;
        Ok(value.value.int64_values)
    }

    /// Clear the given freeze frames; an empty slice clears all of them.
    pub fn clear_freeze_frames(&self, timestamps: &[i64]) -> Result<(), HalError> {
        let (context, _) = self.context_for(ids::OBD2_FREEZE_FRAME_CLEAR)?;
        let mut value = PropertyValue::request(ids::OBD2_FREEZE_FRAME_CLEAR, GLOBAL_AREA);
        value.value.int64_values = timestamps.to_vec();
        context.set_property(&value)
    }

    /// Stream live frames at `rate` Hz.
    pub fn subscribe_live_frames(&self, rate: f32) -> Result<(), HalError> {
        let (context, _) = self.context_for(ids::OBD2_LIVE_FRAME)?;
        context.subscribe_property(ids::OBD2_LIVE_FRAME, rate)
    }

    /// Stream newly stored freeze frames.
    pub fn subscribe_freeze_frames(&self) -> Result<(), HalError> {
        let (context, _) = self.context_for(ids::OBD2_FREEZE_FRAME)?;
        context.subscribe_property(ids::OBD2_FREEZE_FRAME, 0.0)
    }

    /// Stop streaming `prop`.
    pub fn unsubscribe(&self, prop: PropertyId) -> Result<(), HalError> {
        let (context, _) = self.context_for(prop)?;
        context.unsubscribe_property(prop)
    }
}

impl HalService for DiagnosticHalService {
    fn name(&self) -> &str {
        "diagnostic"
    }

    fn supported_properties(&self) -> SupportedProperties {
        SupportedProperties::Explicit(vec![
            ids::OBD2_LIVE_FRAME,
            ids::OBD2_FREEZE_FRAME,
            ids::OBD2_FREEZE_FRAME_INFO,
            ids::OBD2_FREEZE_FRAME_CLEAR,
        ])
    }

    fn take_properties(&self, context: HalContext, properties: Vec<PropertyDescriptor>) {
        let mut state = self.state.lock();
        state.layout = properties
            .iter()
            .find(|d| d.prop == ids::OBD2_LIVE_FRAME)
            .map(SensorLayout::from_descriptor)
            .unwrap_or_default();
        state.properties = properties.into_iter().map(|d| (d.prop, d)).collect();
        state.context = Some(context);
    }

    fn init(&self) -> Result<(), HalError> {
        let layout = self.layout();
        debug!(
            "Diagnostic service: {} int / {} float sensor slots",
            layout.num_int, layout.num_float
        );
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.listener = None;
        state.properties.clear();
    }

    fn on_events(&self, values: &[PropertyValue]) {
        let (layout, listener) = {
            let state = self.state.lock();
            (state.layout, state.listener.clone())
        };
        let frames: Vec<DiagnosticFrame> = values
            .iter()
            .filter_map(|value| match value.prop {
                ids::OBD2_LIVE_FRAME => Some(layout.decode(FrameKind::Live, value)),
                ids::OBD2_FREEZE_FRAME => Some(layout.decode(FrameKind::Freeze, value)),
                _ => None,
            })
            .collect();
        if frames.is_empty() {
            return;
        }
        match listener {
            Some(listener) => listener.on_diagnostic_frames(frames),
            None => warn!("No diagnostic listener, dropping {} frames", frames.len()),
        }
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let state = self.state.lock();
        writeln!(out, "*Diagnostic HAL*")?;
        writeln!(
            out,
            "  properties={} int_sensors={} float_sensors={}",
            state.properties.len(),
            state.layout.num_int,
            state.layout.num_float
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vhal_common::property::{ChangeMode, VehicleAccess};

    #[test]
    fn test_layout_adds_vendor_counts() {
        let descriptor = PropertyDescriptor::new(
            ids::OBD2_LIVE_FRAME,
            VehicleAccess::Read,
            ChangeMode::OnChange,
        )
        .with_config_array(vec![2, 3]);
        let layout = SensorLayout::from_descriptor(&descriptor);
        assert_eq!(layout.num_int, 34);
        assert_eq!(layout.num_float, 74);

        let plain = PropertyDescriptor::new(
            ids::OBD2_LIVE_FRAME,
            VehicleAccess::Read,
            ChangeMode::OnChange,
        );
        assert_eq!(SensorLayout::from_descriptor(&plain), SensorLayout::default());
    }

    #[test]
    fn test_bitmask_selects_sensors() {
        let layout = SensorLayout {
            num_int: 4,
            num_float: 4,
        };
        let mut value = PropertyValue::new(ids::OBD2_FREEZE_FRAME)
            .with_int32s(vec![10, 11, 12, 13])
            .with_string("P0420")
            .at(99);
        value.value.float_values = vec![0.5, 1.5, 2.5, 3.5];
        // int sensors 0 and 2; float sensor 1 is bit 5.
        value.value.bytes = vec![0b0010_0101];

        let frame = layout.decode(FrameKind::Freeze, &value);
        assert_eq!(frame.int_sensors.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(frame.int_sensors[&2], 12);
        assert_eq!(frame.float_sensors.len(), 1);
        assert_eq!(frame.float_sensors[&1], 1.5);
        assert_eq!(frame.dtc, "P0420");
        assert_eq!(frame.timestamp_ns, 99);
    }

    #[test]
    fn test_flag_without_value_is_skipped() {
        let layout = SensorLayout {
            num_int: 2,
            num_float: 0,
        };
        let mut value = PropertyValue::new(ids::OBD2_LIVE_FRAME).with_int32s(vec![5]);
        value.value.bytes = vec![0b11];
        let frame = layout.decode(FrameKind::Live, &value);
        assert_eq!(frame.int_sensors.len(), 1);
    }

    #[test]
    fn test_unsupported_without_properties() {
        let service = DiagnosticHalService::new();
        assert!(matches!(
            service.live_frame(),
            Err(HalError::Unsupported(ids::OBD2_LIVE_FRAME))
        ));
    }
}
