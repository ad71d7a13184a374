//! Vehicle side of the user HAL, answering like a permissive OEM build.
//!
//! | Request                         | Answer                              |
//! |---------------------------------|-------------------------------------|
//! | `INITIAL_USER_INFO`             | `[id, DEFAULT]`                     |
//! | `SWITCH_USER` (Android switch)  | `[id, VEHICLE_RESPONSE, SUCCESS]`   |
//! | `CREATE_USER`                   | `[id, SUCCESS]`                     |
//! | association set                 | new states of the requested types   |
//! | association get                 | stored states, `UNKNOWN` otherwise  |

use std::collections::BTreeMap;

use tracing::debug;
use vhal_common::property::ids;
use vhal_common::property::PropertyValue;

use crate::services::user::{
    InitialUserInfoResponseAction, SwitchUserMessageType, UserIdentificationAssociationSetValue,
    UserIdentificationAssociationValue, UserOperationStatus,
};

/// Emulated user HAL state.
#[derive(Debug, Default)]
pub struct UserHalEmulator {
    // Association type -> value, for the current user.
    associations: BTreeMap<i32, i32>,
}

impl UserHalEmulator {
    /// Emulator with no stored associations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Response event for a written request, if the request expects one.
    pub fn respond_to_set(&mut self, request: &PropertyValue) -> Option<PropertyValue> {
        let ints = &request.value.int32_values;
        let request_id = *ints.first()?;
        let response = match request.prop {
            ids::INITIAL_USER_INFO => vec![
                request_id,
                InitialUserInfoResponseAction::Default.as_raw(),
            ],
            ids::SWITCH_USER => {
                if *ints.get(1)? != SwitchUserMessageType::AndroidSwitch.as_raw() {
                    return None;
                }
                vec![
                    request_id,
                    SwitchUserMessageType::VehicleResponse.as_raw(),
                    UserOperationStatus::Success.as_raw(),
                ]
            }
            ids::CREATE_USER => vec![request_id, UserOperationStatus::Success.as_raw()],
            ids::USER_IDENTIFICATION_ASSOCIATION => self.apply_associations(ints)?,
            _ => return None,
        };
        debug!(prop = %ids::to_hex(request.prop), request_id, "Emulated user HAL response");
        Some(PropertyValue::new(request.prop).with_int32s(response))
    }

    /// Answer to an association query `[id, user_id, flags, n, type*n]`.
    pub fn respond_to_get(&self, request: &PropertyValue) -> Option<PropertyValue> {
        let ints = &request.value.int32_values;
        let request_id = *ints.first()?;
        let count = usize::try_from(*ints.get(3)?).ok()?;
        let types = ints.get(4..4 + count)?;
        let mut response = vec![request_id, count as i32];
        for t in types {
            let value = self
                .associations
                .get(t)
                .copied()
                .unwrap_or(UserIdentificationAssociationValue::Unknown.as_raw());
            response.extend([*t, value]);
        }
        Some(PropertyValue::new(ids::USER_IDENTIFICATION_ASSOCIATION).with_int32s(response))
    }

    // `[id, user_id, flags, n, (type, set_value)*n]`
    fn apply_associations(&mut self, ints: &[i32]) -> Option<Vec<i32>> {
        let count = usize::try_from(*ints.get(3)?).ok()?;
        let pairs = ints.get(4..4 + 2 * count)?;
        let mut response = vec![ints[0], count as i32];
        for pair in pairs.chunks_exact(2) {
            let value = match UserIdentificationAssociationSetValue::from_raw(pair[1]).ok()? {
                UserIdentificationAssociationSetValue::AssociateCurrentUser => {
                    UserIdentificationAssociationValue::AssociatedCurrentUser
                }
                UserIdentificationAssociationSetValue::DisassociateCurrentUser
                | UserIdentificationAssociationSetValue::DisassociateAllUsers => {
                    UserIdentificationAssociationValue::NotAssociatedAnyUser
                }
            };
            self.associations.insert(pair[0], value.as_raw());
            response.extend([pair[0], value.as_raw()]);
        }
        Some(response)
    }
}

/// `SWITCH_USER` event of a vehicle initiated switch.
pub fn vehicle_switch_request(request_id: i32, target_user_id: i32) -> PropertyValue {
    PropertyValue::new(ids::SWITCH_USER).with_int32s(vec![
        request_id,
        SwitchUserMessageType::VehicleRequest.as_raw(),
        target_user_id,
    ])
}
