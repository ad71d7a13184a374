//! User HAL records and their int32-vector encoding.
//!
//! Every request and response starts with the request ID at index 0. The
//! user list shared by most requests is encoded as
//! `cur_id, cur_flags, n, (id, flags)*n`.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vhal_common::property::ids;
use vhal_common::property::{PropertyId, PropertyValue};

/// User ID meaning "no user".
pub const USER_NULL: i32 = -10000;

/// Separator between locales and user name in the initial user info string.
pub const STRING_SEPARATOR: &str = "||";

bitflags! {
    /// Android user flags as seen by the vehicle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct UserFlags: i32 {
        /// System user.
        const SYSTEM = 1;
        /// Guest user.
        const GUEST = 2;
        /// Removed when it stops running.
        const EPHEMERAL = 4;
        /// Administrator.
        const ADMIN = 8;
        /// Disabled.
        const DISABLED = 16;
        /// Managed profile.
        const PROFILE = 32;
    }
}

/// Malformed record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// Fewer values than the layout needs.
    #[error("{record} needs at least {expected} int32 values, got {actual}")]
    TooShort {
        /// Record being decoded.
        record: &'static str,
        /// Minimum size.
        expected: usize,
        /// Actual size.
        actual: usize,
    },

    /// Size does not match the announced element count.
    #[error("{record} has {actual} int32 values, expected exactly {expected}")]
    SizeMismatch {
        /// Record being decoded.
        record: &'static str,
        /// Expected size.
        expected: usize,
        /// Actual size.
        actual: usize,
    },

    /// Field holds a value outside its enumeration.
    #[error("invalid {field} value {value}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Raw value.
        value: i32,
    },

    /// Record is for a different property.
    #[error("unexpected property 0x{0:08x}")]
    WrongProperty(PropertyId),
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field:literal {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i32)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl $name {
            /// Decode the wire value.
            pub fn from_raw(raw: i32) -> Result<Self, MessageError> {
                match raw {
                    $( $value => Ok(Self::$variant), )+
                    value => Err(MessageError::InvalidValue { field: $field, value }),
                }
            }

            /// Wire value.
            pub fn as_raw(self) -> i32 {
                self as i32
            }
        }
    };
}

wire_enum! {
    /// Why the initial user is being selected.
    InitialUserInfoRequestType, "request type" {
        /// First boot of the device.
        FirstBoot = 1,
        /// First boot after a system update.
        FirstBootAfterOta = 2,
        /// Regular cold boot.
        ColdBoot = 3,
        /// Resume from suspend.
        Resume = 4,
    }
}

wire_enum! {
    /// What the vehicle wants done with the initial user.
    InitialUserInfoResponseAction, "initial user action" {
        /// Let Android pick.
        Default = 0,
        /// Switch to an existing user.
        Switch = 1,
        /// Create a new user.
        Create = 2,
    }
}

wire_enum! {
    /// `SWITCH_USER` message type at index 1.
    SwitchUserMessageType, "switch message type" {
        /// Switch done by a legacy API, notification only.
        LegacyAndroidSwitch = 1,
        /// Android asks the vehicle to approve a switch.
        AndroidSwitch = 2,
        /// Vehicle answers an `AndroidSwitch`.
        VehicleResponse = 3,
        /// Vehicle asks Android to switch.
        VehicleRequest = 4,
        /// Android reports the outcome of a switch.
        AndroidPostSwitch = 5,
    }
}

wire_enum! {
    /// Outcome of a switch or create.
    UserOperationStatus, "status" {
        /// Done.
        Success = 1,
        /// Rejected.
        Failure = 2,
    }
}

wire_enum! {
    /// Identification mechanism.
    UserIdentificationAssociationType, "association type" {
        /// Key fob.
        KeyFob = 1,
        /// OEM specific.
        Custom1 = 101,
        /// OEM specific.
        Custom2 = 102,
        /// OEM specific.
        Custom3 = 103,
        /// OEM specific.
        Custom4 = 104,
    }
}

wire_enum! {
    /// Current association of a mechanism.
    UserIdentificationAssociationValue, "association value" {
        /// Cannot tell.
        Unknown = 1,
        /// Tied to the current user.
        AssociatedCurrentUser = 2,
        /// Tied to another user.
        AssociatedAnotherUser = 3,
        /// Tied to nobody.
        NotAssociatedAnyUser = 4,
    }
}

wire_enum! {
    /// Requested association change.
    UserIdentificationAssociationSetValue, "association set value" {
        /// Tie to the current user.
        AssociateCurrentUser = 1,
        /// Untie from the current user.
        DisassociateCurrentUser = 2,
        /// Untie from every user.
        DisassociateAllUsers = 3,
    }
}

/// One user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserInfo {
    /// Android user ID.
    pub user_id: i32,
    /// Flags.
    pub flags: UserFlags,
}

impl UserInfo {
    /// User with flags.
    pub fn new(user_id: i32, flags: UserFlags) -> Self {
        Self { user_id, flags }
    }
}

/// Current user and every existing user.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UsersInfo {
    /// Foreground user.
    pub current_user: UserInfo,
    /// All users, including the current one.
    pub existing_users: Vec<UserInfo>,
}

impl UsersInfo {
    fn encode_into(&self, out: &mut Vec<i32>) {
        out.extend([
            self.current_user.user_id,
            self.current_user.flags.bits(),
            self.existing_users.len() as i32,
        ]);
        for user in &self.existing_users {
            out.extend([user.user_id, user.flags.bits()]);
        }
    }
}

fn ensure_prop(value: &PropertyValue, prop: PropertyId) -> Result<(), MessageError> {
    if value.prop == prop {
        Ok(())
    } else {
        Err(MessageError::WrongProperty(value.prop))
    }
}

fn ensure_len(record: &'static str, ints: &[i32], expected: usize) -> Result<(), MessageError> {
    if ints.len() < expected {
        return Err(MessageError::TooShort {
            record,
            expected,
            actual: ints.len(),
        });
    }
    Ok(())
}

/// Request ID at index 0, if any.
pub fn request_id_of(value: &PropertyValue) -> Option<i32> {
    value.first_int32()
}

// ─── Initial user info ──────────────────────────────────────────────

/// Encode `[req_id, type, users_info]`.
pub fn encode_initial_user_info_request(
    request_id: i32,
    request_type: InitialUserInfoRequestType,
    users_info: &UsersInfo,
) -> PropertyValue {
    let mut ints = vec![request_id, request_type.as_raw()];
    users_info.encode_into(&mut ints);
    PropertyValue::new(ids::INITIAL_USER_INFO).with_int32s(ints)
}

/// Decoded `INITIAL_USER_INFO` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialUserInfoResponse {
    /// Request ID.
    pub request_id: i32,
    /// Requested action.
    pub action: InitialUserInfoResponseAction,
    /// User to switch to (`Switch`) or to create (`Create`).
    pub user_to_switch_or_create: UserInfo,
    /// Locales for a new user, may be empty.
    pub user_locales: String,
    /// Name of a new user, may be empty.
    pub user_name_to_create: String,
}

impl InitialUserInfoResponse {
    /// Decode; `Switch` needs a user ID, `Create` needs flags too.
    pub fn decode(value: &PropertyValue) -> Result<Self, MessageError> {
        const RECORD: &str = "initial user info response";
        ensure_prop(value, ids::INITIAL_USER_INFO)?;
        let ints = &value.value.int32_values;
        ensure_len(RECORD, ints, 2)?;
        let action = InitialUserInfoResponseAction::from_raw(ints[1])?;
        let user = match action {
            InitialUserInfoResponseAction::Default => UserInfo::new(USER_NULL, UserFlags::empty()),
            InitialUserInfoResponseAction::Switch => {
                ensure_len(RECORD, ints, 3)?;
                UserInfo::new(ints[2], UserFlags::empty())
            }
            InitialUserInfoResponseAction::Create => {
                ensure_len(RECORD, ints, 4)?;
                UserInfo::new(ints[2], UserFlags::from_bits_retain(ints[3]))
            }
        };
        let (locales, name) = match value.value.string_value.split_once(STRING_SEPARATOR) {
            Some((locales, name)) => (locales.to_string(), name.to_string()),
            None => (value.value.string_value.clone(), String::new()),
        };
        Ok(Self {
            request_id: ints[0],
            action,
            user_to_switch_or_create: user,
            user_locales: locales,
            user_name_to_create: name,
        })
    }
}

// ─── Switch user ────────────────────────────────────────────────────

/// Android side `SWITCH_USER` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchUserRequest {
    /// Request ID; filled in when sent.
    pub request_id: i32,
    /// `LegacyAndroidSwitch`, `AndroidSwitch` or `AndroidPostSwitch`.
    pub message_type: SwitchUserMessageType,
    /// User being switched to.
    pub target_user: UserInfo,
    /// Users at the time of the request.
    pub users_info: UsersInfo,
}

impl SwitchUserRequest {
    /// Encode `[req_id, type, target_id, target_flags, users_info]`.
    pub fn encode(&self) -> PropertyValue {
        let mut ints = vec![
            self.request_id,
            self.message_type.as_raw(),
            self.target_user.user_id,
            self.target_user.flags.bits(),
        ];
        self.users_info.encode_into(&mut ints);
        PropertyValue::new(ids::SWITCH_USER).with_int32s(ints)
    }
}

/// Vehicle answer to an `AndroidSwitch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchUserResponse {
    /// Request ID.
    pub request_id: i32,
    /// Always `VehicleResponse`.
    pub message_type: SwitchUserMessageType,
    /// Outcome.
    pub status: UserOperationStatus,
    /// Optional reason.
    pub error_message: String,
}

impl SwitchUserResponse {
    /// Decode `[req_id, VEHICLE_RESPONSE, status]`.
    pub fn decode(value: &PropertyValue) -> Result<Self, MessageError> {
        ensure_prop(value, ids::SWITCH_USER)?;
        let ints = &value.value.int32_values;
        ensure_len("switch user response", ints, 3)?;
        let message_type = SwitchUserMessageType::from_raw(ints[1])?;
        if message_type != SwitchUserMessageType::VehicleResponse {
            return Err(MessageError::InvalidValue {
                field: "switch message type",
                value: ints[1],
            });
        }
        Ok(Self {
            request_id: ints[0],
            message_type,
            status: UserOperationStatus::from_raw(ints[2])?,
            error_message: value.value.string_value.clone(),
        })
    }
}

/// Vehicle asking Android to switch, `[negative req_id, VEHICLE_REQUEST, target]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VehicleSwitchRequest {
    /// Vehicle-assigned (negative) request ID.
    pub request_id: i32,
    /// User to switch to.
    pub target_user_id: i32,
}

impl VehicleSwitchRequest {
    /// Decode; the caller already checked the message type.
    pub fn decode(value: &PropertyValue) -> Result<Self, MessageError> {
        ensure_prop(value, ids::SWITCH_USER)?;
        let ints = &value.value.int32_values;
        ensure_len("vehicle switch request", ints, 3)?;
        Ok(Self {
            request_id: ints[0],
            target_user_id: ints[2],
        })
    }
}

/// Message type at index 1 of a `SWITCH_USER` value.
pub fn switch_message_type(value: &PropertyValue) -> Result<SwitchUserMessageType, MessageError> {
    let ints = &value.value.int32_values;
    ensure_len("switch user message", ints, 2)?;
    SwitchUserMessageType::from_raw(ints[1])
}

// ─── Create / remove user ───────────────────────────────────────────

/// `CREATE_USER` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserRequest {
    /// Request ID; filled in when sent.
    pub request_id: i32,
    /// The user just created.
    pub new_user_info: UserInfo,
    /// Its name.
    pub new_user_name: String,
    /// Users at the time of the request.
    pub users_info: UsersInfo,
}

impl CreateUserRequest {
    /// Encode `[req_id, new_id, new_flags, users_info]` + name.
    pub fn encode(&self) -> PropertyValue {
        let mut ints = vec![
            self.request_id,
            self.new_user_info.user_id,
            self.new_user_info.flags.bits(),
        ];
        self.users_info.encode_into(&mut ints);
        PropertyValue::new(ids::CREATE_USER)
            .with_int32s(ints)
            .with_string(self.new_user_name.clone())
    }
}

/// `CREATE_USER` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserResponse {
    /// Request ID.
    pub request_id: i32,
    /// Outcome.
    pub status: UserOperationStatus,
    /// Optional reason.
    pub error_message: String,
}

impl CreateUserResponse {
    /// Decode `[req_id, status]`.
    pub fn decode(value: &PropertyValue) -> Result<Self, MessageError> {
        ensure_prop(value, ids::CREATE_USER)?;
        let ints = &value.value.int32_values;
        ensure_len("create user response", ints, 2)?;
        Ok(Self {
            request_id: ints[0],
            status: UserOperationStatus::from_raw(ints[1])?,
            error_message: value.value.string_value.clone(),
        })
    }
}

/// `REMOVE_USER` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveUserRequest {
    /// Request ID; filled in when sent.
    pub request_id: i32,
    /// The user just removed.
    pub removed_user_info: UserInfo,
    /// Users after the removal.
    pub users_info: UsersInfo,
}

impl RemoveUserRequest {
    /// Encode `[req_id, removed_id, removed_flags, users_info]`.
    pub fn encode(&self) -> PropertyValue {
        let mut ints = vec![
            self.request_id,
            self.removed_user_info.user_id,
            self.removed_user_info.flags.bits(),
        ];
        self.users_info.encode_into(&mut ints);
        PropertyValue::new(ids::REMOVE_USER).with_int32s(ints)
    }
}

// ─── User identification association ────────────────────────────────

/// Query of association states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentificationGetRequest {
    /// Request ID; filled in when sent.
    pub request_id: i32,
    /// User the query is about.
    pub user_info: UserInfo,
    /// Mechanisms queried.
    pub association_types: Vec<UserIdentificationAssociationType>,
}

impl UserIdentificationGetRequest {
    /// Encode `[req_id, user_id, flags, n, type*n]`.
    pub fn encode(&self) -> PropertyValue {
        let mut ints = vec![
            self.request_id,
            self.user_info.user_id,
            self.user_info.flags.bits(),
            self.association_types.len() as i32,
        ];
        ints.extend(self.association_types.iter().map(|t| t.as_raw()));
        PropertyValue::new(ids::USER_IDENTIFICATION_ASSOCIATION).with_int32s(ints)
    }
}

/// One requested association change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIdentificationSetAssociation {
    /// Mechanism.
    pub association_type: UserIdentificationAssociationType,
    /// Change.
    pub value: UserIdentificationAssociationSetValue,
}

/// Request to change association states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentificationSetRequest {
    /// Request ID; filled in when sent.
    pub request_id: i32,
    /// User the change is about.
    pub user_info: UserInfo,
    /// Changes.
    pub associations: Vec<UserIdentificationSetAssociation>,
}

impl UserIdentificationSetRequest {
    /// Encode `[req_id, user_id, flags, n, (type, value)*n]`.
    pub fn encode(&self) -> PropertyValue {
        let mut ints = vec![
            self.request_id,
            self.user_info.user_id,
            self.user_info.flags.bits(),
            self.associations.len() as i32,
        ];
        for association in &self.associations {
            ints.extend([association.association_type.as_raw(), association.value.as_raw()]);
        }
        PropertyValue::new(ids::USER_IDENTIFICATION_ASSOCIATION).with_int32s(ints)
    }

    /// Mechanisms in request order.
    pub fn association_types(&self) -> Vec<UserIdentificationAssociationType> {
        self.associations.iter().map(|a| a.association_type).collect()
    }
}

/// One association state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIdentificationAssociation {
    /// Mechanism.
    pub association_type: UserIdentificationAssociationType,
    /// State.
    pub value: UserIdentificationAssociationValue,
}

/// Association states returned by the vehicle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentificationResponse {
    /// Request ID.
    pub request_id: i32,
    /// States, in request order.
    pub associations: Vec<UserIdentificationAssociation>,
    /// Optional reason.
    pub error_message: String,
}

impl UserIdentificationResponse {
    /// Decode `[req_id, n, (type, value)*n]`; the size must be exactly `2 + 2n`.
    pub fn decode(value: &PropertyValue) -> Result<Self, MessageError> {
        const RECORD: &str = "user identification response";
        ensure_prop(value, ids::USER_IDENTIFICATION_ASSOCIATION)?;
        let ints = &value.value.int32_values;
        ensure_len(RECORD, ints, 2)?;
        let n = usize::try_from(ints[1]).map_err(|_| MessageError::InvalidValue {
            field: "association count",
            value: ints[1],
        })?;
        let expected = 2 + 2 * n;
        if ints.len() != expected {
            return Err(MessageError::SizeMismatch {
                record: RECORD,
                expected,
                actual: ints.len(),
            });
        }
        let associations = ints[2..]
            .chunks_exact(2)
            .map(|pair| {
                Ok(UserIdentificationAssociation {
                    association_type: UserIdentificationAssociationType::from_raw(pair[0])?,
                    value: UserIdentificationAssociationValue::from_raw(pair[1])?,
                })
            })
            .collect::<Result<Vec<_>, MessageError>>()?;
        Ok(Self {
            request_id: ints[0],
            associations,
            error_message: value.value.string_value.clone(),
        })
    }

    /// True when the states line up one-to-one with `types`.
    pub fn matches_types(&self, types: &[UserIdentificationAssociationType]) -> bool {
        self.associations.len() == types.len()
            && self
                .associations
                .iter()
                .zip(types)
                .all(|(a, t)| a.association_type == *t)
    }
}
