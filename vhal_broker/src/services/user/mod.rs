//! User and identity management.
//!
//! The vehicle takes part in user lifecycle decisions through five
//! properties. Requests that expect an answer go through [`PendingRequests`]
//! and complete on the dispatch thread, the timeout thread (timeout), or the
//! caller thread (rejected, or the write failed).
//!
//! ```text
//!  caller                      UserHalService                     vehicle
//!  switch_user(req, cb) ──► begin() ─ id ─► set(SWITCH_USER) ──────►
//!                                                                  │
//!  cb(Ok, resp) ◄──── complete(id) ◄── on_events(SWITCH_USER) ◄────┘
//! ```
//!
//! `SWITCH_USER` events of type `VEHICLE_REQUEST` carry a negative request ID
//! and are routed to the [`UserSwitchHandler`] instead of the pending table.

pub mod messages;
pub mod pending;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vhal_common::config::UserHalConfig;
use vhal_common::hal::HalError;
use vhal_common::property::ids::{self, to_hex};
use vhal_common::property::{PropertyDescriptor, PropertyId, PropertyValue};

use crate::service::{HalContext, HalService, SupportedProperties};

pub use messages::*;
pub use pending::{
    ConcurrencyPolicy, HalCallback, HalCallbackStatus, PendingCallback, PendingRequests,
    ResponseKind,
};

const USER_PROPERTIES: [PropertyId; 5] = [
    ids::INITIAL_USER_INFO,
    ids::SWITCH_USER,
    ids::CREATE_USER,
    ids::REMOVE_USER,
    ids::USER_IDENTIFICATION_ASSOCIATION,
];

const CORE_USER_PROPERTIES: [PropertyId; 4] = [
    ids::INITIAL_USER_INFO,
    ids::SWITCH_USER,
    ids::CREATE_USER,
    ids::REMOVE_USER,
];

/// Handles switches requested by the vehicle.
pub trait UserSwitchHandler: Send + Sync {
    /// The vehicle asks Android to switch to `target_user_id`.
    ///
    /// The answer is a [`UserHalService::post_switch_response`] carrying the
    /// same (negative) `request_id`.
    fn switch_user_from_hal(&self, request_id: i32, target_user_id: i32);
}

/// User HAL service.
pub struct UserHalService {
    context: Mutex<Option<HalContext>>,
    properties: Mutex<BTreeSet<PropertyId>>,
    pending: PendingRequests,
    switch_handler: Mutex<Option<Arc<dyn UserSwitchHandler>>>,
}

impl UserHalService {
    /// Service with its own timeout thread.
    pub fn new(policy: ConcurrencyPolicy) -> Result<Self, HalError> {
        Ok(Self {
            context: Mutex::new(None),
            properties: Mutex::new(BTreeSet::new()),
            pending: PendingRequests::new(policy)?,
            switch_handler: Mutex::new(None),
        })
    }

    /// Service configured from the `[user]` section.
    pub fn from_config(config: &UserHalConfig) -> Result<Self, HalError> {
        let policy = if config.allow_concurrent_requests {
            ConcurrencyPolicy::Unrestricted
        } else {
            ConcurrencyPolicy::OnePerKind
        };
        Self::new(policy)
    }

    /// Attach the handler for vehicle initiated switches.
    pub fn set_switch_handler(&self, handler: Arc<dyn UserSwitchHandler>) {
        *self.switch_handler.lock() = Some(handler);
    }

    /// The vehicle exposes the four core user properties.
    pub fn is_supported(&self) -> bool {
        let properties = self.properties.lock();
        CORE_USER_PROPERTIES.iter().all(|p| properties.contains(p))
    }

    /// The vehicle exposes `USER_IDENTIFICATION_ASSOCIATION`.
    pub fn is_user_association_supported(&self) -> bool {
        self.properties
            .lock()
            .contains(&ids::USER_IDENTIFICATION_ASSOCIATION)
    }

    /// Requests awaiting a response.
    pub fn pending_requests(&self) -> &PendingRequests {
        &self.pending
    }

    // ─── Asynchronous requests ──────────────────────────────────────

    /// Ask the vehicle which user to boot into.
    pub fn get_initial_user_info(
        &self,
        request_type: InitialUserInfoRequestType,
        timeout: Duration,
        users_info: &UsersInfo,
        callback: HalCallback<InitialUserInfoResponse>,
    ) -> Result<(), HalError> {
        self.check_supported()?;
        self.send_request(PendingCallback::InitialUserInfo(callback), timeout, |id| {
            encode_initial_user_info_request(id, request_type, users_info)
        })
    }

    /// Ask the vehicle to approve a switch. The request ID and message type
    /// are filled in here.
    pub fn switch_user(
        &self,
        request: SwitchUserRequest,
        timeout: Duration,
        callback: HalCallback<SwitchUserResponse>,
    ) -> Result<(), HalError> {
        self.check_supported()?;
        self.send_request(PendingCallback::SwitchUser(callback), timeout, |id| {
            SwitchUserRequest {
                request_id: id,
                message_type: SwitchUserMessageType::AndroidSwitch,
                ..request
            }
            .encode()
        })
    }

    /// Tell the vehicle a user was created and wait for its verdict.
    pub fn create_user(
        &self,
        request: CreateUserRequest,
        timeout: Duration,
        callback: HalCallback<CreateUserResponse>,
    ) -> Result<(), HalError> {
        self.check_supported()?;
        self.send_request(PendingCallback::CreateUser(callback), timeout, |id| {
            CreateUserRequest {
                request_id: id,
                ..request
            }
            .encode()
        })
    }

    /// Change association states and wait for the resulting states.
    pub fn set_user_association(
        &self,
        timeout: Duration,
        request: UserIdentificationSetRequest,
        callback: HalCallback<UserIdentificationResponse>,
    ) -> Result<(), HalError> {
        self.check_association_supported()?;
        let types = request.association_types();
        check_association_types(&types)?;
        let pending = PendingCallback::UserIdentification { types, callback };
        self.send_request(pending, timeout, |id| {
            UserIdentificationSetRequest {
                request_id: id,
                ..request
            }
            .encode()
        })
    }

    // ─── Notifications ──────────────────────────────────────────────

    /// Tell the vehicle a user was removed.
    pub fn remove_user(&self, request: RemoveUserRequest) -> Result<(), HalError> {
        self.check_supported()?;
        let request_id = self.pending.next_request_id();
        self.notify(
            &RemoveUserRequest {
                request_id,
                ..request
            }
            .encode(),
        )
    }

    /// Report the outcome of a switch. `request.request_id` must be the ID of
    /// the switch being answered (negative for vehicle initiated switches).
    pub fn post_switch_response(&self, request: SwitchUserRequest) -> Result<(), HalError> {
        self.check_supported()?;
        self.notify(
            &SwitchUserRequest {
                message_type: SwitchUserMessageType::AndroidPostSwitch,
                ..request
            }
            .encode(),
        )
    }

    /// Report a switch done through a legacy API.
    pub fn legacy_user_switch(&self, request: SwitchUserRequest) -> Result<(), HalError> {
        self.check_supported()?;
        let request_id = self.pending.next_request_id();
        self.notify(
            &SwitchUserRequest {
                request_id,
                message_type: SwitchUserMessageType::LegacyAndroidSwitch,
                ..request
            }
            .encode(),
        )
    }

    // ─── Synchronous query ──────────────────────────────────────────

    /// Read association states.
    ///
    /// `Ok(None)` when the vehicle answered with a response that does not
    /// match the request (ID, count or per-index type).
    pub fn get_user_association(
        &self,
        request: UserIdentificationGetRequest,
    ) -> Result<Option<UserIdentificationResponse>, HalError> {
        self.check_association_supported()?;
        check_association_types(&request.association_types)?;
        let context = self.context()?;
        let request_id = self.pending.next_request_id();
        let request = UserIdentificationGetRequest {
            request_id,
            ..request
        };
        let value = context.get_value(&request.encode())?;

        let response = match UserIdentificationResponse::decode(&value) {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id, "Malformed association response: {}", e);
                return Ok(None);
            }
        };
        if response.request_id != request_id {
            warn!(
                request_id,
                received = response.request_id,
                "Association response for another request"
            );
            return Ok(None);
        }
        if !response.matches_types(&request.association_types) {
            warn!(request_id, "Association response types do not match the request");
            return Ok(None);
        }
        Ok(Some(response))
    }

    // ─── Internals ──────────────────────────────────────────────────

    fn context(&self) -> Result<HalContext, HalError> {
        self.context
            .lock()
            .clone()
            .ok_or_else(|| HalError::NotInitialized("user service".to_string()))
    }

    fn check_supported(&self) -> Result<(), HalError> {
        if self.is_supported() {
            Ok(())
        } else {
            Err(HalError::Unsupported(ids::INITIAL_USER_INFO))
        }
    }

    fn check_association_supported(&self) -> Result<(), HalError> {
        if self.is_user_association_supported() {
            Ok(())
        } else {
            Err(HalError::Unsupported(ids::USER_IDENTIFICATION_ASSOCIATION))
        }
    }

    fn send_request(
        &self,
        callback: PendingCallback,
        timeout: Duration,
        encode: impl FnOnce(i32) -> PropertyValue,
    ) -> Result<(), HalError> {
        if timeout.is_zero() {
            return Err(HalError::InvalidRequest("timeout must be positive".to_string()));
        }
        let context = self.context()?;
        let request_id = match self.pending.begin(callback, timeout) {
            Ok(id) => id,
            Err(rejected) => {
                warn!(kind = ?rejected.kind(), "Request of the same kind already pending");
                rejected.fail(HalCallbackStatus::ConcurrentOperation);
                return Ok(());
            }
        };

        let value = encode(request_id);
        if let Err(e) = context.set_property(&value) {
            warn!(request_id, prop = %to_hex(value.prop), "Failed to send request: {}", e);
            self.pending.fail(request_id, HalCallbackStatus::HalSetTimeout);
        }
        Ok(())
    }

    fn notify(&self, value: &PropertyValue) -> Result<(), HalError> {
        debug!(prop = %to_hex(value.prop), request_id = ?request_id_of(value), "Notifying vehicle");
        self.context()?.set_property(value)
    }

    fn on_response(&self, kind: ResponseKind, value: &PropertyValue) {
        let Some(request_id) = request_id_of(value) else {
            warn!(prop = %to_hex(value.prop), "Response without request ID");
            return;
        };
        let Some(callback) = self.pending.complete(request_id, kind) else {
            return;
        };
        deliver(request_id, callback, value);
    }

    fn on_switch_user(&self, value: &PropertyValue) {
        let message_type = match switch_message_type(value) {
            Ok(message_type) => message_type,
            Err(e) => {
                warn!("Malformed SWITCH_USER event: {}", e);
                return;
            }
        };
        match message_type {
            SwitchUserMessageType::VehicleResponse => {
                self.on_response(ResponseKind::SwitchUser, value)
            }
            SwitchUserMessageType::VehicleRequest => self.on_vehicle_switch_request(value),
            other => debug!(?other, "Ignoring Android side SWITCH_USER message"),
        }
    }

    fn on_vehicle_switch_request(&self, value: &PropertyValue) {
        let request = match VehicleSwitchRequest::decode(value) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed vehicle switch request: {}", e);
                return;
            }
        };
        if request.request_id >= 0 {
            warn!(
                request_id = request.request_id,
                "Vehicle switch request must use a negative request ID"
            );
            return;
        }
        let Some(handler) = self.switch_handler.lock().clone() else {
            warn!(request_id = request.request_id, "No switch handler, dropping vehicle request");
            return;
        };
        info!(
            request_id = request.request_id,
            target = request.target_user_id,
            "Vehicle requested user switch"
        );
        handler.switch_user_from_hal(request.request_id, request.target_user_id);
    }
}

fn check_association_types(types: &[UserIdentificationAssociationType]) -> Result<(), HalError> {
    if types.is_empty() {
        return Err(HalError::InvalidRequest(
            "no association types requested".to_string(),
        ));
    }
    let mut seen = BTreeSet::new();
    for t in types {
        if !seen.insert(*t) {
            return Err(HalError::InvalidRequest(format!(
                "duplicate association type {t:?}"
            )));
        }
    }
    Ok(())
}

/// Decode a response against its pending request and fire the callback.
fn deliver(request_id: i32, callback: PendingCallback, value: &PropertyValue) {
    fn finish<T, E: fmt::Display>(
        request_id: i32,
        callback: HalCallback<T>,
        decoded: Result<T, E>,
    ) {
        match decoded {
            Ok(response) => callback(HalCallbackStatus::Ok, Some(response)),
            Err(e) => {
                warn!(request_id, "Wrong HAL response: {}", e);
                callback(HalCallbackStatus::WrongHalResponse, None);
            }
        }
    }

    match callback {
        PendingCallback::InitialUserInfo(callback) => {
            finish(request_id, callback, InitialUserInfoResponse::decode(value))
        }
        PendingCallback::SwitchUser(callback) => {
            finish(request_id, callback, SwitchUserResponse::decode(value))
        }
        PendingCallback::CreateUser(callback) => {
            finish(request_id, callback, CreateUserResponse::decode(value))
        }
        PendingCallback::UserIdentification { types, callback } => {
            let decoded = UserIdentificationResponse::decode(value)
                .map_err(|e| e.to_string())
                .and_then(|response| {
                    if response.matches_types(&types) {
                        Ok(response)
                    } else {
                        Err(format!(
                            "expected types {:?}, got {:?}",
                            types,
                            response
                                .associations
                                .iter()
                                .map(|a| a.association_type)
                                .collect::<Vec<_>>()
                        ))
                    }
                });
            finish(request_id, callback, decoded)
        }
    }
}

impl HalService for UserHalService {
    fn name(&self) -> &str {
        "user"
    }

    fn supported_properties(&self) -> SupportedProperties {
        SupportedProperties::Explicit(USER_PROPERTIES.to_vec())
    }

    fn take_properties(&self, context: HalContext, properties: Vec<PropertyDescriptor>) {
        *self.properties.lock() = properties.iter().map(|d| d.prop).collect();
        *self.context.lock() = Some(context);
    }

    fn init(&self) -> Result<(), HalError> {
        let context = self.context()?;
        let properties: Vec<PropertyId> = self.properties.lock().iter().copied().collect();
        for prop in properties {
            if prop == ids::REMOVE_USER {
                continue;
            }
            context.subscribe_property(prop, 0.0)?;
        }
        info!(
            supported = self.is_supported(),
            association = self.is_user_association_supported(),
            policy = ?self.pending.policy(),
            "User HAL ready"
        );
        Ok(())
    }

    fn release(&self) {
        self.pending.cancel_all();
        *self.switch_handler.lock() = None;
    }

    fn on_events(&self, values: &[PropertyValue]) {
        for value in values {
            match value.prop {
                ids::INITIAL_USER_INFO => self.on_response(ResponseKind::InitialUserInfo, value),
                ids::SWITCH_USER => self.on_switch_user(value),
                ids::CREATE_USER => self.on_response(ResponseKind::CreateUser, value),
                ids::USER_IDENTIFICATION_ASSOCIATION => {
                    self.on_response(ResponseKind::UserIdentification, value)
                }
                other => debug!(prop = %to_hex(other), "Ignoring user property event"),
            }
        }
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "*User HAL*")?;
        writeln!(
            out,
            "  supported={} association={} policy={:?}",
            self.is_supported(),
            self.is_user_association_supported(),
            self.pending.policy()
        )?;
        for (request_id, kind) in self.pending.snapshot() {
            writeln!(out, "  pending #{request_id}: {kind:?}")?;
        }
        Ok(())
    }
}
