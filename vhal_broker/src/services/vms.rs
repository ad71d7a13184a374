//! Vehicle map service bridge.
//!
//! VMS is a layered pub/sub protocol tunnelled through the
//! `VEHICLE_MAP_SERVICE` property. Every message is an int32 vector starting
//! with the message type, plus an optional byte payload:
//!
//! ```text
//! START_SESSION            [type, core_id, client_id]
//! SUBSCRIBE / UNSUBSCRIBE  [type, layer_type, subtype, version]
//! *_TO_PUBLISHER, DATA     [type, layer_type, subtype, version, publisher_id] + bytes
//! OFFERING                 [type, publisher_id, n, (layer, n_deps, layer*n_deps)*n]
//! AVAILABILITY_*           [type, seq, n, (layer, n_pub, pub*n_pub)*n]
//! SUBSCRIPTIONS_*          [type, seq, n_layers, n_assoc, layer*n_layers,
//!                           (layer, n_pub, pub*n_pub)*n_assoc]
//! PUBLISHER_ID_REQUEST     [type] + publisher info bytes
//! PUBLISHER_ID_RESPONSE    [type, publisher_id]
//! PUBLISHER_INFORMATION_*  [type, publisher_id] / [type] + bytes
//! ```
//!
//! The bridge connects the vehicle-side VMS client with local
//! [`VmsClient`]s: vehicle data is forwarded to local subscribers, local
//! publications are forwarded to the vehicle only for layers it subscribed to.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use vhal_common::hal::HalError;
use vhal_common::property::ids;
use vhal_common::property::{PropertyDescriptor, PropertyValue};

use crate::service::{HalContext, HalService, SupportedProperties};

// ─── Codec ──────────────────────────────────────────────────────────

/// Wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum VmsMessageType {
    /// Subscribe to a layer.
    Subscribe = 1,
    /// Subscribe to a layer of one publisher.
    SubscribeToPublisher = 2,
    /// Unsubscribe from a layer.
    Unsubscribe = 3,
    /// Unsubscribe from a layer of one publisher.
    UnsubscribeToPublisher = 4,
    /// Publisher announces the layers it can produce.
    Offering = 5,
    /// Ask for current availability.
    AvailabilityRequest = 6,
    /// Ask for current subscriptions.
    SubscriptionsRequest = 7,
    /// Answer to an availability request.
    AvailabilityResponse = 8,
    /// Unsolicited availability update.
    AvailabilityChange = 9,
    /// Answer to a subscriptions request.
    SubscriptionsResponse = 10,
    /// Unsolicited subscriptions update.
    SubscriptionsChange = 11,
    /// Layer payload.
    Data = 12,
    /// Ask for a publisher ID.
    PublisherIdRequest = 13,
    /// Assigned publisher ID.
    PublisherIdResponse = 14,
    /// Ask for a publisher's description.
    PublisherInformationRequest = 15,
    /// A publisher's description.
    PublisherInformationResponse = 16,
    /// Session handshake.
    StartSession = 17,
}

impl VmsMessageType {
    /// Decode the wire value.
    pub fn from_raw(raw: i32) -> Option<Self> {
        use VmsMessageType::*;
        Some(match raw {
            1 => Subscribe,
            2 => SubscribeToPublisher,
            3 => Unsubscribe,
            4 => UnsubscribeToPublisher,
            5 => Offering,
            6 => AvailabilityRequest,
            7 => SubscriptionsRequest,
            8 => AvailabilityResponse,
            9 => AvailabilityChange,
            10 => SubscriptionsResponse,
            11 => SubscriptionsChange,
            12 => Data,
            13 => PublisherIdRequest,
            14 => PublisherIdResponse,
            15 => PublisherInformationRequest,
            16 => PublisherInformationResponse,
            17 => StartSession,
            _ => return None,
        })
    }
}

/// A data layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmsLayer {
    /// Layer type.
    pub layer_type: i32,
    /// Layer subtype.
    pub subtype: i32,
    /// Layer version.
    pub version: i32,
}

impl VmsLayer {
    /// Layer from its three fields.
    pub fn new(layer_type: i32, subtype: i32, version: i32) -> Self {
        Self {
            layer_type,
            subtype,
            version,
        }
    }
}

/// A layer together with the publishers concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmsAssociatedLayer {
    /// Layer.
    pub layer: VmsLayer,
    /// Publisher IDs, ascending.
    pub publisher_ids: Vec<i32>,
}

/// A layer a publisher offers and what it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmsLayerDependency {
    /// Offered layer.
    pub layer: VmsLayer,
    /// Layers it is computed from.
    pub dependencies: Vec<VmsLayer>,
}

/// Layers currently obtainable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmsAvailability {
    /// Monotonic sequence number.
    pub sequence: i32,
    /// Available layers with their publishers.
    pub associated_layers: Vec<VmsAssociatedLayer>,
}

/// Layers currently subscribed to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmsSubscriptionState {
    /// Monotonic sequence number.
    pub sequence: i32,
    /// Layers subscribed regardless of publisher.
    pub layers: Vec<VmsLayer>,
    /// Layers subscribed for specific publishers.
    pub associated_layers: Vec<VmsAssociatedLayer>,
}

/// A decoded VMS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmsMessage {
    /// Session handshake.
    StartSession {
        /// Session ID of the sender side.
        core_id: i32,
        /// Client ID, `-1` when unknown.
        client_id: i32,
    },
    /// Subscribe to a layer.
    Subscribe(VmsLayer),
    /// Subscribe to one publisher's layer.
    SubscribeToPublisher {
        /// Layer.
        layer: VmsLayer,
        /// Publisher.
        publisher_id: i32,
    },
    /// Unsubscribe from a layer.
    Unsubscribe(VmsLayer),
    /// Unsubscribe from one publisher's layer.
    UnsubscribeToPublisher {
        /// Layer.
        layer: VmsLayer,
        /// Publisher.
        publisher_id: i32,
    },
    /// Layers a publisher can produce.
    Offering {
        /// Publisher.
        publisher_id: i32,
        /// Offered layers.
        offerings: Vec<VmsLayerDependency>,
    },
    /// Ask for availability.
    AvailabilityRequest,
    /// Availability answer.
    AvailabilityResponse(VmsAvailability),
    /// Availability update.
    AvailabilityChange(VmsAvailability),
    /// Ask for subscriptions.
    SubscriptionsRequest,
    /// Subscriptions answer.
    SubscriptionsResponse(VmsSubscriptionState),
    /// Subscriptions update.
    SubscriptionsChange(VmsSubscriptionState),
    /// Layer payload.
    Data {
        /// Layer.
        layer: VmsLayer,
        /// Publisher.
        publisher_id: i32,
        /// Opaque payload.
        payload: Vec<u8>,
    },
    /// Ask for a publisher ID.
    PublisherIdRequest {
        /// Opaque publisher description.
        publisher_info: Vec<u8>,
    },
    /// Assigned publisher ID.
    PublisherIdResponse {
        /// Publisher.
        publisher_id: i32,
    },
    /// Ask for a publisher description.
    PublisherInformationRequest {
        /// Publisher.
        publisher_id: i32,
    },
    /// A publisher description.
    PublisherInformationResponse {
        /// Opaque publisher description, empty if unknown.
        publisher_info: Vec<u8>,
    },
}

/// VMS decoding failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmsCodecError {
    /// No message type.
    #[error("empty VMS message")]
    Empty,

    /// Message type not recognised.
    #[error("unknown VMS message type {0}")]
    UnknownType(i32),

    /// Payload shorter than its header announces.
    #[error("truncated {message_type:?} message: needed index {index}, have {len} values")]
    Truncated {
        /// Type being decoded.
        message_type: VmsMessageType,
        /// First missing index.
        index: usize,
        /// Values available.
        len: usize,
    },

    /// Negative element count.
    #[error("negative count {count} in {message_type:?} message")]
    NegativeCount {
        /// Type being decoded.
        message_type: VmsMessageType,
        /// Count found.
        count: i32,
    },
}

struct Reader<'a> {
    values: &'a [i32],
    pos: usize,
    message_type: VmsMessageType,
}

impl<'a> Reader<'a> {
    fn int(&mut self) -> Result<i32, VmsCodecError> {
        let value = self
            .values
            .get(self.pos)
            .copied()
            .ok_or(VmsCodecError::Truncated {
                message_type: self.message_type,
                index: self.pos,
                len: self.values.len(),
            })?;
        self.pos += 1;
        Ok(value)
    }

    fn count(&mut self) -> Result<usize, VmsCodecError> {
        let count = self.int()?;
        usize::try_from(count).map_err(|_| VmsCodecError::NegativeCount {
            message_type: self.message_type,
            count,
        })
    }

    fn layer(&mut self) -> Result<VmsLayer, VmsCodecError> {
        Ok(VmsLayer::new(self.int()?, self.int()?, self.int()?))
    }

    fn associated_layer(&mut self) -> Result<VmsAssociatedLayer, VmsCodecError> {
        let layer = self.layer()?;
        let n = self.count()?;
        let publisher_ids = (0..n).map(|_| self.int()).collect::<Result<_, _>>()?;
        Ok(VmsAssociatedLayer {
            layer,
            publisher_ids,
        })
    }

    fn availability(&mut self) -> Result<VmsAvailability, VmsCodecError> {
        let sequence = self.int()?;
        let n = self.count()?;
        let associated_layers = (0..n)
            .map(|_| self.associated_layer())
            .collect::<Result<_, _>>()?;
        Ok(VmsAvailability {
            sequence,
            associated_layers,
        })
    }

    fn subscriptions(&mut self) -> Result<VmsSubscriptionState, VmsCodecError> {
        let sequence = self.int()?;
        let n_layers = self.count()?;
        let n_assoc = self.count()?;
        let layers = (0..n_layers).map(|_| self.layer()).collect::<Result<_, _>>()?;
        let associated_layers = (0..n_assoc)
            .map(|_| self.associated_layer())
            .collect::<Result<_, _>>()?;
        Ok(VmsSubscriptionState {
            sequence,
            layers,
            associated_layers,
        })
    }
}

fn push_layer(out: &mut Vec<i32>, layer: &VmsLayer) {
    out.extend([layer.layer_type, layer.subtype, layer.version]);
}

fn push_associated(out: &mut Vec<i32>, associated: &VmsAssociatedLayer) {
    push_layer(out, &associated.layer);
    out.push(associated.publisher_ids.len() as i32);
    out.extend(&associated.publisher_ids);
}

impl VmsMessage {
    /// Wire type of this message.
    pub fn message_type(&self) -> VmsMessageType {
        use VmsMessageType as T;
        match self {
            Self::StartSession { .. } => T::StartSession,
            Self::Subscribe(_) => T::Subscribe,
            Self::SubscribeToPublisher { .. } => T::SubscribeToPublisher,
            Self::Unsubscribe(_) => T::Unsubscribe,
            Self::UnsubscribeToPublisher { .. } => T::UnsubscribeToPublisher,
            Self::Offering { .. } => T::Offering,
            Self::AvailabilityRequest => T::AvailabilityRequest,
            Self::AvailabilityResponse(_) => T::AvailabilityResponse,
            Self::AvailabilityChange(_) => T::AvailabilityChange,
            Self::SubscriptionsRequest => T::SubscriptionsRequest,
            Self::SubscriptionsResponse(_) => T::SubscriptionsResponse,
            Self::SubscriptionsChange(_) => T::SubscriptionsChange,
            Self::Data { .. } => T::Data,
            Self::PublisherIdRequest { .. } => T::PublisherIdRequest,
            Self::PublisherIdResponse { .. } => T::PublisherIdResponse,
            Self::PublisherInformationRequest { .. } => T::PublisherInformationRequest,
            Self::PublisherInformationResponse { .. } => T::PublisherInformationResponse,
        }
    }

    /// Encode as a `VEHICLE_MAP_SERVICE` value.
    pub fn encode(&self) -> PropertyValue {
        let mut ints = vec![self.message_type() as i32];
        let mut bytes = Vec::new();
        match self {
            Self::StartSession { core_id, client_id } => ints.extend([*core_id, *client_id]),
            Self::Subscribe(layer) | Self::Unsubscribe(layer) => push_layer(&mut ints, layer),
            Self::SubscribeToPublisher {
                layer,
                publisher_id,
            }
            | Self::UnsubscribeToPublisher {
                layer,
                publisher_id,
            } => {
                push_layer(&mut ints, layer);
                ints.push(*publisher_id);
            }
            Self::Offering {
                publisher_id,
                offerings,
            } => {
                ints.push(*publisher_id);
                ints.push(offerings.len() as i32);
                for offering in offerings {
                    push_layer(&mut ints, &offering.layer);
                    ints.push(offering.dependencies.len() as i32);
                    for dependency in &offering.dependencies {
                        push_layer(&mut ints, dependency);
                    }
                }
            }
            Self::AvailabilityRequest | Self::SubscriptionsRequest => {}
            Self::AvailabilityResponse(availability) | Self::AvailabilityChange(availability) => {
                ints.push(availability.sequence);
                ints.push(availability.associated_layers.len() as i32);
                for associated in &availability.associated_layers {
                    push_associated(&mut ints, associated);
                }
            }
            Self::SubscriptionsResponse(state) | Self::SubscriptionsChange(state) => {
                ints.push(state.sequence);
                ints.push(state.layers.len() as i32);
                ints.push(state.associated_layers.len() as i32);
                for layer in &state.layers {
                    push_layer(&mut ints, layer);
                }
                for associated in &state.associated_layers {
                    push_associated(&mut ints, associated);
                }
            }
            Self::Data {
                layer,
                publisher_id,
                payload,
            } => {
                push_layer(&mut ints, layer);
                ints.push(*publisher_id);
                bytes.clone_from(payload);
            }
            Self::PublisherIdRequest { publisher_info }
            | Self::PublisherInformationResponse { publisher_info } => {
                bytes.clone_from(publisher_info);
            }
            Self::PublisherIdResponse { publisher_id }
            | Self::PublisherInformationRequest { publisher_id } => ints.push(*publisher_id),
        }
        PropertyValue::new(ids::VEHICLE_MAP_SERVICE)
            .with_int32s(ints)
            .with_bytes(bytes)
    }

    /// Decode a `VEHICLE_MAP_SERVICE` value.
    pub fn decode(value: &PropertyValue) -> Result<Self, VmsCodecError> {
        let ints = &value.value.int32_values;
        let raw_type = *ints.first().ok_or(VmsCodecError::Empty)?;
        let message_type =
            VmsMessageType::from_raw(raw_type).ok_or(VmsCodecError::UnknownType(raw_type))?;
        let mut r = Reader {
            values: ints,
            pos: 1,
            message_type,
        };
        let bytes = || value.value.bytes.clone();

        use VmsMessageType as T;
        Ok(match message_type {
            T::StartSession => Self::StartSession {
                core_id: r.int()?,
                client_id: r.int()?,
            },
            T::Subscribe => Self::Subscribe(r.layer()?),
            T::Unsubscribe => Self::Unsubscribe(r.layer()?),
            T::SubscribeToPublisher => Self::SubscribeToPublisher {
                layer: r.layer()?,
                publisher_id: r.int()?,
            },
            T::UnsubscribeToPublisher => Self::UnsubscribeToPublisher {
                layer: r.layer()?,
                publisher_id: r.int()?,
            },
            T::Offering => {
                let publisher_id = r.int()?;
                let n = r.count()?;
                let mut offerings = Vec::with_capacity(n.min(64));
                for _ in 0..n {
                    let layer = r.layer()?;
                    let n_deps = r.count()?;
                    let dependencies = (0..n_deps).map(|_| r.layer()).collect::<Result<_, _>>()?;
                    offerings.push(VmsLayerDependency {
                        layer,
                        dependencies,
                    });
                }
                Self::Offering {
                    publisher_id,
                    offerings,
                }
            }
            T::AvailabilityRequest => Self::AvailabilityRequest,
            T::SubscriptionsRequest => Self::SubscriptionsRequest,
            T::AvailabilityResponse => Self::AvailabilityResponse(r.availability()?),
            T::AvailabilityChange => Self::AvailabilityChange(r.availability()?),
            T::SubscriptionsResponse => Self::SubscriptionsResponse(r.subscriptions()?),
            T::SubscriptionsChange => Self::SubscriptionsChange(r.subscriptions()?),
            T::Data => Self::Data {
                layer: r.layer()?,
                publisher_id: r.int()?,
                payload: bytes(),
            },
            T::PublisherIdRequest => Self::PublisherIdRequest {
                publisher_info: bytes(),
            },
            T::PublisherIdResponse => Self::PublisherIdResponse {
                publisher_id: r.int()?,
            },
            T::PublisherInformationRequest => Self::PublisherInformationRequest {
                publisher_id: r.int()?,
            },
            T::PublisherInformationResponse => Self::PublisherInformationResponse {
                publisher_info: bytes(),
            },
        })
    }
}

// ─── Bridge ─────────────────────────────────────────────────────────

/// Handle of a local client.
pub type VmsClientId = u32;

/// Local VMS participant.
pub trait VmsClient: Send + Sync {
    /// Data for a layer the client subscribed to.
    fn on_vms_message(&self, layer: VmsLayer, publisher_id: i32, payload: &[u8]);

    /// Layers obtainable from the vehicle changed.
    fn on_layers_availability_changed(&self, availability: &VmsAvailability);
}

struct LocalClient {
    client: Arc<dyn VmsClient>,
    layers: BTreeSet<VmsLayer>,
}

#[derive(Default)]
struct VmsState {
    context: Option<HalContext>,
    supported: bool,
    core_id: i32,
    hal_client_id: Option<i32>,
    next_client_id: VmsClientId,
    clients: BTreeMap<VmsClientId, LocalClient>,
    // Layers the vehicle subscribed to, and per-publisher subscriptions.
    hal_layers: BTreeSet<VmsLayer>,
    hal_publisher_layers: BTreeSet<(VmsLayer, i32)>,
    // Offerings received from the vehicle, by publisher.
    offerings: BTreeMap<i32, Vec<VmsLayerDependency>>,
    availability_sequence: i32,
    subscription_sequence: i32,
    publisher_ids: HashMap<Vec<u8>, i32>,
    publisher_info: BTreeMap<i32, Vec<u8>>,
}

impl VmsState {
    fn availability(&self) -> VmsAvailability {
        let mut by_layer: BTreeMap<VmsLayer, BTreeSet<i32>> = BTreeMap::new();
        for (publisher, offerings) in &self.offerings {
            for offering in offerings {
                by_layer.entry(offering.layer).or_default().insert(*publisher);
            }
        }
        VmsAvailability {
            sequence: self.availability_sequence,
            associated_layers: by_layer
                .into_iter()
                .map(|(layer, publishers)| VmsAssociatedLayer {
                    layer,
                    publisher_ids: publishers.into_iter().collect(),
                })
                .collect(),
        }
    }

    fn local_subscriptions(&self) -> VmsSubscriptionState {
        let layers: BTreeSet<VmsLayer> = self
            .clients
            .values()
            .flat_map(|c| c.layers.iter().copied())
            .collect();
        VmsSubscriptionState {
            sequence: self.subscription_sequence,
            layers: layers.into_iter().collect(),
            associated_layers: Vec::new(),
        }
    }

    fn hal_wants(&self, layer: &VmsLayer, publisher_id: i32) -> bool {
        self.hal_layers.contains(layer) || self.hal_publisher_layers.contains(&(*layer, publisher_id))
    }
}

/// What to do after the state lock is released.
enum Action {
    Send(VmsMessage),
    Deliver(Vec<Arc<dyn VmsClient>>, VmsLayer, i32, Vec<u8>),
    Availability(Vec<Arc<dyn VmsClient>>, VmsAvailability),
}

/// VMS bridge service.
#[derive(Default)]
pub struct VmsHalService {
    state: Mutex<VmsState>,
}

impl VmsHalService {
    /// Bridge with `core_id` identifying this side's session.
    pub fn new(core_id: i32) -> Self {
        let service = Self::default();
        service.state.lock().core_id = core_id;
        service
    }

    /// The vehicle exposes the VMS property.
    pub fn is_supported(&self) -> bool {
        self.state.lock().supported
    }

    /// Client ID the vehicle announced for its side of the session.
    pub fn hal_client_id(&self) -> Option<i32> {
        self.state.lock().hal_client_id
    }

    /// Register a local client.
    pub fn register_client(&self, client: Arc<dyn VmsClient>) -> VmsClientId {
        let mut state = self.state.lock();
        state.next_client_id += 1;
        let id = state.next_client_id;
        state.clients.insert(
            id,
            LocalClient {
                client,
                layers: BTreeSet::new(),
            },
        );
        id
    }

    /// Remove a local client and its subscriptions.
    pub fn unregister_client(&self, id: VmsClientId) -> Result<(), HalError> {
        let changed = {
            let mut state = self.state.lock();
            state
                .clients
                .remove(&id)
                .is_some_and(|client| !client.layers.is_empty())
        };
        if changed {
            self.send_subscriptions_change()?;
        }
        Ok(())
    }

    /// Subscribe a local client to a vehicle layer.
    pub fn subscribe(&self, id: VmsClientId, layer: VmsLayer) -> Result<(), HalError> {
        let changed = self.update_client(id, |layers| layers.insert(layer))?;
        if changed {
            self.send_subscriptions_change()?;
        }
        Ok(())
    }

    /// Unsubscribe a local client from a vehicle layer.
    pub fn unsubscribe(&self, id: VmsClientId, layer: VmsLayer) -> Result<(), HalError> {
        let changed = self.update_client(id, |layers| layers.remove(&layer))?;
        if changed {
            self.send_subscriptions_change()?;
        }
        Ok(())
    }

    fn update_client(
        &self,
        id: VmsClientId,
        update: impl FnOnce(&mut BTreeSet<VmsLayer>) -> bool,
    ) -> Result<bool, HalError> {
        let mut state = self.state.lock();
        let client = state
            .clients
            .get_mut(&id)
            .ok_or_else(|| HalError::InvalidRequest(format!("unknown VMS client {id}")))?;
        let changed = update(&mut client.layers);
        if changed {
            state.subscription_sequence += 1;
        }
        Ok(changed)
    }

    /// Publish local data. Dropped unless the vehicle subscribed to the layer.
    /// Returns whether the data was forwarded.
    pub fn publish(
        &self,
        publisher_id: i32,
        layer: VmsLayer,
        payload: Vec<u8>,
    ) -> Result<bool, HalError> {
        if !self.state.lock().hal_wants(&layer, publisher_id) {
            debug!("Vehicle not subscribed to {:?}, dropping publication", layer);
            return Ok(false);
        }
        self.send(VmsMessage::Data {
            layer,
            publisher_id,
            payload,
        })?;
        Ok(true)
    }

    /// Layers the vehicle currently subscribes to.
    pub fn hal_subscriptions(&self) -> Vec<VmsLayer> {
        self.state.lock().hal_layers.iter().copied().collect()
    }

    /// Layers currently obtainable from the vehicle.
    pub fn availability(&self) -> VmsAvailability {
        self.state.lock().availability()
    }

    fn send(&self, message: VmsMessage) -> Result<(), HalError> {
        let context = self
            .state
            .lock()
            .context
            .clone()
            .ok_or_else(|| HalError::NotInitialized("vms service".to_string()))?;
        debug!("VMS -> vehicle: {:?}", message.message_type());
        context.set_property(&message.encode())
    }

    fn send_subscriptions_change(&self) -> Result<(), HalError> {
        let subscriptions = self.state.lock().local_subscriptions();
        self.send(VmsMessage::SubscriptionsChange(subscriptions))
    }

    fn handle(&self, message: VmsMessage) -> Vec<Action> {
        let mut state = self.state.lock();
        let mut actions = Vec::new();
        match message {
            VmsMessage::StartSession { core_id, client_id } => {
                state.hal_client_id = Some(client_id);
                if core_id != state.core_id {
                    // Vehicle (re)started the session: answer and forget its state.
                    info!("VMS session started by vehicle, client {}", client_id);
                    state.hal_layers.clear();
                    state.hal_publisher_layers.clear();
                    state.offerings.clear();
                    actions.push(Action::Send(VmsMessage::StartSession {
                        core_id: state.core_id,
                        client_id,
                    }));
                }
                actions.push(Action::Send(VmsMessage::SubscriptionsChange(
                    state.local_subscriptions(),
                )));
            }
            VmsMessage::Subscribe(layer) => {
                state.hal_layers.insert(layer);
            }
            VmsMessage::Unsubscribe(layer) => {
                state.hal_layers.remove(&layer);
            }
            VmsMessage::SubscribeToPublisher {
                layer,
                publisher_id,
            } => {
                state.hal_publisher_layers.insert((layer, publisher_id));
            }
            VmsMessage::UnsubscribeToPublisher {
                layer,
                publisher_id,
            } => {
                state.hal_publisher_layers.remove(&(layer, publisher_id));
            }
            VmsMessage::Offering {
                publisher_id,
                offerings,
            } => {
                state.offerings.insert(publisher_id, offerings);
                state.availability_sequence += 1;
                let availability = state.availability();
                let clients = state.clients.values().map(|c| Arc::clone(&c.client)).collect();
                actions.push(Action::Availability(clients, availability));
            }
            VmsMessage::AvailabilityRequest => {
                actions.push(Action::Send(VmsMessage::AvailabilityResponse(
                    state.availability(),
                )));
            }
            VmsMessage::SubscriptionsRequest => {
                actions.push(Action::Send(VmsMessage::SubscriptionsResponse(
                    state.local_subscriptions(),
                )));
            }
            VmsMessage::Data {
                layer,
                publisher_id,
                payload,
            } => {
                let clients: Vec<_> = state
                    .clients
                    .values()
                    .filter(|c| c.layers.contains(&layer))
                    .map(|c| Arc::clone(&c.client))
                    .collect();
                if !clients.is_empty() {
                    actions.push(Action::Deliver(clients, layer, publisher_id, payload));
                }
            }
            VmsMessage::PublisherIdRequest { publisher_info } => {
                let next = i32::try_from(state.publisher_ids.len()).unwrap_or(i32::MAX - 1) + 1;
                let publisher_id = *state
                    .publisher_ids
                    .entry(publisher_info.clone())
                    .or_insert(next);
                state.publisher_info.insert(publisher_id, publisher_info);
                actions.push(Action::Send(VmsMessage::PublisherIdResponse { publisher_id }));
            }
            VmsMessage::PublisherInformationRequest { publisher_id } => {
                let publisher_info = state
                    .publisher_info
                    .get(&publisher_id)
                    .cloned()
                    .unwrap_or_default();
                actions.push(Action::Send(VmsMessage::PublisherInformationResponse {
                    publisher_info,
                }));
            }
            other => warn!("Unexpected VMS message from vehicle: {:?}", other.message_type()),
        }
        actions
    }
}

impl HalService for VmsHalService {
    fn name(&self) -> &str {
        "vms"
    }

    fn supported_properties(&self) -> SupportedProperties {
        SupportedProperties::Explicit(vec![ids::VEHICLE_MAP_SERVICE])
    }

    fn take_properties(&self, context: HalContext, properties: Vec<PropertyDescriptor>) {
        let mut state = self.state.lock();
        state.supported = properties.iter().any(|d| d.prop == ids::VEHICLE_MAP_SERVICE);
        state.context = Some(context);
    }

    fn init(&self) -> Result<(), HalError> {
        let (context, core_id) = {
            let state = self.state.lock();
            if !state.supported {
                return Ok(());
            }
            (state.context.clone(), state.core_id)
        };
        let Some(context) = context else {
            return Ok(());
        };
        context.subscribe_property(ids::VEHICLE_MAP_SERVICE, 0.0)?;
        info!("Starting VMS session, core id {}", core_id);
        self.send(VmsMessage::StartSession {
            core_id,
            client_id: -1,
        })
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.clients.clear();
        state.hal_layers.clear();
        state.hal_publisher_layers.clear();
        state.offerings.clear();
    }

    fn on_events(&self, values: &[PropertyValue]) {
        for value in values {
            let message = match VmsMessage::decode(value) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropping malformed VMS message: {}", e);
                    continue;
                }
            };
            for action in self.handle(message) {
                match action {
                    Action::Send(reply) => {
                        if let Err(e) = self.send(reply) {
                            warn!("Failed to answer VMS message: {}", e);
                        }
                    }
                    Action::Deliver(clients, layer, publisher_id, payload) => {
                        for client in clients {
                            client.on_vms_message(layer, publisher_id, &payload);
                        }
                    }
                    Action::Availability(clients, availability) => {
                        for client in clients {
                            client.on_layers_availability_changed(&availability);
                        }
                    }
                }
            }
        }
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let state = self.state.lock();
        writeln!(out, "*VMS HAL*")?;
        writeln!(
            out,
            "  core_id={} hal_client={:?} clients={} hal_layers={} publishers={}",
            state.core_id,
            state.hal_client_id,
            state.clients.len(),
            state.hal_layers.len(),
            state.publisher_ids.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer() -> VmsLayer {
        VmsLayer::new(1, 2, 3)
    }

    #[test]
    fn test_subscribe_layout() {
        let value = VmsMessage::Subscribe(layer()).encode();
        assert_eq!(value.prop, ids::VEHICLE_MAP_SERVICE);
        assert_eq!(value.value.int32_values, vec![1, 1, 2, 3]);
    }

    #[test]
    fn test_data_layout() {
        let value = VmsMessage::Data {
            layer: layer(),
            publisher_id: 9,
            payload: vec![0xAB, 0xCD],
        }
        .encode();
        assert_eq!(value.value.int32_values, vec![12, 1, 2, 3, 9]);
        assert_eq!(value.value.bytes, vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_subscriptions_layout() {
        let state = VmsSubscriptionState {
            sequence: 4,
            layers: vec![layer()],
            associated_layers: vec![VmsAssociatedLayer {
                layer: VmsLayer::new(7, 8, 9),
                publisher_ids: vec![100, 101],
            }],
        };
        let value = VmsMessage::SubscriptionsChange(state.clone()).encode();
        assert_eq!(
            value.value.int32_values,
            vec![11, 4, 1, 1, 1, 2, 3, 7, 8, 9, 2, 100, 101]
        );
        assert_eq!(
            VmsMessage::decode(&value).unwrap(),
            VmsMessage::SubscriptionsChange(state)
        );
    }

    #[test]
    fn test_offering_decode() {
        let value = PropertyValue::new(ids::VEHICLE_MAP_SERVICE)
            .with_int32s(vec![5, 42, 2, 1, 2, 3, 0, 4, 5, 6, 1, 1, 2, 3]);
        let VmsMessage::Offering {
            publisher_id,
            offerings,
        } = VmsMessage::decode(&value).unwrap()
        else {
            panic!("expected offering");
        };
        assert_eq!(publisher_id, 42);
        assert_eq!(offerings.len(), 2);
        assert!(offerings[0].dependencies.is_empty());
        assert_eq!(offerings[1].dependencies, vec![layer()]);
    }

    #[test]
    fn test_decode_errors() {
        let empty = PropertyValue::new(ids::VEHICLE_MAP_SERVICE);
        assert_eq!(VmsMessage::decode(&empty), Err(VmsCodecError::Empty));

        let unknown = PropertyValue::new(ids::VEHICLE_MAP_SERVICE).with_int32s(vec![99]);
        assert_eq!(
            VmsMessage::decode(&unknown),
            Err(VmsCodecError::UnknownType(99))
        );

        let truncated = PropertyValue::new(ids::VEHICLE_MAP_SERVICE).with_int32s(vec![1, 1, 2]);
        assert!(matches!(
            VmsMessage::decode(&truncated),
            Err(VmsCodecError::Truncated { index: 3, .. })
        ));

        let negative =
            PropertyValue::new(ids::VEHICLE_MAP_SERVICE).with_int32s(vec![9, 0, -1]);
        assert!(matches!(
            VmsMessage::decode(&negative),
            Err(VmsCodecError::NegativeCount { count: -1, .. })
        ));
    }

    #[test]
    fn test_publisher_ids_are_stable() {
        let service = VmsHalService::new(1);
        let request = |info: &str| VmsMessage::PublisherIdRequest {
            publisher_info: info.as_bytes().to_vec(),
        };
        let first = service.handle(request("alpha"));
        let second = service.handle(request("beta"));
        let again = service.handle(request("alpha"));
        let id = |actions: Vec<Action>| match actions.into_iter().next() {
            Some(Action::Send(VmsMessage::PublisherIdResponse { publisher_id })) => publisher_id,
            _ => panic!("expected publisher id response"),
        };
        let (a, b, c) = (id(first), id(second), id(again));
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
