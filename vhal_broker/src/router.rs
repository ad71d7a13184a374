//! Central router between the vehicle channel and the domain services.
//!
//! `VehicleHal` owns the transport client, the property registry and the
//! dispatch queue. It decides which service owns each property, subscribes on
//! the services' behalf and fans event batches out to the owners.
//!
//! ```text
//!        services (priority order)
//!   ┌───────┬───────┬──────┬────────┐
//!   │ power │ input │ user │ ... *  │   * = wildcard services
//!   └───┬───┴───┬───┴──┬───┴───┬────┘
//!       │ HalContext (ownership checked)
//!   ┌───▼──────────────────────────────┐      ┌──────────────┐
//!   │ VehicleHal                       │◄─────│ vhal-dispatch│
//!   │  ownership · subscriptions       │      └──────▲───────┘
//!   └───┬──────────────────────────────┘             │
//!       ▼                                            │
//!   TransportClient ──────► VehicleChannel ──────────┘ callbacks
//! ```
//!
//! Lock order: the router state lock may be taken before a service buffer
//! lock, never the other way round. No lock is held while a service callback
//! runs.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vhal_common::config::TransportConfig;
use vhal_common::hal::{HalError, StatusCode, VehicleChannel};
use vhal_common::property::ids::to_hex;
use vhal_common::property::{
    AreaId, PropertyDescriptor, PropertyId, PropertyValue, SubscribeFlags, SubscribeOptions,
};

use crate::dispatch::{DispatchQueue, HalListener};
use crate::registry::PropertyRegistry;
use crate::service::{HalContext, HalService, ServiceId, SupportedProperties};
use crate::transport::{RetryPolicy, TransportClient};

/// Active subscription of one property.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscriptionEntry {
    /// Clamped sample rate.
    pub sample_rate: f32,
    /// Event sources.
    pub flags: SubscribeFlags,
}

struct ServiceSlot {
    service: Arc<dyn HalService>,
    pending_events: Mutex<Vec<PropertyValue>>,
}

struct RouterState {
    transport: Arc<TransportClient>,
    ownership: HashMap<PropertyId, ServiceId>,
    subscriptions: HashMap<PropertyId, SubscriptionEntry>,
    initialized: bool,
}

/// The vehicle HAL broker.
pub struct VehicleHal {
    this: Weak<VehicleHal>,
    registry: Arc<PropertyRegistry>,
    services: Vec<ServiceSlot>,
    dispatch: DispatchQueue,
    policy: RetryPolicy,
    state: Mutex<RouterState>,
}

impl VehicleHal {
    /// Build the router and start its dispatch thread.
    ///
    /// `services` are given in priority order: explicit claims are checked in
    /// this order and wildcard services are offered leftovers in this order.
    pub fn new(
        channel: Arc<dyn VehicleChannel>,
        services: Vec<Arc<dyn HalService>>,
        config: &TransportConfig,
    ) -> Result<Arc<Self>, HalError> {
        config
            .validate()
            .map_err(|e| HalError::Config(e.to_string()))?;
        let policy = RetryPolicy::from(config);
        let dispatch = DispatchQueue::new();
        let transport = Arc::new(TransportClient::new(channel, dispatch.callback(), policy));

        let hal = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            registry: Arc::new(PropertyRegistry::new()),
            services: services
                .into_iter()
                .map(|service| ServiceSlot {
                    service,
                    pending_events: Mutex::new(Vec::new()),
                })
                .collect(),
            dispatch,
            policy,
            state: Mutex::new(RouterState {
                transport,
                ownership: HashMap::new(),
                subscriptions: HashMap::new(),
                initialized: false,
            }),
        });

        let listener: Weak<dyn HalListener> = Arc::downgrade(&hal) as Weak<dyn HalListener>;
        hal.dispatch.start(listener)?;
        Ok(hal)
    }

    /// Fetch descriptors, assign ownership and start every service.
    ///
    /// # Errors
    /// - descriptor fetch failure (fatal)
    /// - `HalError::OwnershipConflict` when two services claim one property
    /// - the first service `init` error
    pub fn init(&self) -> Result<(), HalError> {
        info!("Initializing vehicle HAL with {} services", self.services.len());
        let transport = self.transport();
        let descriptors = transport.get_all_descriptors()?;
        info!("Vehicle exposes {} properties", descriptors.len());
        self.registry.populate(descriptors.clone());

        let (ownership, owned) = self.assign_ownership(&descriptors)?;
        {
            let mut state = self.state.lock();
            state.ownership = ownership;
            state.initialized = true;
        }

        for (id, (slot, properties)) in self.services.iter().zip(owned).enumerate() {
            debug!(
                "Service '{}' owns {} properties",
                slot.service.name(),
                properties.len()
            );
            slot.service
                .take_properties(HalContext::new(self.this.clone(), id), properties);
            slot.service.init()?;
        }

        info!("Vehicle HAL initialized");
        Ok(())
    }

    fn assign_ownership(
        &self,
        descriptors: &[PropertyDescriptor],
    ) -> Result<(HashMap<PropertyId, ServiceId>, Vec<Vec<PropertyDescriptor>>), HalError> {
        let by_id: HashMap<PropertyId, &PropertyDescriptor> =
            descriptors.iter().map(|d| (d.prop, d)).collect();
        let mut ownership: HashMap<PropertyId, ServiceId> = HashMap::new();
        let mut owned: Vec<Vec<PropertyDescriptor>> = vec![Vec::new(); self.services.len()];

        for (id, slot) in self.services.iter().enumerate() {
            let SupportedProperties::Explicit(claims) = slot.service.supported_properties() else {
                continue;
            };
            for prop in claims {
                let Some(descriptor) = by_id.get(&prop) else {
                    debug!(
                        "Service '{}' supports {} but the vehicle does not",
                        slot.service.name(),
                        to_hex(prop)
                    );
                    continue;
                };
                if !slot.service.is_supported_property(descriptor) {
                    continue;
                }
                match ownership.get(&prop) {
                    Some(&first) if first != id => {
                        return Err(HalError::OwnershipConflict {
                            prop,
                            first: self.services[first].service.name().to_string(),
                            second: slot.service.name().to_string(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        ownership.insert(prop, id);
                        owned[id].push((*descriptor).clone());
                    }
                }
            }
        }

        for descriptor in descriptors {
            if ownership.contains_key(&descriptor.prop) {
                continue;
            }
            let wildcard = self.services.iter().enumerate().find(|(_, slot)| {
                slot.service.supported_properties() == SupportedProperties::Any
                    && slot.service.is_supported_property(descriptor)
            });
            match wildcard {
                Some((id, _)) => {
                    ownership.insert(descriptor.prop, id);
                    owned[id].push(descriptor.clone());
                }
                None => debug!("No service for property {}", to_hex(descriptor.prop)),
            }
        }

        Ok((ownership, owned))
    }

    fn transport(&self) -> Arc<TransportClient> {
        Arc::clone(&self.state.lock().transport)
    }

    fn check_owner(
        &self,
        state: &RouterState,
        service: ServiceId,
        prop: PropertyId,
    ) -> Result<(), HalError> {
        if !state.initialized {
            return Err(HalError::NotInitialized("vehicle HAL".to_string()));
        }
        match state.ownership.get(&prop) {
            Some(&owner) if owner == service => Ok(()),
            _ if self.registry.get(prop).is_none() => Err(HalError::Unsupported(prop)),
            _ => Err(HalError::NotOwner {
                service: self.service_name(service),
                prop,
            }),
        }
    }

    fn service_name(&self, service: ServiceId) -> String {
        self.services
            .get(service)
            .map(|slot| slot.service.name().to_string())
            .unwrap_or_else(|| format!("#{service}"))
    }

    /// Subscribe `prop` on behalf of `service`.
    ///
    /// The rate is clamped into the descriptor's sample rate range. Re-issuing
    /// an identical subscription is a no-op.
    pub fn subscribe_property(
        &self,
        service: ServiceId,
        prop: PropertyId,
        sample_rate: f32,
        flags: SubscribeFlags,
    ) -> Result<(), HalError> {
        let mut state = self.state.lock();
        self.check_owner(&state, service, prop)?;
        let descriptor = self.registry.get(prop).ok_or(HalError::Unsupported(prop))?;
        if !PropertyRegistry::is_subscribable(descriptor) {
            return Err(HalError::NotSubscribable(prop));
        }

        let entry = SubscriptionEntry {
            sample_rate: descriptor.clamp_sample_rate(sample_rate),
            flags,
        };
        if state.subscriptions.get(&prop) == Some(&entry) {
            debug!(prop = %to_hex(prop), "Subscription unchanged");
            return Ok(());
        }

        state.transport.subscribe(&[SubscribeOptions {
            prop,
            sample_rate: entry.sample_rate,
            flags: entry.flags,
        }])?;
        state.subscriptions.insert(prop, entry);
        debug!(
            prop = %to_hex(prop),
            rate = entry.sample_rate,
            "Subscribed for '{}'",
            self.service_name(service)
        );
        Ok(())
    }

    /// Drop the subscription of `prop`. Unknown subscriptions are ignored.
    pub fn unsubscribe_property(&self, service: ServiceId, prop: PropertyId) -> Result<(), HalError> {
        let mut state = self.state.lock();
        self.check_owner(&state, service, prop)?;
        if state.subscriptions.remove(&prop).is_none() {
            return Ok(());
        }
        state.transport.unsubscribe(prop)
    }

    /// Read `prop`/`area` on behalf of `service`.
    pub fn get_property(
        &self,
        service: ServiceId,
        prop: PropertyId,
        area: AreaId,
    ) -> Result<PropertyValue, HalError> {
        self.get_value(service, &PropertyValue::request(prop, area))
    }

    /// Read with a full request value on behalf of `service`.
    pub fn get_value(
        &self,
        service: ServiceId,
        request: &PropertyValue,
    ) -> Result<PropertyValue, HalError> {
        let transport = {
            let state = self.state.lock();
            self.check_owner(&state, service, request.prop)?;
            Arc::clone(&state.transport)
        };
        transport.get_value(request)
    }

    /// Write on behalf of `service`.
    pub fn set_property(&self, service: ServiceId, value: &PropertyValue) -> Result<(), HalError> {
        let transport = {
            let state = self.state.lock();
            self.check_owner(&state, service, value.prop)?;
            Arc::clone(&state.transport)
        };
        transport.set(value)
    }

    /// Switch to a new channel and re-issue every subscription on it.
    /// Services keep running unaware.
    ///
    /// The previous channel is retired first: its callbacks stop reaching the
    /// services, including anything it queued before the switch, and its
    /// subscriptions are dropped on a best-effort basis.
    pub fn reconnect(&self, channel: Arc<dyn VehicleChannel>) -> Result<(), HalError> {
        let transport = Arc::new(TransportClient::new(
            channel,
            self.dispatch.next_generation(),
            self.policy,
        ));
        let mut state = self.state.lock();
        let retired = mem::replace(&mut state.transport, Arc::clone(&transport));
        let mut options: Vec<SubscribeOptions> = state
            .subscriptions
            .iter()
            .map(|(&prop, entry)| SubscribeOptions {
                prop,
                sample_rate: entry.sample_rate,
                flags: entry.flags,
            })
            .collect();
        options.sort_by_key(|o| o.prop);

        for option in &options {
            if let Err(e) = retired.unsubscribe(option.prop) {
                debug!(prop = %to_hex(option.prop), "Retired channel unsubscribe failed: {}", e);
            }
        }
        info!("Channel reconnected, re-issuing {} subscriptions", options.len());
        transport.subscribe(&options)
    }

    /// Release services in reverse order, drop all subscriptions and stop
    /// dispatching.
    pub fn release(&self) {
        info!("Releasing vehicle HAL");
        for slot in self.services.iter().rev() {
            slot.service.release();
        }

        {
            let mut state = self.state.lock();
            let subscriptions: Vec<PropertyId> = state.subscriptions.drain().map(|(p, _)| p).collect();
            for prop in subscriptions {
                if let Err(e) = state.transport.unsubscribe(prop) {
                    warn!("Failed to unsubscribe {} on release: {}", to_hex(prop), e);
                }
            }
            state.ownership.clear();
            state.initialized = false;
        }

        self.dispatch.shutdown();
        info!("Vehicle HAL released");
    }

    /// Descriptor of `prop`.
    pub fn property_config(&self, prop: PropertyId) -> Option<PropertyDescriptor> {
        self.registry.get(prop).cloned()
    }

    /// Shared registry.
    pub fn registry(&self) -> Arc<PropertyRegistry> {
        Arc::clone(&self.registry)
    }

    /// True if `prop` exists and can be subscribed.
    pub fn is_property_subscribable(&self, prop: PropertyId) -> bool {
        self.registry
            .get(prop)
            .is_some_and(PropertyRegistry::is_subscribable)
    }

    /// Owner name of `prop`, if assigned.
    pub fn owner_of(&self, prop: PropertyId) -> Option<String> {
        let owner = self.state.lock().ownership.get(&prop).copied()?;
        Some(self.service_name(owner))
    }

    /// Snapshot of the subscription table.
    pub fn subscriptions(&self) -> HashMap<PropertyId, SubscriptionEntry> {
        self.state.lock().subscriptions.clone()
    }

    /// Wait until every notification received so far was dispatched.
    pub fn sync_dispatch(&self) {
        self.dispatch.sync();
    }

    /// Human readable state.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "**dump VehicleHal**")?;
        writeln!(out, "Properties: {}", self.registry.len())?;
        {
            let state = self.state.lock();
            let mut counts = vec![0usize; self.services.len()];
            for owner in state.ownership.values() {
                counts[*owner] += 1;
            }
            for (slot, count) in self.services.iter().zip(&counts) {
                writeln!(out, "  service '{}': {} properties", slot.service.name(), count)?;
            }
            let mut subscribed: Vec<_> = state.subscriptions.iter().collect();
            subscribed.sort_by_key(|(prop, _)| **prop);
            writeln!(out, "Subscriptions: {}", subscribed.len())?;
            for (prop, entry) in subscribed {
                writeln!(
                    out,
                    "  {} rate={} flags={:?}",
                    to_hex(*prop),
                    entry.sample_rate,
                    entry.flags
                )?;
            }
        }
        for slot in &self.services {
            slot.service.dump(out)?;
        }
        Ok(())
    }
}

impl HalListener for VehicleHal {
    fn on_property_events(&self, values: Vec<PropertyValue>) {
        let mut touched = vec![false; self.services.len()];
        {
            let state = self.state.lock();
            for value in values {
                match state.ownership.get(&value.prop) {
                    Some(&owner) => {
                        self.services[owner].pending_events.lock().push(value);
                        touched[owner] = true;
                    }
                    None => warn!("Dropping event for unowned property {}", to_hex(value.prop)),
                }
            }
        }

        for (slot, _) in self.services.iter().zip(touched).filter(|(_, t)| *t) {
            let batch = mem::take(&mut *slot.pending_events.lock());
            if !batch.is_empty() {
                slot.service.on_events(&batch);
            }
        }
    }

    fn on_property_set(&self, value: PropertyValue) {
        debug!(
            prop = %to_hex(value.prop),
            area = value.area_id,
            "Property set acknowledged"
        );
    }

    fn on_property_set_error(&self, status: StatusCode, prop: PropertyId, area: AreaId) {
        let owner = self.state.lock().ownership.get(&prop).copied();
        match owner {
            Some(owner) => {
                warn!(prop = %to_hex(prop), area, %status, "Property set failed");
                self.services[owner]
                    .service
                    .on_property_set_error(prop, area, status);
            }
            None => warn!(
                "Set error {} for unowned property {} area {}",
                status,
                to_hex(prop),
                area
            ),
        }
    }
}

impl fmt::Debug for VehicleHal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VehicleHal")
            .field("services", &self.services.len())
            .field("properties", &self.registry.len())
            .finish()
    }
}
