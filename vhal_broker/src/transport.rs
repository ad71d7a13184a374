//! Retrying client over the raw vehicle channel.
//!
//! `get`/`set` retry `TRY_AGAIN` for a bounded wall-clock budget; all other
//! statuses are mapped straight onto [`HalError`]. Subscriptions are issued
//! exactly once.

use std::cell::Cell;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};
use vhal_common::config::TransportConfig;
use vhal_common::hal::{ChannelCallback, ChannelError, HalError, StatusCode, VehicleChannel};
use vhal_common::property::ids::to_hex;
use vhal_common::property::{
    AreaId, GLOBAL_AREA, PropertyDescriptor, PropertyId, PropertyValue, SubscribeOptions,
};

/// Budget and spacing of transient retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wall-clock time after the first attempt in which retries may start.
    pub budget: Duration,
    /// Sleep between two attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Policy with explicit values.
    pub fn new(budget: Duration, interval: Duration) -> Self {
        Self { budget, interval }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for RetryPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self::new(config.retry_budget(), config.retry_interval())
    }
}

/// Map a channel failure onto the broker taxonomy.
pub fn map_channel_error(err: ChannelError, prop: PropertyId, area: AreaId) -> HalError {
    match err {
        ChannelError::Status(StatusCode::InvalidArg) => HalError::InvalidArgument { prop, area },
        ChannelError::Status(status @ (StatusCode::NotAvailable | StatusCode::TryAgain)) => {
            HalError::NotAvailable { prop, area, status }
        }
        ChannelError::Status(status) => HalError::PropertyAccess { prop, area, status },
        ChannelError::Transport(reason) => HalError::Channel(reason),
    }
}

/// Time source of a retry loop.
pub trait RetryClock {
    /// Time since the first attempt started.
    fn elapsed(&self) -> Duration;

    /// Wait `duration` before the next attempt.
    fn sleep(&self, duration: Duration);
}

impl<C: RetryClock + ?Sized> RetryClock for &C {
    fn elapsed(&self) -> Duration {
        (**self).elapsed()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Real time, measured from [`SystemClock::start`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    /// Start measuring now.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl RetryClock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Clock that only moves when told to. Sleeping advances it instantly.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Duration>,
    slept: Cell<Duration>,
}

impl ManualClock {
    /// Clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `duration` pass, e.g. the latency of a channel call.
    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }

    /// Sum of all sleeps so far.
    pub fn slept(&self) -> Duration {
        self.slept.get()
    }
}

impl RetryClock for ManualClock {
    fn elapsed(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.slept.set(self.slept.get() + duration);
        self.advance(duration);
    }
}

/// Run `op` until it stops answering `TRY_AGAIN` or the budget is spent.
///
/// A retry is only started if it begins within `policy.budget` of the first
/// attempt, counting both sleeps and the time spent inside `op`. The whole
/// loop therefore ends within `budget` plus the latency of one call.
pub fn retry_transient<T>(
    policy: &RetryPolicy,
    prop: PropertyId,
    area: AreaId,
    clock: impl RetryClock,
    mut op: impl FnMut() -> Result<T, ChannelError>,
) -> Result<T, HalError> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(ChannelError::Status(StatusCode::TryAgain)) => {
                let elapsed = clock.elapsed();
                if policy.interval.is_zero() || elapsed + policy.interval > policy.budget {
                    warn!(
                        prop = %to_hex(prop),
                        area,
                        attempts,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Transient status persisted past the retry budget"
                    );
                    return Err(HalError::NotAvailable {
                        prop,
                        area,
                        status: StatusCode::TryAgain,
                    });
                }
                clock.sleep(policy.interval);
            }
            Err(err) => return Err(map_channel_error(err, prop, area)),
        }
    }
}

/// Client of one vehicle channel.
pub struct TransportClient {
    channel: Arc<dyn VehicleChannel>,
    callback: Arc<dyn ChannelCallback>,
    policy: RetryPolicy,
}

impl TransportClient {
    /// Wrap `channel`. Notifications go to `callback`.
    pub fn new(
        channel: Arc<dyn VehicleChannel>,
        callback: Arc<dyn ChannelCallback>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            channel,
            callback,
            policy,
        }
    }

    /// Retry policy in use.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Fetch every descriptor. Not retried: a failure here aborts startup.
    pub fn get_all_descriptors(&self) -> Result<Vec<PropertyDescriptor>, HalError> {
        self.channel.get_all_prop_configs().map_err(|e| {
            error!("Cannot fetch property configs: {}", e);
            HalError::InitFailed(format!("cannot fetch property configs: {e}"))
        })
    }

    /// Read `prop`/`area`.
    pub fn get(&self, prop: PropertyId, area: AreaId) -> Result<PropertyValue, HalError> {
        self.get_value(&PropertyValue::request(prop, area))
    }

    /// Read with a full request value (used by request-style properties).
    pub fn get_value(&self, request: &PropertyValue) -> Result<PropertyValue, HalError> {
        retry_transient(
            &self.policy,
            request.prop,
            request.area_id,
            SystemClock::start(),
            || self.channel.get(request),
        )
    }

    /// Write a value.
    pub fn set(&self, value: &PropertyValue) -> Result<(), HalError> {
        retry_transient(
            &self.policy,
            value.prop,
            value.area_id,
            SystemClock::start(),
            || self.channel.set(value),
        )
    }

    /// Subscribe, single attempt.
    pub fn subscribe(&self, options: &[SubscribeOptions]) -> Result<(), HalError> {
        if options.is_empty() {
            return Ok(());
        }
        debug!("Subscribing {} properties", options.len());
        self.channel
            .subscribe(Arc::clone(&self.callback), options)
            .map_err(|e| {
                let prop = options[0].prop;
                error!(prop = %to_hex(prop), "Subscribe failed: {}", e);
                map_channel_error(e, prop, GLOBAL_AREA)
            })
    }

    /// Unsubscribe, single attempt.
    pub fn unsubscribe(&self, prop: PropertyId) -> Result<(), HalError> {
        self.channel
            .unsubscribe(Arc::clone(&self.callback), prop)
            .map_err(|e| {
                error!(prop = %to_hex(prop), "Unsubscribe failed: {}", e);
                map_channel_error(e, prop, GLOBAL_AREA)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vhal_common::property::ids;

    fn policy(budget_ms: u64, interval_ms: u64) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(budget_ms),
            Duration::from_millis(interval_ms),
        )
    }

    #[test]
    fn test_success_after_transient() {
        let clock = ManualClock::new();
        let mut remaining = 3;
        let result = retry_transient(
            &policy(2000, 50),
            ids::PERF_VEHICLE_SPEED,
            0,
            &clock,
            || {
                if remaining > 0 {
                    remaining -= 1;
                    Err(ChannelError::Status(StatusCode::TryAgain))
                } else {
                    Ok(7)
                }
            },
        );
        assert_eq!(result, Ok(7));
        assert_eq!(clock.slept(), Duration::from_millis(150));
    }

    #[test]
    fn test_budget_exhausted_maps_to_not_available() {
        let clock = ManualClock::new();
        let mut calls = 0;
        let result: Result<(), HalError> = retry_transient(
            &policy(200, 50),
            ids::FUEL_LEVEL,
            0,
            &clock,
            || {
                calls += 1;
                Err(ChannelError::Status(StatusCode::TryAgain))
            },
        );
        assert!(matches!(
            result,
            Err(HalError::NotAvailable {
                status: StatusCode::TryAgain,
                ..
            })
        ));
        assert_eq!(clock.slept(), Duration::from_millis(200));
        assert_eq!(calls, 5);
    }

    #[test]
    fn test_call_latency_counts_against_budget() {
        // Each call takes 100ms: 0..100, sleep, 150..250, then 250 + 50 > 200.
        let clock = ManualClock::new();
        let latency = Duration::from_millis(100);
        let mut calls = 0;
        let result: Result<(), HalError> = retry_transient(
            &policy(200, 50),
            ids::FUEL_LEVEL,
            0,
            &clock,
            || {
                calls += 1;
                clock.advance(latency);
                Err(ChannelError::Status(StatusCode::TryAgain))
            },
        );
        assert!(matches!(result, Err(HalError::NotAvailable { .. })));
        assert_eq!(calls, 2);
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
        assert!(clock.elapsed() <= Duration::from_millis(200) + latency);
    }

    #[test]
    fn test_invalid_arg_not_retried() {
        let clock = ManualClock::new();
        let mut calls = 0;
        let result: Result<(), HalError> = retry_transient(
            &policy(2000, 50),
            ids::DOOR_LOCK,
            1,
            &clock,
            || {
                calls += 1;
                Err(ChannelError::Status(StatusCode::InvalidArg))
            },
        );
        assert_eq!(
            result,
            Err(HalError::InvalidArgument {
                prop: ids::DOOR_LOCK,
                area: 1
            })
        );
        assert_eq!(calls, 1);
        assert_eq!(clock.slept(), Duration::ZERO);
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_channel_error(StatusCode::AccessDenied.into(), 1, 0),
            HalError::PropertyAccess {
                status: StatusCode::AccessDenied,
                ..
            }
        ));
        assert!(matches!(
            map_channel_error(StatusCode::NotAvailable.into(), 1, 0),
            HalError::NotAvailable { .. }
        ));
        assert!(matches!(
            map_channel_error(ChannelError::Transport("dead".into()), 1, 0),
            HalError::Channel(_)
        ));
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.budget, Duration::from_millis(2000));
        assert_eq!(policy.interval, Duration::from_millis(50));
    }
}
