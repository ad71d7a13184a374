//! Domain services built on the router.
//!
//! | Service      | Properties                                  | Ownership |
//! |--------------|---------------------------------------------|-----------|
//! | `power`      | `AP_POWER_*`, `DISPLAY_BRIGHTNESS`          | explicit  |
//! | `input`      | `HW_KEY_INPUT`                              | explicit  |
//! | `user`       | user lifecycle and identification           | explicit  |
//! | `diagnostic` | `OBD2_*`                                    | explicit  |
//! | `vms`        | `VEHICLE_MAP_SERVICE`                       | explicit  |
//! | `property`   | everything else with a policy, vendor group | wildcard  |

pub mod diagnostic;
pub mod input;
pub mod power;
pub mod property;
pub mod user;
pub mod vms;

use std::sync::Arc;

use vhal_common::config::BrokerConfig;
use vhal_common::hal::HalError;

use crate::service::HalService;

use self::diagnostic::DiagnosticHalService;
use self::input::InputHalService;
use self::power::PowerHalService;
use self::property::PropertyHalService;
use self::user::UserHalService;
use self::vms::VmsHalService;

/// The standard set of services, with typed handles kept for the caller.
pub struct ServiceSet {
    /// Power management.
    pub power: Arc<PowerHalService>,
    /// Key input.
    pub input: Arc<InputHalService>,
    /// User HAL; absent when disabled in the configuration.
    pub user: Option<Arc<UserHalService>>,
    /// OBD2 diagnostics.
    pub diagnostic: Arc<DiagnosticHalService>,
    /// VMS bridge.
    pub vms: Arc<VmsHalService>,
    /// Generic passthrough.
    pub property: Arc<PropertyHalService>,
}

impl ServiceSet {
    /// Build every service from the configuration. `vms_core_id` identifies
    /// this side of VMS sessions.
    pub fn new(config: &BrokerConfig, vms_core_id: i32) -> Result<Self, HalError> {
        let user = if config.user.enabled {
            Some(Arc::new(UserHalService::from_config(&config.user)?))
        } else {
            None
        };
        Ok(Self {
            power: Arc::new(PowerHalService::new()),
            input: Arc::new(InputHalService::new()),
            user,
            diagnostic: Arc::new(DiagnosticHalService::new()),
            vms: Arc::new(VmsHalService::new(vms_core_id)),
            property: Arc::new(PropertyHalService::new()),
        })
    }

    /// Services in registration order, the wildcard service last.
    pub fn as_list(&self) -> Vec<Arc<dyn HalService>> {
        let mut list: Vec<Arc<dyn HalService>> = vec![self.power.clone(), self.input.clone()];
        if let Some(user) = &self.user {
            list.push(user.clone());
        }
        list.push(self.diagnostic.clone());
        list.push(self.vms.clone());
        list.push(self.property.clone());
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_registered_last() {
        let set = ServiceSet::new(&BrokerConfig::default(), 1).unwrap();
        let names: Vec<String> = set.as_list().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["power", "input", "user", "diagnostic", "vms", "property"]);
    }

    #[test]
    fn test_user_service_optional() {
        let mut config = BrokerConfig::default();
        config.user.enabled = false;
        let set = ServiceSet::new(&config, 1).unwrap();
        assert!(set.user.is_none());
        assert_eq!(set.as_list().len(), 5);
    }
}
