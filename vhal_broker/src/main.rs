//! # Vehicle HAL broker binary
//!
//! Runs the broker and its standard services against the simulated vehicle.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, runs until Ctrl-C
//! vhal_broker
//!
//! # Configuration file, verbose JSON logs, stop after a minute
//! vhal_broker --config broker.toml -v --json --duration-secs 60
//!
//! # Print the property table and exit
//! vhal_broker --list-properties --json
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;
use vhal_broker::services::diagnostic::{DiagnosticFrame, DiagnosticListener};
use vhal_broker::services::input::{InputListener, KeyEvent};
use vhal_broker::services::power::{PowerEventListener, PowerStateRequest};
use vhal_broker::services::property::PropertyHalListener;
use vhal_broker::services::user::{
    InitialUserInfoRequestType, SwitchUserMessageType, SwitchUserRequest, UserFlags,
    UserHalService, UserInfo, UserSwitchHandler, UsersInfo,
};
use vhal_broker::services::vms::{VmsAvailability, VmsClient, VmsLayer};
use vhal_broker::{ServiceSet, SimulatedVehicle, VehicleHal};
use vhal_common::config::BrokerConfig;
use vhal_common::hal::StatusCode;
use vhal_common::property::ids::{self, to_hex};
use vhal_common::property::{AreaId, PropertyId, PropertyValue};

/// Vehicle HAL broker running against a simulated vehicle
#[derive(Parser, Debug)]
#[command(name = "vhal_broker")]
#[command(version)]
#[command(about = "Vehicle HAL broker with domain services")]
#[command(long_about = None)]
struct Args {
    /// Path to the broker configuration (TOML). Built-in defaults when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    /// Print the property table with owners and exit
    #[arg(long)]
    list_properties: bool,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long, value_name = "N")]
    duration_secs: Option<u64>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("Broker startup failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(&args);

    info!("Vehicle HAL broker v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            BrokerConfig::load_validated(path)?
        }
        None => {
            info!("No config given, using defaults");
            BrokerConfig::default()
        }
    };

    let vehicle = Arc::new(SimulatedVehicle::from_config(&config.simulation));
    let core_id = i32::try_from(std::process::id()).unwrap_or(1);
    let services = ServiceSet::new(&config, core_id)?;
    attach_listeners(&services);

    let hal = VehicleHal::new(vehicle.clone(), services.as_list(), &config.transport)?;
    hal.init()?;

    if args.list_properties {
        list_properties(&hal, args.json)?;
        hal.release();
        return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })?;

    start_services(&services, &config);

    let interval = Duration::from_millis(config.simulation.event_interval_ms);
    let deadline = args
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    info!("Broker running, simulation tick every {:?}", interval);
    while running.load(Ordering::SeqCst) && deadline.is_none_or(|d| Instant::now() < d) {
        thread::sleep(interval);
        vehicle.tick();
    }

    let mut report = String::new();
    if hal.dump(&mut report).is_ok() {
        info!("Final state:\n{}", report);
    }
    hal.release();
    info!("Vehicle HAL broker shutdown complete");
    Ok(())
}

/// Kick off the startup handshakes the services support.
fn start_services(services: &ServiceSet, config: &BrokerConfig) {
    if services.power.is_power_state_supported() {
        if let Err(e) = services.power.send_wait_for_vhal() {
            warn!("Failed to report WAIT_FOR_VHAL: {}", e);
        }
    }

    if let Some(user) = services.user.as_ref().filter(|u| u.is_supported()) {
        let users = UsersInfo {
            current_user: UserInfo::new(0, UserFlags::SYSTEM),
            existing_users: vec![UserInfo::new(0, UserFlags::SYSTEM)],
        };
        let result = user.get_initial_user_info(
            InitialUserInfoRequestType::ColdBoot,
            config.user.timeout(),
            &users,
            Box::new(|status, response| match response {
                Some(response) => info!(%status, action = ?response.action, "Initial user info"),
                None => warn!(%status, "Initial user info request failed"),
            }),
        );
        if let Err(e) = result {
            warn!("Initial user info not requested: {}", e);
        }
    }

    for (prop, rate) in [(ids::PERF_VEHICLE_SPEED, 5.0), (ids::FUEL_LEVEL, 1.0)] {
        if let Err(e) = services.property.subscribe_property(prop, rate) {
            warn!(prop = %to_hex(prop), "Subscription failed: {}", e);
        }
    }

    if let Ok(frame) = services.diagnostic.live_frame() {
        info!(
            int_sensors = frame.int_sensors.len(),
            float_sensors = frame.float_sensors.len(),
            "Live diagnostic frame"
        );
    }
}

fn attach_listeners(services: &ServiceSet) {
    let logger = Arc::new(EventLogger);
    services.power.set_listener(logger.clone());
    services.input.set_listener(logger.clone());
    services.diagnostic.set_listener(logger.clone());
    services.property.set_listener(logger.clone());
    services.vms.register_client(logger);
    if let Some(user) = &services.user {
        user.set_switch_handler(Arc::new(AcceptingSwitchHandler {
            user: Arc::downgrade(user),
        }));
    }
}

fn list_properties(hal: &VehicleHal, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let descriptors = hal.registry().descriptors();
    if json {
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(());
    }
    println!("{:<12} {:<10} {:<11} {:<12} owner", "property", "access", "change", "type");
    for d in &descriptors {
        println!(
            "{:<12} {:<10} {:<11} {:<12} {}",
            to_hex(d.prop),
            format!("{:?}", d.access),
            format!("{:?}", d.change_mode),
            format!("{:?}", d.value_type),
            hal.owner_of(d.prop).unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

// ─── Listeners ──────────────────────────────────────────────────────

/// Logs every service notification.
struct EventLogger;

impl PowerEventListener for EventLogger {
    fn on_power_state_request(&self, request: PowerStateRequest) {
        info!(state = ?request.state, param = request.param, "Power state request");
    }

    fn on_display_brightness_change(&self, percent: i32) {
        info!(percent, "Display brightness changed");
    }
}

impl InputListener for EventLogger {
    fn on_key_event(&self, event: KeyEvent) {
        info!(
            action = ?event.action,
            key = event.key_code,
            display = ?event.display,
            repeat = event.repeat_count,
            "Key event"
        );
    }
}

impl DiagnosticListener for EventLogger {
    fn on_diagnostic_frames(&self, frames: Vec<DiagnosticFrame>) {
        for frame in frames {
            info!(kind = ?frame.kind, dtc = %frame.dtc, "Diagnostic frame");
        }
    }
}

impl PropertyHalListener for EventLogger {
    fn on_property_change(&self, values: Vec<PropertyValue>) {
        for value in values {
            tracing::debug!(prop = %to_hex(value.prop), area = value.area_id, "Property changed");
        }
    }

    fn on_property_set_error(&self, prop: PropertyId, area: AreaId, status: StatusCode) {
        warn!(prop = %to_hex(prop), area, %status, "Property write failed");
    }
}

impl VmsClient for EventLogger {
    fn on_vms_message(&self, layer: VmsLayer, publisher_id: i32, payload: &[u8]) {
        info!(?layer, publisher_id, len = payload.len(), "VMS data");
    }

    fn on_layers_availability_changed(&self, availability: &VmsAvailability) {
        info!(
            sequence = availability.sequence,
            layers = availability.associated_layers.len(),
            "VMS availability changed"
        );
    }
}

/// Accepts every vehicle initiated switch.
struct AcceptingSwitchHandler {
    user: Weak<UserHalService>,
}

impl UserSwitchHandler for AcceptingSwitchHandler {
    fn switch_user_from_hal(&self, request_id: i32, target_user_id: i32) {
        let Some(user) = self.user.upgrade() else {
            return;
        };
        info!(request_id, target_user_id, "Switching user on vehicle request");
        let target = UserInfo::new(target_user_id, UserFlags::empty());
        let response = SwitchUserRequest {
            request_id,
            message_type: SwitchUserMessageType::AndroidPostSwitch,
            target_user: target,
            users_info: UsersInfo {
                current_user: target,
                existing_users: vec![UserInfo::new(0, UserFlags::SYSTEM), target],
            },
        };
        if let Err(e) = user.post_switch_response(response) {
            warn!(request_id, "Failed to post switch response: {}", e);
        }
    }
}
