//! Bridge Shelly Pro energy meters onto a Victron-style service bus.
//!
//! One physical meter is classified into one or more logical metering
//! channels, each published as its own bus service with a fixed point
//! schema. User configuration (role, position, phase assignment) lives in
//! an external settings store; critical changes restart the device group.

pub mod config;
pub mod meter;
pub mod service;
pub mod settings;
pub mod transport;

// Re-export the types most callers need
pub use config::Config;
pub use meter::{MeterChannel, MeterError, PhysicalMeter, SingleMeter, ThreePhaseMeter};
pub use service::MetricService;
pub use settings::{SettingsService, StoreLink};
pub use transport::ShellyManager;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROCESS_NAME: &str = "shelly2dbus";
