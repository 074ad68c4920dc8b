//! Meter channels and their lifecycle.
//!
//! One physical Shelly device turns into one or more logical channels on
//! the bus, depending on its model and profile. A channel walks through
//! `Unconfigured -> Configuring -> Active -> Destroyed`; `Destroyed` is
//! terminal. Critical configuration changes (role, VRM instance) are not
//! applied in place: the channel destroys itself and the supervisor re-runs
//! classification from a fresh handshake.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::service::{MetricItem, MetricService};
use crate::settings::SettingValue;

pub mod group;
pub mod single;
pub mod three_phase;
pub mod units;

pub use group::PhysicalMeter;
pub use single::SingleMeter;
pub use three_phase::ThreePhaseMeter;

/// How long to wait for the settings store before giving up on a channel.
pub const SETTINGS_TIMEOUT: Duration = Duration::from_secs(5);

pub const PRODUCT_ID: i64 = 0xB034;
pub const PRODUCT_NAME: &str = "Shelly energy meter";
pub const ALLOWED_ROLES: [&str; 4] = ["grid", "pvinverter", "genset", "acload"];
pub const DEFAULT_ROLE_INSTANCE: &str = "grid:40";

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("Unsupported device model {model}/{app}")]
    UnsupportedDevice { model: String, app: String },
    #[error("Handshake is missing field {0}")]
    MissingField(&'static str),
    #[error("Settings store did not become available")]
    SettingsUnavailable,
    #[error("Malformed setting value: {0}")]
    InvalidSetting(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unconfigured,
    Configuring,
    Active,
    Destroyed,
}

/// Identity block from the Shelly.GetDeviceInfo handshake.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub mac: String,
    pub fw_id: String,
    pub model: String,
    pub app: String,
    pub name: Option<String>,
    pub profile: Option<String>,
}

impl DeviceInfo {
    pub fn from_frame(frame: &Value) -> Result<Self, MeterError> {
        let result = frame.get("result").ok_or(MeterError::MissingField("result"))?;
        let text = |field: &'static str| -> Result<String, MeterError> {
            result
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(MeterError::MissingField(field))
        };

        Ok(DeviceInfo {
            mac: text("mac")?,
            fw_id: text("fw_id")?,
            model: text("model")?,
            app: text("app")?,
            name: result.get("name").and_then(Value::as_str).map(str::to_string),
            profile: result.get("profile").and_then(Value::as_str).map(str::to_string),
        })
    }
}

/// Split a combined `"role:instance"` setting.
pub fn role_instance(value: &str) -> Result<(String, i64), MeterError> {
    let (role, instance) = value
        .split_once(':')
        .ok_or_else(|| MeterError::InvalidSetting(value.to_string()))?;
    let instance = instance
        .parse::<i64>()
        .map_err(|_| MeterError::InvalidSetting(value.to_string()))?;
    if instance < 0 {
        return Err(MeterError::InvalidSetting(value.to_string()));
    }
    Ok((role.to_string(), instance))
}

pub(crate) fn field_f64(block: &Value, key: &str) -> Option<f64> {
    block.get(key).and_then(Value::as_f64)
}

/// Build the service with the point set every channel variant shares.
pub(crate) fn base_service(
    name: &str,
    device: &DeviceInfo,
    connection: &str,
    role: &str,
    instance: i64,
    phase: i64,
    custom_name: Option<String>,
) -> MetricService {
    let mut service = MetricService::new(name);

    service.add_item("/Mgmt/ProcessName",
        MetricItem::text(Some(crate::PROCESS_NAME.to_string())));
    service.add_item("/Mgmt/ProcessVersion",
        MetricItem::text(Some(crate::VERSION.to_string())));
    service.add_item("/Mgmt/Connection", MetricItem::text(Some(connection.to_string())));
    service.add_item("/DeviceInstance", MetricItem::integer(Some(instance)));
    service.add_item("/ProductId",
        MetricItem::integer(Some(PRODUCT_ID)).format(units::unit_product_id));
    service.add_item("/ProductName", MetricItem::text(Some(PRODUCT_NAME.to_string())));
    if let Some(custom_name) = custom_name {
        service.add_item("/CustomName", MetricItem::text(Some(custom_name)));
    }
    service.add_item("/FirmwareVersion", MetricItem::text(Some(device.fw_id.clone())));
    service.add_item("/Connected", MetricItem::integer(Some(1)));
    service.add_item("/RefreshTime", MetricItem::integer(Some(100)));

    service.add_item("/AllowedRoles",
        MetricItem::text_array(ALLOWED_ROLES.iter().map(|r| r.to_string()).collect()));
    service.add_item("/Role", MetricItem::text(Some(role.to_string())).writeable());
    service.add_item("/Phase", MetricItem::integer(Some(phase)).writeable());

    service.add_item("/Ac/Energy/Forward", MetricItem::double(None).format(units::unit_kwh));
    service.add_item("/Ac/Energy/Reverse", MetricItem::double(None).format(units::unit_kwh));
    service.add_item("/Ac/Power", MetricItem::double(None).format(units::unit_watt));

    service
}

/// Add the measurement points for one logical line.
pub(crate) fn add_line_points(service: &mut MetricService, line: i64) {
    let prefix = format!("/Ac/L{}", line);
    service.add_item(&format!("{}/Voltage", prefix),
        MetricItem::double(None).format(units::unit_volt));
    service.add_item(&format!("{}/Current", prefix),
        MetricItem::double(None).format(units::unit_amp));
    service.add_item(&format!("{}/Power", prefix),
        MetricItem::double(None).format(units::unit_watt));
    service.add_item(&format!("{}/Energy/Forward", prefix),
        MetricItem::double(None).format(units::unit_kwh));
    service.add_item(&format!("{}/Energy/Reverse", prefix),
        MetricItem::double(None).format(units::unit_kwh));
}

pub(crate) fn remove_line_points(service: &mut MetricService, line: i64) {
    let prefix = format!("/Ac/L{}", line);
    for suffix in ["/Voltage", "/Current", "/Power", "/Energy/Forward", "/Energy/Reverse"] {
        service.remove_item(&format!("{}{}", prefix, suffix));
    }
}

/// The two channel shapes, dispatched as a tagged variant.
pub enum MeterChannel {
    Single(SingleMeter),
    ThreePhase(ThreePhaseMeter),
}

impl MeterChannel {
    pub async fn configure(
        &mut self,
        device: &DeviceInfo,
        connection: &str,
    ) -> Result<(), MeterError> {
        match self {
            MeterChannel::Single(m) => m.configure(device, connection).await,
            MeterChannel::ThreePhase(m) => m.configure(device, connection).await,
        }
    }

    pub fn ingest(&mut self, key: &str, block: &Value) {
        match self {
            MeterChannel::Single(m) => m.ingest(key, block),
            MeterChannel::ThreePhase(m) => m.ingest(key, block),
        }
    }

    /// Dispatch a write to one of the writeable points. Returns whether the
    /// write was accepted.
    pub fn handle_write(&mut self, path: &str, value: &SettingValue) -> bool {
        match self {
            MeterChannel::Single(m) => m.handle_write(path, value),
            MeterChannel::ThreePhase(m) => m.handle_write(path, value),
        }
    }

    pub fn settings_changed(&mut self, path: &str) {
        match self {
            MeterChannel::Single(m) => m.settings_changed(path),
            MeterChannel::ThreePhase(m) => m.settings_changed(path),
        }
    }

    pub fn destroy(&mut self) {
        match self {
            MeterChannel::Single(m) => m.destroy(),
            MeterChannel::ThreePhase(m) => m.destroy(),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        match self {
            MeterChannel::Single(m) => m.is_destroyed(),
            MeterChannel::ThreePhase(m) => m.is_destroyed(),
        }
    }

    pub fn service(&self) -> Option<&MetricService> {
        match self {
            MeterChannel::Single(m) => m.service(),
            MeterChannel::ThreePhase(m) => m.service(),
        }
    }
}
