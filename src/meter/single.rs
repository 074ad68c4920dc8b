//! Single-phase metering channel.
//!
//! Used for both channels of a Pro EM and for a Pro 3EM running the
//! monophase profile. Each channel reports on exactly one configurable
//! phase line.

use log::{error, info};
use serde_json::Value;
use std::sync::Arc;

use crate::meter::{
    add_line_points, base_service, field_f64, remove_line_points, role_instance, units,
    ChannelState, DeviceInfo, MeterError, ALLOWED_ROLES, DEFAULT_ROLE_INSTANCE,
    SETTINGS_TIMEOUT,
};
use crate::service::{MetricItem, MetricService};
use crate::settings::{Setting, SettingValue, SettingsService};

pub struct SingleMeter {
    meter_id: usize,
    state: ChannelState,
    /// Which physical phase line this meter is wired to (1..=3).
    phase: i64,
    settings: Arc<SettingsService>,
    setting_prefix: String,
    service: Option<MetricService>,
}

impl SingleMeter {
    pub fn new(settings: Arc<SettingsService>, meter_id: usize) -> Self {
        SingleMeter {
            meter_id,
            state: ChannelState::Unconfigured,
            phase: 1,
            settings,
            setting_prefix: String::new(),
            service: None,
        }
    }

    fn instance_path(&self) -> String {
        format!("{}/ClassAndVrmInstance", self.setting_prefix)
    }

    fn position_path(&self) -> String {
        format!("{}/Position", self.setting_prefix)
    }

    fn phase_path(&self) -> String {
        format!("{}/Phase", self.setting_prefix)
    }

    pub async fn configure(
        &mut self,
        device: &DeviceInfo,
        connection: &str,
    ) -> Result<(), MeterError> {
        self.state = ChannelState::Configuring;
        self.setting_prefix =
            format!("/Settings/Devices/shelly_{}_{}", device.mac, self.meter_id);

        info!("Waiting for localsettings");
        if !self.settings.wait_until_ready(SETTINGS_TIMEOUT).await {
            error!("Failed to connect to localsettings");
            self.destroy();
            return Err(MeterError::SettingsUnavailable);
        }

        self.settings.add_settings(&[
            Setting::text(&self.instance_path(), DEFAULT_ROLE_INSTANCE),
            Setting::int(&self.position_path(), 0, 0, 2),
            Setting::int(&self.phase_path(), 1, 1, 3),
        ]);

        let combined = self
            .settings
            .get(&self.instance_path())
            .and_then(|v| v.as_text().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_ROLE_INSTANCE.to_string());
        let (role, instance) = match role_instance(&combined) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.destroy();
                return Err(e);
            }
        };

        self.phase = self
            .settings
            .get(&self.phase_path())
            .and_then(|v| v.as_i64())
            .unwrap_or(1);

        let service_name =
            format!("com.victronenergy.{}.shelly_{}_{}", role, device.mac, self.meter_id);
        let custom_name = device
            .name
            .as_ref()
            .map(|n| format!("{}_{}", n, self.meter_id));

        let mut service = base_service(
            &service_name, device, connection, &role, instance, self.phase, custom_name,
        );

        if role == "pvinverter" {
            let position = self
                .settings
                .get(&self.position_path())
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            service.add_item("/Position", MetricItem::integer(Some(position)).writeable());
        }

        add_line_points(&mut service, self.phase);

        service.publish();
        self.service = Some(service);
        self.state = ChannelState::Active;
        Ok(())
    }

    /// Apply one telemetry block. Fields that are missing or of the wrong
    /// shape are skipped; the rest of the block is still processed.
    pub fn ingest(&mut self, key: &str, block: &Value) {
        if self.state != ChannelState::Active {
            return;
        }
        let Some(service) = self.service.as_mut() else { return };
        let prefix = format!("/Ac/L{}", self.phase);

        if key == format!("em1:{}", self.meter_id) {
            if let Some(v) = field_f64(block, "voltage") {
                service.set_double(&format!("{}/Voltage", prefix), Some(v));
            }
            if let Some(v) = field_f64(block, "current") {
                service.set_double(&format!("{}/Current", prefix), Some(v));
            }
            if let Some(v) = field_f64(block, "act_power") {
                service.set_double(&format!("{}/Power", prefix), Some(v));
                service.set_double("/Ac/Power", Some(v));
            }
        } else if key == format!("em1data:{}", self.meter_id) {
            if let Some(v) = field_f64(block, "total_act_energy") {
                let v = units::scale_energy(v);
                service.set_double("/Ac/Energy/Forward", Some(v));
                service.set_double(&format!("{}/Energy/Forward", prefix), Some(v));
            }
            if let Some(v) = field_f64(block, "total_act_ret_energy") {
                let v = units::scale_energy(v);
                service.set_double("/Ac/Energy/Reverse", Some(v));
                service.set_double(&format!("{}/Energy/Reverse", prefix), Some(v));
            }
        }
    }

    pub fn handle_write(&mut self, path: &str, value: &SettingValue) -> bool {
        match path {
            "/Role" => self.role_changed(value),
            "/Position" => self.position_changed(value),
            "/Phase" => self.phase_changed(value),
            _ => false,
        }
    }

    fn role_changed(&mut self, value: &SettingValue) -> bool {
        let Some(role) = value.as_text() else { return false };
        if !ALLOWED_ROLES.contains(&role) {
            return false;
        }

        let path = self.instance_path();
        let Some(instance) = self
            .settings
            .get(&path)
            .and_then(|v| v.as_text().and_then(|t| role_instance(t).ok()))
            .map(|(_, instance)| instance)
        else {
            return false;
        };

        self.settings
            .set(&path, SettingValue::Text(format!("{}:{}", role, instance)));
        // A role change moves the service to a new bus name; destroy and
        // let the supervisor restart us.
        self.destroy();
        true
    }

    fn position_changed(&mut self, value: &SettingValue) -> bool {
        let Some(position) = value.as_i64() else { return false };
        if !(0..=2).contains(&position) {
            return false;
        }
        self.settings.set(&self.position_path(), SettingValue::Int(position));
        true
    }

    fn phase_changed(&mut self, value: &SettingValue) -> bool {
        let Some(phase) = value.as_i64() else { return false };
        if !(1..=3).contains(&phase) {
            return false;
        }
        self.settings.set(&self.phase_path(), SettingValue::Int(phase));

        // Applied live: move the line points over to the new phase so that
        // subsequent readings land on the right paths.
        if phase != self.phase {
            if let Some(service) = self.service.as_mut() {
                remove_line_points(service, self.phase);
                add_line_points(service, phase);
                service.set_integer("/Phase", Some(phase));
            }
            self.phase = phase;
        }
        true
    }

    /// External edit of one of our settings keys.
    pub fn settings_changed(&mut self, path: &str) {
        if self.state != ChannelState::Active {
            return;
        }
        // Kill the service, the supervisor will restart us soon
        if path == self.instance_path() {
            self.destroy();
        }
    }

    pub fn destroy(&mut self) {
        if self.state == ChannelState::Destroyed {
            return;
        }
        if let Some(mut service) = self.service.take() {
            service.unpublish();
        }
        self.state = ChannelState::Destroyed;
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == ChannelState::Destroyed
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn phase(&self) -> i64 {
        self.phase
    }

    pub fn service(&self) -> Option<&MetricService> {
        self.service.as_ref()
    }
}
