//! Three-phase metering channel for the Pro 3EM in triphase setup.
//!
//! The user can pick which physical phase is presented as L1; the other two
//! follow cyclically. Total power and the energy totals always come from
//! the unrotated physical readings, summation does not care about order.

use log::{error, info};
use serde_json::Value;
use std::sync::Arc;

use crate::meter::{
    add_line_points, base_service, field_f64, role_instance, units, ChannelState,
    DeviceInfo, MeterError, ALLOWED_ROLES, DEFAULT_ROLE_INSTANCE, SETTINGS_TIMEOUT,
};
use crate::service::{MetricItem, MetricService};
use crate::settings::{Setting, SettingValue, SettingsService};

pub struct ThreePhaseMeter {
    state: ChannelState,
    /// Which physical phase is presented as logical L1 (1..=3).
    phase1: i64,
    settings: Arc<SettingsService>,
    setting_prefix: String,
    service: Option<MetricService>,
}

impl ThreePhaseMeter {
    pub fn new(settings: Arc<SettingsService>) -> Self {
        ThreePhaseMeter {
            state: ChannelState::Unconfigured,
            phase1: 1,
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
        format!("{}/Phase1Position", self.setting_prefix)
    }

    pub async fn configure(
        &mut self,
        device: &DeviceInfo,
        connection: &str,
    ) -> Result<(), MeterError> {
        self.state = ChannelState::Configuring;
        self.setting_prefix = format!("/Settings/Devices/shelly_{}", device.mac);

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

        self.phase1 = self
            .settings
            .get(&self.phase_path())
            .and_then(|v| v.as_i64())
            .unwrap_or(1);

        let service_name = format!("com.victronenergy.{}.shelly_{}", role, device.mac);

        let mut service = base_service(
            &service_name, device, connection, &role, instance, self.phase1,
            device.name.clone(),
        );

        if role == "pvinverter" {
            let position = self
                .settings
                .get(&self.position_path())
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            service.add_item("/Position", MetricItem::integer(Some(position)).writeable());
        }

        for line in 1..=3 {
            add_line_points(&mut service, line);
        }

        service.publish();
        self.service = Some(service);
        self.state = ChannelState::Active;
        Ok(())
    }

    /// Apply one telemetry block, remapping physical phases onto the
    /// configured logical order. Missing fields are skipped per field.
    pub fn ingest(&mut self, key: &str, block: &Value) {
        if self.state != ChannelState::Active {
            return;
        }
        let Some(service) = self.service.as_mut() else { return };
        let letters = units::phase_letters(self.phase1);

        if key == "em:0" {
            for (line, letter) in letters.iter().enumerate() {
                let prefix = format!("/Ac/L{}", line + 1);
                if let Some(v) = field_f64(block, &format!("{}_voltage", letter)) {
                    service.set_double(&format!("{}/Voltage", prefix), Some(v));
                }
                if let Some(v) = field_f64(block, &format!("{}_current", letter)) {
                    service.set_double(&format!("{}/Current", prefix), Some(v));
                }
                if let Some(v) = field_f64(block, &format!("{}_act_power", letter)) {
                    service.set_double(&format!("{}/Power", prefix), Some(v));
                }
            }

            // Total power is the plain sum over the physical phases, never
            // the rotated ones. Only publish it when all three are present.
            if let (Some(a), Some(b), Some(c)) = (
                field_f64(block, "a_act_power"),
                field_f64(block, "b_act_power"),
                field_f64(block, "c_act_power"),
            ) {
                service.set_double("/Ac/Power", Some(a + b + c));
            }
        } else if key == "emdata:0" {
            if let Some(v) = field_f64(block, "total_act") {
                service.set_double("/Ac/Energy/Forward", Some(units::scale_energy(v)));
            }
            if let Some(v) = field_f64(block, "total_act_ret") {
                service.set_double("/Ac/Energy/Reverse", Some(units::scale_energy(v)));
            }
            for (line, letter) in letters.iter().enumerate() {
                let prefix = format!("/Ac/L{}", line + 1);
                if let Some(v) = field_f64(block, &format!("{}_total_act_energy", letter)) {
                    service.set_double(
                        &format!("{}/Energy/Forward", prefix),
                        Some(units::scale_energy(v)),
                    );
                }
                if let Some(v) = field_f64(block, &format!("{}_total_act_ret_energy", letter)) {
                    service.set_double(
                        &format!("{}/Energy/Reverse", prefix),
                        Some(units::scale_energy(v)),
                    );
                }
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
        // New role means a new bus name; destroy and wait for the restart.
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
        let Some(phase1) = value.as_i64() else { return false };
        if !(1..=3).contains(&phase1) {
            return false;
        }
        self.settings.set(&self.phase_path(), SettingValue::Int(phase1));
        // Applied live; the next block lands with the new rotation.
        self.phase1 = phase1;
        if let Some(service) = self.service.as_mut() {
            service.set_integer("/Phase", Some(phase1));
        }
        true
    }

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

    pub fn phase1(&self) -> i64 {
        self.phase1
    }

    pub fn service(&self) -> Option<&MetricService> {
        self.service.as_ref()
    }
}
