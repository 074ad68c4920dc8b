//! One physical meter device and the channels derived from it.
//!
//! The group classifies the device from its handshake, owns the resulting
//! channels and routes telemetry blocks to them by key. When any channel
//! destroys itself (role change, external settings edit) the whole group is
//! torn down, because the supervisor restarts per device, not per channel.

use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::meter::{DeviceInfo, MeterChannel, MeterError, SingleMeter, ThreePhaseMeter};
use crate::settings::{SettingValue, SettingsChange, SettingsService};

struct ChannelSlot {
    channel: MeterChannel,
    keys: Vec<String>,
}

pub struct PhysicalMeter {
    settings: Arc<SettingsService>,
    changes: broadcast::Receiver<SettingsChange>,
    slots: Vec<ChannelSlot>,
    destroyed: bool,
}

impl PhysicalMeter {
    pub fn new(settings: Arc<SettingsService>) -> Self {
        let changes = settings.subscribe();
        PhysicalMeter {
            settings,
            changes,
            slots: Vec::new(),
            destroyed: false,
        }
    }

    /// Classify the device and bring up its channels. All or nothing: if
    /// any channel fails to configure, everything started so far is torn
    /// down again and the error is returned.
    pub async fn start(
        &mut self,
        handshake: &Value,
        connection: &str,
    ) -> Result<(), MeterError> {
        let device = DeviceInfo::from_frame(handshake)?;

        let result = self.start_channels(&device, connection).await;
        if result.is_err() {
            self.destroy();
        }
        result
    }

    async fn start_channels(
        &mut self,
        device: &DeviceInfo,
        connection: &str,
    ) -> Result<(), MeterError> {
        match (device.model.as_str(), device.app.as_str()) {
            ("SPEM-002CEBEU50", "ProEM") => {
                info!("Found Pro EM {}, starting 2 single phase meters", device.mac);
                for meter_id in 0..2 {
                    self.start_single(device, connection, meter_id).await?;
                }
            }
            ("SPEM-003CEBEU", "Pro3EM") => {
                let Some(profile) = device.profile.as_deref() else {
                    return Err(MeterError::MissingField("profile"));
                };
                if profile == "monophase" {
                    info!("Found Pro 3EM {} in monophase setup", device.mac);
                    for meter_id in 0..3 {
                        self.start_single(device, connection, meter_id).await?;
                    }
                } else {
                    info!("Found Pro 3EM {} in 3phase setup", device.mac);
                    let mut channel =
                        MeterChannel::ThreePhase(ThreePhaseMeter::new(self.settings.clone()));
                    channel.configure(device, connection).await?;
                    self.slots.push(ChannelSlot {
                        channel,
                        keys: vec!["em:0".to_string(), "emdata:0".to_string()],
                    });
                }
            }
            (model, app) => {
                warn!("Unsupported model connected: {}/{}", model, app);
                return Err(MeterError::UnsupportedDevice {
                    model: model.to_string(),
                    app: app.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn start_single(
        &mut self,
        device: &DeviceInfo,
        connection: &str,
        meter_id: usize,
    ) -> Result<(), MeterError> {
        let mut channel = MeterChannel::Single(SingleMeter::new(self.settings.clone(), meter_id));
        channel.configure(device, connection).await?;
        self.slots.push(ChannelSlot {
            channel,
            keys: vec![format!("em1:{}", meter_id), format!("em1data:{}", meter_id)],
        });
        Ok(())
    }

    /// Route one incoming frame. Batched NotifyStatus notifications may
    /// carry several blocks at once; each recognized key is routed on its
    /// own and unknown keys are ignored.
    pub fn handle_frame(&mut self, frame: &Value) {
        if self.destroyed {
            return;
        }
        self.drain_settings_changes();
        self.sweep();
        if self.destroyed {
            return;
        }

        if frame.get("method").and_then(Value::as_str) == Some("NotifyStatus") {
            if let Some(params) = frame.get("params") {
                for slot in self.slots.iter_mut() {
                    for key in slot.keys.clone() {
                        if let Some(block) = params.get(&key) {
                            slot.channel.ingest(&key, block);
                        }
                    }
                }
            } else {
                debug!("NotifyStatus without params");
            }
        }

        self.sweep();
    }

    /// Route one legacy keyed block to the channel owning the key.
    pub fn handle_block(&mut self, key: &str, block: &Value) {
        if self.destroyed {
            return;
        }
        self.drain_settings_changes();
        self.sweep();
        if self.destroyed {
            return;
        }

        for slot in self.slots.iter_mut() {
            if slot.keys.iter().any(|k| k == key) {
                slot.channel.ingest(key, block);
                break;
            }
        }

        self.sweep();
    }

    /// Write to a writeable point of one channel, e.g. coming from the bus.
    pub fn channel_write(&mut self, index: usize, path: &str, value: &SettingValue) -> bool {
        let accepted = match self.slots.get_mut(index) {
            Some(slot) => slot.channel.handle_write(path, value),
            None => false,
        };
        self.sweep();
        accepted
    }

    fn drain_settings_changes(&mut self) {
        while let Ok(change) = self.changes.try_recv() {
            for slot in self.slots.iter_mut() {
                slot.channel.settings_changed(&change.path);
            }
        }
    }

    /// If any channel killed itself, tear down the whole group; the
    /// supervisor restarts per physical device.
    fn sweep(&mut self) {
        if self.destroyed {
            return;
        }
        if self.slots.iter().any(|s| s.channel.is_destroyed()) {
            info!("A channel requested a restart, tearing down the device group");
            self.destroy();
        }
    }

    pub fn destroy(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.channel.destroy();
        }
        self.destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn channel_count(&self) -> usize {
        self.slots.len()
    }

    pub fn channels(&self) -> impl Iterator<Item = &MeterChannel> {
        self.slots.iter().map(|s| &s.channel)
    }

    pub fn keys_of(&self, index: usize) -> &[String] {
        self.slots
            .get(index)
            .map(|s| s.keys.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::StoreLink;
    use serde_json::json;

    fn pro_em_handshake() -> Value {
        json!({"result": {
            "mac": "AABBCCDDEEFF", "fw_id": "1.4.0",
            "model": "SPEM-002CEBEU50", "app": "ProEM", "name": "garage"
        }})
    }

    fn pro_3em_handshake(profile: &str) -> Value {
        json!({"result": {
            "mac": "112233445566", "fw_id": "1.4.0",
            "model": "SPEM-003CEBEU", "app": "Pro3EM", "profile": profile
        }})
    }

    fn ready_settings() -> (Arc<SettingsService>, StoreLink) {
        let (service, link) = SettingsService::new();
        link.mark_ready(true);
        (service, link)
    }

    async fn started(handshake: &Value) -> (PhysicalMeter, StoreLink) {
        let (settings, link) = ready_settings();
        let mut group = PhysicalMeter::new(settings);
        group.start(handshake, "MQTT localhost:1883").await.unwrap();
        (group, link)
    }

    #[tokio::test]
    async fn test_pro_em_yields_two_single_channels() {
        let (group, _link) = started(&pro_em_handshake()).await;
        assert_eq!(group.channel_count(), 2);
        assert_eq!(group.keys_of(0), ["em1:0", "em1data:0"]);
        assert_eq!(group.keys_of(1), ["em1:1", "em1data:1"]);
        for channel in group.channels() {
            assert!(matches!(channel, MeterChannel::Single(_)));
            assert!(!channel.is_destroyed());
        }
    }

    #[tokio::test]
    async fn test_pro_3em_monophase_yields_three_single_channels() {
        let (group, _link) = started(&pro_3em_handshake("monophase")).await;
        assert_eq!(group.channel_count(), 3);
        assert_eq!(group.keys_of(2), ["em1:2", "em1data:2"]);
        for channel in group.channels() {
            assert!(matches!(channel, MeterChannel::Single(_)));
        }
    }

    #[tokio::test]
    async fn test_pro_3em_triphase_yields_one_channel() {
        let (group, _link) = started(&pro_3em_handshake("triphase")).await;
        assert_eq!(group.channel_count(), 1);
        assert_eq!(group.keys_of(0), ["em:0", "emdata:0"]);
        assert!(matches!(group.channels().next(), Some(MeterChannel::ThreePhase(_))));
    }

    #[tokio::test]
    async fn test_unsupported_model_is_rejected() {
        let (settings, _link) = ready_settings();
        let mut group = PhysicalMeter::new(settings);
        let handshake = json!({"result": {
            "mac": "AABBCC", "fw_id": "1.0", "model": "SHSW-25", "app": "Switch"
        }});
        match group.start(&handshake, "MQTT localhost:1883").await {
            Err(MeterError::UnsupportedDevice { model, app }) => {
                assert_eq!(model, "SHSW-25");
                assert_eq!(app, "Switch");
            }
            other => panic!("expected unsupported device, got {:?}", other),
        }
        assert!(group.is_destroyed());
    }

    #[tokio::test]
    async fn test_pro_3em_without_profile_is_rejected() {
        let (settings, _link) = ready_settings();
        let mut group = PhysicalMeter::new(settings);
        let handshake = json!({"result": {
            "mac": "112233445566", "fw_id": "1.4.0",
            "model": "SPEM-003CEBEU", "app": "Pro3EM"
        }});
        assert!(group.start(&handshake, "MQTT localhost:1883").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_timeout_tears_everything_down() {
        let (settings, _link) = SettingsService::new();
        let mut group = PhysicalMeter::new(settings);
        match group.start(&pro_em_handshake(), "MQTT localhost:1883").await {
            Err(MeterError::SettingsUnavailable) => {}
            other => panic!("expected settings timeout, got {:?}", other),
        }
        assert!(group.is_destroyed());
        for channel in group.channels() {
            assert!(channel.is_destroyed());
        }
    }

    #[tokio::test]
    async fn test_notify_status_routes_batched_blocks() {
        let (mut group, _link) = started(&pro_em_handshake()).await;
        group.handle_frame(&json!({
            "method": "NotifyStatus",
            "params": {
                "em1:0": {"act_power": 100.0},
                "em1data:1": {"total_act_energy": 2000.0},
                "bogus:9": {"act_power": 5.0}
            }
        }));

        let services: Vec<_> = group.channels().map(|c| c.service().unwrap()).collect();
        assert_eq!(services[0].get_double("/Ac/Power"), Some(100.0));
        assert_eq!(services[1].get_double("/Ac/Energy/Forward"), Some(2.0));
        assert_eq!(services[1].get_double("/Ac/Power"), None);
    }

    #[tokio::test]
    async fn test_legacy_keyed_block_routing() {
        let (mut group, _link) = started(&pro_3em_handshake("triphase")).await;
        group.handle_block("em:0", &json!({
            "a_act_power": 1.0, "b_act_power": 2.0, "c_act_power": 3.0
        }));
        let service = group.channels().next().unwrap().service().unwrap();
        assert_eq!(service.get_double("/Ac/Power"), Some(6.0));
    }

    #[tokio::test]
    async fn test_malformed_frames_are_harmless() {
        let (mut group, _link) = started(&pro_em_handshake()).await;
        group.handle_frame(&json!({"method": "NotifyStatus"}));
        group.handle_frame(&json!({"method": "NotifyEvent", "params": {}}));
        group.handle_frame(&json!("not even an object"));
        assert!(!group.is_destroyed());
    }

    #[tokio::test]
    async fn test_role_write_destroys_whole_group() {
        let (mut group, _link) = started(&pro_em_handshake()).await;
        assert!(!group.channel_write(0, "/Role", &SettingValue::Text("factory".to_string())));
        assert!(!group.is_destroyed());

        assert!(group.channel_write(0, "/Role", &SettingValue::Text("genset".to_string())));
        assert!(group.is_destroyed());
        for channel in group.channels() {
            assert!(channel.is_destroyed());
        }
    }

    #[tokio::test]
    async fn test_external_instance_edit_destroys_group_on_next_frame() {
        let (mut group, link) = started(&pro_em_handshake()).await;
        link.inject(
            "/Settings/Devices/shelly_AABBCCDDEEFF_1/ClassAndVrmInstance",
            SettingValue::Text("acload:41".to_string()),
        );
        group.handle_frame(&json!({
            "method": "NotifyStatus",
            "params": {"em1:0": {"act_power": 100.0}}
        }));
        assert!(group.is_destroyed());
    }

    #[tokio::test]
    async fn test_destroyed_group_drops_frames() {
        let (mut group, _link) = started(&pro_em_handshake()).await;
        group.destroy();
        group.destroy();
        group.handle_frame(&json!({
            "method": "NotifyStatus",
            "params": {"em1:0": {"act_power": 100.0}}
        }));
        assert!(group.channels().all(|c| c.service().is_none()));
    }
}
