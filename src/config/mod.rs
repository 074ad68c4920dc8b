use log::info;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs::File;
use std::io::prelude::*;

fn broker_port_default() -> u16 { 1883 }
fn device_enabled_default() -> bool { true }

/// One Shelly meter to bridge: which broker delivers its frames and under
/// which MQTT topic prefix the device talks.
#[derive(Deserialize, Serialize, Clone)]
pub struct ShellyDeviceConfig {
    pub name: String,
    pub broker_host: String,
    #[serde(default = "broker_port_default")]
    pub broker_port: u16,
    pub topic_prefix: String,
    #[serde(default = "device_enabled_default")]
    pub enabled: bool,
}

fn devices_default() -> Vec<ShellyDeviceConfig> { Vec::new() }
fn settings_file_default() -> String { "settings.json".to_string() }

#[derive(Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "devices_default")]
    pub devices: Vec<ShellyDeviceConfig>,
    #[serde(default = "settings_file_default")]
    pub settings_file: String,
}

impl Config {
    /// Check the two usual places for the config file.
    pub fn load() -> Result<Config, Box<dyn Error>> {
        let mut file = match File::open("config/s2d.yaml") {
            Ok(f) => f,
            Err(_) => File::open("s2d.yaml")?,
        };

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config = Config::parse(&contents)?;
        info!("Loaded config with {} devices", config.devices.len());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Config, Box<dyn Error>> {
        Ok(serde_yml::from_str(contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let yaml = r#"
devices:
  - name: garage
    broker_host: localhost
    topic_prefix: shellyproem50-aabbccddeeff
  - name: main
    broker_host: broker.lan
    broker_port: 8883
    topic_prefix: shellypro3em-112233445566
    enabled: false
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].broker_port, 1883);
        assert!(config.devices[0].enabled);
        assert!(!config.devices[1].enabled);
        assert_eq!(config.settings_file, "settings.json");
    }

    #[test]
    fn test_parse_empty() {
        let config = Config::parse("settings_file: /data/settings.json").unwrap();
        assert!(config.devices.is_empty());
        assert_eq!(config.settings_file, "/data/settings.json");
    }
}
