//! MQTT delivery of Shelly RPC frames, one manager per configured device.
//!
//! Shelly Gen2 devices publish their RPC notifications on
//! `<prefix>/events/rpc` and answer RPC requests sent to `<prefix>/rpc`.
//! The manager requests `Shelly.GetDeviceInfo`, runs device classification
//! on the answer and then feeds every event frame into the meter group.
//! When the group tears itself down after a critical configuration change,
//! the manager restarts from a fresh handshake. That loop is the external
//! supervisor the channels rely on.

use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, ClientError, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ShellyDeviceConfig;
use crate::meter::{MeterError, PhysicalMeter};
use crate::settings::SettingsService;

/// Reply topic we ask the device to answer on.
const RPC_SRC: &str = "shelly2dbus";

pub struct ShellyManager {
    conf: ShellyDeviceConfig,
    settings: Arc<SettingsService>,
}

impl ShellyManager {
    pub fn new(conf: ShellyDeviceConfig, settings: Arc<SettingsService>) -> Self {
        ShellyManager { conf, settings }
    }

    pub async fn start_thread(&mut self) {
        let host = self.conf.broker_host.clone();
        let port = self.conf.broker_port;
        info!("[{host}:{port}] Starting MQTT connection for {}", self.conf.name);

        let mut mqttoptions = MqttOptions::new(
            format!("{}_{}", RPC_SRC, self.conf.name),
            host.clone(),
            port,
        );
        mqttoptions.set_keep_alive(Duration::from_secs(5));

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
        let events_topic = format!("{}/events/rpc", self.conf.topic_prefix);
        let reply_topic = format!("{}/rpc", RPC_SRC);
        let connection = format!("MQTT {host}:{port}");

        let mut group: Option<PhysicalMeter> = None;
        let mut unsupported = false;
        let mut last_error = String::new();

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("[{host}:{port}] Connected, subscribing");
                    if let Err(e) = self.subscribe(&client, &events_topic, &reply_topic).await {
                        error!("[{host}:{port}] Subscribe failed: {e}");
                        continue;
                    }
                    if !unsupported {
                        self.request_device_info(&client).await;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let frame: Value = match serde_json::from_slice(&p.payload) {
                        Ok(v) => v,
                        Err(e) => {
                            debug!("[{host}:{port}] Dropping unparseable frame: {e}");
                            continue;
                        }
                    };

                    if p.topic == reply_topic {
                        if unsupported || group.as_ref().is_some_and(|g| !g.is_destroyed()) {
                            continue;
                        }
                        let mut fresh = PhysicalMeter::new(self.settings.clone());
                        match fresh.start(&frame, &connection).await {
                            Ok(()) => {
                                info!("[{host}:{port}] Device group up with {} channels",
                                    fresh.channel_count());
                                group = Some(fresh);
                            }
                            Err(MeterError::UnsupportedDevice { .. })
                            | Err(MeterError::MissingField(_)) => {
                                // Do not retry with this identity
                                error!("[{host}:{port}] Unsupported device, giving up");
                                unsupported = true;
                            }
                            Err(e) => {
                                warn!("[{host}:{port}] Startup failed ({e}), retrying");
                                tokio::time::sleep(Duration::from_secs(5)).await;
                                self.request_device_info(&client).await;
                            }
                        }
                    } else if p.topic == events_topic {
                        if let Some(g) = group.as_mut() {
                            g.handle_frame(&frame);
                            if g.is_destroyed() {
                                info!("[{host}:{port}] Device group torn down, rerunning classification");
                                group = None;
                                self.request_device_info(&client).await;
                            }
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    // Rate limiting, the broker being away is one error, not thousands
                    if e.to_string() != last_error {
                        error!("[{host}:{port}] Error in MQTT {e:?}");
                        last_error = e.to_string();
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn subscribe(
        &self,
        client: &AsyncClient,
        events_topic: &str,
        reply_topic: &str,
    ) -> Result<(), ClientError> {
        client.subscribe(events_topic, QoS::AtLeastOnce).await?;
        client.subscribe(reply_topic, QoS::AtLeastOnce).await
    }

    async fn request_device_info(&self, client: &AsyncClient) {
        let request = json!({
            "id": 1,
            "src": RPC_SRC,
            "method": "Shelly.GetDeviceInfo"
        });
        let topic = format!("{}/rpc", self.conf.topic_prefix);
        debug!("Requesting device info on {topic}");
        if let Err(e) = client
            .publish(topic, QoS::AtLeastOnce, false, request.to_string())
            .await
        {
            error!("Failed to request device info: {e}");
        }
    }
}
