use log::{error, info};
use shelly2dbus::settings::{FileStore, SettingsService};
use shelly2dbus::{Config, ShellyManager};
use std::time::Duration;
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter = std::env::var("S2D_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            error!("Unable to read the config on config/s2d.yaml or s2d.yaml: {e}");
            return Ok(());
        }
    };

    let (settings, link) = SettingsService::new();

    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    // The settings store; everything waits for it to come up
    let store = match FileStore::load(config.settings_file.clone().into()) {
        Ok(s) => s,
        Err(e) => {
            error!("Unable to open settings store {}: {e}", config.settings_file);
            return Ok(());
        }
    };
    threads.push(tokio::spawn(store.run(link)));

    // One manager task per configured device
    for conf in config.devices {
        if !conf.enabled {
            info!("Device {} is disabled", conf.name);
            continue;
        }

        let mut manager = ShellyManager::new(conf, settings.clone());
        threads.push(tokio::spawn(async move {
            manager.start_thread().await;
        }));
    }

    info!("All modules started, now waiting for a task to exit");
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        if threads.iter().any(|t| t.is_finished()) {
            for task in threads.iter_mut() {
                task.abort();
            }
            break;
        }
    }
    Ok(())
}
