//! Client side of the external settings store.
//!
//! Channels register their settings with defaults, read and write values
//! through a shared `SettingsService`, and get told about edits made by
//! other processes. The store side sits behind a `StoreLink`: the binary
//! wires it to a small file-backed task, tests drive it directly.

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Int(i64),
    Text(String),
}

impl SettingValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SettingValue::Int(v) => Some(*v),
            SettingValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SettingValue::Text(v) => Some(v),
            SettingValue::Int(_) => None,
        }
    }
}

/// One setting registration: path, default and (for integers) bounds.
#[derive(Debug, Clone)]
pub struct Setting {
    pub path: String,
    pub default: SettingValue,
    pub min: i64,
    pub max: i64,
}

impl Setting {
    pub fn text(path: &str, default: &str) -> Self {
        Setting {
            path: path.to_string(),
            default: SettingValue::Text(default.to_string()),
            min: 0,
            max: 0,
        }
    }

    pub fn int(path: &str, default: i64, min: i64, max: i64) -> Self {
        Setting {
            path: path.to_string(),
            default: SettingValue::Int(default),
            min,
            max,
        }
    }
}

/// Notification about a setting edited by something other than this process.
#[derive(Debug, Clone)]
pub struct SettingsChange {
    pub path: String,
    pub value: SettingValue,
}

#[derive(Debug)]
pub enum StoreCommand {
    Register(Setting),
    Write { path: String, value: SettingValue },
}

/// Cache and change fan-out shared between the client and the store link.
struct Shared {
    values: Mutex<HashMap<String, SettingValue>>,
    changes: broadcast::Sender<SettingsChange>,
}

/// Shared client handle. Reads are served from the local cache; writes are
/// fire-and-forget towards the store.
pub struct SettingsService {
    shared: Arc<Shared>,
    ready: watch::Receiver<bool>,
    commands: mpsc::Sender<StoreCommand>,
}

/// Store side of the seam handed out by `SettingsService::new`.
pub struct StoreLink {
    ready: watch::Sender<bool>,
    commands: mpsc::Receiver<StoreCommand>,
    shared: Arc<Shared>,
}

impl SettingsService {
    pub fn new() -> (Arc<SettingsService>, StoreLink) {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (change_tx, _) = broadcast::channel(16);

        let shared = Arc::new(Shared {
            values: Mutex::new(HashMap::new()),
            changes: change_tx,
        });

        let service = Arc::new(SettingsService {
            shared: shared.clone(),
            ready: ready_rx,
            commands: cmd_tx,
        });

        let link = StoreLink {
            ready: ready_tx,
            commands: cmd_rx,
            shared,
        };

        (service, link)
    }

    /// Wait until the store is reachable, up to `timeout`. A timeout is not
    /// an error for the waiter, it just means "treat the store as absent".
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.ready.clone();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        ready
    }

    /// Register settings with their defaults. Values already known locally
    /// (seeded from the store or registered earlier) are left alone.
    pub fn add_settings(&self, settings: &[Setting]) {
        let mut values = self.shared.values.lock().unwrap();
        for setting in settings {
            values
                .entry(setting.path.clone())
                .or_insert_with(|| setting.default.clone());
            if let Err(e) = self.commands.try_send(StoreCommand::Register(setting.clone())) {
                warn!("Dropping setting registration for {}: {}", setting.path, e);
            }
        }
    }

    pub fn get(&self, path: &str) -> Option<SettingValue> {
        self.shared.values.lock().unwrap().get(path).cloned()
    }

    /// Update the local cache and queue the write towards the store.
    pub fn set(&self, path: &str, value: SettingValue) {
        self.shared
            .values
            .lock()
            .unwrap()
            .insert(path.to_string(), value.clone());
        if let Err(e) = self.commands.try_send(StoreCommand::Write {
            path: path.to_string(),
            value,
        }) {
            warn!("Dropping setting write for {}: {}", path, e);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.shared.changes.subscribe()
    }
}

impl StoreLink {
    pub fn mark_ready(&self, ready: bool) {
        let _ = self.ready.send(ready);
    }

    pub async fn next_command(&mut self) -> Option<StoreCommand> {
        self.commands.recv().await
    }

    pub fn try_command(&mut self) -> Option<StoreCommand> {
        self.commands.try_recv().ok()
    }

    /// Load a value into the client cache without raising a change
    /// notification. Used when replaying the persisted store at startup.
    pub fn seed(&self, path: &str, value: SettingValue) {
        self.shared
            .values
            .lock()
            .unwrap()
            .insert(path.to_string(), value);
    }

    /// Apply an edit made by another process: update the cache and notify
    /// subscribed channels.
    pub fn inject(&self, path: &str, value: SettingValue) {
        self.seed(path, value.clone());
        let _ = self.shared.changes.send(SettingsChange {
            path: path.to_string(),
            value,
        });
    }
}

/// Minimal durable store used by the binary: a flat JSON file.
pub struct FileStore {
    path: PathBuf,
    values: HashMap<String, SettingValue>,
}

impl FileStore {
    pub fn load(path: PathBuf) -> Result<Self, SettingsError> {
        let values = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No settings file at {:?}, starting empty", path);
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(FileStore { path, values })
    }

    fn persist(&self) {
        match serde_json::to_string_pretty(&self.values) {
            Ok(contents) => {
                if let Err(e) = std::fs::write(&self.path, contents) {
                    error!("Error writing settings file {:?}: {}", self.path, e);
                }
            }
            Err(e) => error!("Error serializing settings: {}", e),
        }
    }

    /// Replay persisted values into the client, mark the store ready and
    /// serve registration/write commands until the client goes away.
    pub async fn run(mut self, mut link: StoreLink) {
        for (path, value) in self.values.iter() {
            link.seed(path, value.clone());
        }
        link.mark_ready(true);
        info!("Settings store ready with {} entries", self.values.len());

        while let Some(command) = link.next_command().await {
            match command {
                StoreCommand::Register(setting) => {
                    if !self.values.contains_key(&setting.path) {
                        debug!("Registering setting {} = {:?}", setting.path, setting.default);
                        self.values.insert(setting.path, setting.default);
                        self.persist();
                    }
                }
                StoreCommand::Write { path, value } => {
                    debug!("Storing {} = {:?}", path, value);
                    self.values.insert(path, value);
                    self.persist();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_times_out() {
        let (service, _link) = SettingsService::new();
        assert!(!service.wait_until_ready(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_wait_until_ready() {
        let (service, link) = SettingsService::new();
        link.mark_ready(true);
        assert!(service.wait_until_ready(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_defaults_do_not_clobber() {
        let (service, link) = SettingsService::new();
        link.seed("/Settings/Devices/x/Phase", SettingValue::Int(3));
        service.add_settings(&[
            Setting::int("/Settings/Devices/x/Phase", 1, 1, 3),
            Setting::int("/Settings/Devices/x/Position", 0, 0, 2),
        ]);
        assert_eq!(service.get("/Settings/Devices/x/Phase"), Some(SettingValue::Int(3)));
        assert_eq!(service.get("/Settings/Devices/x/Position"), Some(SettingValue::Int(0)));
    }

    #[tokio::test]
    async fn test_set_reaches_store() {
        let (service, mut link) = SettingsService::new();
        service.set("/Settings/Devices/x/Position", SettingValue::Int(2));
        match link.try_command() {
            Some(StoreCommand::Write { path, value }) => {
                assert_eq!(path, "/Settings/Devices/x/Position");
                assert_eq!(value, SettingValue::Int(2));
            }
            other => panic!("expected a write command, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inject_notifies_subscribers() {
        let (service, link) = SettingsService::new();
        let mut rx = service.subscribe();
        link.inject("/Settings/Devices/x/ClassAndVrmInstance",
            SettingValue::Text("acload:41".to_string()));
        let change = rx.try_recv().unwrap();
        assert_eq!(change.path, "/Settings/Devices/x/ClassAndVrmInstance");
        assert_eq!(service.get(&change.path), Some(change.value));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        {
            let (service, link) = SettingsService::new();
            let store = FileStore::load(path.clone()).unwrap();
            let task = tokio::spawn(store.run(link));
            assert!(service.wait_until_ready(Duration::from_secs(5)).await);
            service.set("/Settings/Devices/x/Phase", SettingValue::Int(2));
            drop(service);
            task.await.unwrap();
        }

        let store = FileStore::load(path).unwrap();
        assert_eq!(
            store.values.get("/Settings/Devices/x/Phase"),
            Some(&SettingValue::Int(2))
        );
    }
}
