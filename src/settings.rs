//! # Probe Settings
//!
//! Operator-tunable constants (timeouts, stress cycle count, topics to watch)
//! stored as TOML. Connection credentials are not part of this file: they are
//! supplied per run and never written to disk.
//!
//! Missing fields fall back to their defaults, and a missing default settings
//! file falls back to [`ProbeSettings::default`], so a fresh machine can run the
//! probe without any setup.

use crate::harness::probe::ProbeRequest;
use crate::mqtt::config::{qos_from_level, ConfigError};
use crate::mqtt::mqtt_handler::SessionOptions;
use color_eyre::eyre::{eyre, Result};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/mqttprobe";
const SETTINGS_FILE: &str = "settings.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProbeSettings {
    /// Broker port on the device
    pub port: u16,
    pub keep_alive_secs: u64,
    /// Upper bound for socket + CONNACK
    pub connect_timeout_secs: u64,
    /// Wait window for device responses after the request is published
    pub response_timeout_secs: u64,
    /// Upper bound for each SUBACK
    pub ack_timeout_secs: u64,
    /// Connect/close cycles in the rapid reconnect scenario
    pub stress_cycles: u32,
    pub stress_pause_ms: u64,
    pub queue_capacity: usize,
    pub event_capacity: usize,
    /// Suffixes appended as `<prefix>/status/<suffix>`
    pub status_suffixes: Vec<String>,
    pub command_suffix: String,
    /// `msg` field of the request payload
    pub request_msg: String,
    pub qos: u8,
    pub client_id_prefix: String,
    /// End the response window early once this many messages arrived
    pub stop_after_messages: Option<usize>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            port: 1883,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            response_timeout_secs: 10,
            ack_timeout_secs: 5,
            stress_cycles: 5,
            stress_pause_ms: 500,
            queue_capacity: 1000,
            event_capacity: 256,
            status_suffixes: vec![
                "current".to_string(),
                "faults".to_string(),
                "connection".to_string(),
                "software".to_string(),
                "summary".to_string(),
            ],
            command_suffix: "command".to_string(),
            request_msg: "REQUEST-CURRENT-STATE".to_string(),
            qos: 1,
            client_id_prefix: "mqttprobe".to_string(),
            stop_after_messages: None,
        }
    }
}

impl ProbeSettings {
    /// `~/.config/mqttprobe/settings.toml`
    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(SETTINGS_FILE);
        path
    }

    /// Loads an explicit file (which must exist) or the default file (which may not).
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load_from(path).await,
            None => {
                let path = Self::default_path();
                if tokio::fs::try_exists(&path)
                    .await
                    .map_err(|e| eyre!("Failed to check if settings file exists: {}", e))?
                {
                    Self::load_from(&path).await
                } else {
                    debug!(
                        "No settings file at {}, using defaults",
                        path.display()
                    );
                    Ok(Self::default())
                }
            }
        }
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read settings file {}: {}", path.display(), e))?;

        let settings: ProbeSettings = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse settings file {}: {}", path.display(), e))?;

        settings
            .validate()
            .map_err(|e| eyre!("Invalid settings in {}: {}", path.display(), e))?;

        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !tokio::fs::try_exists(parent)
                .await
                .map_err(|e| eyre!("Failed to check if settings directory exists: {}", e))?
            {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| eyre!("Failed to create settings directory: {}", e))?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize settings: {}", e))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write settings file: {}", e))?;

        info!("Settings written to {}", path.display());
        Ok(())
    }

    /// Writes the defaults unless the file already exists.
    pub async fn ensure_default(path: &Path) -> Result<bool> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if settings file exists: {}", e))?
        {
            warn!("Settings file {} already exists, leaving it untouched", path.display());
            return Ok(false);
        }
        Self::default().save(path).await?;
        Ok(true)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidKeepAlive);
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConnectTimeout);
        }
        if self.ack_timeout_secs == 0 {
            return Err(ConfigError::InvalidAckTimeout);
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidEventCapacity);
        }
        if self.status_suffixes.is_empty() {
            return Err(ConfigError::EmptyTopics);
        }
        qos_from_level(self.qos).map(|_| ())
    }

    pub fn qos(&self) -> Result<QoS, ConfigError> {
        qos_from_level(self.qos)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn stress_pause(&self) -> Duration {
        Duration::from_millis(self.stress_pause_ms)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            queue_capacity: self.queue_capacity,
            event_capacity: self.event_capacity,
            ..SessionOptions::default()
        }
    }

    /// The subscribe/publish probe described by these settings.
    pub fn probe_request(&self) -> ProbeRequest {
        ProbeRequest {
            status_suffixes: self.status_suffixes.clone(),
            request: Some(crate::harness::probe::PublishRequest::status_request(
                &self.command_suffix,
                &self.request_msg,
            )),
            window: Duration::from_secs(self.response_timeout_secs),
            stop_after: self.stop_after_messages,
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
        }
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
