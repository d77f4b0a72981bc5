use rumqttc::{MqttOptions, QoS};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Validation failures for [`ConnectionConfig`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Host cannot be empty")]
    EmptyHost,

    #[error("MQTT username cannot be empty")]
    EmptyUsername,

    #[error("MQTT password cannot be empty")]
    EmptyPassword,

    #[error("MQTT topics list cannot be empty")]
    EmptyTopics,

    #[error("Port must be between 1 and 65535")]
    InvalidPort,

    #[error("Keepalive must be positive")]
    InvalidKeepAlive,

    #[error("Client id cannot be empty")]
    EmptyClientId,

    #[error("Connect timeout must be positive")]
    InvalidConnectTimeout,

    #[error("Subscription acknowledgement timeout must be positive")]
    InvalidAckTimeout,

    #[error("Event capacity must be positive")]
    InvalidEventCapacity,

    #[error("Topic prefix must be 3 or 4 digits, got '{0}'")]
    InvalidPrefix(String),

    #[error("QoS must be 0, 1 or 2, got {0}")]
    InvalidQos(u8),
}

/// Everything needed to open one session against a device.
///
/// Supplied once per run from flags or prompts and never written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub qos: QoS,
}

impl ConnectionConfig {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        topic_prefix: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            password: password.into(),
            topic_prefix: topic_prefix.into(),
            client_id: format!("mqttprobe-{}", std::process::id()),
            keep_alive: DEFAULT_KEEP_ALIVE,
            qos: QoS::AtLeastOnce,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Checks every field; the first violation wins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.username.is_empty() {
            return Err(ConfigError::EmptyUsername);
        }
        if self.password.is_empty() {
            return Err(ConfigError::EmptyPassword);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.keep_alive.is_zero() {
            return Err(ConfigError::InvalidKeepAlive);
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::EmptyClientId);
        }
        validate_prefix(&self.topic_prefix)
    }

    /// `<prefix>/status/<suffix>`
    pub fn status_topic(&self, suffix: &str) -> String {
        format!("{}/status/{}", self.topic_prefix, suffix)
    }

    pub fn status_topics(&self, suffixes: &[String]) -> Result<Vec<String>, ConfigError> {
        if suffixes.is_empty() {
            return Err(ConfigError::EmptyTopics);
        }
        Ok(suffixes.iter().map(|s| self.status_topic(s)).collect())
    }

    /// `<prefix>/<suffix>`, usually `<prefix>/command`
    pub fn command_topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.topic_prefix, suffix)
    }

    pub fn mqtt_options(&self) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(&self.client_id, &self.host, self.port);
        mqtt_options
            .set_credentials(self.username.clone(), self.password.clone())
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true);
        mqtt_options
    }
}

pub fn validate_prefix(prefix: &str) -> Result<(), ConfigError> {
    let digits_only = prefix.chars().all(|c| c.is_ascii_digit());
    if digits_only && (3..=4).contains(&prefix.len()) {
        Ok(())
    } else {
        Err(ConfigError::InvalidPrefix(prefix.to_string()))
    }
}

pub fn qos_from_level(level: u8) -> Result<QoS, ConfigError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ConfigError::InvalidQos(other)),
    }
}
