//! Error taxonomy for probe runs.
//!
//! Every failure a scenario can hit is one [`ProbeError`]. The scenario runner
//! catches it at the scenario boundary, records its [`FailureKind`] and prints the
//! remediation hint; nothing here is allowed to abort the whole run.

use crate::mqtt::config::ConfigError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("Invalid connection parameters: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("No answer from {host}:{port} within {timeout:?}")]
    ConnectionTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error("Broker refused the credentials ({code})")]
    AuthorizationRefused { code: String },

    #[error("Broker refused the connection ({code})")]
    ConnectionRefused { code: String },

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Subscription to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Client is not connected")]
    NotConnected,

    #[error("Connection lost: {0}")]
    Disconnected(String),

    #[error("Error during disconnect: {0}")]
    Cleanup(String),
}

/// Coarse classification shown in the summary table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Configuration,
    Timeout,
    AuthorizationRefused,
    ConnectionRefused,
    NetworkUnreachable,
    PublishSubscribe,
    Disconnected,
    Cleanup,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            FailureKind::Configuration => "configuration",
            FailureKind::Timeout => "timeout",
            FailureKind::AuthorizationRefused => "authorization refused",
            FailureKind::ConnectionRefused => "connection refused",
            FailureKind::NetworkUnreachable => "network unreachable",
            FailureKind::PublishSubscribe => "publish/subscribe",
            FailureKind::Disconnected => "disconnected",
            FailureKind::Cleanup => "cleanup",
        };
        f.write_str(label)
    }
}

impl ProbeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProbeError::InvalidConfig(_) => FailureKind::Configuration,
            ProbeError::ConnectionTimeout { .. } => FailureKind::Timeout,
            ProbeError::AuthorizationRefused { .. } => FailureKind::AuthorizationRefused,
            ProbeError::ConnectionRefused { .. } => FailureKind::ConnectionRefused,
            ProbeError::NetworkUnreachable(_) => FailureKind::NetworkUnreachable,
            ProbeError::Subscribe { .. } | ProbeError::Publish { .. } => {
                FailureKind::PublishSubscribe
            }
            ProbeError::NotConnected | ProbeError::Disconnected(_) => FailureKind::Disconnected,
            ProbeError::Cleanup(_) => FailureKind::Cleanup,
        }
    }

    /// What the operator should check next.
    pub fn hint(&self) -> &'static str {
        match self.kind() {
            FailureKind::Configuration => {
                "Check the flags: host, username and password must be set, the prefix is 3-4 digits"
            }
            FailureKind::Timeout => {
                "Check the device IP address and that the device is powered on and on the same network"
            }
            FailureKind::AuthorizationRefused => {
                "Check the MQTT username and password (credentials are device specific)"
            }
            FailureKind::ConnectionRefused => {
                "Check the port and that the device accepts MQTT 3.1.1 clients"
            }
            FailureKind::NetworkUnreachable => {
                "Check network reachability (ping the device, firewall, VLAN isolation)"
            }
            FailureKind::PublishSubscribe => {
                "Check the topic prefix; the device may reject topics outside its namespace"
            }
            FailureKind::Disconnected => {
                "The device closed the connection; check for a second client using the same credentials"
            }
            FailureKind::Cleanup => "The connection was released forcibly; no action needed",
        }
    }
}
