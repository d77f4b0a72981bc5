//! # MQTT Integration Module
//!
//! Wraps `rumqttc` into a session type the probe scenarios can drive without
//! touching the wire protocol. The client library delivers connect, message and
//! disconnect notifications on its own task; this module turns them into
//! "wait for the first of {event, deadline}" calls on a [`mqtt_handler::DeviceSession`].
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connection parameters, validation and topic layout
//! ├── message_manager.rs  - Received message representation and bounded queue
//! └── mqtt_handler.rs     - Session state machine and event loop bridge
//! ```
//!
//! ## Topic Layout
//!
//! Devices publish under a short numeric prefix (the product type, e.g. `475`):
//! - status: `<prefix>/status/<suffix>` (`current`, `faults`, `+`, ...)
//! - requests: `<prefix>/command`
//!
//! ## Resource Guarantees
//!
//! A session owns exactly one socket. Closing it, dropping it, or failing to
//! connect always stops the event loop task and releases the socket, so a probe
//! scenario can return early on any error without leaking connections.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

pub use config::{ConfigError, ConnectionConfig};
pub use message_manager::{MessageQueue, MqttMessage};
pub use mqtt_handler::{
    Closed, Configured, Connected, ConnectionStatus, DeviceSession, SessionHooks, SessionOptions,
};
