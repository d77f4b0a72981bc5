//! Smoke tester for MQTT-speaking consumer devices.
//!
//! Connects to a device acting as broker, watches its status topics, sends a
//! state request and reports per-scenario pass/warning/fail verdicts.

pub mod cli;
pub mod error;
pub mod harness;
pub mod mqtt;
pub mod settings;

pub use error::{FailureKind, ProbeError};
