//! Command line surface: flags first, interactive prompts for whatever is missing.

use crate::mqtt::config::{validate_prefix, ConnectionConfig};
use crate::settings::ProbeSettings;
use clap::{ArgAction, Parser};
use color_eyre::eyre::{eyre, Result};
use dialoguer::{Input, Password};
use std::path::PathBuf;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(
    name = "mqttprobe",
    version,
    about = "Connect/subscribe/publish smoke test against an MQTT-speaking device"
)]
pub struct Cli {
    /// Device IP address or hostname
    #[arg(long, short = 'H')]
    pub host: Option<String>,

    /// MQTT username (usually the device serial)
    #[arg(long, short)]
    pub username: Option<String>,

    /// MQTT password
    #[arg(long, short = 'P')]
    pub password: Option<String>,

    /// Topic prefix, 3-4 digits (e.g. 475)
    #[arg(long, short = 't')]
    pub prefix: Option<String>,

    /// Broker port on the device
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Client ID (default: <client_id_prefix>-<pid>)
    #[arg(long, short)]
    pub client_id: Option<String>,

    /// Run only the basic connection scenario
    #[arg(long, short)]
    pub quick: bool,

    /// Fail instead of prompting for missing parameters
    #[arg(long)]
    pub non_interactive: bool,

    /// Seconds to wait for device responses
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Seconds to wait for the connection to be acknowledged
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Connect/close cycles in the rapid reconnect scenario
    #[arg(long)]
    pub stress_cycles: Option<u32>,

    /// Status topic suffix to subscribe to (repeatable, e.g. --suffix current --suffix faults)
    #[arg(long = "suffix")]
    pub suffixes: Vec<String>,

    /// Quality of Service level (0, 1, or 2)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub qos: Option<u8>,

    /// Settings file (default: ~/.config/mqttprobe/settings.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write the default settings file and exit
    #[arg(long)]
    pub init_config: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn log_level(&self) -> Level {
        match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }

    /// Flags win over the settings file.
    pub fn apply_overrides(&self, settings: &mut ProbeSettings) {
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(timeout) = self.timeout {
            settings.response_timeout_secs = timeout;
        }
        if let Some(timeout) = self.connect_timeout {
            settings.connect_timeout_secs = timeout;
        }
        if let Some(cycles) = self.stress_cycles {
            settings.stress_cycles = cycles;
        }
        if !self.suffixes.is_empty() {
            settings.status_suffixes = self.suffixes.clone();
        }
        if let Some(qos) = self.qos {
            settings.qos = qos;
        }
    }

    /// Builds validated connection parameters, prompting for missing ones
    /// unless `--non-interactive` is set.
    pub fn connection_config(&self, settings: &ProbeSettings) -> Result<ConnectionConfig> {
        let interactive = !self.non_interactive;

        let host = resolve(self.host.clone(), interactive, "--host", || {
            prompt_text("Device IP address", |input| {
                if input.trim().is_empty() {
                    Err("Host cannot be empty".to_string())
                } else {
                    Ok(())
                }
            })
        })?;
        let username = resolve(self.username.clone(), interactive, "--username", || {
            prompt_text("MQTT username", |input| {
                if input.is_empty() {
                    Err("MQTT username cannot be empty".to_string())
                } else {
                    Ok(())
                }
            })
        })?;
        let password = resolve(self.password.clone(), interactive, "--password", || {
            Password::new()
                .with_prompt("MQTT password")
                .interact()
                .map_err(|e| eyre!("Failed to get password input: {}", e))
        })?;
        let prefix = resolve(self.prefix.clone(), interactive, "--prefix", || {
            prompt_text("Topic prefix (3-4 digits, e.g. 475)", |input| {
                validate_prefix(input).map_err(|e| e.to_string())
            })
        })?;

        let client_id = self
            .client_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", settings.client_id_prefix, std::process::id()));
        let qos = settings
            .qos()
            .map_err(|e| eyre!("Invalid QoS setting: {}", e))?;

        let config = ConnectionConfig::new(host.trim(), username, password, prefix.trim())
            .with_port(settings.port)
            .with_client_id(client_id)
            .with_keep_alive(settings.keep_alive())
            .with_qos(qos);

        config
            .validate()
            .map_err(|e| eyre!("Invalid connection parameters: {}", e))?;
        Ok(config)
    }
}

fn resolve(
    value: Option<String>,
    interactive: bool,
    flag: &str,
    prompt: impl FnOnce() -> Result<String>,
) -> Result<String> {
    match value {
        Some(value) => Ok(value),
        None if interactive => prompt(),
        None => Err(eyre!(
            "{} is required. Pass {} or run without --non-interactive",
            flag.trim_start_matches("--"),
            flag
        )),
    }
}

fn prompt_text(
    prompt: &str,
    check: impl Fn(&str) -> std::result::Result<(), String>,
) -> Result<String> {
    Input::<String>::new()
        .with_prompt(prompt)
        .validate_with(|input: &String| check(input))
        .interact_text()
        .map_err(|e| eyre!("Failed to get input for '{}': {}", prompt, e))
}
