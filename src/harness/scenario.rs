//! Scenario runner
//!
//! Runs named scenarios strictly one after another. Each scenario opens its own
//! session and closes it before returning, whatever the outcome; errors are
//! folded into that scenario's [`ScenarioResult`] and the next scenario runs.

use super::probe::{run_probe, ProbeRequest};
use super::report::{ConsoleReporter, ScenarioResult, Verdict};
use crate::error::ProbeError;
use crate::mqtt::{Configured, ConnectionConfig, DeviceSession, SessionHooks, SessionOptions};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const CALLBACK_API_HINT: &str =
    "The client library's callback contract changed; compare event order with the upgrade notes";

#[derive(Debug, Clone, PartialEq)]
pub enum Scenario {
    /// Connect, confirm, disconnect
    BasicConnection,
    /// Subscribe to status topics, publish a request, collect responses
    PublishSubscribe,
    /// Back-to-back connect/close cycles
    RapidReconnect { cycles: u32, pause: Duration },
    /// Callback invocation order and status bookkeeping
    CallbackApi,
}

impl Scenario {
    pub fn name(&self) -> &'static str {
        match self {
            Scenario::BasicConnection => "Basic Connection",
            Scenario::PublishSubscribe => "Publish/Subscribe",
            Scenario::RapidReconnect { .. } => "Rapid Reconnect",
            Scenario::CallbackApi => "Callback API",
        }
    }

    pub fn standard_suite(cycles: u32, pause: Duration) -> Vec<Scenario> {
        vec![
            Scenario::BasicConnection,
            Scenario::PublishSubscribe,
            Scenario::RapidReconnect { cycles, pause },
            Scenario::CallbackApi,
        ]
    }

    /// Quick mode: only the first scenario of the suite.
    pub fn quick_suite() -> Vec<Scenario> {
        vec![Scenario::BasicConnection]
    }
}

pub struct ScenarioRunner<W: Write> {
    config: ConnectionConfig,
    options: SessionOptions,
    probe: ProbeRequest,
    reporter: ConsoleReporter<W>,
}

impl<W: Write> ScenarioRunner<W> {
    pub fn new(
        config: ConnectionConfig,
        options: SessionOptions,
        probe: ProbeRequest,
        reporter: ConsoleReporter<W>,
    ) -> Self {
        Self {
            config,
            options,
            probe,
            reporter,
        }
    }

    pub fn reporter(&mut self) -> &mut ConsoleReporter<W> {
        &mut self.reporter
    }

    pub fn into_reporter(self) -> ConsoleReporter<W> {
        self.reporter
    }

    pub async fn run(&mut self, scenarios: &[Scenario]) -> Vec<ScenarioResult> {
        self.reporter.banner(&self.config, scenarios.len());

        let mut results = Vec::with_capacity(scenarios.len());
        for (index, scenario) in scenarios.iter().enumerate() {
            self.reporter
                .scenario_started(index + 1, scenarios.len(), scenario.name());
            info!("Starting scenario: {}", scenario.name());

            let started = Instant::now();
            let outcome = match scenario {
                Scenario::BasicConnection => self.basic_connection().await,
                Scenario::PublishSubscribe => self.publish_subscribe().await,
                Scenario::RapidReconnect { cycles, pause } => {
                    self.rapid_reconnect(*cycles, *pause).await
                }
                Scenario::CallbackApi => self.callback_api().await,
            };

            let result = ScenarioResult::from_outcome(scenario.name(), outcome, started.elapsed());
            info!("Scenario {} finished: {}", result.name, result.status);
            self.reporter.scenario_finished(&result);
            results.push(result);
        }
        results
    }

    fn session(&self) -> DeviceSession<Configured> {
        DeviceSession::create(self.config.clone(), self.options.clone())
    }

    fn announce_connect(&mut self) {
        let line = format!(
            "Connecting to {}:{} as {}",
            self.config.host, self.config.port, self.config.client_id
        );
        self.reporter.line(&line);
    }

    async fn basic_connection(&mut self) -> Result<Verdict, ProbeError> {
        self.announce_connect();
        let started = Instant::now();
        let mut session = self.session().connect().await?;
        let connect_time = started.elapsed();
        let connected = session.is_connected();
        let attempts = session.status().connection_attempts;

        let closed = session.close().await;
        self.reporter.line("Disconnected");

        if !connected {
            return Ok(Verdict::failed(
                "session lost the connection right after CONNACK",
                Some(crate::error::FailureKind::Disconnected),
                "The device accepted and dropped the connection; check for a competing client",
            ));
        }
        debug!("Status after close: {:?}", closed.status());
        Ok(Verdict::passed(format!(
            "connected in {:.2}s (attempts: {})",
            connect_time.as_secs_f64(),
            attempts
        )))
    }

    async fn publish_subscribe(&mut self) -> Result<Verdict, ProbeError> {
        self.announce_connect();
        let mut session = self.session().connect().await?;
        let topics = self.probe.status_suffixes.join(", ");
        self.reporter
            .line(&format!("Subscribing to {}/status/{{{}}}", self.config.topic_prefix, topics));

        let probe = run_probe(&mut session, &self.probe).await;
        session.close().await;
        let report = probe?;

        if let Some(topic) = &report.published {
            self.reporter.line(&format!("Request published to {}", topic));
        }
        for message in &report.messages {
            self.reporter.message(message);
        }

        if report.is_idle() {
            return Ok(Verdict::warning(format!(
                "no messages within {:.0}s (device may be idle)",
                self.probe.window.as_secs_f64()
            ))
            .with_messages(0));
        }

        let mut detail = report
            .kinds()
            .iter()
            .map(|(kind, count)| format!("{} x{}", kind, count))
            .collect::<Vec<_>>()
            .join(", ");
        if report.dropped > 0 {
            detail.push_str(&format!("; {} dropped (queue full)", report.dropped));
        }
        Ok(Verdict::passed(detail).with_messages(report.messages.len()))
    }

    async fn rapid_reconnect(&mut self, cycles: u32, pause: Duration) -> Result<Verdict, ProbeError> {
        if cycles == 0 {
            return Ok(Verdict::warning("no reconnect cycles configured"));
        }

        let mut succeeded = 0u32;
        let mut first_failure: Option<ProbeError> = None;

        for cycle in 1..=cycles {
            match self.session().connect().await {
                Ok(session) => {
                    session.close().await;
                    succeeded += 1;
                    self.reporter
                        .line(&format!("cycle {}/{}: connected and closed", cycle, cycles));
                }
                Err(e) => {
                    self.reporter.line(&format!("cycle {}/{}: {}", cycle, cycles, e));
                    first_failure.get_or_insert(e);
                }
            }
            if cycle < cycles {
                tokio::time::sleep(pause).await;
            }
        }

        match first_failure {
            None => Ok(Verdict::passed(format!(
                "{}/{} cycles connected",
                succeeded, cycles
            ))),
            Some(err) => Ok(Verdict::failed(
                format!(
                    "{}/{} cycles connected; first failure: {}",
                    succeeded, cycles, err
                ),
                Some(err.kind()),
                err.hint(),
            )),
        }
    }

    async fn callback_api(&mut self) -> Result<Verdict, ProbeError> {
        let connection_events: Arc<Mutex<Vec<(bool, Option<String>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let seen_messages = Arc::new(AtomicUsize::new(0));

        let events = connection_events.clone();
        let counter = seen_messages.clone();
        let hooks = SessionHooks::default()
            .on_connection(move |connected, error| {
                if let Ok(mut guard) = events.lock() {
                    guard.push((connected, error.map(str::to_string)));
                }
            })
            .on_message(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        self.announce_connect();
        let mut session = self.session().with_hooks(hooks).connect().await?;
        let mut failures = Vec::new();

        let after_connect = snapshot(&connection_events);
        if after_connect.first() != Some(&(true, None)) {
            failures.push(format!(
                "connection callback after CONNACK was {:?}, expected (true, None)",
                after_connect.first()
            ));
        }
        let status = session.status().clone();
        if !status.connected {
            failures.push("status not connected after CONNACK".to_string());
        }
        if status.connection_attempts != 1 {
            failures.push(format!(
                "expected 1 connection attempt, status reports {}",
                status.connection_attempts
            ));
        }
        if status.last_connect_time.is_none() {
            failures.push("no connect timestamp recorded".to_string());
        }

        let probe = run_probe(&mut session, &self.probe).await;
        let mut closed = session.close().await;
        let report = probe?;
        let collected = report.messages.len() + closed.take_messages().len();
        let dropped = closed.dropped_messages();

        let seen = seen_messages.load(Ordering::SeqCst);
        if seen != collected + dropped {
            failures.push(format!(
                "message callback saw {} messages, session collected {} and dropped {}",
                seen, collected, dropped
            ));
        }
        if closed.status().connected {
            failures.push("status still connected after close".to_string());
        }
        if closed.status().last_disconnect_time.is_none() {
            failures.push("no disconnect timestamp recorded".to_string());
        }
        let all_events = snapshot(&connection_events);
        if all_events.last() != Some(&(false, None)) {
            failures.push(format!(
                "connection callback after close was {:?}, expected (false, None)",
                all_events.last()
            ));
        }

        self.reporter.line(&format!(
            "{} connection callback(s), {} message callback(s)",
            all_events.len(),
            seen
        ));

        if failures.is_empty() {
            Ok(Verdict::passed("callbacks and status match the expected contract")
                .with_messages(collected))
        } else {
            Ok(
                Verdict::failed(failures.join("; "), None, CALLBACK_API_HINT)
                    .with_messages(collected),
            )
        }
    }
}

fn snapshot(events: &Arc<Mutex<Vec<(bool, Option<String>)>>>) -> Vec<(bool, Option<String>)> {
    events.lock().map(|guard| guard.clone()).unwrap_or_default()
}
