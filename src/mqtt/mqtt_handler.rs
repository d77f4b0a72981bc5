//! Device session with statum state machine around the rumqttc event loop
//!
//! The event loop runs on its own tokio task and reports everything it sees over
//! a bounded channel. The session side never polls: every wait is "first of
//! {awaited event, deadline}".
//!
//! # State Machine
//!
//! ```text
//! Configured ──connect()──► Connected ──close()──► Closed
//!     │                         │
//!     └── error / timeout ──────┴── drop: event loop cancelled, socket released
//! ```

use super::config::ConnectionConfig;
use super::message_manager::{MessageQueue, MqttMessage};
use crate::error::ProbeError;
use chrono::{DateTime, Local};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet,
    SubscribeReasonCode,
};
use serde::Serialize;
use statum::{machine, state};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type MessageCallback = Arc<dyn Fn(&MqttMessage) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(bool, Option<&str>) + Send + Sync>;

/// Connection bookkeeping, updated as session events are absorbed.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub last_connect_time: Option<DateTime<Local>>,
    pub last_disconnect_time: Option<DateTime<Local>>,
    pub connection_attempts: u32,
    pub last_error: Option<String>,
}

/// Tunables for one session
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Upper bound for socket + CONNACK
    pub connect_timeout: Duration,
    /// How long `close()` waits for the event loop to flush DISCONNECT
    pub close_grace: Duration,
    pub queue_capacity: usize,
    pub event_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            close_grace: Duration::from_secs(2),
            queue_capacity: 1000,
            event_capacity: 256,
        }
    }
}

/// Optional user callbacks, invoked from the event loop task.
///
/// A panicking callback is caught and logged; the event loop keeps running.
#[derive(Clone, Default)]
pub struct SessionHooks {
    on_message: Option<MessageCallback>,
    on_connection: Option<ConnectionCallback>,
}

impl fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionHooks")
            .field("on_message", &self.on_message.is_some())
            .field("on_connection", &self.on_connection.is_some())
            .finish()
    }
}

impl SessionHooks {
    pub fn on_message(mut self, callback: impl Fn(&MqttMessage) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(callback));
        self
    }

    pub fn on_connection(
        mut self,
        callback: impl Fn(bool, Option<&str>) + Send + Sync + 'static,
    ) -> Self {
        self.on_connection = Some(Arc::new(callback));
        self
    }

    fn message(&self, message: &MqttMessage) {
        if let Some(callback) = &self.on_message {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                error!("Error in message callback: callback panicked on {}", message.topic);
            }
        }
    }

    fn connection(&self, connected: bool, error: Option<&str>) {
        if let Some(callback) = &self.on_connection {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(connected, error))).is_err() {
                error!("Error in connection callback: callback panicked");
            }
        }
    }
}

/// What the event loop task reports to the session
#[derive(Debug)]
pub enum SessionEvent {
    Connected,
    Message(MqttMessage),
    SubAck { pkid: u16, granted: bool },
    Disconnected { reason: Option<String> },
    Failed(ProbeError),
}

enum Wait {
    Event(SessionEvent),
    TimedOut,
    Closed,
}

/// Owns the network side of a session. Dropping it cancels the event loop,
/// which drops the socket.
struct SessionLink {
    client: AsyncClient,
    events: mpsc::Receiver<SessionEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Drop for SessionLink {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct LoopContext {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl LoopContext {
    fn timeout_error(&self) -> ProbeError {
        ProbeError::ConnectionTimeout {
            host: self.host.clone(),
            port: self.port,
            timeout: self.connect_timeout,
        }
    }
}

/// Maps a refused CONNACK to the error taxonomy.
pub fn classify_connack(code: ConnectReturnCode) -> ProbeError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            ProbeError::AuthorizationRefused {
                code: format!("{:?}", code),
            }
        }
        other => ProbeError::ConnectionRefused {
            code: format!("{:?}", other),
        },
    }
}

fn classify_connection_error(err: ConnectionError, ctx: &LoopContext) -> ProbeError {
    match err {
        ConnectionError::ConnectionRefused(code) => classify_connack(code),
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => ctx.timeout_error(),
        ConnectionError::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
            ctx.timeout_error()
        }
        ConnectionError::Io(io) => ProbeError::NetworkUnreachable(io.to_string()),
        other => ProbeError::NetworkUnreachable(other.to_string()),
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    hooks: SessionHooks,
    ctx: LoopContext,
) {
    let mut connected = false;

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Event loop cancelled for {}:{}", ctx.host, ctx.port);
                break;
            }
            polled = event_loop.poll() => polled,
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to {}:{} ({:?})", ctx.host, ctx.port, ack.code);
                connected = true;
                hooks.connection(true, None);
                SessionEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = MqttMessage::new(
                    publish.topic.clone(),
                    publish.payload.to_vec(),
                    publish.qos as u8,
                    publish.retain,
                );
                debug!("Received {} bytes on {}", message.payload.len(), message.topic);
                hooks.message(&message);
                SessionEvent::Message(message)
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let granted = ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                debug!("Subscription acknowledged (pkid: {}, QoS: {:?})", ack.pkid, ack.return_codes);
                SessionEvent::SubAck {
                    pkid: ack.pkid,
                    granted,
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                debug!("Message published (pkid: {})", ack.pkid);
                continue;
            }
            Ok(Event::Incoming(Packet::PubComp(ack))) => {
                debug!("Message published (pkid: {})", ack.pkid);
                continue;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let reason = format!("{}:{} sent DISCONNECT", ctx.host, ctx.port);
                warn!("{}", reason);
                hooks.connection(false, Some(&reason));
                let _ = events
                    .send(SessionEvent::Disconnected {
                        reason: Some(reason),
                    })
                    .await;
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Disconnected from {}:{}", ctx.host, ctx.port);
                hooks.connection(false, None);
                let _ = events
                    .send(SessionEvent::Disconnected { reason: None })
                    .await;
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                let failure = if connected {
                    ProbeError::Disconnected(e.to_string())
                } else {
                    classify_connection_error(e, &ctx)
                };
                warn!("Event loop for {}:{} stopped: {}", ctx.host, ctx.port, failure);
                hooks.connection(false, Some(&failure.to_string()));
                let _ = events.send(SessionEvent::Failed(failure)).await;
                break;
            }
        };

        if events.send(event).await.is_err() {
            debug!("Session dropped, stopping event loop");
            break;
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Configured,
    Connected,
    Closed,
}

/// One MQTT session against one device
#[machine]
pub struct DeviceSession<S: SessionState> {
    config: ConnectionConfig,
    options: SessionOptions,
    status: ConnectionStatus,
    queue: MessageQueue,
    hooks: SessionHooks,
    link: Option<SessionLink>,
    /// Why the event loop stopped, if it stopped on its own
    failure: Option<ProbeError>,
}

impl<S: SessionState> DeviceSession<S> {
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Drains queued messages in arrival order.
    pub fn take_messages(&mut self) -> Vec<MqttMessage> {
        self.queue.drain()
    }

    /// Messages discarded because the queue was full. They still reached the
    /// message callback.
    pub fn dropped_messages(&self) -> usize {
        self.queue.dropped()
    }

    async fn next_event(&mut self, deadline: Instant) -> Wait {
        let Some(link) = self.link.as_mut() else {
            return Wait::Closed;
        };
        match time::timeout_at(deadline, link.events.recv()).await {
            Ok(Some(event)) => Wait::Event(event),
            Ok(None) => Wait::Closed,
            Err(_) => Wait::TimedOut,
        }
    }

    /// Folds an event into status and queue. Messages are consumed, everything
    /// else is handed back to the waiting caller.
    fn absorb(&mut self, event: SessionEvent) -> Option<SessionEvent> {
        match event {
            SessionEvent::Message(message) => {
                self.queue.push(message);
                None
            }
            SessionEvent::Connected => {
                self.status.connected = true;
                self.status.last_connect_time = Some(Local::now());
                self.status.last_error = None;
                self.failure = None;
                Some(SessionEvent::Connected)
            }
            SessionEvent::Disconnected { reason } => {
                self.status.connected = false;
                self.status.last_disconnect_time = Some(Local::now());
                if let Some(reason) = &reason {
                    self.status.last_error = Some(format!("Unexpected disconnection: {}", reason));
                    self.failure = Some(ProbeError::Disconnected(reason.clone()));
                }
                Some(SessionEvent::Disconnected { reason })
            }
            SessionEvent::Failed(err) => {
                if self.status.connected {
                    self.status.last_disconnect_time = Some(Local::now());
                }
                self.status.connected = false;
                self.status.last_error = Some(err.to_string());
                self.failure = Some(err.clone());
                Some(SessionEvent::Failed(err))
            }
            other => Some(other),
        }
    }

    fn release(&mut self) {
        if let Some(link) = self.link.take() {
            debug!("Releasing connection to {}:{}", self.config.host, self.config.port);
            drop(link);
        }
    }
}

impl<S: SessionState> fmt::Debug for DeviceSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("client_id", &self.config.client_id)
            .field("status", &self.status)
            .field("queued", &self.queue.len())
            .field("linked", &self.link.is_some())
            .field("failure", &self.failure)
            .finish()
    }
}

impl DeviceSession<Configured> {
    pub fn create(config: ConnectionConfig, options: SessionOptions) -> Self {
        let queue = MessageQueue::new(options.queue_capacity);
        Self::new(
            config,
            options,
            ConnectionStatus::default(),
            queue,
            SessionHooks::default(),
            None,
            None,
        )
    }

    pub fn with_hooks(mut self, hooks: SessionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Opens the connection and waits for the CONNACK, a classified failure, or
    /// the connect timeout, whichever comes first.
    pub async fn connect(mut self) -> Result<DeviceSession<Connected>, ProbeError> {
        self.config.validate()?;
        self.status.connection_attempts += 1;

        info!(
            "Connecting to {}:{} as {} (attempt {})",
            self.config.host,
            self.config.port,
            self.config.client_id,
            self.status.connection_attempts
        );

        let capacity = self.options.event_capacity.max(1);
        let (client, event_loop) = AsyncClient::new(self.config.mqtt_options(), capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let ctx = LoopContext {
            host: self.config.host.clone(),
            port: self.config.port,
            connect_timeout: self.options.connect_timeout,
        };
        let timeout_error = ctx.timeout_error();

        let task = tokio::spawn(drive_event_loop(
            event_loop,
            events_tx,
            cancel.clone(),
            self.hooks.clone(),
            ctx,
        ));
        self.link = Some(SessionLink {
            client,
            events: events_rx,
            cancel,
            task: Some(task),
        });

        let deadline = Instant::now() + self.options.connect_timeout;
        loop {
            match self.next_event(deadline).await {
                Wait::Event(event) => match self.absorb(event) {
                    Some(SessionEvent::Connected) => break,
                    Some(SessionEvent::Failed(err)) => {
                        self.release();
                        return Err(err);
                    }
                    Some(SessionEvent::Disconnected { reason }) => {
                        self.release();
                        return Err(ProbeError::Disconnected(
                            reason.unwrap_or_else(|| "closed before CONNACK".to_string()),
                        ));
                    }
                    _ => {}
                },
                Wait::TimedOut => {
                    warn!("{}", timeout_error);
                    self.release();
                    self.status.last_error = Some(timeout_error.to_string());
                    self.hooks
                        .connection(false, Some(&timeout_error.to_string()));
                    return Err(timeout_error);
                }
                Wait::Closed => {
                    self.release();
                    return Err(ProbeError::NetworkUnreachable(
                        "event loop stopped before the broker answered".to_string(),
                    ));
                }
            }
        }

        Ok(self.transition())
    }
}

impl DeviceSession<Connected> {
    /// Absorbs whatever the event loop reported since the last wait.
    pub fn pump(&mut self) {
        let mut pending = Vec::new();
        if let Some(link) = self.link.as_mut() {
            while let Ok(event) = link.events.try_recv() {
                pending.push(event);
            }
        }
        for event in pending {
            self.absorb(event);
        }
    }

    pub fn is_connected(&mut self) -> bool {
        self.pump();
        self.status.connected && self.link.is_some()
    }

    /// Like [`Self::is_connected`], but hands back why the session dropped.
    fn ensure_connected(&mut self) -> Result<(), ProbeError> {
        if self.is_connected() {
            return Ok(());
        }
        Err(self.failure.clone().unwrap_or(ProbeError::NotConnected))
    }

    /// Subscribes and waits for the matching SUBACK.
    pub async fn subscribe(&mut self, topic: &str, ack_timeout: Duration) -> Result<(), ProbeError> {
        self.ensure_connected()?;
        let qos = self.config.qos;
        let link = self.link.as_ref().ok_or(ProbeError::NotConnected)?;
        link.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| ProbeError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        debug!("Subscription requested: {}", topic);

        let deadline = Instant::now() + ack_timeout;
        loop {
            match self.next_event(deadline).await {
                Wait::Event(event) => match self.absorb(event) {
                    Some(SessionEvent::SubAck {
                        pkid,
                        granted: true,
                    }) => {
                        info!("Subscribed to {} (pkid: {})", topic, pkid);
                        return Ok(());
                    }
                    Some(SessionEvent::SubAck { granted: false, .. }) => {
                        return Err(ProbeError::Subscribe {
                            topic: topic.to_string(),
                            reason: "rejected by broker".to_string(),
                        });
                    }
                    Some(SessionEvent::Failed(err)) => return Err(err),
                    Some(SessionEvent::Disconnected { reason }) => {
                        return Err(ProbeError::Disconnected(
                            reason.unwrap_or_else(|| "closed during subscribe".to_string()),
                        ));
                    }
                    _ => {}
                },
                Wait::TimedOut => {
                    return Err(ProbeError::Subscribe {
                        topic: topic.to_string(),
                        reason: format!("no SUBACK within {:.1}s", ack_timeout.as_secs_f32()),
                    });
                }
                Wait::Closed => {
                    return Err(ProbeError::Disconnected(
                        "event loop stopped during subscribe".to_string(),
                    ));
                }
            }
        }
    }

    pub async fn publish(
        &mut self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), ProbeError> {
        self.ensure_connected()?;
        let payload = payload.into();
        let size = payload.len();
        let qos = self.config.qos;
        let link = self.link.as_ref().ok_or(ProbeError::NotConnected)?;
        link.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| ProbeError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        debug!("Published {} bytes to {}", size, topic);
        Ok(())
    }

    /// Collects messages until `window` elapses or `stop_after` messages are
    /// queued. Messages that arrived before the call are included.
    pub async fn collect_messages(
        &mut self,
        window: Duration,
        stop_after: Option<usize>,
    ) -> Result<Vec<MqttMessage>, ProbeError> {
        let deadline = Instant::now() + window;
        loop {
            if let Some(limit) = stop_after {
                if self.queue.len() >= limit {
                    debug!("Collected {} messages, stopping early", limit);
                    break;
                }
            }
            match self.next_event(deadline).await {
                Wait::Event(event) => match self.absorb(event) {
                    Some(SessionEvent::Failed(err)) => return Err(err),
                    Some(SessionEvent::Disconnected { reason }) => {
                        return Err(ProbeError::Disconnected(
                            reason.unwrap_or_else(|| "closed while waiting".to_string()),
                        ));
                    }
                    _ => {}
                },
                Wait::TimedOut => break,
                Wait::Closed => {
                    return Err(ProbeError::Disconnected(
                        "event loop stopped while waiting".to_string(),
                    ));
                }
            }
        }
        Ok(self.queue.drain())
    }

    /// Sends DISCONNECT, waits briefly for the event loop to finish and releases
    /// the socket. Never fails; cleanup problems end up in `last_error`.
    pub async fn close(mut self) -> DeviceSession<Closed> {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.client.disconnect().await {
                let cleanup = ProbeError::Cleanup(e.to_string());
                warn!("{}", cleanup);
                self.status.last_error = Some(cleanup.to_string());
            }

            if let Some(mut task) = link.task.take() {
                match time::timeout(self.options.close_grace, &mut task).await {
                    Ok(Ok(())) => debug!("Event loop finished"),
                    Ok(Err(e)) => error!("Event loop task failed: {}", e),
                    Err(_) => {
                        warn!(
                            "Event loop did not stop within {:?}, cancelling",
                            self.options.close_grace
                        );
                        task.abort();
                    }
                }
            }

            let mut pending = Vec::new();
            while let Ok(event) = link.events.try_recv() {
                pending.push(event);
            }
            drop(link);
            for event in pending {
                self.absorb(event);
            }
        }

        if self.status.connected {
            self.status.connected = false;
            self.status.last_disconnect_time = Some(Local::now());
        }

        info!("Session to {}:{} closed", self.config.host, self.config.port);
        self.transition()
    }
}

impl DeviceSession<Closed> {
    pub fn is_connected(&self) -> bool {
        false
    }
}
