//! In-process MQTT 3.1.1 broker stand-in for integration tests.
//!
//! Speaks just enough of the protocol for one client at a time: CONNECT,
//! SUBSCRIBE, PUBLISH (QoS 0-2), PINGREQ and DISCONNECT. A command published to
//! `<prefix>/command` is answered with a `CURRENT-STATE` status message, the way
//! the devices do.

#![allow(dead_code)]

use mqttprobe::mqtt::ConnectionConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const USERNAME: &str = "serial";
pub const PASSWORD: &str = "secret";
pub const PREFIX: &str = "475";
pub const CURRENT_STATE: &str =
    r#"{"msg":"CURRENT-STATE","time":"2024-01-01T00:00:00Z","product-state":{"fpwr":"OFF"}}"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// Accepts the test credentials and answers commands
    Responsive,
    /// Accepts the test credentials and never publishes
    Idle,
    /// Refuses every CONNECT with NotAuthorized
    RejectCredentials,
    /// Accepts the socket and never answers anything
    Silent,
    /// Accepts the connection and rejects every subscription
    RejectSubscriptions,
    /// Answers every command with a burst of status messages
    Chatty,
    /// Acknowledges the CONNECT, then closes the socket
    HangUpAfterConnect,
}

/// Status messages sent per command by [`Behavior::Chatty`]
pub const CHATTY_BURST: usize = 3;

#[derive(Default)]
pub struct BrokerStats {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub connects: AtomicUsize,
    pub subscriptions: Mutex<Vec<String>>,
    pub publishes: Mutex<Vec<(String, Vec<u8>)>>,
}

pub struct FakeBroker {
    pub addr: SocketAddr,
    stats: Arc<BrokerStats>,
}

impl FakeBroker {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(BrokerStats::default());

        let shared = stats.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.opened.fetch_add(1, Ordering::SeqCst);
                let connection_stats = shared.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, behavior, &connection_stats).await;
                    connection_stats.closed.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        Self { addr, stats }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", USERNAME, PASSWORD, PREFIX)
            .with_port(self.port())
            .with_client_id("probe-test")
    }

    pub fn opened(&self) -> usize {
        self.stats.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.stats.closed.load(Ordering::SeqCst)
    }

    /// Waits until every accepted socket has been closed by the client.
    pub async fn all_released(&self) -> bool {
        for _ in 0..150 {
            if self.opened() > 0 && self.opened() == self.closed() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.stats.subscriptions.lock().unwrap().clone()
    }

    pub fn publishes(&self) -> Vec<(String, Vec<u8>)> {
        self.stats.publishes.lock().unwrap().clone()
    }
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn serve(mut stream: TcpStream, behavior: Behavior, stats: &BrokerStats) -> std::io::Result<()> {
    let mut subscribed = false;

    while let Some((header, body)) = read_packet(&mut stream).await? {
        if behavior == Behavior::Silent {
            continue;
        }

        match header >> 4 {
            // CONNECT
            1 => {
                stats.connects.fetch_add(1, Ordering::SeqCst);
                let (username, password) = parse_credentials(&body);
                let authorized = behavior != Behavior::RejectCredentials
                    && username.as_deref() == Some(USERNAME)
                    && password.as_deref() == Some(PASSWORD);
                let code = if authorized { 0x00 } else { 0x05 };
                stream.write_all(&[0x20, 0x02, 0x00, code]).await?;
                if !authorized || behavior == Behavior::HangUpAfterConnect {
                    return Ok(());
                }
            }
            // PUBLISH
            3 => {
                let qos = (header >> 1) & 0x03;
                let (topic, mut pos) = read_str(&body, 0);
                let pid = if qos > 0 {
                    let pid = [body[pos], body[pos + 1]];
                    pos += 2;
                    Some(pid)
                } else {
                    None
                };
                let payload = body[pos..].to_vec();
                stats
                    .publishes
                    .lock()
                    .unwrap()
                    .push((topic.clone(), payload));

                match (qos, pid) {
                    (1, Some(pid)) => stream.write_all(&[0x40, 0x02, pid[0], pid[1]]).await?,
                    (2, Some(pid)) => stream.write_all(&[0x50, 0x02, pid[0], pid[1]]).await?,
                    _ => {}
                }

                let replies = match behavior {
                    Behavior::Responsive => 1,
                    Behavior::Chatty => CHATTY_BURST,
                    _ => 0,
                };
                if subscribed {
                    if let Some(prefix) = topic.strip_suffix("/command") {
                        let status_topic = format!("{}/status/current", prefix);
                        for _ in 0..replies {
                            stream
                                .write_all(&encode_publish(&status_topic, CURRENT_STATE.as_bytes()))
                                .await?;
                        }
                    }
                }
            }
            // PUBREL
            6 => {
                stream.write_all(&[0x70, 0x02, body[0], body[1]]).await?;
            }
            // SUBSCRIBE
            8 => {
                let mut codes = Vec::new();
                let mut pos = 2;
                while pos + 2 <= body.len() {
                    let (topic, next) = read_str(&body, pos);
                    let requested = body[next];
                    pos = next + 1;
                    stats.subscriptions.lock().unwrap().push(topic);
                    codes.push(if behavior == Behavior::RejectSubscriptions {
                        0x80
                    } else {
                        requested.min(2)
                    });
                }
                subscribed = true;
                let mut packet = vec![0x90, (2 + codes.len()) as u8, body[0], body[1]];
                packet.extend(codes);
                stream.write_all(&packet).await?;
            }
            // PINGREQ
            12 => stream.write_all(&[0xD0, 0x00]).await?,
            // DISCONNECT
            14 => return Ok(()),
            _ => {}
        }
    }
    Ok(())
}

async fn read_packet(stream: &mut TcpStream) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; 1];
    if stream.read(&mut header).await? == 0 {
        return Ok(None);
    }

    let mut length = 0usize;
    let mut multiplier = 1usize;
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        length += (byte[0] & 0x7f) as usize * multiplier;
        if byte[0] & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    Ok(Some((header[0], body)))
}

fn read_str(body: &[u8], pos: usize) -> (String, usize) {
    let len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    let start = pos + 2;
    let value = String::from_utf8_lossy(&body[start..start + len]).to_string();
    (value, start + len)
}

fn parse_credentials(body: &[u8]) -> (Option<String>, Option<String>) {
    // protocol name, level, flags, keep alive
    let (_, pos) = read_str(body, 0);
    let flags = body[pos + 1];
    let mut pos = pos + 4;

    let (_client_id, next) = read_str(body, pos);
    pos = next;
    if flags & 0x04 != 0 {
        let (_, next) = read_str(body, pos);
        let (_, next) = read_str(body, next);
        pos = next;
    }
    let mut username = None;
    let mut password = None;
    if flags & 0x80 != 0 {
        let (value, next) = read_str(body, pos);
        username = Some(value);
        pos = next;
    }
    if flags & 0x40 != 0 {
        let (value, _) = read_str(body, pos);
        password = Some(value);
    }
    (username, password)
}

fn encode_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut remaining = 2 + topic.len() + payload.len();
    let mut packet = vec![0x30];
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if remaining == 0 {
            break;
        }
    }
    packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    packet.extend_from_slice(topic.as_bytes());
    packet.extend_from_slice(payload);
    packet
}
