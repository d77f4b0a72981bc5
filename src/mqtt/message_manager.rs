use chrono::{DateTime, Local};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use tracing::warn;

const PREVIEW_CHARS: usize = 60;

/// A message observed on one of the subscribed topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub timestamp: DateTime<Local>,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let payload = self.payload_str();
        let preview: String = payload.chars().take(PREVIEW_CHARS).collect();
        let ellipsis = if payload.chars().count() > PREVIEW_CHARS {
            "..."
        } else {
            ""
        };
        write!(
            f,
            "{} {} -> {}{}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.topic,
            preview,
            ellipsis
        )
    }
}

impl MqttMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: u8, retain: bool) -> Self {
        Self::with_timestamp(topic, payload, qos, retain, Local::now())
    }

    pub fn with_timestamp(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: u8,
        retain: bool,
        timestamp: DateTime<Local>,
    ) -> Self {
        MqttMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            timestamp,
        }
    }

    /// Payload as text; invalid UTF-8 sequences are replaced.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// The `"msg"` field of a JSON object payload, e.g. `CURRENT-STATE`.
    pub fn message_kind(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(&self.payload).ok()?;
        value.get("msg")?.as_str().map(str::to_string)
    }
}

/// Arrival-ordered buffer that drops the oldest entry once full.
#[derive(Debug)]
pub struct MessageQueue {
    messages: VecDeque<MqttMessage>,
    capacity: usize,
    dropped: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, message: MqttMessage) {
        if self.messages.len() == self.capacity {
            if let Some(oldest) = self.messages.pop_front() {
                self.dropped += 1;
                warn!(
                    "Message queue full ({}), dropping oldest message from {}",
                    self.capacity, oldest.topic
                );
            }
        }
        self.messages.push_back(message);
    }

    pub fn drain(&mut self) -> Vec<MqttMessage> {
        self.messages.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages discarded because of overflow since creation.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}
