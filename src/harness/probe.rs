//! Subscribe/publish probe
//!
//! Subscribes to the status topics under the device prefix, optionally publishes
//! one request and collects what arrives within the window. An empty result is
//! not an error: idle devices often stay quiet.

use crate::error::ProbeError;
use crate::mqtt::{Connected, DeviceSession, MqttMessage};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Payload published once the subscriptions are in place
#[derive(Clone, Debug, PartialEq)]
pub struct PublishRequest {
    /// Appended as `<prefix>/<topic_suffix>`
    pub topic_suffix: String,
    pub payload: Vec<u8>,
}

impl PublishRequest {
    /// `{"msg":"<kind>","time":"<UTC now>"}` on `<prefix>/<topic_suffix>`
    pub fn status_request(topic_suffix: &str, kind: &str) -> Self {
        let payload = serde_json::json!({
            "msg": kind,
            "time": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        });
        Self {
            topic_suffix: topic_suffix.to_string(),
            payload: payload.to_string().into_bytes(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProbeRequest {
    pub status_suffixes: Vec<String>,
    pub request: Option<PublishRequest>,
    pub window: Duration,
    pub stop_after: Option<usize>,
    pub ack_timeout: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct ProbeReport {
    pub subscribed: Vec<String>,
    pub published: Option<String>,
    /// Arrival order
    pub messages: Vec<MqttMessage>,
    /// Seen but discarded because the session queue was full
    pub dropped: usize,
}

impl ProbeReport {
    pub fn is_idle(&self) -> bool {
        self.messages.is_empty()
    }

    /// Message kinds (`"msg"` field) with their counts, sorted by kind.
    pub fn kinds(&self) -> BTreeMap<String, usize> {
        let mut kinds = BTreeMap::new();
        for message in &self.messages {
            let kind = message
                .message_kind()
                .unwrap_or_else(|| "non-JSON".to_string());
            *kinds.entry(kind).or_insert(0) += 1;
        }
        kinds
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.messages
            .iter()
            .filter(|m| m.message_kind().as_deref() == Some(kind))
            .count()
    }
}

/// Runs the probe on an open session. The first subscribe or publish error
/// aborts the probe; the caller still owns and closes the session.
pub async fn run_probe(
    session: &mut DeviceSession<Connected>,
    request: &ProbeRequest,
) -> Result<ProbeReport, ProbeError> {
    let topics = session.config().status_topics(&request.status_suffixes)?;
    let mut report = ProbeReport::default();

    for topic in topics {
        session.subscribe(&topic, request.ack_timeout).await?;
        report.subscribed.push(topic);
    }

    if let Some(publish) = &request.request {
        let topic = session.config().command_topic(&publish.topic_suffix);
        session.publish(&topic, publish.payload.clone()).await?;
        info!("Request published to {}", topic);
        report.published = Some(topic);
    }

    report.messages = session
        .collect_messages(request.window, request.stop_after)
        .await?;
    report.dropped = session.dropped_messages();

    debug!(
        "Probe finished: {} subscriptions, {} messages",
        report.subscribed.len(),
        report.messages.len()
    );
    Ok(report)
}
