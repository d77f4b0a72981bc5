mod common;

use common::{Behavior, FakeBroker, CURRENT_STATE, PREFIX};
use mqttprobe::harness::{run_probe, ProbeRequest, PublishRequest};
use mqttprobe::mqtt::{ConnectionConfig, DeviceSession, SessionHooks, SessionOptions};
use mqttprobe::{FailureKind, ProbeError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn options(connect_timeout: Duration) -> SessionOptions {
    SessionOptions {
        connect_timeout,
        close_grace: Duration::from_secs(1),
        ..SessionOptions::default()
    }
}

fn probe(suffixes: &[&str], window: Duration) -> ProbeRequest {
    ProbeRequest {
        status_suffixes: suffixes.iter().map(|s| s.to_string()).collect(),
        request: Some(PublishRequest::status_request("command", "REQUEST-CURRENT-STATE")),
        window,
        stop_after: Some(1),
        ack_timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn connect_then_close_releases_the_socket() {
    let broker = FakeBroker::start(Behavior::Idle).await;

    let mut session = DeviceSession::create(broker.config(), options(Duration::from_secs(5)))
        .connect()
        .await
        .unwrap();
    assert!(session.is_connected());
    assert_eq!(session.status().connection_attempts, 1);
    assert!(session.status().last_connect_time.is_some());

    let closed = session.close().await;
    assert!(!closed.is_connected());
    assert!(!closed.status().connected);
    assert!(closed.status().last_disconnect_time.is_some());

    assert!(broker.all_released().await);
    assert_eq!(broker.opened(), 1);
}

#[tokio::test]
async fn silent_host_times_out_within_bound() {
    let broker = FakeBroker::start(Behavior::Silent).await;

    let started = Instant::now();
    let err = DeviceSession::create(broker.config(), options(Duration::from_secs(1)))
        .connect()
        .await
        .err()
        .expect("connect should fail");

    assert!(matches!(
        err,
        ProbeError::ConnectionTimeout { timeout, .. } if timeout == Duration::from_secs(1)
    ));
    assert_eq!(err.kind(), FailureKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(broker.all_released().await);
}

#[tokio::test]
async fn wrong_credentials_are_refused() {
    let broker = FakeBroker::start(Behavior::Responsive).await;
    let config = ConnectionConfig::new("127.0.0.1", "serial", "wrong", PREFIX)
        .with_port(broker.port())
        .with_client_id("probe-test");

    let err = DeviceSession::create(config, options(Duration::from_secs(5)))
        .connect()
        .await
        .err()
        .expect("connect should fail");

    assert!(matches!(err, ProbeError::AuthorizationRefused { .. }));
    assert_eq!(err.kind(), FailureKind::AuthorizationRefused);
    assert!(broker.all_released().await);
}

#[tokio::test]
async fn closed_port_is_network_unreachable() {
    let port = common::closed_port().await;
    let config = ConnectionConfig::new("127.0.0.1", "serial", "secret", PREFIX)
        .with_port(port)
        .with_client_id("probe-test");

    let err = DeviceSession::create(config, options(Duration::from_secs(5)))
        .connect()
        .await
        .err()
        .expect("connect should fail");

    assert!(matches!(err, ProbeError::NetworkUnreachable(_)), "{:?}", err);
}

#[tokio::test]
async fn failed_connect_reports_through_the_connection_callback() {
    let broker = FakeBroker::start(Behavior::RejectCredentials).await;
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let hooks = SessionHooks::default().on_connection(move |connected, error| {
        sink.lock().unwrap().push((connected, error.is_some()));
    });

    let result = DeviceSession::create(broker.config(), options(Duration::from_secs(5)))
        .with_hooks(hooks)
        .connect()
        .await;

    assert!(result.is_err());
    assert_eq!(events.lock().unwrap().as_slice(), &[(false, true)]);
}

#[tokio::test]
async fn probe_collects_current_state() {
    let broker = FakeBroker::start(Behavior::Responsive).await;
    let mut session = DeviceSession::create(broker.config(), options(Duration::from_secs(5)))
        .connect()
        .await
        .unwrap();

    let report = run_probe(&mut session, &probe(&["+"], Duration::from_secs(5)))
        .await
        .unwrap();
    session.close().await;

    assert_eq!(report.subscribed, vec!["475/status/+".to_string()]);
    assert_eq!(report.published.as_deref(), Some("475/command"));
    assert_eq!(report.count_kind("CURRENT-STATE"), 1);
    assert_eq!(report.messages[0].topic, "475/status/current");
    assert_eq!(report.messages[0].payload_str(), CURRENT_STATE);

    let publishes = broker.publishes();
    let (topic, payload) = &publishes[0];
    assert_eq!(topic, "475/command");
    let request: serde_json::Value = serde_json::from_slice(payload).unwrap();
    assert_eq!(request["msg"], "REQUEST-CURRENT-STATE");
    assert!(broker.all_released().await);
}

#[tokio::test]
async fn idle_device_yields_empty_report() {
    let broker = FakeBroker::start(Behavior::Idle).await;
    let mut session = DeviceSession::create(broker.config(), options(Duration::from_secs(5)))
        .connect()
        .await
        .unwrap();

    let report = run_probe(
        &mut session,
        &probe(&["current", "faults"], Duration::from_millis(500)),
    )
    .await
    .unwrap();
    session.close().await;

    assert!(report.is_idle());
    assert_eq!(
        broker.subscriptions(),
        vec!["475/status/current".to_string(), "475/status/faults".to_string()]
    );
}

#[tokio::test]
async fn rejected_subscription_is_a_subscribe_error() {
    let broker = FakeBroker::start(Behavior::RejectSubscriptions).await;
    let mut session = DeviceSession::create(broker.config(), options(Duration::from_secs(5)))
        .connect()
        .await
        .unwrap();

    let err = run_probe(&mut session, &probe(&["current"], Duration::from_secs(1)))
        .await
        .unwrap_err();
    let closed = session.close().await;

    assert!(matches!(err, ProbeError::Subscribe { ref topic, .. } if topic == "475/status/current"));
    assert_eq!(err.kind(), FailureKind::PublishSubscribe);
    assert!(!closed.is_connected());
    assert!(broker.publishes().is_empty());
    assert!(broker.all_released().await);
}

#[tokio::test]
async fn dropping_a_connected_session_releases_the_socket() {
    let broker = FakeBroker::start(Behavior::Idle).await;
    let session = DeviceSession::create(broker.config(), options(Duration::from_secs(5)))
        .connect()
        .await
        .unwrap();

    drop(session);
    assert!(broker.all_released().await);
}

#[tokio::test]
async fn publish_after_peer_hangup_reports_the_cause() {
    let broker = FakeBroker::start(Behavior::HangUpAfterConnect).await;
    let mut session = DeviceSession::create(broker.config(), options(Duration::from_secs(5)))
        .connect()
        .await
        .unwrap();

    assert!(broker.all_released().await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = session.publish("475/command", "{}").await.unwrap_err();
    assert!(matches!(err, ProbeError::Disconnected(_)), "{:?}", err);
    assert_eq!(err.kind(), FailureKind::Disconnected);
    assert!(!session.is_connected());
    session.close().await;
}

#[tokio::test]
async fn zero_event_capacity_still_connects() {
    let broker = FakeBroker::start(Behavior::Idle).await;
    let options = SessionOptions {
        event_capacity: 0,
        ..options(Duration::from_secs(5))
    };

    let mut session = DeviceSession::create(broker.config(), options)
        .connect()
        .await
        .unwrap();
    assert!(session.is_connected());
    session.close().await;
    assert!(broker.all_released().await);
}
