//! Connect-time negotiation and remote shutdown.

mod common;

use common::{
    client_options, connect, eventually, fast_server_options, next_frame, raw_session,
    raw_socket, spawn_server, InstrumentedMotor,
};
use daq_proxy::protocol::Frame;
use daq_proxy::{
    CallArgs, ClientOptions, Driver, ManifestBuilder, ParamKind, ProxyClient, ProxyError,
    ProxyServer, ServerOptions,
};
use futures::SinkExt;
use serde_json::Value;
use std::time::Duration;

struct Clashing;

impl Driver for Clashing {
    fn name(&self) -> &str {
        "Clashing"
    }

    fn register(builder: &mut ManifestBuilder<Self>) {
        builder.operation("home").handler(|_: &Clashing, _| Ok(Value::Null));
        builder
            .property("home", ParamKind::Float)
            .read_only(|_: &Clashing| Ok(Value::Null));
    }
}

#[tokio::test]
async fn test_client_receives_manifest_and_fingerprint() {
    let (motor, _log) = InstrumentedMotor::new(Duration::from_millis(1));
    let ts = spawn_server(motor, fast_server_options()).await;
    let client = connect(&ts.address, "A").await;

    assert_eq!(client.fingerprint(), ts.server.fingerprint());
    let manifest = client.manifest();
    assert_eq!(manifest.driver, "InstrumentedMotor");
    let mv = manifest.operation("move").expect("move is declared");
    assert!(mv.requires_admin);
    assert!(!manifest.operation("get_position").unwrap().requires_admin);
    assert_eq!(
        manifest.interrupt_operation().map(|op| op.name.as_str()),
        Some("stop")
    );
    assert!(client.session_id().is_some());
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_expected_fingerprint_mismatch_is_refused() {
    let (motor, _log) = InstrumentedMotor::new(Duration::from_millis(1));
    let ts = spawn_server(motor, fast_server_options()).await;

    let options = ClientOptions {
        expected_fingerprint: Some("0000".into()),
        ..client_options("picky")
    };
    match ProxyClient::connect(ts.address.as_str(), options).await {
        Err(ProxyError::IncompatibleManifest { expected, received }) => {
            assert_eq!(expected, "0000");
            assert_eq!(received, ts.server.fingerprint());
        }
        Ok(_) => panic!("connection should have been refused"),
        Err(other) => panic!("unexpected error {other:?}"),
    }

    let options = ClientOptions {
        expected_fingerprint: Some(ts.server.fingerprint().to_string()),
        ..client_options("matching")
    };
    assert!(ProxyClient::connect(ts.address.as_str(), options).await.is_ok());
}

#[tokio::test]
async fn test_wrong_protocol_version_is_rejected() {
    let (motor, _log) = InstrumentedMotor::new(Duration::from_millis(1));
    let ts = spawn_server(motor, fast_server_options()).await;

    let mut raw = raw_socket(&ts.address).await;
    raw.send(Frame::Hello {
        protocol_version: 99,
        client_name: "from the future".into(),
    })
    .await
    .unwrap();
    match next_frame(&mut raw).await {
        Some(Frame::HelloReject { reason }) => assert!(reason.contains("99"), "{reason}"),
        other => panic!("expected HELLO_REJECT, got {other:?}"),
    }
    assert!(next_frame(&mut raw).await.is_none());
    assert_eq!(ts.server.session_count(), 0);
}

#[tokio::test]
async fn test_first_frame_must_be_hello() {
    let (motor, _log) = InstrumentedMotor::new(Duration::from_millis(1));
    let ts = spawn_server(motor, fast_server_options()).await;

    let mut raw = raw_socket(&ts.address).await;
    raw.send(Frame::Call {
        call_id: 1,
        operation: "get_position".into(),
        args: CallArgs::none(),
    })
    .await
    .unwrap();
    assert!(matches!(
        next_frame(&mut raw).await,
        Some(Frame::HelloReject { .. })
    ));
}

#[tokio::test]
async fn test_silent_socket_times_out_during_handshake() {
    let (motor, _log) = InstrumentedMotor::new(Duration::from_millis(1));
    let ts = spawn_server(motor, fast_server_options()).await;

    let mut raw = raw_socket(&ts.address).await;
    // Never send HELLO; the handshake timeout (500 ms) closes the socket.
    assert!(next_frame(&mut raw).await.is_none());
    assert_eq!(ts.server.session_count(), 0);
}

#[test]
fn test_conflicting_manifest_fails_server_startup() {
    match ProxyServer::new(Clashing, ServerOptions::default()) {
        Err(ProxyError::ManifestConflict(message)) => assert!(message.contains("home")),
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("server should not start with a conflicting manifest"),
    }
}

#[tokio::test]
async fn test_shutdown_requires_admin() {
    let (motor, _log) = InstrumentedMotor::new(Duration::from_millis(1));
    let ts = spawn_server(motor, fast_server_options()).await;
    let client = connect(&ts.address, "A").await;

    assert!(matches!(
        client.shutdown_server().await,
        Err(ProxyError::PermissionDenied(_))
    ));
    assert!(!ts.server.is_shut_down());
    assert!(client.call("get_position", CallArgs::none()).await.is_ok());
}

#[tokio::test]
async fn test_admin_shutdown_says_bye_to_everyone() {
    let (motor, _log) = InstrumentedMotor::new(Duration::from_millis(1));
    let ts = spawn_server(motor, fast_server_options()).await;
    let admin = connect(&ts.address, "admin").await;
    let (mut bystander, _) = raw_session(&ts.address, "bystander").await;

    admin.request_admin().await.unwrap();
    admin.shutdown_server().await.unwrap();

    assert_eq!(next_frame(&mut bystander).await, Some(Frame::Bye));
    assert!(next_frame(&mut bystander).await.is_none());
    assert!(eventually(|| !admin.is_connected()).await);

    let served = tokio::time::timeout(Duration::from_secs(5), ts.handle)
        .await
        .expect("serve() should return after shutdown")
        .expect("serve task panicked");
    assert!(served.is_ok());
    assert!(ts.server.is_shut_down());
    assert_eq!(ts.server.session_count(), 0);
}
