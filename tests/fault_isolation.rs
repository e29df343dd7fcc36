//! Driver failures and misbehaving sessions stay contained.

mod common;

use bytes::{BufMut, BytesMut};
use common::{
    connect, eventually, fast_server_options, next_frame, raw_session, spawn_server,
    InstrumentedMotor,
};
use daq_proxy::error::ErrorKind;
use daq_proxy::protocol::{Frame, CONTROL_CALL_ID};
use daq_proxy::{CallArgs, ProxyError};
use futures::SinkExt;
use serde_json::json;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn test_driver_error_keeps_its_kind() {
    let (motor, _log) = InstrumentedMotor::new(Duration::from_millis(1));
    let ts = spawn_server(motor, fast_server_options()).await;
    let client = connect(&ts.address, "A").await;

    match client.call("fail", CallArgs::none()).await {
        Err(ProxyError::Driver { kind, message }) => {
            assert_eq!(kind, "overtravel");
            assert!(message.contains("limit switch"), "{message}");
        }
        other => panic!("expected a driver error, got {other:?}"),
    }
    // The session is still usable.
    assert_eq!(client.call("get_position", CallArgs::none()).await.unwrap(), json!(0.0));
}

#[tokio::test]
async fn test_driver_panic_is_reported_and_server_survives() {
    let (motor, _log) = InstrumentedMotor::new(Duration::from_millis(1));
    let ts = spawn_server(motor, fast_server_options()).await;
    let a = connect(&ts.address, "A").await;
    let b = connect(&ts.address, "B").await;

    match a.call("explode", CallArgs::none()).await {
        Err(ProxyError::Driver { kind, message }) => {
            assert_eq!(kind, "panic");
            assert!(message.contains("firmware crashed"), "{message}");
        }
        other => panic!("expected a panic report, got {other:?}"),
    }

    // The dispatch lock was not poisoned: both sessions keep working.
    assert!(a.call("get_position", CallArgs::none()).await.is_ok());
    b.request_admin().await.unwrap();
    assert_eq!(b.call("move", CallArgs::positional([4.5])).await.unwrap(), json!(4.5));
    assert_eq!(ts.server.session_count(), 2);
}

#[tokio::test]
async fn test_unknown_operation_and_bad_arguments() {
    let (motor, log) = InstrumentedMotor::new(Duration::from_millis(1));
    let ts = spawn_server(motor, fast_server_options()).await;
    let client = connect(&ts.address, "A").await;
    client.request_admin().await.unwrap();

    assert!(matches!(
        client.call("teleport", CallArgs::none()).await,
        Err(ProxyError::UnknownOperation(_))
    ));
    assert!(matches!(
        client.call("move", CallArgs::positional(["far"])).await,
        Err(ProxyError::InvalidArguments(_))
    ));
    assert!(matches!(
        client.call("move", CallArgs::none()).await,
        Err(ProxyError::InvalidArguments(_))
    ));
    assert!(log.calls_to("move").is_empty(), "invalid calls must not reach the driver");
}

#[tokio::test]
async fn test_malformed_frame_closes_only_that_session() {
    let (motor, _log) = InstrumentedMotor::new(Duration::from_millis(1));
    let ts = spawn_server(motor, fast_server_options()).await;
    let bystander = connect(&ts.address, "bystander").await;

    let (mut raw, session) = raw_session(&ts.address, "garbage").await;
    assert!(ts.server.is_connected(session));

    let mut bytes = BytesMut::new();
    bytes.put_u32(9);
    bytes.put_slice(b"not json!");
    raw.get_mut().write_all(&bytes).await.unwrap();

    match next_frame(&mut raw).await {
        Some(Frame::Error { call_id, kind, .. }) => {
            assert_eq!(call_id, CONTROL_CALL_ID);
            assert_eq!(kind, ErrorKind::Protocol);
        }
        other => panic!("expected a protocol error, got {other:?}"),
    }
    assert!(next_frame(&mut raw).await.is_none(), "socket should be closed");
    assert!(eventually(|| !ts.server.is_connected(session)).await);

    assert!(bystander.call("get_position", CallArgs::none()).await.is_ok());
    assert_eq!(ts.server.session_count(), 1);
}

#[tokio::test]
async fn test_unexpected_frame_is_protocol_violation() {
    let (motor, _log) = InstrumentedMotor::new(Duration::from_millis(1));
    let ts = spawn_server(motor, fast_server_options()).await;
    let (mut raw, session) = raw_session(&ts.address, "confused").await;

    // A server-to-client frame coming from a client.
    raw.send(Frame::AdminGranted).await.unwrap();
    assert!(matches!(
        next_frame(&mut raw).await,
        Some(Frame::Error {
            kind: ErrorKind::Protocol,
            ..
        })
    ));
    assert!(eventually(|| !ts.server.is_connected(session)).await);
}

#[tokio::test]
async fn test_abrupt_disconnect_frees_admin() {
    let (motor, _log) = InstrumentedMotor::new(Duration::from_millis(1));
    let ts = spawn_server(motor, fast_server_options()).await;
    let other = connect(&ts.address, "other").await;

    let (mut raw, session) = raw_session(&ts.address, "crasher").await;
    raw.send(Frame::RequestAdmin { force: false }).await.unwrap();
    assert_eq!(next_frame(&mut raw).await, Some(Frame::AdminGranted));
    assert_eq!(ts.server.admin_holder(), Some(session));

    // No BYE: the socket just goes away.
    drop(raw);
    assert!(eventually(|| ts.server.admin_holder().is_none()).await);
    other.request_admin().await.unwrap();
}
