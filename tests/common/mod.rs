//! Shared helpers for the proxy integration tests.

#![allow(dead_code)]

use daq_proxy::client::ReconnectPolicy;
use daq_proxy::protocol::codec::FrameCodec;
use daq_proxy::protocol::{Frame, PROTOCOL_VERSION};
use daq_proxy::{
    AppResult, ClientOptions, Driver, DriverFault, ManifestBuilder, ParamKind, ProxyClient,
    ProxyServer, ServerOptions, SessionId,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

/// One recorded driver invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub operation: String,
    pub args: Vec<Value>,
    pub entered: Instant,
    pub exited: Instant,
}

/// Invocation log shared between a test and the driver it handed to the server.
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<Invocation>>,
}

impl CallLog {
    pub fn snapshot(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, operation: &str) -> Vec<Invocation> {
        self.snapshot()
            .into_iter()
            .filter(|c| c.operation == operation)
            .collect()
    }

    fn record(&self, operation: &str, args: Vec<Value>, entered: Instant) {
        self.calls.lock().push(Invocation {
            operation: operation.to_string(),
            args,
            entered,
            exited: Instant::now(),
        });
    }
}

/// Motor-like driver that records enter/exit timestamps of every invocation.
pub struct InstrumentedMotor {
    pub log: Arc<CallLog>,
    position: Mutex<f64>,
    gain: Mutex<f64>,
    hold: Duration,
    stop_requested: AtomicBool,
}

impl InstrumentedMotor {
    /// `hold` is how long `move` and `slow_read` keep the device busy, and the
    /// length of one `scan` step.
    pub fn new(hold: Duration) -> (Self, Arc<CallLog>) {
        let log = Arc::new(CallLog::default());
        let motor = Self {
            log: Arc::clone(&log),
            position: Mutex::new(0.0),
            gain: Mutex::new(1.0),
            hold,
            stop_requested: AtomicBool::new(false),
        };
        (motor, log)
    }

    fn traced<T>(&self, operation: &str, args: Vec<Value>, body: impl FnOnce() -> T) -> T {
        let entered = Instant::now();
        let out = body();
        self.log.record(operation, args, entered);
        out
    }
}

impl Driver for InstrumentedMotor {
    fn name(&self) -> &str {
        "InstrumentedMotor"
    }

    fn register(builder: &mut ManifestBuilder<Self>) {
        builder
            .operation("get_position")
            .handler(|m: &InstrumentedMotor, _| {
                m.traced("get_position", vec![], || Ok(json!(*m.position.lock())))
            });
        builder
            .operation("move")
            .param("position", ParamKind::Float)
            .requires_admin()
            .handler(|m: &InstrumentedMotor, args| {
                let target: f64 = args.get(0, "position")?;
                m.traced("move", args.positional.clone(), || {
                    std::thread::sleep(m.hold);
                    *m.position.lock() = target;
                    Ok(json!(target))
                })
            });
        builder
            .operation("slow_read")
            .handler(|m: &InstrumentedMotor, _| {
                m.traced("slow_read", vec![], || {
                    std::thread::sleep(m.hold);
                    Ok(json!(*m.position.lock()))
                })
            });
        builder
            .operation("fail")
            .handler(|m: &InstrumentedMotor, _| {
                m.traced("fail", vec![], || {
                    Err(DriverFault::new("overtravel", "limit switch hit").into())
                })
            });
        builder
            .operation("explode")
            .handler(|_: &InstrumentedMotor, _| panic!("controller firmware crashed"));
        builder
            .operation("scan")
            .param("steps", ParamKind::Integer)
            .blocking(false)
            .handler(|m: &InstrumentedMotor, args| {
                let steps: u64 = args.get(0, "steps")?;
                m.traced("scan", args.positional.clone(), || {
                    m.stop_requested.store(false, Ordering::SeqCst);
                    for step in 0..steps {
                        if m.stop_requested.swap(false, Ordering::SeqCst) {
                            return Err(DriverFault::new("aborted", format!("scan stopped at step {step}")).into());
                        }
                        std::thread::sleep(m.hold);
                    }
                    Ok(json!(steps))
                })
            });
        builder
            .operation("dump")
            .param("size", ParamKind::Integer)
            .handler(|_: &InstrumentedMotor, args| {
                let size: usize = args.get(0, "size")?;
                Ok(json!("x".repeat(size)))
            });
        builder
            .operation("stop")
            .interrupt()
            .handler(|m: &InstrumentedMotor, _| {
                m.traced("stop", vec![], || {
                    m.stop_requested.store(true, Ordering::SeqCst);
                    Ok(Value::Null)
                })
            });
        builder
            .property("gain", ParamKind::Float)
            .requires_admin()
            .read_write(
                |m: &InstrumentedMotor| Ok(json!(*m.gain.lock())),
                |m: &InstrumentedMotor, value| {
                    *m.gain.lock() = serde_json::from_value(value)?;
                    Ok(())
                },
            );
    }
}

/// Server options with a short heartbeat so liveness tests finish quickly.
pub fn fast_server_options() -> ServerOptions {
    ServerOptions {
        heartbeat_interval: Duration::from_millis(100),
        missed_heartbeats: 3,
        handshake_timeout: Duration::from_millis(500),
        ..ServerOptions::default()
    }
}

/// Client options that always ask the server (no local admin short-circuit) and never reconnect.
pub fn client_options(name: &str) -> ClientOptions {
    ClientOptions {
        client_name: name.to_string(),
        request_timeout: Duration::from_secs(5),
        reconnect: ReconnectPolicy::disabled(),
        optimistic_admin_check: false,
        ..ClientOptions::default()
    }
}

pub struct TestServer<D: Driver> {
    pub server: ProxyServer<D>,
    pub address: String,
    pub handle: JoinHandle<AppResult<()>>,
}

/// Serve `driver` on an ephemeral localhost port.
pub async fn spawn_server<D: Driver>(driver: D, options: ServerOptions) -> TestServer<D> {
    let server = ProxyServer::new(driver, options).expect("manifest should build");
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let address = listener
        .local_addr()
        .expect("listener has an address")
        .to_string();
    let serving = server.clone();
    let handle = tokio::spawn(async move { serving.serve(listener).await });
    TestServer {
        server,
        address,
        handle,
    }
}

pub async fn connect(address: &str, name: &str) -> ProxyClient {
    ProxyClient::connect(address, client_options(name))
        .await
        .expect("Failed to connect test client")
}

/// Poll `condition` every 10 ms for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// A framed socket driven by hand, for exercising the wire protocol directly.
pub type RawLink = Framed<TcpStream, FrameCodec>;

pub async fn raw_socket(address: &str) -> RawLink {
    let stream = TcpStream::connect(address)
        .await
        .expect("Failed to open raw socket");
    Framed::new(stream, FrameCodec::new())
}

/// Open a raw socket and complete the handshake with `HELLO`.
pub async fn raw_session(address: &str, name: &str) -> (RawLink, SessionId) {
    let mut link = raw_socket(address).await;
    link.send(Frame::Hello {
        protocol_version: PROTOCOL_VERSION,
        client_name: name.to_string(),
    })
    .await
    .expect("Failed to send HELLO");
    match next_frame(&mut link).await {
        Some(Frame::HelloAck { session_id, .. }) => (link, session_id),
        other => panic!("expected HELLO_ACK, got {other:?}"),
    }
}

/// Next decoded frame, `None` once the server closed the socket.
pub async fn next_frame(link: &mut RawLink) -> Option<Frame> {
    match tokio::time::timeout(Duration::from_secs(5), link.next()).await {
        Ok(Some(Ok(frame))) => Some(frame),
        Ok(_) => None,
        Err(_) => panic!("no frame within 5 s"),
    }
}

/// Serve one client by hand: complete the handshake with a real manifest,
/// answer `PING` and hand every other frame to `respond`, sending back
/// whatever it returns in order.
pub async fn spawn_scripted_server<F>(mut respond: F) -> (String, JoinHandle<()>)
where
    F: FnMut(Frame) -> Vec<Frame> + Send + 'static,
{
    let (motor, _log) = InstrumentedMotor::new(Duration::from_millis(1));
    let reference = ProxyServer::new(motor, ServerOptions::default()).expect("manifest should build");
    let manifest = reference.manifest().as_ref().clone();
    let fingerprint = reference.fingerprint().to_string();

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind scripted listener");
    let address = listener
        .local_addr()
        .expect("listener has an address")
        .to_string();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("client should connect");
        let mut link = Framed::new(stream, FrameCodec::new());
        match link.next().await {
            Some(Ok(Frame::Hello { .. })) => {}
            other => panic!("expected HELLO, got {other:?}"),
        }
        link.send(Frame::HelloAck {
            protocol_version: PROTOCOL_VERSION,
            session_id: SessionId::from_raw(1),
            manifest,
            fingerprint,
            heartbeat_interval_ms: 1000,
        })
        .await
        .expect("Failed to send HELLO_ACK");

        while let Some(Ok(frame)) = link.next().await {
            let replies = match frame {
                Frame::Ping => vec![Frame::Pong],
                Frame::Bye => break,
                other => respond(other),
            };
            for reply in replies {
                if link.send(reply).await.is_err() {
                    return;
                }
            }
        }
    });
    (address, handle)
}
