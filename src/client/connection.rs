//! Background side of [`ProxyClient`](super::ProxyClient).
//!
//! One task per client owns the socket. It writes queued requests, sends `PING`s
//! at the interval the server advertised, routes replies to waiting callers
//! (calls by `call_id`, control requests first-in first-out) and, when the link
//! drops, fails everything pending and reconnects with bounded exponential backoff.

use super::ClientOptions;
use crate::error::{AppResult, ProxyError};
use crate::manifest::CapabilityManifest;
use crate::protocol::codec::FrameCodec;
use crate::protocol::{Frame, ReplyStats, CONTROL_CALL_ID, PROTOCOL_VERSION};
use crate::server::SessionId;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) type FramedStream = Framed<TcpStream, FrameCodec>;

/// Bounded exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempts: u32,
    /// Attempts per outage; 0 disables reconnecting.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub base_delay: Duration,
    current_delay: Duration,
    /// Upper bound of the doubling delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(200), Duration::from_secs(5))
    }
}

impl ReconnectPolicy {
    /// Policy allowing `max_attempts` attempts, waiting `base_delay` doubled up to `max_delay`.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            base_delay,
            current_delay: base_delay,
            max_delay,
        }
    }

    /// Never reconnect.
    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let delay = self.current_delay;
        self.attempts += 1;
        self.current_delay = (self.current_delay * 2).min(self.max_delay);
        Some(delay)
    }

    /// Start counting from the first attempt again.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.base_delay;
    }
}

/// Result of a successful `HELLO` exchange.
pub(crate) struct Link {
    pub(crate) framed: FramedStream,
    pub(crate) session_id: SessionId,
    pub(crate) manifest: CapabilityManifest,
    pub(crate) fingerprint: String,
    pub(crate) heartbeat_interval: Duration,
}

/// Open a transport to `address` and perform the handshake.
pub(crate) async fn establish(address: &str, options: &ClientOptions) -> AppResult<Link> {
    let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| ProxyError::Timeout(options.connect_timeout))?
        .map_err(|err| ProxyError::Connection(format!("{address}: {err}")))?;
    if let Err(err) = stream.set_nodelay(true) {
        debug!(error = %err, "could not disable Nagle");
    }

    let mut framed = Framed::new(stream, FrameCodec::with_max_frame_bytes(options.max_frame_bytes));
    framed
        .send(Frame::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_name: options.client_name.clone(),
        })
        .await
        .map_err(|err| ProxyError::Connection(err.to_string()))?;

    let reply = tokio::time::timeout(options.connect_timeout, framed.next())
        .await
        .map_err(|_| ProxyError::Handshake(format!("no HELLO_ACK within {:?}", options.connect_timeout)))?;

    match reply {
        Some(Ok(Frame::HelloAck {
            protocol_version,
            session_id,
            manifest,
            fingerprint,
            heartbeat_interval_ms,
        })) => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(ProxyError::Handshake(format!(
                    "server speaks protocol {protocol_version}, client speaks {PROTOCOL_VERSION}"
                )));
            }
            let computed = manifest.fingerprint();
            if computed != fingerprint {
                return Err(ProxyError::IncompatibleManifest {
                    expected: fingerprint,
                    received: computed,
                });
            }
            if let Some(expected) = &options.expected_fingerprint {
                if *expected != fingerprint {
                    return Err(ProxyError::IncompatibleManifest {
                        expected: expected.clone(),
                        received: fingerprint,
                    });
                }
            }
            Ok(Link {
                framed,
                session_id,
                manifest,
                fingerprint,
                heartbeat_interval: Duration::from_millis(heartbeat_interval_ms.max(1)),
            })
        }
        Some(Ok(Frame::HelloReject { reason })) => Err(ProxyError::Handshake(reason)),
        Some(Ok(other)) => Err(ProxyError::Handshake(format!(
            "expected HELLO_ACK, got {}",
            other.name()
        ))),
        Some(Err(err)) => Err(ProxyError::Handshake(err.to_string())),
        None => Err(ProxyError::Handshake("connection closed during handshake".into())),
    }
}

#[derive(Default)]
pub(crate) struct LinkState {
    pub(crate) session_id: Option<SessionId>,
    pub(crate) is_admin: bool,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    pending: HashMap<u64, oneshot::Sender<Frame>>,
    control: VecDeque<oneshot::Sender<Frame>>,
    /// Last call id handed out. Ids are taken and queued under the link lock,
    /// so they reach the wire in increasing order; they survive reconnects.
    last_call_id: u64,
}

impl LinkState {
    fn next_call_id(&mut self) -> u64 {
        self.last_call_id += 1;
        self.last_call_id
    }
}

/// State shared between the client handle and its connection task.
pub(crate) struct Inner {
    pub(crate) address: String,
    pub(crate) options: ClientOptions,
    pub(crate) manifest: CapabilityManifest,
    pub(crate) fingerprint: String,
    pub(crate) link: Mutex<LinkState>,
    pub(crate) stats: Mutex<ReplyStats>,
    pub(crate) closed: CancellationToken,
}

impl Inner {
    pub(crate) fn new(address: String, options: ClientOptions, link: &Link) -> Self {
        Self {
            address,
            options,
            manifest: link.manifest.clone(),
            fingerprint: link.fingerprint.clone(),
            link: Mutex::new(LinkState::default()),
            stats: Mutex::new(ReplyStats::default()),
            closed: CancellationToken::new(),
        }
    }

    /// Queue a `CALL`. Id allocation, registration and sending happen under one
    /// lock so that ids leave in order and a concurrent disconnect cannot strand
    /// the waiter.
    pub(crate) fn submit_call(
        &self,
        operation: &str,
        args: crate::protocol::CallArgs,
    ) -> AppResult<(u64, oneshot::Receiver<Frame>)> {
        let (tx, rx) = oneshot::channel();
        let mut link = self.link.lock();
        let outbound = link.outbound.clone().ok_or_else(not_connected)?;
        let call_id = link.next_call_id();
        outbound
            .send(Frame::Call {
                call_id,
                operation: operation.to_string(),
                args,
            })
            .map_err(|_| not_connected())?;
        link.pending.insert(call_id, tx);
        Ok((call_id, rx))
    }

    /// Queue a control request answered in order by the server.
    pub(crate) fn submit_control(&self, frame: Frame) -> AppResult<oneshot::Receiver<Frame>> {
        let (tx, rx) = oneshot::channel();
        let mut link = self.link.lock();
        let outbound = link.outbound.as_ref().ok_or_else(not_connected)?;
        outbound.send(frame).map_err(|_| not_connected())?;
        link.control.push_back(tx);
        Ok(rx)
    }

    /// Stop waiting for `call_id`; a late reply is then dropped.
    pub(crate) fn forget(&self, call_id: u64) {
        self.link.lock().pending.remove(&call_id);
    }

    fn install(&self, session_id: SessionId, outbound: mpsc::UnboundedSender<Frame>) {
        let mut link = self.link.lock();
        link.session_id = Some(session_id);
        link.is_admin = false;
        link.outbound = Some(outbound);
    }

    /// Fail every waiter and forget the session and its admin flag.
    fn drop_link(&self) {
        let mut link = self.link.lock();
        link.outbound = None;
        link.session_id = None;
        link.is_admin = false;
        link.pending.clear();
        link.control.clear();
    }

    fn route(&self, frame: Frame) {
        let mut link = self.link.lock();
        match frame {
            Frame::Result { call_id, .. }
            | Frame::Started { call_id }
            | Frame::Error { call_id, .. }
                if call_id != CONTROL_CALL_ID =>
            {
                match link.pending.remove(&call_id) {
                    Some(waiter) => {
                        let _ = waiter.send(frame);
                    }
                    None => debug!(call_id, "discarding late reply"),
                }
            }
            Frame::AdminRevoked { by } => {
                link.is_admin = false;
                warn!(%by, "admin rights revoked by another session");
            }
            Frame::Pong => {}
            Frame::Error { ref message, .. } if link.control.is_empty() => {
                warn!(%message, "unsolicited error from server");
            }
            Frame::Error { .. }
            | Frame::AdminGranted
            | Frame::AdminDenied { .. }
            | Frame::AdminReleased { .. }
            | Frame::AdminState { .. }
            | Frame::StatsReport { .. }
            | Frame::TaskResult { .. }
            | Frame::ResultPending { .. }
            | Frame::Aborted { .. }
            | Frame::LogLevelSet { .. }
            | Frame::ShutdownAck => {
                // Applied in arrival order: a later ADMIN_REVOKED must win.
                match frame {
                    Frame::AdminGranted => link.is_admin = true,
                    Frame::AdminReleased { .. } => link.is_admin = false,
                    _ => {}
                }
                match link.control.pop_front() {
                    Some(waiter) => {
                        let _ = waiter.send(frame);
                    }
                    None => warn!(frame = frame.name(), "unexpected control reply"),
                }
            }
            other => warn!(frame = other.name(), "unexpected frame from server"),
        }
    }
}

fn not_connected() -> ProxyError {
    ProxyError::Connection("not connected to the proxy server".into())
}

/// Make `link` the current one; returns the queue the connection task writes from.
pub(crate) fn attach(inner: &Inner, link: &Link) -> mpsc::UnboundedReceiver<Frame> {
    let (tx, rx) = mpsc::unbounded_channel();
    inner.install(link.session_id, tx);
    rx
}

/// Connection task: serve the current link, then reconnect until told to stop.
pub(crate) async fn run(
    inner: Arc<Inner>,
    first: Link,
    first_outbound: mpsc::UnboundedReceiver<Frame>,
) {
    let mut link = first;
    let mut outbound = first_outbound;
    loop {
        let reason = drive(&inner, link.framed, outbound, link.heartbeat_interval).await;
        inner.drop_link();

        if inner.closed.is_cancelled() {
            debug!(reason, "connection closed");
            return;
        }
        warn!(address = %inner.address, reason, "connection to proxy server lost");

        link = match reconnect(&inner).await {
            Some(next) => next,
            None => {
                inner.closed.cancel();
                return;
            }
        };
        outbound = attach(&inner, &link);
    }
}

async fn reconnect(inner: &Inner) -> Option<Link> {
    let mut policy = inner.options.reconnect.clone();
    policy.reset();
    while let Some(delay) = policy.next_backoff() {
        tokio::select! {
            _ = inner.closed.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match establish(&inner.address, &inner.options).await {
            Ok(link) if link.fingerprint != inner.fingerprint => {
                error!(
                    expected = %inner.fingerprint,
                    received = %link.fingerprint,
                    "server manifest changed across reconnect, giving up"
                );
                return None;
            }
            Ok(link) => {
                info!(address = %inner.address, session = %link.session_id, "reconnected");
                return Some(link);
            }
            Err(err) => {
                warn!(address = %inner.address, error = %err, ?delay, "reconnect attempt failed");
            }
        }
    }
    error!(address = %inner.address, "reconnect attempts exhausted");
    None
}

async fn drive(
    inner: &Inner,
    mut framed: FramedStream,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    heartbeat: Duration,
) -> &'static str {
    let silence_limit = heartbeat * inner.options.missed_heartbeats.max(1);
    let mut ping = tokio::time::interval(heartbeat);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = inner.closed.cancelled() => {
                let _ = framed.send(Frame::Bye).await;
                let _ = SinkExt::<Frame>::close(&mut framed).await;
                return "closed by client";
            }
            Some(frame) = outbound.recv() => {
                if let Err(err) = framed.send(frame).await {
                    debug!(error = %err, "write failed");
                    return "write failed";
                }
            }
            _ = ping.tick() => {
                if last_seen.elapsed() > silence_limit {
                    return "server stopped answering heartbeats";
                }
                if framed.send(Frame::Ping).await.is_err() {
                    return "write failed";
                }
            }
            inbound = framed.next() => match inbound {
                None => return "server closed the connection",
                Some(Err(err)) => {
                    warn!(error = %err, "read failed");
                    return "read failed";
                }
                Some(Ok(Frame::Bye)) => return "server said goodbye",
                Some(Ok(frame)) => {
                    last_seen = Instant::now();
                    inner.route(frame);
                }
            },
        }
    }
}
