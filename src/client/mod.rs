//! Proxy client: remote access to a driver served by a [`ProxyServer`](crate::server::ProxyServer).
//!
//! The client validates the server's manifest at connect time and then offers a
//! generic [`ProxyClient::call`] entry point plus admin management. Every call waits
//! for its reply with a client-side timeout; a timeout does **not** cancel the
//! operation on the server, which may still complete and change device state.
//!
//! # Example
//!
//! ```rust,ignore
//! let motor = ProxyClient::connect("127.0.0.1:7001", ClientOptions::default()).await?;
//! let position = motor.call("get_position", CallArgs::none()).await?;
//! motor.request_admin().await?;
//! motor.call("move", CallArgs::positional([10.0])).await?;
//! motor.release_admin().await?;
//!
//! // Operations published with `blocking: false` can run in the background.
//! motor.call_nowait("scan", CallArgs::positional([100])).await?;
//! while let TaskPoll::Running { .. } = motor.result().await? {}
//! ```

pub mod connection;

pub use connection::ReconnectPolicy;

use crate::error::{AppResult, ProxyError};
use crate::manifest::CapabilityManifest;
use crate::protocol::{unix_now, CallArgs, Frame, ReplyStats};
use crate::server::SessionId;
use connection::Inner;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Client-side settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Name reported in `HELLO`, shown in server logs.
    pub client_name: String,
    /// Limit for opening the socket and for the handshake reply.
    pub connect_timeout: Duration,
    /// Default wait for a reply; see [`ProxyClient::call_with_timeout`].
    pub request_timeout: Duration,
    /// Silent heartbeat intervals tolerated before the link is considered lost.
    pub missed_heartbeats: u32,
    /// Largest frame body accepted or sent.
    pub max_frame_bytes: usize,
    /// What to do when an established link drops.
    pub reconnect: ReconnectPolicy,
    /// Reject admin-gated calls locally while the cached admin flag is false.
    pub optimistic_admin_check: bool,
    /// Refuse servers whose manifest fingerprint differs.
    pub expected_fingerprint: Option<String>,
    /// Ask for admin rights right after the handshake. If another session holds
    /// them the connection still succeeds without them. Not repeated on reconnect.
    pub request_admin_on_connect: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_name: format!("daq_proxy-client-{}", std::process::id()),
            connect_timeout: Duration::from_millis(3000),
            request_timeout: Duration::from_millis(10_000),
            missed_heartbeats: 3,
            max_frame_bytes: crate::protocol::codec::DEFAULT_MAX_FRAME_BYTES,
            reconnect: ReconnectPolicy::default(),
            optimistic_admin_check: true,
            expected_fingerprint: None,
            request_admin_on_connect: false,
        }
    }
}

/// Snapshot of the server's admin token as seen by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminState {
    /// Current holder, if any.
    pub held_by: Option<SessionId>,
    /// Whether the holder is this client's session.
    pub is_admin: bool,
}

/// State of this session's background call, as reported by [`ProxyClient::result`].
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPoll {
    /// The call has not finished yet.
    Running {
        /// Id of the `CALL` that started it.
        call_id: u64,
        /// Operation still running.
        operation: String,
    },
    /// The call finished with this value. The slot is free again.
    Done(Value),
}

/// Connection to one proxy server.
///
/// Dropping the client closes the connection with `BYE`; admin rights held by
/// this session are released by the server.
pub struct ProxyClient {
    inner: Arc<Inner>,
    task: Option<JoinHandle<()>>,
}

impl ProxyClient {
    /// Connect and perform the handshake.
    ///
    /// # Errors
    ///
    /// `Connection`/`Timeout` if the server is unreachable, `Handshake` if it rejects
    /// us, `IncompatibleManifest` if the manifest does not match its fingerprint or
    /// `options.expected_fingerprint`. With `request_admin_on_connect`, errors of the
    /// admin request other than `Busy` are returned too.
    pub async fn connect(address: impl Into<String>, options: ClientOptions) -> AppResult<Self> {
        let address = address.into();
        let link = connection::establish(&address, &options).await?;
        info!(
            %address,
            session = %link.session_id,
            driver = %link.manifest.driver,
            "connected to proxy server"
        );

        let inner = Arc::new(Inner::new(address, options, &link));
        let outbound = connection::attach(&inner, &link);
        let task = tokio::spawn(connection::run(Arc::clone(&inner), link, outbound));
        let client = Self {
            inner,
            task: Some(task),
        };

        if client.inner.options.request_admin_on_connect {
            match client.request_admin().await {
                Ok(()) => info!("admin rights acquired on connect"),
                Err(ProxyError::Busy { held_by }) => {
                    warn!(%held_by, "admin rights requested on connect are held elsewhere");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(client)
    }

    /// Manifest received at connect time.
    pub fn manifest(&self) -> &CapabilityManifest {
        &self.inner.manifest
    }

    /// Fingerprint of [`ProxyClient::manifest`].
    pub fn fingerprint(&self) -> &str {
        &self.inner.fingerprint
    }

    /// Current session id; changes after a reconnect, `None` while disconnected.
    pub fn session_id(&self) -> Option<SessionId> {
        let link = self.inner.link.lock();
        link.session_id.filter(|_| !self.inner.closed.is_cancelled())
    }

    /// Whether a link to the server is currently up.
    pub fn is_connected(&self) -> bool {
        !self.inner.closed.is_cancelled() && self.inner.link.lock().session_id.is_some()
    }

    /// Cached admin flag. Only updated by explicit grant/release replies, a
    /// revocation notice or a lost connection.
    pub fn is_admin(&self) -> bool {
        self.inner.link.lock().is_admin
    }

    /// Client-side reply statistics for this connection.
    pub fn stats(&self) -> ReplyStats {
        *self.inner.stats.lock()
    }

    /// Invoke `operation` with the default request timeout.
    pub async fn call(&self, operation: &str, args: CallArgs) -> AppResult<Value> {
        self.call_with_timeout(operation, args, self.inner.options.request_timeout)
            .await
    }

    /// Invoke `operation`, waiting at most `timeout` for the reply.
    ///
    /// A non-blocking operation is started in the background and polled until it
    /// finishes. If `timeout` expires first it keeps running; collect it later
    /// with [`ProxyClient::result`].
    pub async fn call_with_timeout(
        &self,
        operation: &str,
        args: CallArgs,
        timeout: Duration,
    ) -> AppResult<Value> {
        self.check_admin(operation, &args)?;
        if self.is_background(operation) {
            return self.run_in_background(operation, args, timeout).await;
        }

        let (call_id, rx) = self.inner.submit_call(operation, args)?;
        debug!(call_id, operation, "call sent");
        match self.wait(rx, timeout, Some(call_id)).await? {
            Frame::Result { payload, .. } => Ok(payload),
            reply => Err(reply_error(reply)),
        }
    }

    /// Start a non-blocking operation and return its call id without waiting
    /// for the outcome.
    ///
    /// # Errors
    ///
    /// `InvalidArguments` for an operation the manifest declares blocking,
    /// `BackgroundCall` if this session already has an uncollected background call.
    pub async fn call_nowait(&self, operation: &str, args: CallArgs) -> AppResult<u64> {
        if let Some(spec) = self.inner.manifest.operation(operation) {
            if spec.blocking {
                return Err(ProxyError::InvalidArguments(format!(
                    "'{operation}' is a blocking operation"
                )));
            }
        }
        self.check_admin(operation, &args)?;
        self.start(operation, args, self.inner.options.request_timeout)
            .await
    }

    /// Poll this session's background call. Waits briefly on the server before
    /// reporting [`TaskPoll::Running`].
    ///
    /// # Errors
    ///
    /// `BackgroundCall` when there is nothing to collect; the call's own error if
    /// it failed (an interrupted call usually reports a driver error).
    pub async fn result(&self) -> AppResult<TaskPoll> {
        match self.control(Frame::GetResult).await? {
            Frame::TaskResult { payload, .. } => Ok(TaskPoll::Done(payload)),
            Frame::ResultPending { call_id, operation } => {
                Ok(TaskPoll::Running { call_id, operation })
            }
            reply => Err(reply_error(reply)),
        }
    }

    fn is_background(&self, operation: &str) -> bool {
        self.inner
            .manifest
            .operation(operation)
            .is_some_and(|spec| !spec.blocking)
    }

    fn check_admin(&self, operation: &str, args: &CallArgs) -> AppResult<()> {
        if !self.inner.options.optimistic_admin_check || self.is_admin() {
            return Ok(());
        }
        match self.inner.manifest.operation(operation) {
            Some(spec) if spec.needs_admin(args) => Err(ProxyError::PermissionDenied(format!(
                "'{operation}' requires admin rights"
            ))),
            _ => Ok(()),
        }
    }

    async fn start(&self, operation: &str, args: CallArgs, timeout: Duration) -> AppResult<u64> {
        let (call_id, rx) = self.inner.submit_call(operation, args)?;
        match self.wait(rx, timeout, Some(call_id)).await? {
            Frame::Started { call_id } => {
                debug!(call_id, operation, "background call started");
                Ok(call_id)
            }
            reply => Err(reply_error(reply)),
        }
    }

    async fn run_in_background(
        &self,
        operation: &str,
        args: CallArgs,
        timeout: Duration,
    ) -> AppResult<Value> {
        let started = Instant::now();
        self.start(operation, args, timeout).await?;
        loop {
            match self.result().await? {
                TaskPoll::Done(value) => return Ok(value),
                TaskPoll::Running { .. } if started.elapsed() >= timeout => {
                    return Err(ProxyError::Timeout(timeout));
                }
                TaskPoll::Running { .. } => {}
            }
        }
    }

    /// Read a property.
    pub async fn get_property(&self, name: &str) -> AppResult<Value> {
        self.call(name, CallArgs::none()).await
    }

    /// Write a property. Needs admin if the property's setter is gated.
    pub async fn set_property(&self, name: &str, value: impl Into<Value>) -> AppResult<()> {
        self.call(name, CallArgs::positional([value.into()]))
            .await
            .map(|_| ())
    }

    /// Invoke the driver's interrupt operation.
    ///
    /// The interrupt bypasses the dispatch lock, so it runs even while another
    /// session's long operation is in progress. A background call of this
    /// session that was running is then collected with [`ProxyClient::result`].
    pub async fn abort(&self) -> AppResult<Value> {
        match self.control(Frame::Abort).await? {
            Frame::Aborted {
                payload,
                interrupted,
            } => {
                if let Some(call_id) = interrupted {
                    debug!(call_id, "background call interrupted");
                }
                Ok(payload)
            }
            reply => Err(reply_error(reply)),
        }
    }

    /// Change the server's log level; returns the level now in effect.
    pub async fn set_log_level(&self, level: &str) -> AppResult<String> {
        let request = Frame::SetLogLevel {
            level: level.to_string(),
        };
        match self.control(request).await? {
            Frame::LogLevelSet { level } => Ok(level),
            reply => Err(reply_error(reply)),
        }
    }

    /// Ask for admin rights. Fails with `Busy` if another session holds them.
    pub async fn request_admin(&self) -> AppResult<()> {
        self.acquire(false).await
    }

    /// Take admin rights even if another session holds them; that session is notified.
    pub async fn request_admin_forced(&self) -> AppResult<()> {
        self.acquire(true).await
    }

    async fn acquire(&self, force: bool) -> AppResult<()> {
        match self.control(Frame::RequestAdmin { force }).await? {
            Frame::AdminGranted => Ok(()),
            Frame::AdminDenied { held_by } => Err(ProxyError::Busy { held_by }),
            reply => Err(reply_error(reply)),
        }
    }

    /// Give admin rights back. Returns whether this session actually held them.
    pub async fn release_admin(&self) -> AppResult<bool> {
        match self.control(Frame::ReleaseAdmin).await? {
            Frame::AdminReleased { was_admin } => Ok(was_admin),
            reply => Err(reply_error(reply)),
        }
    }

    /// Query the admin token without changing it.
    pub async fn admin_status(&self) -> AppResult<AdminState> {
        match self.control(Frame::AdminStatus).await? {
            Frame::AdminState { held_by, is_admin } => Ok(AdminState { held_by, is_admin }),
            reply => Err(reply_error(reply)),
        }
    }

    /// Server-side reply statistics of this session.
    pub async fn server_stats(&self) -> AppResult<ReplyStats> {
        match self.control(Frame::Stats).await? {
            Frame::StatsReport { stats } => Ok(stats),
            reply => Err(reply_error(reply)),
        }
    }

    /// Stop the server. Only the admin session may do this.
    pub async fn shutdown_server(&self) -> AppResult<()> {
        match self.control(Frame::Shutdown).await? {
            Frame::ShutdownAck => Ok(()),
            reply => Err(reply_error(reply)),
        }
    }

    /// Send `BYE` and wait for the connection task to finish.
    pub async fn disconnect(mut self) {
        self.inner.closed.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    async fn control(&self, frame: Frame) -> AppResult<Frame> {
        let name = frame.name();
        let rx = self.inner.submit_control(frame)?;
        debug!(request = name, "control request sent");
        self.wait(rx, self.inner.options.request_timeout, None).await
    }

    async fn wait(
        &self,
        rx: oneshot::Receiver<Frame>,
        timeout: Duration,
        call_id: Option<u64>,
    ) -> AppResult<Frame> {
        let started = Instant::now();
        let started_at = unix_now();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => {
                self.inner.stats.lock().record(started.elapsed(), started_at);
                Ok(frame)
            }
            Ok(Err(_)) => Err(ProxyError::Connection(
                "connection lost before the reply arrived".into(),
            )),
            Err(_) => {
                if let Some(call_id) = call_id {
                    self.inner.forget(call_id);
                }
                Err(ProxyError::Timeout(timeout))
            }
        }
    }
}

impl Drop for ProxyClient {
    fn drop(&mut self) {
        self.inner.closed.cancel();
    }
}

fn reply_error(reply: Frame) -> ProxyError {
    match reply {
        Frame::Error {
            kind,
            driver_kind,
            message,
            ..
        } => ProxyError::from_wire(kind, driver_kind, message),
        other => ProxyError::Protocol(format!("unexpected reply {}", other.name())),
    }
}
