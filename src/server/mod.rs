//! Proxy server: owns one driver and exposes it to many network clients.
//!
//! # Architecture
//!
//! ```text
//!  TcpListener ──accept──► ConnectionHandler (one task per session)
//!                               │  frames in order
//!                               ▼
//!                         request worker ──► ProxyServer::process
//!                                                 │
//!                                     spawn_blocking + device gate
//!                                                 ▼
//!                                               Driver
//! ```
//!
//! Two locks exist and are never held together:
//!
//! - the **state lock** guards the session table and the [`AdminToken`]; it is only
//!   held for short, non-blocking bookkeeping, so `is_admin` flags always agree with
//!   the token;
//! - the **device gate** holds the dispatch lock that serializes driver invocations
//!   and refuses new ones once the driver has been released. It is taken on the
//!   blocking thread pool, never on an I/O task, so a slow device cannot stall
//!   other sessions.
//!
//! A panic inside a driver operation is caught and reported to the caller as a
//! driver error of kind `panic`; `parking_lot` locks are not poisoned by it.
//!
//! Operations published with `blocking: false` run as background calls: the
//! `CALL` is answered with `STARTED` and the outcome is collected later with
//! `GET_RESULT`. Each session has at most one uncollected background call.

pub mod admin;
mod background;
pub mod connection;
mod gate;
pub mod session;

pub use admin::{Acquired, AdminToken};
pub use session::{ClientSession, SessionId, SessionTable};

use crate::driver::{classify, classify_panic, Driver};
use crate::error::{AppResult, ProxyError};
use crate::logging::LogLevelHandle;
use crate::manifest::builder::{DispatchTable, Operation};
use crate::manifest::{CapabilityManifest, ManifestBuilder};
use crate::protocol::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::protocol::{CallArgs, Frame, ReplyStats, CONTROL_CALL_ID};
use background::{BackgroundCall, RESULT_WAIT};
use connection::ConnectionHandler;
use gate::DeviceGate;
use parking_lot::Mutex;
use serde_json::Value;
use session::SessionIdAllocator;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runtime options of a proxy server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Interval advertised to clients for their `PING`s.
    pub heartbeat_interval: Duration,
    /// Consecutive silent intervals after which a session is declared dead.
    pub missed_heartbeats: u32,
    /// Time allowed between accept and a valid `HELLO`.
    pub handshake_timeout: Duration,
    /// Largest frame body accepted or sent. A reply that would exceed it is
    /// replaced by an `oversized` driver error.
    pub max_frame_bytes: usize,
    /// Lets clients change the log level with `SET_LOG_LEVEL`. Without it the
    /// request fails with `UnknownOperation`.
    pub log_control: Option<LogLevelHandle>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            missed_heartbeats: 3,
            handshake_timeout: Duration::from_millis(5000),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            log_control: None,
        }
    }
}

impl ServerOptions {
    /// Silence after which a session is considered dead.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }
}

#[derive(Debug, Default)]
struct ServerState {
    admin: AdminToken,
    sessions: SessionTable,
}

struct Shared<D> {
    driver: Arc<D>,
    table: DispatchTable<D>,
    gate: Arc<DeviceGate>,
    state: Mutex<ServerState>,
    ids: SessionIdAllocator,
    options: ServerOptions,
    cancel: CancellationToken,
}

/// Handle to a proxy server. Cheap to clone; all clones share one driver.
pub struct ProxyServer<D: Driver> {
    shared: Arc<Shared<D>>,
}

impl<D: Driver> Clone for ProxyServer<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: Driver> ProxyServer<D> {
    /// Build the manifest for `driver` and wrap it.
    ///
    /// Fails with `ManifestConflict` if the driver's declarations collide.
    pub fn new(driver: D, options: ServerOptions) -> AppResult<Self> {
        let mut builder = ManifestBuilder::new(driver.name());
        D::register(&mut builder);
        let table = builder.build()?;
        info!(
            driver = %table.manifest().driver,
            operations = table.manifest().operations.len(),
            fingerprint = %table.fingerprint(),
            "capability manifest published"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                driver: Arc::new(driver),
                table,
                gate: Arc::new(DeviceGate::default()),
                state: Mutex::new(ServerState::default()),
                ids: SessionIdAllocator::new(),
                options,
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// The published capability manifest.
    pub fn manifest(&self) -> Arc<CapabilityManifest> {
        Arc::clone(self.shared.table.manifest())
    }

    /// sha256 of the canonical manifest, as sent in `HELLO_ACK`.
    pub fn fingerprint(&self) -> &str {
        self.shared.table.fingerprint()
    }

    /// Options the server was built with.
    pub fn options(&self) -> &ServerOptions {
        &self.shared.options
    }

    /// Bind `address` and serve until [`ProxyServer::shutdown`].
    pub async fn start(&self, address: impl ToSocketAddrs) -> AppResult<()> {
        let listener = TcpListener::bind(address).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown.
    ///
    /// Returns once every session is closed and the driver has been released.
    pub async fn serve(&self, listener: TcpListener) -> AppResult<()> {
        let local = listener.local_addr()?;
        info!(
            driver = %self.shared.table.manifest().driver,
            address = %local,
            "proxy server listening"
        );

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        connections.spawn(ConnectionHandler::new(self.clone(), stream, peer).run());
                    }
                    Err(err) => {
                        // Usually fd exhaustion; keep serving the existing sessions.
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "connection task failed");
                    }
                }
            }
        }
        drop(listener);

        self.shutdown();
        while let Some(joined) = connections.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "connection task failed during shutdown");
            }
        }
        self.release_driver().await;
        info!(address = %local, "proxy server stopped");
        Ok(())
    }

    /// Stop accepting, say `BYE` to every session and free the admin token.
    ///
    /// Idempotent. The serving loop releases the driver once connections are closed.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if !self.shared.cancel.is_cancelled() {
            info!("proxy server shutting down");
        }
        self.shared.cancel.cancel();
        state.admin = AdminToken::Free;
        for session in state.sessions.drain() {
            session.notify(Frame::Bye);
        }
    }

    /// Whether [`ProxyServer::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Request admin rights without displacing a current holder.
    pub fn request_admin(&self, session: SessionId) -> AppResult<()> {
        self.acquire_admin(session, false).map(|_| ())
    }

    /// Take admin rights, revoking them from any other holder.
    pub fn take_admin(&self, session: SessionId) -> AppResult<Acquired> {
        self.acquire_admin(session, true)
    }

    fn acquire_admin(&self, session: SessionId, force: bool) -> AppResult<Acquired> {
        let mut state = self.shared.state.lock();
        if !state.sessions.contains(session) {
            return Err(ProxyError::Connection(format!("{session} is not connected")));
        }

        let acquired = state.admin.acquire(session, force)?;
        if let Acquired::TakenFrom(previous) = acquired {
            if let Some(prev) = state.sessions.get_mut(previous) {
                prev.is_admin = false;
                prev.notify(Frame::AdminRevoked { by: session });
            }
            warn!(%session, %previous, "admin rights taken over");
        } else if acquired == Acquired::Granted {
            info!(%session, "admin rights granted");
        }
        if let Some(current) = state.sessions.get_mut(session) {
            current.is_admin = true;
        }
        Ok(acquired)
    }

    /// Release admin rights if `session` holds them. Returns whether it did.
    pub fn release_admin(&self, session: SessionId) -> bool {
        let mut state = self.shared.state.lock();
        let released = state.admin.release(session);
        if released {
            if let Some(current) = state.sessions.get_mut(session) {
                current.is_admin = false;
            }
            info!(%session, "admin rights released");
        }
        released
    }

    /// Session holding admin rights, if any.
    pub fn admin_holder(&self) -> Option<SessionId> {
        self.shared.state.lock().admin.holder()
    }

    /// Whether `session` holds admin rights.
    pub fn is_admin(&self, session: SessionId) -> bool {
        self.shared.state.lock().admin.is_held_by(session)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.shared.state.lock().sessions.len()
    }

    /// Whether `session` is still live.
    pub fn is_connected(&self, session: SessionId) -> bool {
        self.shared.state.lock().sessions.contains(session)
    }

    /// Server-side reply statistics of a live session.
    pub fn session_stats(&self, session: SessionId) -> Option<ReplyStats> {
        self.shared.state.lock().sessions.get(session).map(|s| s.stats)
    }

    pub(crate) fn register_session(
        &self,
        peer: SocketAddr,
        client_name: String,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> AppResult<SessionId> {
        let mut state = self.shared.state.lock();
        if self.shared.cancel.is_cancelled() {
            return Err(ProxyError::Connection("server is shutting down".into()));
        }
        let id = self.shared.ids.next();
        state
            .sessions
            .insert(ClientSession::new(id, peer, client_name.clone(), outbound));
        info!(session = %id, %peer, client = %client_name, "session opened");
        Ok(id)
    }

    /// Drop a session and free the admin token if it held it. Safe to call twice.
    pub(crate) fn close_session(&self, session: SessionId, reason: &str) {
        let mut state = self.shared.state.lock();
        let Some(closed) = state.sessions.remove(session) else {
            return;
        };
        if let Some(call) = closed.background {
            debug!(%session, call_id = call.call_id, "dropping uncollected background call");
        }
        if state.admin.release(session) {
            info!(%session, "admin rights released by disconnect");
        }
        info!(%session, reason, remaining = state.sessions.len(), "session closed");
    }

    pub(crate) fn touch(&self, session: SessionId) {
        if let Some(s) = self.shared.state.lock().sessions.get_mut(session) {
            s.last_heartbeat = Instant::now();
        }
    }

    pub(crate) fn last_heartbeat(&self, session: SessionId) -> Option<Instant> {
        self.shared.state.lock().sessions.get(session).map(|s| s.last_heartbeat)
    }

    pub(crate) fn record_reply(&self, session: SessionId, elapsed: Duration, started_at: f64) {
        if let Some(s) = self.shared.state.lock().sessions.get_mut(session) {
            s.stats.record(elapsed, started_at);
        }
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    /// Answer one request frame of `session`.
    pub(crate) async fn process(&self, session: SessionId, frame: Frame) -> Frame {
        match frame {
            Frame::Call {
                call_id,
                operation,
                args,
            } => {
                let background = self
                    .shared
                    .table
                    .get(&operation)
                    .is_some_and(|op| !op.spec.blocking);
                let reply = if background {
                    self.start_background(session, call_id, &operation, args)
                } else {
                    self.dispatch(session, &operation, args)
                        .await
                        .map(|payload| Frame::Result { call_id, payload })
                };
                reply.unwrap_or_else(|err| {
                    debug!(%session, call_id, %operation, error = %err, "call failed");
                    Frame::error(call_id, &err)
                })
            }
            Frame::GetResult => self.collect(session).await.unwrap_or_else(control_error),
            Frame::Abort => self.abort(session).await.unwrap_or_else(control_error),
            Frame::SetLogLevel { level } => self.set_log_level(&level).unwrap_or_else(control_error),
            Frame::RequestAdmin { force } => match self.acquire_admin(session, force) {
                Ok(_) => Frame::AdminGranted,
                Err(ProxyError::Busy { held_by }) => {
                    debug!(%session, %held_by, "admin request denied");
                    Frame::AdminDenied { held_by }
                }
                Err(err) => Frame::error(CONTROL_CALL_ID, &err),
            },
            Frame::ReleaseAdmin => Frame::AdminReleased {
                was_admin: self.release_admin(session),
            },
            Frame::AdminStatus => {
                let held_by = self.admin_holder();
                Frame::AdminState {
                    held_by,
                    is_admin: held_by == Some(session),
                }
            }
            Frame::Stats => Frame::StatsReport {
                stats: self.session_stats(session).unwrap_or_default(),
            },
            Frame::Shutdown => {
                if self.is_admin(session) {
                    info!(%session, "remote shutdown requested");
                    Frame::ShutdownAck
                } else {
                    Frame::error(
                        CONTROL_CALL_ID,
                        &ProxyError::PermissionDenied(
                            "only the admin session may shut the server down".into(),
                        ),
                    )
                }
            }
            other => Frame::error(
                CONTROL_CALL_ID,
                &ProxyError::Protocol(format!("unexpected {} frame from client", other.name())),
            ),
        }
    }

    /// Run `operation` on behalf of `session`.
    ///
    /// Checks, in order: the operation exists, admin rights if it mutates, the
    /// argument schema. The driver then runs on the blocking pool, under the
    /// dispatch lock unless the operation is concurrency-safe. Once the driver has
    /// been released every call fails with a driver error of kind `shutdown`.
    pub async fn dispatch(
        &self,
        session: SessionId,
        operation: &str,
        args: CallArgs,
    ) -> AppResult<Value> {
        let op = self.admit(session, operation, &args)?;
        self.execute(session, op, args).await
    }

    fn admit(
        &self,
        session: SessionId,
        operation: &str,
        args: &CallArgs,
    ) -> AppResult<Arc<Operation<D>>> {
        let op = self
            .shared
            .table
            .get(operation)
            .ok_or_else(|| ProxyError::UnknownOperation(operation.to_string()))?;

        if op.spec.needs_admin(args) && !self.is_admin(session) {
            return Err(ProxyError::PermissionDenied(format!(
                "'{operation}' requires admin rights"
            )));
        }
        op.spec.validate(args)?;
        Ok(op)
    }

    async fn execute(
        &self,
        session: SessionId,
        op: Arc<Operation<D>>,
        args: CallArgs,
    ) -> AppResult<Value> {
        let operation = op.spec.name.clone();
        let exclusive = !op.spec.concurrency_safe;
        let driver = Arc::clone(&self.shared.driver);
        let gate = Arc::clone(&self.shared.gate);
        let joined = tokio::task::spawn_blocking(move || {
            gate.run(exclusive, || {
                std::panic::catch_unwind(AssertUnwindSafe(|| op.invoke(&driver, &args)))
            })
        })
        .await;

        match joined {
            Ok(Some(Ok(Ok(value)))) => Ok(value),
            Ok(Some(Ok(Err(err)))) => {
                let err = classify(err);
                warn!(%session, %operation, error = %err, "driver operation failed");
                Err(err)
            }
            Ok(Some(Err(payload))) => {
                let err = classify_panic(payload);
                error!(%session, %operation, error = %err, "driver operation panicked");
                Err(err)
            }
            Ok(None) => {
                debug!(%session, %operation, "call refused, driver already released");
                Err(ProxyError::driver("shutdown", "the driver has been released"))
            }
            Err(join_err) if join_err.is_panic() => Err(classify_panic(join_err.into_panic())),
            Err(join_err) => Err(ProxyError::driver("cancelled", join_err.to_string())),
        }
    }

    /// Admit a non-blocking call and run it on its own task.
    fn start_background(
        &self,
        session: SessionId,
        call_id: u64,
        operation: &str,
        args: CallArgs,
    ) -> AppResult<Frame> {
        let op = self.admit(session, operation, &args)?;
        let done = {
            let mut state = self.shared.state.lock();
            let owner = state
                .sessions
                .get_mut(session)
                .ok_or_else(|| ProxyError::Connection(format!("{session} is not connected")))?;
            if let Some(previous) = &owner.background {
                let status = if previous.is_finished() {
                    "has not been collected"
                } else {
                    "is still running"
                };
                return Err(ProxyError::BackgroundCall(format!(
                    "'{}' (call {}) {status}",
                    previous.operation, previous.call_id
                )));
            }
            let (call, done) = BackgroundCall::new(call_id, operation);
            owner.background = Some(call);
            done
        };
        info!(%session, call_id, %operation, "background call started");

        let server = self.clone();
        tokio::spawn(async move {
            let operation = op.spec.name.clone();
            let reply = match server.execute(session, op, args).await {
                Ok(payload) => Frame::TaskResult {
                    call_id,
                    operation,
                    payload,
                },
                Err(err) => Frame::error(CONTROL_CALL_ID, &err),
            };
            debug!(%session, call_id, "background call finished");
            done.send_replace(Some(reply));
        });
        Ok(Frame::Started { call_id })
    }

    /// Outcome of the session's background call, or `RESULT_PENDING` if it is
    /// still running after a short wait. A delivered outcome frees the slot.
    async fn collect(&self, session: SessionId) -> AppResult<Frame> {
        let call = self
            .shared
            .state
            .lock()
            .sessions
            .get(session)
            .and_then(|s| s.background.clone())
            .ok_or_else(|| ProxyError::BackgroundCall("no background call to collect".into()))?;

        let Some(reply) = call.outcome(RESULT_WAIT).await else {
            return Ok(Frame::ResultPending {
                call_id: call.call_id,
                operation: call.operation,
            });
        };
        if let Some(owner) = self.shared.state.lock().sessions.get_mut(session) {
            if owner.background.as_ref().map(|c| c.call_id) == Some(call.call_id) {
                owner.background = None;
            }
        }
        Ok(reply)
    }

    /// Run the driver's interrupt operation on behalf of `session`.
    async fn abort(&self, session: SessionId) -> AppResult<Frame> {
        let manifest = self.shared.table.manifest();
        let interrupt = manifest
            .interrupt_operation()
            .map(|op| op.name.clone())
            .ok_or_else(|| {
                ProxyError::UnknownOperation(format!(
                    "{} declares no interrupt operation",
                    manifest.driver
                ))
            })?;
        let running = self
            .shared
            .state
            .lock()
            .sessions
            .get(session)
            .and_then(|s| s.background.as_ref())
            .filter(|call| !call.is_finished())
            .map(|call| call.call_id);

        let payload = self.dispatch(session, &interrupt, CallArgs::none()).await?;
        if let Some(call_id) = running {
            info!(%session, call_id, "background call interrupted");
        }
        Ok(Frame::Aborted {
            payload,
            interrupted: running,
        })
    }

    fn set_log_level(&self, level: &str) -> AppResult<Frame> {
        let control = self.shared.options.log_control.as_ref().ok_or_else(|| {
            ProxyError::UnknownOperation("log level control is not enabled on this server".into())
        })?;
        let level = control.set_level(level)?;
        Ok(Frame::LogLevelSet { level })
    }

    async fn release_driver(&self) {
        let driver = Arc::clone(&self.shared.driver);
        let gate = Arc::clone(&self.shared.gate);
        let released = tokio::task::spawn_blocking(move || {
            gate.release(|| {
                if std::panic::catch_unwind(AssertUnwindSafe(|| driver.shutdown())).is_err() {
                    error!("driver cleanup panicked");
                }
            })
        })
        .await;
        match released {
            Ok(true) => debug!("driver released"),
            Ok(false) => {}
            Err(err) => error!(error = %err, "driver cleanup failed"),
        }
    }
}

fn control_error(err: ProxyError) -> Frame {
    Frame::error(CONTROL_CALL_ID, &err)
}
