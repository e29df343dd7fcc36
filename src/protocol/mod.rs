//! Wire protocol shared by the proxy server and client.
//!
//! Every message is a [`Frame`], serialized as a JSON object tagged by `type`
//! and carried inside a length-prefixed envelope (see [`codec`]):
//!
//! ```text
//! +----------------------------+------------------------------+
//! | Length (4 bytes, BE)       | JSON frame body              |
//! +----------------------------+------------------------------+
//! ```
//!
//! # Frame Flow
//!
//! ```text
//! client                                server
//!   HELLO ------------------------------>
//!   <------------------- HELLO_ACK(manifest, fingerprint)
//!   CALL(id, op, args) ----------------->
//!   <--------------- RESULT(id) | ERROR(id, kind, message)
//!   CALL(id, background op) ------------>
//!   <------------------------------ STARTED(id)
//!   GET_RESULT ------------------------->
//!   <------- TASK_RESULT(id) | RESULT_PENDING(id) | ERROR(0)
//!   ABORT ------------------------------>
//!   <------------------- ABORTED(payload, interrupted)
//!   REQUEST_ADMIN ---------------------->
//!   <------------ ADMIN_GRANTED | ADMIN_DENIED(held_by)
//!   PING ------------------------------->
//!   <------------------------------- PONG
//!   BYE -------------------------------->
//! ```
//!
//! Control replies (admin, status, stats, results, abort, log level, shutdown)
//! carry no call id of their own; a session's
//! requests are answered in the order they were received, so the client matches
//! them first-in first-out. Control failures use an `ERROR` frame with
//! [`CONTROL_CALL_ID`].

pub mod codec;

use crate::error::ErrorKind;
use crate::manifest::CapabilityManifest;
use crate::server::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Version of the frame vocabulary below. Bumped on any incompatible change.
pub const PROTOCOL_VERSION: u32 = 1;

/// Call id used by `ERROR` frames that answer a control request.
pub const CONTROL_CALL_ID: u64 = 0;

/// Every message exchanged between a proxy client and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    /// Client greeting, first frame on every connection.
    Hello {
        /// Must equal [`PROTOCOL_VERSION`].
        protocol_version: u32,
        /// Free-form name shown in server logs.
        client_name: String,
    },
    /// Server reply to a compatible `HELLO`.
    HelloAck {
        /// Version the server speaks.
        protocol_version: u32,
        /// Id of the session opened for this connection.
        session_id: SessionId,
        /// Everything the driver exposes.
        manifest: CapabilityManifest,
        /// sha256 of the canonical manifest.
        fingerprint: String,
        /// Interval at which the client is expected to `PING`.
        heartbeat_interval_ms: u64,
    },
    /// Server reply to an incompatible `HELLO`; the connection is closed afterwards.
    HelloReject {
        /// Why the greeting was refused.
        reason: String,
    },

    /// Ask for the admin token.
    RequestAdmin {
        /// Take the token even if another session holds it.
        #[serde(default)]
        force: bool,
    },
    /// The token now belongs to the requesting session.
    AdminGranted,
    /// Another session holds the token.
    AdminDenied {
        /// Current holder.
        held_by: SessionId,
    },
    /// Give the token back.
    ReleaseAdmin,
    /// Reply to `RELEASE_ADMIN`.
    AdminReleased {
        /// Whether the session actually held the token.
        was_admin: bool,
    },
    /// Unsolicited: another session forced its way to admin.
    AdminRevoked {
        /// The new holder.
        by: SessionId,
    },
    /// Query the token without changing it.
    AdminStatus,
    /// Reply to `ADMIN_STATUS`.
    AdminState {
        /// Current holder, if any.
        held_by: Option<SessionId>,
        /// Whether the holder is the requesting session.
        is_admin: bool,
    },

    /// Invoke a driver operation.
    Call {
        /// Client-chosen id echoed by the reply; never [`CONTROL_CALL_ID`].
        call_id: u64,
        /// Operation or property name from the manifest.
        operation: String,
        /// Arguments, checked against the operation's parameters.
        #[serde(default)]
        args: CallArgs,
    },
    /// Successful reply to a blocking `CALL`.
    Result {
        /// Id of the answered `CALL`.
        call_id: u64,
        /// Value returned by the driver.
        payload: Value,
    },
    /// Failed request.
    Error {
        /// Id of the failed `CALL`, or [`CONTROL_CALL_ID`].
        call_id: u64,
        /// Wire category of the failure.
        kind: ErrorKind,
        /// Driver-chosen sub-kind when `kind` is `DRIVER`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        driver_kind: Option<String>,
        /// Human-readable description.
        message: String,
    },
    /// A `CALL` to a non-blocking operation was accepted and runs in the background.
    Started {
        /// Id of the accepted `CALL`.
        call_id: u64,
    },
    /// Collect the outcome of this session's background call.
    GetResult,
    /// Value of a finished background call.
    TaskResult {
        /// Id of the `CALL` that started it.
        call_id: u64,
        /// Operation that ran.
        operation: String,
        /// Value returned by the driver.
        payload: Value,
    },
    /// The background call has not finished yet; ask again later.
    ResultPending {
        /// Id of the `CALL` that started it.
        call_id: u64,
        /// Operation still running.
        operation: String,
    },
    /// Run the driver's interrupt operation.
    Abort,
    /// Reply to `ABORT`.
    Aborted {
        /// Value returned by the interrupt operation.
        payload: Value,
        /// Background call of this session that was running when the interrupt fired.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interrupted: Option<u64>,
    },
    /// Change the server's log level.
    SetLogLevel {
        /// One of `trace`, `debug`, `info`, `warn`, `error`.
        level: String,
    },
    /// Reply to `SET_LOG_LEVEL`.
    LogLevelSet {
        /// The level now in effect.
        level: String,
    },

    /// Ask for this session's server-side reply statistics.
    Stats,
    /// Reply to `STATS`.
    StatsReport {
        /// Statistics of the requesting session.
        stats: ReplyStats,
    },

    /// Stop the server; admin only.
    Shutdown,
    /// The server is about to stop.
    ShutdownAck,

    /// Heartbeat.
    Ping,
    /// Heartbeat reply.
    Pong,
    /// Orderly close, from either side.
    Bye,
}

impl Frame {
    /// Short frame name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "HELLO",
            Frame::HelloAck { .. } => "HELLO_ACK",
            Frame::HelloReject { .. } => "HELLO_REJECT",
            Frame::RequestAdmin { .. } => "REQUEST_ADMIN",
            Frame::AdminGranted => "ADMIN_GRANTED",
            Frame::AdminDenied { .. } => "ADMIN_DENIED",
            Frame::ReleaseAdmin => "RELEASE_ADMIN",
            Frame::AdminReleased { .. } => "ADMIN_RELEASED",
            Frame::AdminRevoked { .. } => "ADMIN_REVOKED",
            Frame::AdminStatus => "ADMIN_STATUS",
            Frame::AdminState { .. } => "ADMIN_STATE",
            Frame::Call { .. } => "CALL",
            Frame::Result { .. } => "RESULT",
            Frame::Error { .. } => "ERROR",
            Frame::Started { .. } => "STARTED",
            Frame::GetResult => "GET_RESULT",
            Frame::TaskResult { .. } => "TASK_RESULT",
            Frame::ResultPending { .. } => "RESULT_PENDING",
            Frame::Abort => "ABORT",
            Frame::Aborted { .. } => "ABORTED",
            Frame::SetLogLevel { .. } => "SET_LOG_LEVEL",
            Frame::LogLevelSet { .. } => "LOG_LEVEL_SET",
            Frame::Stats => "STATS",
            Frame::StatsReport { .. } => "STATS_REPORT",
            Frame::Shutdown => "SHUTDOWN",
            Frame::ShutdownAck => "SHUTDOWN_ACK",
            Frame::Ping => "PING",
            Frame::Pong => "PONG",
            Frame::Bye => "BYE",
        }
    }

    /// Build an `ERROR` frame from a proxy error.
    ///
    /// Errors without a wire form are reported as protocol errors.
    pub fn error(call_id: u64, err: &crate::error::ProxyError) -> Self {
        let (kind, driver_kind, message) = err
            .to_wire()
            .unwrap_or_else(|| (ErrorKind::Protocol, None, err.to_string()));
        Frame::Error {
            call_id,
            kind,
            driver_kind,
            message,
        }
    }
}

/// Positional and keyword arguments of a `CALL`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    /// Arguments matched to parameters by position.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positional: Vec<Value>,
    /// Arguments matched to parameters by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keyword: BTreeMap<String, Value>,
}

impl CallArgs {
    /// No arguments.
    pub fn none() -> Self {
        Self::default()
    }

    /// Positional arguments only.
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            positional: values.into_iter().map(Into::into).collect(),
            keyword: BTreeMap::new(),
        }
    }

    /// Add a keyword argument.
    pub fn with_keyword(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    /// Total number of supplied arguments.
    pub fn len(&self) -> usize {
        self.positional.len() + self.keyword.len()
    }

    /// True when no argument was supplied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw value of the parameter at `index`, falling back to the keyword `name`.
    pub fn value(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional.get(index).or_else(|| self.keyword.get(name))
    }

    /// Deserialize the parameter at `index` (or keyword `name`) into `T`.
    pub fn get<T: serde::de::DeserializeOwned>(&self, index: usize, name: &str) -> anyhow::Result<T> {
        let value = self
            .value(index, name)
            .ok_or_else(|| anyhow::anyhow!("missing argument '{name}'"))?;
        serde_json::from_value(value.clone())
            .map_err(|err| anyhow::anyhow!("argument '{name}' has the wrong type: {err}"))
    }
}

/// Seconds since the unix epoch, as recorded in [`ReplyStats::last_reply_time`].
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Reply-time statistics, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReplyStats {
    /// Number of replies recorded.
    pub reply_number: u64,
    /// Sum of reply times.
    pub total_reply_time: f64,
    /// Sum of squared reply times.
    pub total_reply_time2: f64,
    /// Fastest reply.
    pub min_reply_time: f64,
    /// Slowest reply.
    pub max_reply_time: f64,
    /// Unix timestamp (seconds) of the start of the most recent request.
    pub last_reply_time: f64,
}

impl Default for ReplyStats {
    fn default() -> Self {
        Self {
            reply_number: 0,
            total_reply_time: 0.0,
            total_reply_time2: 0.0,
            min_reply_time: 0.0,
            max_reply_time: 0.0,
            last_reply_time: 0.0,
        }
    }
}

impl ReplyStats {
    /// Account for one reply that took `elapsed`, started at `started_at` (unix seconds).
    pub fn record(&mut self, elapsed: Duration, started_at: f64) {
        let dt = elapsed.as_secs_f64();
        self.min_reply_time = if self.reply_number == 0 {
            dt
        } else {
            self.min_reply_time.min(dt)
        };
        self.reply_number += 1;
        self.total_reply_time += dt;
        self.total_reply_time2 += dt * dt;
        self.max_reply_time = self.max_reply_time.max(dt);
        self.last_reply_time = started_at;
    }

    /// Mean reply time, if any reply was recorded.
    pub fn mean(&self) -> Option<f64> {
        (self.reply_number > 0).then(|| self.total_reply_time / self.reply_number as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_tag_names() {
        let frame = Frame::Call {
            call_id: 3,
            operation: "move".into(),
            args: CallArgs::positional([10]),
        };
        let encoded = serde_json::to_value(&frame).unwrap();
        assert_eq!(encoded["type"], "CALL");
        assert_eq!(encoded["args"]["positional"], json!([10]));

        let denied = serde_json::to_value(Frame::AdminDenied {
            held_by: SessionId::from_raw(2),
        })
        .unwrap();
        assert_eq!(denied, json!({"type": "ADMIN_DENIED", "held_by": 2}));
    }

    #[test]
    fn test_background_frames_on_the_wire() {
        let aborted = serde_json::to_value(Frame::Aborted {
            payload: Value::Null,
            interrupted: None,
        })
        .unwrap();
        assert_eq!(aborted, json!({"type": "ABORTED", "payload": null}));

        let pending: Frame = serde_json::from_value(
            json!({"type": "RESULT_PENDING", "call_id": 4, "operation": "scan"}),
        )
        .unwrap();
        assert_eq!(pending.name(), "RESULT_PENDING");
        assert_eq!(
            serde_json::to_value(Frame::SetLogLevel { level: "debug".into() }).unwrap(),
            json!({"type": "SET_LOG_LEVEL", "level": "debug"})
        );
    }

    #[test]
    fn test_call_without_args_decodes() {
        let frame: Frame =
            serde_json::from_value(json!({"type": "CALL", "call_id": 1, "operation": "status"}))
                .unwrap();
        assert_eq!(
            frame,
            Frame::Call {
                call_id: 1,
                operation: "status".into(),
                args: CallArgs::none(),
            }
        );
    }

    #[test]
    fn test_call_args_lookup() {
        let args = CallArgs::positional([1.5]).with_keyword("axis", 2);
        assert_eq!(args.get::<f64>(0, "position").unwrap(), 1.5);
        assert_eq!(args.get::<u8>(1, "axis").unwrap(), 2);
        assert!(args.get::<f64>(2, "speed").is_err());
        assert!(args.get::<String>(0, "position").is_err());
    }

    #[test]
    fn test_reply_stats() {
        let mut stats = ReplyStats::default();
        assert!(stats.mean().is_none());
        stats.record(Duration::from_millis(10), 100.0);
        stats.record(Duration::from_millis(30), 101.0);
        assert_eq!(stats.reply_number, 2);
        assert!((stats.mean().unwrap() - 0.02).abs() < 1e-9);
        assert!((stats.min_reply_time - 0.01).abs() < 1e-9);
        assert!((stats.max_reply_time - 0.03).abs() < 1e-9);
        assert_eq!(stats.last_reply_time, 101.0);
    }
}
