//! Custom error types for the proxy.
//!
//! This module defines the primary error type, `ProxyError`, shared by the server,
//! the client and the launcher. Using the `thiserror` crate, it provides a single
//! taxonomy for everything that can go wrong between a remote caller and the device.
//!
//! ## Error Hierarchy
//!
//! - **Recoverable, per call**: `PermissionDenied`, `Busy`, `UnknownOperation`,
//!   `InvalidArguments`, `Driver`, `BackgroundCall` and `Timeout`. The session that received them keeps
//!   working and may issue further requests.
//! - **Session fatal**: `Protocol` and `Connection`. Only the offending session is torn
//!   down; the server and every other session continue.
//! - **Connect time**: `Handshake` and `IncompatibleManifest`, raised by the client
//!   before any call is attempted.
//! - **Startup**: `ManifestConflict`, `Config` and `ConfigValidation`, fatal to server
//!   startup only.
//!
//! Errors that cross the wire are reduced to an [`ErrorKind`] plus a message and
//! rebuilt on the client side with [`ProxyError::from_wire`].

use crate::server::SessionId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the proxy error type.
pub type AppResult<T> = std::result::Result<T, ProxyError>;

/// Every failure the proxy reports, locally or over the wire.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The transport failed or the client is not connected.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server refused or never answered `HELLO`.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The published manifest does not match the fingerprint we trust.
    #[error("Incompatible manifest: expected fingerprint {expected}, received {received}")]
    IncompatibleManifest {
        /// Fingerprint the client expected.
        expected: String,
        /// Fingerprint the server published.
        received: String,
    },

    /// The operation needs admin rights this session does not hold.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Another session holds admin rights.
    #[error("Admin rights are held by {held_by}")]
    Busy {
        /// Session currently holding the token.
        held_by: SessionId,
    },

    /// No reply within the client-side deadline. The server may still run the call.
    #[error("No response within {0:?}")]
    Timeout(Duration),

    /// The driver reported a failure; `kind` is its own classification.
    #[error("Driver error ({kind}): {message}")]
    Driver {
        /// Driver-chosen class such as `overtravel`, or `panic`/`driver`.
        kind: String,
        /// Human-readable detail.
        message: String,
    },

    /// Malformed or unexpected frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The manifest declares no such operation.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Arguments do not match the declared parameter schema.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// A background call is still outstanding, or there is none to collect.
    #[error("Background call: {0}")]
    BackgroundCall(String),

    /// The driver's declarations collide; the server cannot start.
    #[error("Manifest conflict: {0}")]
    ManifestConflict(String),

    /// Figment could not load or extract the configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration loaded but is inconsistent.
    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),

    /// Binding or accepting failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error classes carried by `ERROR` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`ProxyError::PermissionDenied`].
    PermissionDenied,
    /// See [`ProxyError::UnknownOperation`].
    UnknownOperation,
    /// See [`ProxyError::InvalidArguments`].
    InvalidArguments,
    /// See [`ProxyError::Driver`]; the frame also carries the driver's kind.
    Driver,
    /// See [`ProxyError::BackgroundCall`].
    BackgroundCall,
    /// See [`ProxyError::Protocol`].
    Protocol,
}

impl ProxyError {
    /// Build a `Driver` error from a kind and message.
    pub fn driver(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ProxyError::Driver {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// True when the session that observed this error can keep issuing requests.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProxyError::PermissionDenied(_)
                | ProxyError::Busy { .. }
                | ProxyError::Timeout(_)
                | ProxyError::Driver { .. }
                | ProxyError::UnknownOperation(_)
                | ProxyError::InvalidArguments(_)
                | ProxyError::BackgroundCall(_)
        )
    }

    /// Wire error class, if this error can be carried by an `ERROR` frame.
    pub fn kind(&self) -> Option<ErrorKind> {
        self.to_wire().map(|(kind, _, _)| kind)
    }

    /// Wire representation as `(kind, driver_kind, message)`.
    ///
    /// Returns `None` for errors that never travel in an `ERROR` frame.
    pub fn to_wire(&self) -> Option<(ErrorKind, Option<String>, String)> {
        match self {
            ProxyError::PermissionDenied(msg) => {
                Some((ErrorKind::PermissionDenied, None, msg.clone()))
            }
            ProxyError::UnknownOperation(op) => {
                Some((ErrorKind::UnknownOperation, None, op.clone()))
            }
            ProxyError::InvalidArguments(msg) => {
                Some((ErrorKind::InvalidArguments, None, msg.clone()))
            }
            ProxyError::Driver { kind, message } => {
                Some((ErrorKind::Driver, Some(kind.clone()), message.clone()))
            }
            ProxyError::BackgroundCall(msg) => {
                Some((ErrorKind::BackgroundCall, None, msg.clone()))
            }
            ProxyError::Protocol(msg) => Some((ErrorKind::Protocol, None, msg.clone())),
            _ => None,
        }
    }

    /// Rebuild an error received in an `ERROR` frame.
    pub fn from_wire(kind: ErrorKind, driver_kind: Option<String>, message: String) -> Self {
        match kind {
            ErrorKind::PermissionDenied => ProxyError::PermissionDenied(message),
            ErrorKind::UnknownOperation => ProxyError::UnknownOperation(message),
            ErrorKind::InvalidArguments => ProxyError::InvalidArguments(message),
            ErrorKind::Driver => ProxyError::Driver {
                kind: driver_kind.unwrap_or_else(|| "driver".to_string()),
                message,
            },
            ErrorKind::BackgroundCall => ProxyError::BackgroundCall(message),
            ErrorKind::Protocol => ProxyError::Protocol(message),
        }
    }
}

impl From<figment::Error> for ProxyError {
    fn from(err: figment::Error) -> Self {
        ProxyError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProxyError::driver("overtravel", "limit switch hit");
        assert_eq!(err.to_string(), "Driver error (overtravel): limit switch hit");
    }

    #[test]
    fn test_busy_names_holder() {
        let err = ProxyError::Busy {
            held_by: SessionId::from_raw(7),
        };
        assert!(err.to_string().contains("session-7"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_session_fatal_errors_are_not_recoverable() {
        assert!(!ProxyError::Protocol("bad frame".into()).is_recoverable());
        assert!(!ProxyError::Connection("reset".into()).is_recoverable());
    }

    #[test]
    fn test_wire_conversion_keeps_driver_kind() {
        let err = ProxyError::driver("timeout", "controller silent");
        let (kind, driver_kind, message) = err.to_wire().unwrap();
        assert_eq!(kind, ErrorKind::Driver);

        match ProxyError::from_wire(kind, driver_kind, message) {
            ProxyError::Driver { kind, message } => {
                assert_eq!(kind, "timeout");
                assert_eq!(message, "controller silent");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_background_call_errors_cross_the_wire() {
        let err = ProxyError::BackgroundCall("nothing to collect".into());
        assert!(err.is_recoverable());
        let (kind, driver_kind, message) = err.to_wire().unwrap();
        assert!(matches!(
            ProxyError::from_wire(kind, driver_kind, message),
            ProxyError::BackgroundCall(m) if m == "nothing to collect"
        ));
    }

    #[test]
    fn test_client_side_errors_have_no_wire_form() {
        assert!(ProxyError::Timeout(Duration::from_secs(1)).to_wire().is_none());
        assert!(ProxyError::Handshake("closed".into()).to_wire().is_none());
    }
}
