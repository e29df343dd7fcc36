//! The seam between the proxy and a wrapped device.
//!
//! A driver is a plain synchronous object: the proxy owns it, serializes access to
//! it, and runs each invocation on the blocking thread pool so a slow device never
//! stalls network I/O. Drivers declare their remote surface in [`Driver::register`].

use crate::error::ProxyError;
use crate::manifest::ManifestBuilder;
use std::any::Any;

/// A device driver exposed through a proxy server.
///
/// Implementations hold their state behind interior mutability because handlers
/// receive `&self`. The dispatch lock guarantees that non-`concurrency_safe`
/// operations never overlap.
pub trait Driver: Send + Sync + 'static {
    /// Driver type name, published as `CapabilityManifest::driver`.
    fn name(&self) -> &str;

    /// Declare every remotely callable operation and property.
    fn register(builder: &mut ManifestBuilder<Self>)
    where
        Self: Sized;

    /// Release the device. Called once during server shutdown, after in-flight
    /// calls finish; no operation runs afterwards.
    fn shutdown(&self) {}
}

/// Classified failure a driver can return (through `anyhow`) to set the reported kind.
///
/// ```rust,ignore
/// return Err(DriverFault::new("overtravel", "limit switch hit").into());
/// ```
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct DriverFault {
    /// Short machine-readable kind, e.g. `overtravel` or `aborted`.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

impl DriverFault {
    /// Fault of `kind` described by `message`.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Convert a handler failure into the wire-level driver error.
pub(crate) fn classify(err: anyhow::Error) -> ProxyError {
    match err.downcast_ref::<DriverFault>() {
        Some(fault) => ProxyError::driver(fault.kind.clone(), fault.message.clone()),
        None => ProxyError::driver("driver", format!("{err:#}")),
    }
}

/// Convert a caught panic payload into a driver error of kind `panic`.
pub(crate) fn classify_panic(payload: Box<dyn Any + Send>) -> ProxyError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "driver operation panicked".to_string()
    };
    ProxyError::driver("panic", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_fault_kind_survives_context() {
        let err = Err::<(), _>(DriverFault::new("overtravel", "limit switch hit"))
            .context("moving axis 1")
            .unwrap_err();
        match classify(err) {
            ProxyError::Driver { kind, .. } => assert_eq!(kind, "overtravel"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_plain_errors_get_generic_kind() {
        match classify(anyhow::anyhow!("serial port closed")) {
            ProxyError::Driver { kind, message } => {
                assert_eq!(kind, "driver");
                assert_eq!(message, "serial port closed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_panic_payloads() {
        let err = classify_panic(Box::new("boom"));
        assert!(matches!(err, ProxyError::Driver { ref kind, ref message } if kind == "panic" && message == "boom"));
        let err = classify_panic(Box::new(String::from("owned boom")));
        assert!(err.to_string().contains("owned boom"));
    }
}
