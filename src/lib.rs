//! Network proxy for laboratory devices that tolerate a single connection.
//!
//! One [`ProxyServer`] owns a device [`Driver`] and serves many [`ProxyClient`]s.
//! Every driver invocation goes through one dispatch path that serializes access
//! to the device, and mutating operations are reserved for the single session
//! holding the admin token. A misbehaving client, a malformed frame or a panic
//! inside the driver only ever affects the session that caused it.
//!
//! - [`manifest`]: what a driver exposes, built once by an explicit registration step
//! - [`server`]: accept loop, dispatch, admin arbitration, liveness
//! - [`client`]: handshake, calls, admin management, reconnect
//! - [`protocol`]: frames and their length-prefixed JSON encoding
//! - [`launcher`]: the `daq_proxy` command line

pub mod client;
pub mod config;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod manifest;
pub mod protocol;
pub mod server;

pub use client::{ClientOptions, ProxyClient, TaskPoll};
pub use driver::{Driver, DriverFault};
pub use error::{AppResult, ProxyError};
pub use manifest::{CapabilityManifest, ManifestBuilder, ParamKind};
pub use protocol::CallArgs;
pub use server::{ProxyServer, ServerOptions, SessionId};
