//! Lab configuration using Figment.
//!
//! Configuration is merged from, lowest precedence first:
//! 1. built-in defaults,
//! 2. a TOML file (`config/daq_proxy.toml` unless another path is given),
//! 3. environment variables prefixed with `DAQPROXY_`, nested keys split on `__`.
//!
//! ```text
//! DAQPROXY_APPLICATION__LOG_LEVEL=debug
//! DAQPROXY_NETWORK__HEARTBEAT_INTERVAL_MS=500
//! ```
//!
//! # Example
//!
//! ```no_run
//! use daq_proxy::config::LabConfig;
//!
//! let config = LabConfig::load().unwrap();
//! for driver in config.startable_drivers() {
//!     println!("{} on {}", driver.name, driver.address);
//! }
//! ```

use crate::client::{ClientOptions, ReconnectPolicy};
use crate::error::{AppResult, ProxyError};
use crate::server::ServerOptions;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_proxy.toml";

/// Driver types the built-in catalog knows how to start.
pub const KNOWN_DRIVER_TYPES: &[&str] = &["DummyMotor", "DummyDetector"];

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LabConfig {
    /// `[application]` table
    #[serde(default)]
    pub application: ApplicationConfig,
    /// `[network]` table
    #[serde(default)]
    pub network: NetworkConfig,
    /// Proxy servers of the lab, one per device
    #[serde(default)]
    pub drivers: Vec<DriverDefinition>,
}

/// Lab identity and process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Lab name
    pub lab: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Data storage path, passed through to drivers
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Manager service address
    #[serde(default)]
    pub manager_address: Option<String>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            lab: "lab".to_string(),
            log_level: "info".to_string(),
            log_format: default_log_format(),
            data_dir: None,
            manager_address: None,
        }
    }
}

/// Host registry and protocol timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Addresses that identify this machine; decides which drivers start here
    #[serde(default = "default_local_addresses")]
    pub local_addresses: Vec<IpAddr>,
    /// Interval clients are asked to `PING` at
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Silent intervals after which a peer is dead
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    /// Time a new connection gets to send `HELLO`
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Default client wait for a reply
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Client limit for connecting and the handshake
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Largest frame body, both directions
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Client reconnect attempts per outage
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// First reconnect delay, doubled per attempt
    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_ms: u64,
    /// Cap of the reconnect delay
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            local_addresses: default_local_addresses(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            missed_heartbeats: default_missed_heartbeats(),
            handshake_timeout_ms: default_handshake_timeout(),
            request_timeout_ms: default_request_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
        }
    }
}

/// One proxied device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverDefinition {
    /// Unique name used on the command line
    pub name: String,
    /// Driver type, one of [`KNOWN_DRIVER_TYPES`]
    pub r#type: String,
    /// `host:port` the proxy server listens on
    pub address: String,
    /// Disabled drivers are skipped by `startall`
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl DriverDefinition {
    /// Parsed listen address. Valid after [`LabConfig::validate`].
    pub fn socket_addr(&self) -> AppResult<SocketAddr> {
        self.address.parse().map_err(|_| {
            ProxyError::ConfigValidation(format!(
                "driver '{}': '{}' is not a host:port address",
                self.name, self.address
            ))
        })
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_format() -> String {
    "text".to_string()
}

fn default_local_addresses() -> Vec<IpAddr> {
    vec![IpAddr::from([127, 0, 0, 1])]
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_missed_heartbeats() -> u32 {
    3
}

fn default_handshake_timeout() -> u64 {
    5000
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_max_frame_bytes() -> usize {
    crate::protocol::codec::DEFAULT_MAX_FRAME_BYTES
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay() -> u64 {
    200
}

fn default_reconnect_max_delay() -> u64 {
    5000
}

fn default_enabled() -> bool {
    true
}

// ============================================================================
// Loading and validation
// ============================================================================

impl LabConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment, then validate.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::from_figment(Self::figment(path.as_ref()))
    }

    /// The merged provider stack, exposed for tests and tooling.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(LabConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DAQPROXY_").split("__"))
    }

    /// Extract and validate a configuration from an already layered figment.
    pub fn from_figment(figment: Figment) -> AppResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks:
    /// - log level and log format are known
    /// - heartbeat interval and missed-heartbeat count are non-zero
    /// - driver names are unique, types are known, addresses parse
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = crate::logging::LOG_LEVELS;
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ProxyError::ConfigValidation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ProxyError::ConfigValidation(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.network.heartbeat_interval_ms == 0 {
            return Err(ProxyError::ConfigValidation(
                "heartbeat_interval_ms must be > 0".into(),
            ));
        }
        if self.network.missed_heartbeats == 0 {
            return Err(ProxyError::ConfigValidation(
                "missed_heartbeats must be > 0".into(),
            ));
        }

        let mut names = HashSet::new();
        for driver in &self.drivers {
            if !names.insert(driver.name.as_str()) {
                return Err(ProxyError::ConfigValidation(format!(
                    "Duplicate driver name: '{}'",
                    driver.name
                )));
            }
            if !KNOWN_DRIVER_TYPES.contains(&driver.r#type.as_str()) {
                return Err(ProxyError::ConfigValidation(format!(
                    "Invalid driver type '{}' for driver '{}'. Must be one of: {}",
                    driver.r#type,
                    driver.name,
                    KNOWN_DRIVER_TYPES.join(", ")
                )));
            }
            driver.socket_addr()?;
        }

        Ok(())
    }

    /// Look up a driver by name.
    pub fn driver(&self, name: &str) -> Option<&DriverDefinition> {
        self.drivers.iter().find(|d| d.name == name)
    }

    /// Whether `driver` is meant to run on this machine.
    pub fn is_local(&self, driver: &DriverDefinition) -> bool {
        driver
            .socket_addr()
            .map(|addr| self.network.local_addresses.contains(&addr.ip()))
            .unwrap_or(false)
    }

    /// Enabled drivers whose address belongs to this machine.
    pub fn startable_drivers(&self) -> Vec<&DriverDefinition> {
        self.drivers
            .iter()
            .filter(|d| d.enabled && self.is_local(d))
            .collect()
    }

    /// Options for a proxy server started from this configuration.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            heartbeat_interval: Duration::from_millis(self.network.heartbeat_interval_ms),
            missed_heartbeats: self.network.missed_heartbeats,
            handshake_timeout: Duration::from_millis(self.network.handshake_timeout_ms),
            max_frame_bytes: self.network.max_frame_bytes,
            log_control: None,
        }
    }

    /// Options for clients talking to the configured servers.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            client_name: format!("{}-{}", self.application.lab, std::process::id()),
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.network.request_timeout_ms),
            missed_heartbeats: self.network.missed_heartbeats,
            max_frame_bytes: self.network.max_frame_bytes,
            reconnect: ReconnectPolicy::new(
                self.network.reconnect_attempts,
                Duration::from_millis(self.network.reconnect_base_delay_ms),
                Duration::from_millis(self.network.reconnect_max_delay_ms),
            ),
            ..ClientOptions::default()
        }
    }
}
