//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level, so
//! `RUST_LOG=daq_proxy::server=debug daq_proxy start stage` works as expected.
//!
//! The filter sits behind a [`reload`] layer; the returned [`LogLevelHandle`]
//! lets a running server change its level when a client sends `SET_LOG_LEVEL`.

use crate::config::LabConfig;
use crate::error::{AppResult, ProxyError};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

/// Levels accepted in the configuration and by [`LogLevelHandle::set_level`].
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Changes the level of an installed subscriber.
#[derive(Debug, Clone)]
pub struct LogLevelHandle {
    filter: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelHandle {
    /// Replace the whole filter with `level`; returns the normalized level.
    ///
    /// # Errors
    ///
    /// `InvalidArguments` for a level outside [`LOG_LEVELS`], `UnknownOperation`
    /// if the subscriber behind this handle is gone.
    pub fn set_level(&self, level: &str) -> AppResult<String> {
        let level = level.trim().to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ProxyError::InvalidArguments(format!(
                "unknown log level '{level}', expected one of: {}",
                LOG_LEVELS.join(", ")
            )));
        }
        self.filter
            .reload(EnvFilter::new(&level))
            .map_err(|err| ProxyError::UnknownOperation(format!("log level control: {err}")))?;
        info!(%level, "log level changed");
        Ok(level)
    }

    /// The active filter directives.
    pub fn current(&self) -> Option<String> {
        self.filter.with_current(|filter| filter.to_string()).ok()
    }
}

/// Wrap `filter` so it can be swapped later.
pub fn reloadable_filter(
    filter: EnvFilter,
) -> (reload::Layer<EnvFilter, Registry>, LogLevelHandle) {
    let (layer, filter) = reload::Layer::new(filter);
    (layer, LogLevelHandle { filter })
}

/// Install the global subscriber for `config`.
///
/// `level_override` (from `--log-level`) replaces `application.log_level`.
/// Returns `None` if a subscriber was already installed; that is not an error.
pub fn init_from_config(config: &LabConfig, level_override: Option<&str>) -> Option<LogLevelHandle> {
    let level = level_override.unwrap_or(&config.application.log_level);
    init(level, config.application.log_format == "json")
}

/// Install the global subscriber with `level` as the fallback filter.
pub fn init(level: &str, json: bool) -> Option<LogLevelHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter, handle) = reloadable_filter(filter);
    let format = if json {
        fmt::layer().with_target(true).json().boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .try_init()
        .ok()
        .map(|()| handle)
}
