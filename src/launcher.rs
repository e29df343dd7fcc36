//! Command-line launcher for the proxy servers of a lab.
//!
//! | Command | Effect | Exit code |
//! |---|---|---|
//! | `list` | drivers startable on this host | 0 |
//! | `running` | check every configured driver | 0 |
//! | `start <driver>` | run one server in the foreground | 0, 2 on failure |
//! | `startall` | spawn `start` for every startable driver not yet running | 0, 2 if a spawn failed |
//! | `kill <driver>` / `killall` | force admin, then `SHUTDOWN` | 0, 2 on failure |
//!
//! Usage errors exit with 1.

use crate::client::{ClientOptions, ProxyClient, ReconnectPolicy};
use crate::config::{DriverDefinition, LabConfig, DEFAULT_CONFIG_PATH};
use crate::drivers::DriverCatalog;
use crate::error::{AppResult, ProxyError};
use crate::logging::LogLevelHandle;
use crate::server::ServerOptions;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitCode, Stdio};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Exit code for usage errors.
pub const EXIT_USAGE: u8 = 1;
/// Exit code for startup or runtime failures.
pub const EXIT_FAILURE: u8 = 2;

const CHECK_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "daq_proxy", version, about = "Start, list and stop device proxy servers")]
/// Command line of the `daq_proxy` binary.
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override application.log_level
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// What to do
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// `--config`, or [`DEFAULT_CONFIG_PATH`].
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}

/// Launcher subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// List drivers that can be started on this host
    List,
    /// Show which configured drivers answer
    Running,
    /// Run one proxy server in the foreground
    Start {
        /// Name from the configuration
        driver: String,
    },
    /// Start every local driver in the background
    Startall,
    /// Stop one proxy server
    Kill {
        /// Name from the configuration
        driver: String,
    },
    /// Stop every running proxy server
    Killall,
}

/// Result of `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Another server already answers at the driver's address.
    AlreadyRunning,
    /// The server ran and has stopped.
    Stopped,
}

/// Runs the launcher commands against one configuration.
pub struct Launcher {
    config: LabConfig,
    config_path: PathBuf,
    catalog: DriverCatalog,
    log_control: Option<LogLevelHandle>,
}

impl Launcher {
    /// Launcher for `config`, read from `config_path`, building drivers from `catalog`.
    pub fn new(config: LabConfig, config_path: PathBuf, catalog: DriverCatalog) -> Self {
        Self {
            config,
            config_path,
            catalog,
            log_control: None,
        }
    }

    /// Let servers started by [`Launcher::start`] honour `SET_LOG_LEVEL`.
    pub fn with_log_control(mut self, handle: Option<LogLevelHandle>) -> Self {
        self.log_control = handle;
        self
    }

    /// The configuration in use.
    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    fn driver(&self, name: &str) -> AppResult<&DriverDefinition> {
        self.config.driver(name).ok_or_else(|| {
            ProxyError::ConfigValidation(format!("no driver named '{name}' in the configuration"))
        })
    }

    fn check_options(&self) -> ClientOptions {
        ClientOptions {
            client_name: "daq_proxy-launcher".to_string(),
            connect_timeout: CHECK_TIMEOUT,
            reconnect: ReconnectPolicy::disabled(),
            request_admin_on_connect: false,
            ..self.config.client_options()
        }
    }

    /// Drivers that may be started on this host.
    pub fn list(&self) -> Vec<&DriverDefinition> {
        self.config.startable_drivers()
    }

    /// Whether a proxy server answers the handshake at the driver's address.
    pub async fn is_running(&self, driver: &DriverDefinition) -> bool {
        match ProxyClient::connect(driver.address.clone(), self.check_options()).await {
            Ok(client) => {
                client.disconnect().await;
                true
            }
            Err(_) => false,
        }
    }

    /// Every configured driver with whether its server answers.
    pub async fn running(&self) -> Vec<(&DriverDefinition, bool)> {
        let mut report = Vec::with_capacity(self.config.drivers.len());
        for driver in &self.config.drivers {
            report.push((driver, self.is_running(driver).await));
        }
        report
    }

    /// Run the named driver's server until `stop` resolves or a client shuts it down.
    pub async fn start(&self, name: &str, stop: impl Future<Output = ()>) -> AppResult<StartOutcome> {
        let driver = self.driver(name)?;
        if !self.config.is_local(driver) {
            return Err(ProxyError::ConfigValidation(format!(
                "'{name}' ({}) is not startable on this host",
                driver.address
            )));
        }
        if self.is_running(driver).await {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let options = ServerOptions {
            log_control: self.log_control.clone(),
            ..self.config.server_options()
        };
        let service = self.catalog.build(driver, options)?;
        let listener = TcpListener::bind(driver.socket_addr()?).await?;
        info!(driver = %driver.name, address = %driver.address, "starting proxy server");

        let serving = service.serve(listener);
        tokio::pin!(serving);
        tokio::select! {
            served = &mut serving => served?,
            _ = stop => {
                service.shutdown();
                serving.await?;
            }
        }
        Ok(StartOutcome::Stopped)
    }

    /// Spawn `daq_proxy start <name>` for every startable driver not already running.
    ///
    /// Returns the names that were spawned.
    pub async fn startall(&self) -> anyhow::Result<Vec<String>> {
        let exe = std::env::current_exe().context("cannot locate the daq_proxy executable")?;
        let mut spawned = Vec::new();
        for driver in self.list() {
            if self.is_running(driver).await {
                info!(driver = %driver.name, "already running");
                continue;
            }
            tokio::process::Command::new(&exe)
                .arg("--config")
                .arg(&self.config_path)
                .arg("start")
                .arg(&driver.name)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .with_context(|| format!("failed to spawn proxy server for '{}'", driver.name))?;
            spawned.push(driver.name.clone());
        }
        Ok(spawned)
    }

    /// Stop the named server: take admin by force, then send `SHUTDOWN`.
    pub async fn kill(&self, name: &str) -> AppResult<()> {
        let driver = self.driver(name)?;
        let client = ProxyClient::connect(driver.address.clone(), self.check_options()).await?;
        client.request_admin_forced().await?;
        client.shutdown_server().await?;
        client.disconnect().await;
        info!(driver = %name, "proxy server stopped");
        Ok(())
    }

    /// Stop every configured server that answers. Returns the names stopped.
    pub async fn killall(&self) -> Vec<String> {
        let mut stopped = Vec::new();
        for driver in &self.config.drivers {
            if !self.is_running(driver).await {
                continue;
            }
            match self.kill(&driver.name).await {
                Ok(()) => stopped.push(driver.name.clone()),
                Err(err) => warn!(driver = %driver.name, error = %err, "could not stop proxy server"),
            }
        }
        stopped
    }
}

/// Execute `command`; the returned code is the process exit status.
pub async fn run(cli: Cli, config: LabConfig, log_control: Option<LogLevelHandle>) -> ExitCode {
    let launcher = Launcher::new(config, cli.config_path(), DriverCatalog::with_builtin())
        .with_log_control(log_control);
    match execute(&launcher, cli.command).await {
        Ok(code) => code,
        Err(err) => {
            error!("command failed: {err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn execute(launcher: &Launcher, command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::List => {
            for driver in launcher.list() {
                println!("{:<20} {:<16} {}", driver.name, driver.r#type, driver.address);
            }
        }
        Command::Running => {
            for (driver, running) in launcher.running().await {
                println!("{:<20} {}", driver.name, if running { "YES" } else { "NO" });
            }
        }
        Command::Start { driver } => {
            let stop = async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "cannot listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            };
            let outcome = launcher
                .start(&driver, stop)
                .await
                .with_context(|| format!("cannot start '{driver}'"))?;
            if outcome == StartOutcome::AlreadyRunning {
                println!("ALREADY RUNNING");
            }
        }
        Command::Startall => {
            for name in launcher.startall().await? {
                println!("started {name}");
            }
        }
        Command::Kill { driver } => {
            launcher
                .kill(&driver)
                .await
                .with_context(|| format!("cannot stop '{driver}'"))?;
        }
        Command::Killall => {
            for name in launcher.killall().await {
                println!("stopped {name}");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind as ClapErrorKind;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::EnvFilter;

    fn config_with(drivers: Vec<DriverDefinition>) -> LabConfig {
        LabConfig {
            drivers,
            ..LabConfig::default()
        }
    }

    fn def(name: &str, address: &str) -> DriverDefinition {
        DriverDefinition {
            name: name.into(),
            r#type: "DummyMotor".into(),
            address: address.into(),
            enabled: true,
        }
    }

    #[test]
    fn test_missing_driver_argument_is_usage_error() {
        let err = Cli::try_parse_from(["daq_proxy", "start"]).unwrap_err();
        assert_eq!(err.kind(), ClapErrorKind::MissingRequiredArgument);
        assert!(Cli::try_parse_from(["daq_proxy"]).is_err());
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["daq_proxy", "kill", "stage", "--config", "lab.toml"]).unwrap();
        assert_eq!(cli.config_path(), PathBuf::from("lab.toml"));
        assert!(matches!(cli.command, Command::Kill { ref driver } if driver == "stage"));
    }

    #[test]
    fn test_list_only_shows_local_enabled_drivers() {
        let mut disabled = def("spare", "127.0.0.1:7003");
        disabled.enabled = false;
        let launcher = Launcher::new(
            config_with(vec![
                def("stage", "127.0.0.1:7001"),
                def("remote", "10.1.2.3:7002"),
                disabled,
            ]),
            PathBuf::from(DEFAULT_CONFIG_PATH),
            DriverCatalog::with_builtin(),
        );
        let names: Vec<_> = launcher.list().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["stage"]);
    }

    #[tokio::test]
    async fn test_start_refuses_foreign_driver() {
        let launcher = Launcher::new(
            config_with(vec![def("remote", "10.1.2.3:7002")]),
            PathBuf::from(DEFAULT_CONFIG_PATH),
            DriverCatalog::with_builtin(),
        );
        let result = launcher.start("remote", std::future::ready(())).await;
        assert!(matches!(result, Err(ProxyError::ConfigValidation(_))));
        assert!(launcher.start("nope", std::future::ready(())).await.is_err());
    }

    #[tokio::test]
    async fn test_start_then_kill() {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = spare.local_addr().unwrap().to_string();
        drop(spare);

        let (filter, log_control) = crate::logging::reloadable_filter(EnvFilter::new("info"));
        let _subscriber = tracing_subscriber::registry().with(filter);
        let launcher = std::sync::Arc::new(
            Launcher::new(
                config_with(vec![def("stage", &address)]),
                PathBuf::from(DEFAULT_CONFIG_PATH),
                DriverCatalog::with_builtin(),
            )
            .with_log_control(Some(log_control.clone())),
        );
        let server = {
            let launcher = std::sync::Arc::clone(&launcher);
            tokio::spawn(async move { launcher.start("stage", std::future::pending()).await })
        };

        let stage = launcher.config().driver("stage").unwrap().clone();
        let mut up = false;
        for _ in 0..50 {
            if launcher.is_running(&stage).await {
                up = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(up, "server never came up");
        assert_eq!(
            launcher.start("stage", std::future::ready(())).await.unwrap(),
            StartOutcome::AlreadyRunning
        );

        let operator = ProxyClient::connect(address.clone(), launcher.check_options())
            .await
            .unwrap();
        assert_eq!(operator.set_log_level("warn").await.unwrap(), "warn");
        assert_eq!(log_control.current().as_deref(), Some("warn"));
        operator.disconnect().await;

        launcher.kill("stage").await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, StartOutcome::Stopped);
    }
}
