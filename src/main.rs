//! `daq_proxy` command-line entry point.

use clap::Parser;
use daq_proxy::config::LabConfig;
use daq_proxy::launcher::{self, Cli, EXIT_FAILURE, EXIT_USAGE};
use daq_proxy::logging;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            // --help and --version are not usage errors.
            return if err.use_stderr() {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config = match LabConfig::load_from(cli.config_path()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: cannot load {}: {err}", cli.config_path().display());
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let log_control = logging::init_from_config(&config, cli.log_level.as_deref());

    launcher::run(cli, config, log_control).await
}
