//! Composition root for the client binary: parses CLI/SIP003 configuration,
//! then hands off to [`kcptun::tunnel::client::run`].

use clap::Parser;
use kcptun::config::{apply_sip003_env, init_logging, Cli, TunnelConfig};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let mut cli = Cli::parse();
    if let Err(err) = apply_sip003_env(&mut cli) {
        eprintln!("{err}");
        return std::process::ExitCode::FAILURE;
    }
    init_logging(cli.logfile.as_deref());

    let config = match TunnelConfig::from_cli(cli) {
        Ok(config) => config,
        Err(err) => {
            log::error!("{err}");
            return std::process::ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = kcptun::tunnel::client::run(config) => {
            if let Err(err) = result {
                log::error!("client tunnel exited: {err}");
                return std::process::ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("received interrupt, shutting down");
        }
    }

    std::process::ExitCode::SUCCESS
}
