//! Main entry point for the fan control daemon

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pi_fan_control::{
    args::{Args, Commands},
    client::FanControlClient,
    daemon::FanControlDaemon,
    logging,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logging::setup(args.verbose, args.log_file.as_deref()).context("logging setup failed")?;

    // Build identity, useful when chasing a stale installed binary
    let pkg_version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let build_time = option_env!("BUILD_TIME").unwrap_or("unknown");
    log::debug!(
        "pi-fan-control v{} (git {}) built {}",
        pkg_version,
        git_hash,
        build_time
    );

    match args.command {
        Some(Commands::Daemon {
            fans,
            interval,
            config,
        }) => {
            let interval = Duration::from_secs_f64(interval.max(0.1));
            let daemon = FanControlDaemon::new(&fans, interval, config)?;
            daemon.run().await?;
        }
        Some(command) => {
            let client = FanControlClient::new()
                .await
                .context("connecting to the system bus")?;
            client.handle_command(command).await?;
        }
        None => {
            anyhow::bail!("no command specified (try --help)");
        }
    }

    Ok(())
}
