//! mktl-broker: request router and broadcast relay
//!
//! ## Configuration
//! - `-c/--config FILE` or MKTL_CONFIG: INI file with `[core]` and `[zmq]`
//! - MKTL__ZMQ__BROKER etc.: per-key overrides
//! - MKTL_LOG: tracing filter (overrides `-v`)

use std::path::PathBuf;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use mktl::broker::Broker;
use mktl::config::Config;
use mktl::logging::init_tracing;

#[derive(Debug, Parser)]
#[command(name = "mktl-broker", about = "Run an mktl broker in the foreground")]
struct Args {
    /// Configuration file.
    #[arg(short, long, env = "MKTL_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (repeatable).
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Fail instead of shutting down cleanly on interrupt.
    #[arg(short = 'D')]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = Config::load(args.config.as_deref())?;
    let broker = Broker::bind(&config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut running = tokio::spawn(broker.run(shutdown_rx));

    tokio::select! {
        result = &mut running => {
            result??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupt received, stopping broker");
        }
    }

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(config.join_timeout(), running).await {
        Ok(result) => result??,
        Err(_) => error!("Broker did not stop within the join timeout"),
    }

    if args.debug {
        return Err("interrupted".into());
    }
    Ok(())
}
