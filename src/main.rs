use clap::Parser;
use std::path::PathBuf;
use tokio::task::LocalSet;
use tracing::{info, Level};

use orc_bus::{Bus, BusConfig, BusError, ModuleCatalog};

/// Orc bus - command bus for a tree of cooperating processes
#[derive(Parser, Debug)]
#[command(name = "orc-bus", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address for both sockets
    #[arg(long)]
    host: Option<String>,

    /// Command socket port
    #[arg(long)]
    commander_port: Option<u16>,

    /// Notification socket port
    #[arg(long)]
    notifier_port: Option<u16>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<BusConfig, BusError> {
        let mut config = match &self.config {
            Some(path) => BusConfig::from_file(path)?,
            None => BusConfig::default(),
        };
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.commander_port {
            config.commander_port = port;
        }
        if let Some(port) = self.notifier_port {
            config.notifier_port = port;
        }
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let config = args.into_config()?;
    info!(
        host = %config.host,
        commander_port = config.commander_port,
        notifier_port = config.notifier_port,
        "orc bus starting"
    );

    // Every bus component is single-threaded and lives on this set.
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (bus, inbound) = Bus::boot(config, ModuleCatalog::new()).await?;

            tokio::select! {
                _ = bus.run(inbound) => {}
                _ = tokio::signal::ctrl_c() => info!("interrupted"),
            }

            bus.stop().await;
            Ok::<(), BusError>(())
        })
        .await?;

    info!("orc bus stopped");
    Ok(())
}
