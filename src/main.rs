use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;

use tiltlink_lib::{
    DeviceEvent, DeviceManager, DiscoverySettings, JsonConfigStore, SystemPorts, VirtualDisplay,
};

/// Watch USB-serial orientation sensors and rotate the mapped displays
#[derive(Debug, Parser)]
#[command(name = "tiltlinkd", version)]
struct Args {
    /// Device mapping store
    #[arg(long, default_value = "tiltlink.json")]
    config: PathBuf,

    /// Optional discovery settings file (JSON)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Number of virtual display targets to drive
    #[arg(long, default_value_t = 1)]
    targets: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {} - {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let args = Args::parse();
    let settings = match &args.settings {
        Some(path) => DiscoverySettings::from_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => DiscoverySettings::default(),
    };

    let manager = DeviceManager::new(
        settings.clone(),
        Arc::new(SystemPorts::new(settings.usb_only)),
        Arc::new(VirtualDisplay::new(args.targets)),
        Arc::new(JsonConfigStore::new(args.config.clone())),
    );

    let mut events = manager.subscribe();
    manager
        .start_discovery()
        .await
        .context("starting device discovery")?;
    log::info!("tiltlinkd running, config at {}", args.config.display());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => log::warn!("Dropped {} device events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupt received, shutting down");
                break;
            }
        }
    }

    manager.stop_discovery().await?;
    Ok(())
}

fn log_event(event: &DeviceEvent) {
    match event {
        DeviceEvent::DeviceDiscovered { address } => log::info!("Discovered {}", address),
        DeviceEvent::DeviceConnected { address, port } => log::info!("{} connected on {}", address, port),
        DeviceEvent::DeviceDisconnected { address } => log::info!("{} disconnected", address),
        DeviceEvent::OrientationChanged { address, target_index, orientation } => match target_index {
            Some(target) => log::info!("{} -> {} on target {}", address, orientation, target),
            None => log::info!("{} -> {} (unmapped)", address, orientation),
        },
    }
}
