//! `tagbridge` binary.
//!
//! Wires the device manager, scan service, distributor and control server
//! together and runs them until Ctrl-C.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::AppConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use tagbridge_hardware::drivers::ProximityFeed;
use tagbridge_hardware::{DeviceManager, TransportSet};
use tagbridge_network::{AppState, ControlServer, Distributor};
use tagbridge_session::ScanService;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tagbridge", author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML). Defaults to ./tagbridge.toml when present.
    #[arg(long, short, env = "TAGBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address, e.g. 127.0.0.1:3001
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, source) = AppConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }

    init_tracing(&config.log_filter);
    match source {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("No configuration file, using defaults"),
    }

    run(config).await
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn transports(config: &AppConfig) -> TransportSet {
    let transports = TransportSet::new(ProximityFeed::new())
        .with_proximity(config.proximity.clone())
        .with_daemon(config.effective_daemon());

    #[cfg(feature = "hardware-usb")]
    let transports = match tagbridge_hardware::drivers::usb::RusbBackend::new() {
        Ok(backend) => transports.with_usb(config.usb.clone(), std::sync::Arc::new(backend)),
        Err(e) => {
            warn!(error = %e, "USB transport unavailable");
            transports
        }
    };

    #[cfg(not(feature = "hardware-usb"))]
    debug!(
        vendors = config.usb.vendor_ids.len(),
        "USB transport not built in (enable the hardware-usb feature)"
    );

    if !config.proximity.is_secure() {
        debug!("Proximity forwarding disabled: no trusted origins");
    }
    transports
}

async fn run(config: AppConfig) -> Result<()> {
    let shutdown = CancellationToken::new();

    let manager = DeviceManager::new(config.manager.clone(), transports(&config));
    let (service, handle, events) = ScanService::new(config.scan.clone(), manager);
    let service_task = tokio::spawn(service.run(shutdown.clone()));

    let initial = handle
        .status()
        .await
        .context("Scan service did not start")?;
    let (distributor, distributor_handle) =
        Distributor::new(events, initial, config.server.subscriber_queue);
    let distributor_task = tokio::spawn(distributor.run(shutdown.clone()));

    let state = AppState::new(handle.clone(), distributor_handle, config.server.clone());
    let server = ControlServer::bind(state)
        .await
        .context("Failed to start control server")?;
    info!(addr = %server.local_addr(), "tagbridge listening");
    let mut server_task = tokio::spawn(server.serve(shutdown.clone()));

    match handle.connect_reader().await {
        Ok(reader) => info!(reader = reader.name(), transport = %reader.transport, "Reader ready"),
        Err(e) => warn!(error = %e, "No reader at startup, waiting for a connect request"),
    }

    let served = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
            None
        }
        served = &mut server_task => Some(served),
    };

    shutdown.cancel();
    let served = match served {
        Some(served) => served,
        None => server_task.await,
    };
    let (distributor_done, service_done) = tokio::join!(distributor_task, service_task);
    if distributor_done.is_err() || service_done.is_err() {
        warn!("A background task panicked during shutdown");
    }

    served.context("Control server task panicked")??;
    Ok(())
}
