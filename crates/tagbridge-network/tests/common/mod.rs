//! Shared fixture: the full service stack over the proximity transport.

#![allow(dead_code)]

use std::net::SocketAddr;
use tagbridge_hardware::drivers::{ProximityConfig, ProximityFeed};
use tagbridge_hardware::{DeviceManager, ManagerConfig, TransportSet};
use tagbridge_network::{AppState, ControlServer, Distributor, ServerConfig};
use tagbridge_session::{ScanConfig, ScanService, ServiceHandle};
use tokio_util::sync::CancellationToken;

pub const ORIGIN: &str = "https://pos.example.com";

pub struct TestStack {
    pub state: AppState,
    pub shutdown: CancellationToken,
}

impl TestStack {
    pub fn service(&self) -> &ServiceHandle {
        &self.state.service
    }

    /// Bind on an ephemeral loopback port and serve in the background.
    pub async fn serve(&self) -> SocketAddr {
        let server = ControlServer::bind(self.state.clone()).await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.serve(self.shutdown.clone()));
        addr
    }
}

impl Drop for TestStack {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn stack() -> TestStack {
    let transports = TransportSet::new(ProximityFeed::new())
        .with_proximity(ProximityConfig::trusting([ORIGIN]))
        .without_daemon();
    let manager = DeviceManager::new(ManagerConfig::default(), transports);
    let (service, handle, events) = ScanService::new(ScanConfig::default(), manager);

    let shutdown = CancellationToken::new();
    tokio::spawn(service.run(shutdown.clone()));

    let initial = handle.status().await.unwrap();
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        subscriber_queue: 16,
        ..ServerConfig::default()
    };
    let (distributor, distributor_handle) =
        Distributor::new(events, initial, config.subscriber_queue);
    tokio::spawn(distributor.run(shutdown.clone()));

    TestStack {
        state: AppState::new(handle, distributor_handle, config),
        shutdown,
    }
}
