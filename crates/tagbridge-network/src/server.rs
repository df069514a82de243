use crate::error::{Result, ServerError};
use crate::routes::{self, AppState};
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// HTTP control API and WebSocket event channel on one listener.
pub struct ControlServer {
    listener: TcpListener,
    router: Router,
    local_addr: SocketAddr,
}

impl ControlServer {
    /// Bind the configured address.
    ///
    /// # Errors
    ///
    /// Returns `BindFailed` if the address is in use or not local.
    pub async fn bind(state: AppState) -> Result<Self> {
        let addr = state.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::BindFailed { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Control server bound");

        Ok(Self {
            listener,
            router: routes::router(state),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` fires. Upgraded event channels outlive the
    /// listener and close once the distributor stops.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        info!(addr = %self.local_addr, "Control server stopped");
        Ok(())
    }
}
