//! HTTP server hosting the data plane and the admin API.

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::state::AppState;
use super::{admin_router, gateway_router};
use crate::error::{GatewayError, Result};

/// Both listeners of one gateway process.
pub struct HttpServer {
    state: AppState,
    gateway: TcpListener,
    admin: TcpListener,
}

impl HttpServer {
    /// Bind the configured gateway and admin addresses.
    pub async fn bind(state: AppState) -> Result<Self> {
        let gateway = TcpListener::bind(state.config.server.gateway_addr).await?;
        let admin = TcpListener::bind(state.config.server.admin_addr).await?;
        Ok(Self {
            state,
            gateway,
            admin,
        })
    }

    pub fn gateway_addr(&self) -> Result<SocketAddr> {
        Ok(self.gateway.local_addr()?)
    }

    pub fn admin_addr(&self) -> Result<SocketAddr> {
        Ok(self.admin.local_addr()?)
    }

    /// Serve until `signal` resolves.
    ///
    /// Shutdown cancels every queued request first, then lets in-flight
    /// requests finish on both listeners.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let gateway_addr = self.gateway_addr()?;
        let admin_addr = self.admin_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let queue = self.state.limiter.queue().clone();
        tokio::spawn(async move {
            signal.await;
            info!("Shutdown requested, cancelling queued requests");
            queue.close();
            shutdown_tx.send_replace(true);
        });

        let sweep_interval = Duration::from_secs(self.state.config.rate_limiting.sweep_interval_secs);
        let sweeper = tokio::spawn(sweep_loop(
            self.state.clone(),
            sweep_interval,
            shutdown_rx.clone(),
        ));

        info!(addr = %gateway_addr, "Starting gateway listener");
        let gateway = axum::serve(
            self.gateway,
            gateway_router(self.state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));

        info!(addr = %admin_addr, "Starting admin listener");
        let admin = axum::serve(self.admin, admin_router(self.state).into_make_service())
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx));

        let (gateway, admin) = tokio::join!(gateway.into_future(), admin.into_future());
        if let Err(e) = sweeper.await {
            error!(error = %e, "Sweeper task failed");
        }

        gateway.map_err(|e| {
            error!(error = %e, "Gateway listener failed");
            GatewayError::Io(e)
        })?;
        admin.map_err(|e| {
            error!(error = %e, "Admin listener failed");
            GatewayError::Io(e)
        })?;

        info!("HTTP server stopped");
        Ok(())
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    // A dropped sender also means shutdown
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn sweep_loop(state: AppState, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => state.sweep(),
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }
}
