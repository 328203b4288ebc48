//! API Server
//!
//! Runs the REST server for the volume orchestrator with graceful shutdown.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

use super::rest::RestRouter;
use crate::controlplane::Orchestrator;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// REST API server
pub struct ApiServer {
    config: ApiServerConfig,
    orchestrator: Arc<Orchestrator>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: ApiServerConfig, orchestrator: Arc<Orchestrator>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            orchestrator,
            shutdown_tx,
        }
    }

    /// Run the API server until shutdown
    pub async fn run(&self) -> Result<()> {
        info!("Starting API Server");
        info!("  REST API: {}", self.config.rest_addr);

        let rest_handle = self.spawn_rest_server();

        match rest_handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("REST server task failed: {:?}", e);
                Err(Error::Internal(format!("REST server task failed: {}", e)))
            }
        }
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        serve_rest(listener, self.orchestrator.clone(), self.shutdown_tx.subscribe()).await
    }

    /// Spawn the REST server
    fn spawn_rest_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let addr = self.config.rest_addr;
        let orchestrator = self.orchestrator.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
            serve_rest(listener, orchestrator, shutdown_rx).await
        })
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Run the REST API server
async fn serve_rest(
    listener: TcpListener,
    orchestrator: Arc<Orchestrator>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let app = RestRouter::new(orchestrator).build();

    if let Ok(addr) = listener.local_addr() {
        info!("REST API listening on {}", addr);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("REST server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::metrics::OperatorMetrics;
    use crate::controlplane::OrchestratorConfig;
    use crate::pool::{FcpManager, FcpManagerConfig};
    use crate::store::MemoryStore;
    use crate::testing::{FakeGuest, FakeHardware};

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8090);
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let pool = FcpManager::new(
            FcpManagerConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(FakeHardware::new(String::new())),
        );
        let guest = Arc::new(FakeGuest::with_guests(&[]));
        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                lpar_name: "lpar1".into(),
            },
            pool,
            guest.clone(),
            guest,
            OperatorMetrics::new().unwrap(),
        );
        let server = Arc::new(ApiServer::new(ApiServerConfig::default(), orchestrator));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let body = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");

        server.shutdown();
        handle.await.unwrap().unwrap();
    }
}
