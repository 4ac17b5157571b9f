//! HTTP server implementation.
//!
//! [`PipelineServer`] provisions the chain from a configuration file and
//! serves it until shutdown.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;

use wasmpipe_common::{ConfigError, ConfigFile, ProvisionError};

use crate::provision::provision;
use crate::router::build_router;
use crate::state::AppState;

/// Resolved server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
}

/// The wasmpipe HTTP server.
///
/// # Example
///
/// ```ignore
/// use wasmpipe_common::ConfigFile;
/// use wasmpipe_server::PipelineServer;
///
/// let config = ConfigFile::from_file("wasmpipe.toml")?;
/// let server = PipelineServer::new(&config)?;
/// server.run().await?;
/// ```
pub struct PipelineServer {
    state: AppState,
    config: ServerConfig,
}

impl PipelineServer {
    /// Provision the pipeline and prepare the server.
    ///
    /// # Errors
    ///
    /// Returns an error if any stage fails to provision or the bind
    /// address is invalid.
    pub fn new(config: &ConfigFile) -> Result<Self, ProvisionError> {
        let state = provision(config)?;

        let bind_addr: SocketAddr = config.server.bind_addr.parse().map_err(|_| {
            ProvisionError::Config(ConfigError::InvalidValue {
                key: "server.bind_addr".to_string(),
                reason: format!("'{}' is not a socket address", config.server.bind_addr),
            })
        })?;

        Ok(Self {
            state,
            config: ServerConfig {
                bind_addr,
                graceful_shutdown: config.server.graceful_shutdown,
            },
        })
    }

    /// Application state, for introspection.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the server until shutdown.
    ///
    /// Blocks until the server is shut down via signal (SIGTERM/SIGINT)
    /// when graceful shutdown is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self) -> Result<(), ProvisionError> {
        let epoch_ticker = self.state.spawn_epoch_ticker();
        let app = build_router(self.state);

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| {
                ProvisionError::engine(format!("failed to bind {}: {e}", self.config.bind_addr))
            })?;

        info!(addr = %self.config.bind_addr, "Starting HTTP server");

        let served = if self.config.graceful_shutdown {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
        } else {
            axum::serve(listener, app).await
        };
        served.map_err(|e| ProvisionError::engine(format!("server error: {e}")))?;

        if let Some(ticker) = epoch_ticker {
            ticker.abort();
        }

        info!("Server shutdown complete");
        Ok(())
    }

    /// Start the server on an ephemeral port and return a test handle.
    ///
    /// # Errors
    ///
    /// Returns an error if provisioning or binding fails.
    pub async fn start_test(config: &ConfigFile) -> Result<TestHandle, ProvisionError> {
        let state = provision(config)?;
        let epoch_ticker = state.spawn_epoch_ticker();
        let app = build_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| ProvisionError::engine(format!("failed to bind test listener: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ProvisionError::engine(format!("failed to get local addr: {e}")))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
            epoch_ticker,
        })
    }
}

/// Handle for a test server instance.
pub struct TestHandle {
    addr: SocketAddr,
    state: AppState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
    epoch_ticker: Option<tokio::task::JoinHandle<()>>,
}

impl TestHandle {
    /// The address the server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// The application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shut down the server gracefully.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
        if let Some(ticker) = self.epoch_ticker {
            ticker.abort();
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
