//! Server Lifecycle
//!
//! Wires the engine, dispatcher, and RPC layer together, binds the
//! ephemeral loopback port, and handles shutdown signals.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::ServerOptions;
use crate::engine::{DuckDbConfig, DuckDbEngineFactory, EngineFactory};

use super::handler::{Dispatcher, ServerState};
use super::ws::RpcServer;

/// How long servers get to drain before being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Handle for stopping a running server from another task.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown_tx: broadcast::Sender<()>,
}

impl ServerHandle {
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// A fully-initialized server, ready to serve once [`run`](Self::run)
/// is called.
pub struct Server {
    state: Arc<ServerState>,
    dispatcher: Dispatcher,
    listener: TcpListener,
    port: u16,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Start with the production DuckDB engine.
    pub async fn start(options: ServerOptions) -> Result<Self> {
        let factory = Arc::new(DuckDbEngineFactory::new(DuckDbConfig {
            storage_dir: options.global_storage_path.clone(),
            gdx_extension_path: options.gdx_extension_path.clone(),
        }));
        Self::start_with_factory(options, factory).await
    }

    /// Start against any engine factory. The test suite drives the full
    /// server through this with a scripted engine.
    pub async fn start_with_factory(
        options: ServerOptions,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self> {
        info!("Starting GDX query server");

        // Engine initialization does blocking I/O (database file,
        // extension loading); keep it off the runtime threads.
        let state = tokio::task::spawn_blocking(move || ServerState::new(factory, &options))
            .await
            .context("Engine initialization task panicked")?
            .context("Failed to initialize engine")?;

        let dispatcher = Dispatcher::start(state.clone());

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("Failed to bind loopback listener")?;
        let port = listener.local_addr()?.port();
        let (shutdown_tx, _) = broadcast::channel(16);

        info!("Server initialized on port {}", port);
        Ok(Self {
            state,
            dispatcher,
            listener,
            port,
            shutdown_tx,
        })
    }

    /// Port of the bound loopback listener.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Report readiness to the parent process: exactly one JSON line on
    /// stdout, which carries nothing else.
    pub fn report_ready(&self) {
        println!("{}", serde_json::json!({"type": "ready", "port": self.port}));
    }

    /// Serve until a shutdown signal arrives, then tear down: cancel
    /// active materializations, dispose the engine (removing its
    /// database files), and delete staged remote sources.
    pub async fn run(self) -> Result<()> {
        let rpc = RpcServer::new(self.dispatcher.clone(), self.state.clone());
        let rpc_shutdown = self.shutdown_tx.subscribe();
        let rpc_task = tokio::spawn(async move {
            if let Err(e) = rpc.run(self.listener, rpc_shutdown).await {
                warn!("RPC server failed: {}", e);
            }
        });

        // Periodic resource snapshot, so long sessions leave a trace.
        let metrics = self.state.metrics.clone();
        let mut metrics_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tracing::debug!(snapshot = ?metrics.snapshot(), "Server metrics");
                    }
                    _ = metrics_shutdown.recv() => break,
                }
            }
        });

        let mut internal_shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = wait_for_sigterm() => {
                info!("Received SIGTERM, shutting down");
            }
            _ = internal_shutdown.recv() => {
                info!("Shutdown requested");
            }
        }
        let _ = self.shutdown_tx.send(());

        let abort = rpc_task.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, rpc_task).await.is_err() {
            warn!("RPC server did not stop within {:?}, aborting", SHUTDOWN_GRACE);
            abort.abort();
        }

        self.state.shutdown().await;
        info!("Server shutdown complete");
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}. Falling back to pending future.", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
