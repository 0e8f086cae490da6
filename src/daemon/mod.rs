//! The daemon: socket server, sweeper and relay bridge around one [`Bus`].
//!
//! [`Daemon::start`] spawns every task and returns a [`DaemonHandle`];
//! [`DaemonHandle::stop`] signals them and waits for them to finish.

mod client;
mod protocol;
mod server;
mod sweeper;

pub use client::Client;
pub use protocol::{encode, parse_request, ProtocolError, Request, Response, MAX_LINE_BYTES};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::Bus;
use crate::config::DaemonConfig;
use crate::error::BusError;
use crate::relay::{RelayBridge, RelayError, RelayTransport, TcpTransport};
use server::ServerState;
use sweeper::{run_sweeper, SweepSettings};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Another daemon is listening on {0}")]
    SocketInUse(PathBuf),
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Relay setup failed: {0}")]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

pub struct Daemon;

impl Daemon {
    /// Start with the relay configured in `config` (TCP broker), if any.
    pub async fn start(bus: Arc<Bus>, config: &DaemonConfig) -> Result<DaemonHandle, DaemonError> {
        let transport: Option<Arc<dyn RelayTransport>> = match (&config.relay.url, config.relay.is_active()) {
            (Some(url), true) => {
                let client_id = format!("agentbusd-{}", std::process::id());
                Some(Arc::new(TcpTransport::new(url, client_id)?))
            }
            _ => None,
        };
        Self::start_with_relay(bus, config, transport).await
    }

    /// Start with an explicit relay transport (`None` disables the relay).
    pub async fn start_with_relay(
        bus: Arc<Bus>,
        config: &DaemonConfig,
        transport: Option<Arc<dyn RelayTransport>>,
    ) -> Result<DaemonHandle, DaemonError> {
        let listener = bind_socket(&config.socket_path).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(ServerState::new(
            bus.clone(),
            config.idle_after(),
            shutdown_tx.clone(),
        ));

        let mut tasks = vec![
            tokio::spawn(server::serve(listener, state.clone(), shutdown_rx.clone())),
            tokio::spawn(run_sweeper(
                bus.clone(),
                state,
                SweepSettings {
                    interval: config.sweep_interval(),
                    idle_after: config.idle_after(),
                    archive_after: config.archive_after(),
                },
                shutdown_rx.clone(),
            )),
        ];

        match transport {
            Some(transport) => {
                let bridge = Arc::new(RelayBridge::new(
                    bus.store().clone(),
                    bus.registry().clone(),
                    bus.subscriptions().clone(),
                    transport,
                    &config.relay,
                )?);
                bus.attach_relay(bridge.clone());
                tasks.push(tokio::spawn(bridge.run(shutdown_rx)));
            }
            None => tracing::debug!("Relay disabled"),
        }

        tracing::info!(socket = %config.socket_path.display(), "Daemon started");
        Ok(DaemonHandle {
            shutdown: shutdown_tx,
            tasks,
            socket_path: config.socket_path.clone(),
            bus,
        })
    }
}

pub struct DaemonHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    socket_path: PathBuf,
    bus: Arc<Bus>,
}

impl DaemonHandle {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Resolves once shutdown was requested (by a client or [`Self::stop`]).
    pub async fn stopped(&self) {
        let mut rx = self.shutdown.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop every task and remove the socket.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Daemon task ended abnormally");
            }
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::debug!(error = %e, "Socket already gone");
        }
        tracing::info!("Daemon stopped");
    }
}

/// Bind the socket, clearing a stale file left by a dead daemon.
async fn bind_socket(path: &Path) -> Result<UnixListener, DaemonError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(DaemonError::SocketInUse(path.to_path_buf()));
        }
        tracing::info!(socket = %path.display(), "Removing stale socket");
        std::fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}
