//! Connection router. Accepts endpoints and controllers and routes
//! commands between them.
//!
//! Every accepted connection gets its own task. The first frame on a
//! connection must be an [`Identity`]; its role selects the endpoint or the
//! controller protocol (see [`session`]). The connection table, the command
//! queue and the identity registry are shared by all tasks, each behind its
//! own lock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, error, info};
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::activity::ActivityLog;
use crate::config::Config;
use crate::module_store::ModuleStore;
use crate::registry::{IdentityRegistry, RegistryError};
use crate::types::{Command, Identity};

pub mod queue;
pub mod session;
pub mod table;

pub use queue::CommandQueue;
pub use table::{ActiveConnection, ConnectionTable, SharedChannel};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Unreadable identity registry could not be set aside: {0}")]
    Registry(#[from] RegistryError),
}

/// State shared by every connection task.
pub(crate) struct Shared {
    pub(crate) connections: Mutex<ConnectionTable>,
    pub(crate) queue: Mutex<CommandQueue>,
    pub(crate) registry: Mutex<IdentityRegistry>,
    pub(crate) activity: ActivityLog,
    pub(crate) modules: ModuleStore,
    pub(crate) relay_idle_timeout: Option<Duration>,
    pub(crate) max_frame_size: u32,
    next_id: AtomicU64,
}

impl Shared {
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop a connection from the table. Its socket closes once the last
    /// task holding the channel lets go.
    pub(crate) async fn drop_connection(&self, id: u64) {
        let removed = self.connections.lock().await.remove(id);
        if let Some(connection) = removed {
            info!(
                "Removed connection {} ({}) from {}",
                connection.identity.name, connection.identity.uuid, connection.remote
            );
        }
    }
}

/// A running router.
pub struct Router {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<TcpListener>,
    sessions: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Router {
    /// Bind the listening socket and start accepting connections.
    ///
    /// Failing to bind stops the router from starting. An unreadable
    /// registry file is moved aside to `<path>.corrupt` and the router
    /// starts with an empty registry; if it cannot be moved, starting fails
    /// rather than letting the first save overwrite it.
    pub async fn start(config: &Config, activity: ActivityLog) -> Result<Self, RouterError> {
        let listener = bind_listener(config.bind_addr, config.backlog)
            .map_err(|source| RouterError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| RouterError::Bind {
            addr: config.bind_addr,
            source,
        })?;

        let registry = match IdentityRegistry::load(&config.registry_path).await {
            Ok(registry) => registry,
            Err(e) => {
                error!("Failed to load identity registry: {}", e);
                IdentityRegistry::quarantine(&config.registry_path).await?;
                IdentityRegistry::new(&config.registry_path)
            }
        };

        let shared = Arc::new(Shared {
            connections: Mutex::new(ConnectionTable::new()),
            queue: Mutex::new(CommandQueue::new()),
            registry: Mutex::new(registry),
            activity,
            modules: ModuleStore::new(&config.module_dir),
            relay_idle_timeout: config.relay_idle_timeout(),
            max_frame_size: config.max_frame_size,
            next_id: AtomicU64::new(1),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sessions = Arc::new(Mutex::new(Vec::new()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            Arc::clone(&sessions),
            shutdown_rx,
        ));

        info!("Router started on {}", local_addr);
        Ok(Self {
            shared,
            local_addr,
            shutdown_tx,
            accept_task,
            sessions,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue a command for delivery on its target's next visit.
    ///
    /// This is the only way to fill the queue: controllers relay live and
    /// never enqueue, and the `tether` binary does not call it. Embedders
    /// that want store-and-forward delivery call it directly.
    pub async fn queue_command(&self, command: Command) {
        info!(
            "Queued {} {} for {}",
            command.kind, command.module_file, command.target
        );
        self.shared.queue.lock().await.push(command);
    }

    /// Commands still waiting for `uuid`.
    pub async fn pending_commands(&self, uuid: &str) -> Vec<Command> {
        self.shared.queue.lock().await.pending_for(uuid)
    }

    /// Identities of the endpoints currently in the connection table.
    ///
    /// Nobody reads an endpoint's socket between relays, so an endpoint
    /// that hung up after its delivery pass is still listed until a relay
    /// to it fails or it reconnects.
    pub async fn active_endpoints(&self) -> Vec<Identity> {
        self.shared.connections.lock().await.endpoints()
    }

    /// Identities currently stored in the registry.
    pub async fn known_identities(&self) -> Vec<Identity> {
        self.shared.registry.lock().await.identities().to_vec()
    }

    /// Stop accepting, close every connection, wait for every connection
    /// task, then close the listening socket.
    pub async fn shutdown(self) {
        info!("Router shutting down");
        let _ = self.shutdown_tx.send(true);

        let listener = match self.accept_task.await {
            Ok(listener) => Some(listener),
            Err(e) => {
                error!("Accept loop ended abnormally: {}", e);
                None
            }
        };

        let connections = self.shared.connections.lock().await.drain();
        debug!("Closing {} connections", connections.len());
        for connection in connections {
            // A channel still locked by a session is closed when that
            // session observes the shutdown signal and drops it.
            if let Ok(mut channel) = connection.channel.try_lock() {
                channel.shutdown().await;
            }
        }

        let handles = std::mem::take(&mut *self.sessions.lock().await);
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Connection task ended abnormally: {}", e);
            }
        }

        drop(listener);
        info!("Shutdown complete.");
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Resolves once the router is shutting down (or has been dropped).
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    sessions: Arc<Mutex<Vec<JoinHandle<()>>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> TcpListener {
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown_rx) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("Accepted connection from {}", addr);
                    let handle = tokio::spawn(handle_connection(
                        stream,
                        addr,
                        Arc::clone(&shared),
                        shutdown_rx.clone(),
                    ));
                    let mut sessions = sessions.lock().await;
                    sessions.retain(|h| !h.is_finished());
                    sessions.push(handle);
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
        }
    }
    listener
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = shutdown_requested(&mut shutdown_rx) => {
            debug!("Connection from {} interrupted by shutdown", addr);
        }
        _ = session::run(stream, addr, &shared) => {}
    }
}
