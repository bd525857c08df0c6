//! The server role: a listener, an accept loop, and the registry of
//! connected peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::JOIN_WAIT;
use crate::error::NetError;
use crate::message::Message;
use crate::peer::Peer;

/// Lifecycle and message callbacks for the server role.
///
/// Every method defaults to a no-op. Callbacks run on the server's own
/// tasks and must not block; a handler that wants to reply from
/// `on_message` should hold the peer handle and spawn, or bridge the
/// message out through a channel.
pub trait ServerHandler: Send + Sync + 'static {
    fn on_server_started(&self, _addr: SocketAddr) {}
    fn on_server_stopped(&self, _addr: SocketAddr) {}
    fn on_server_failed_to_start(&self, _addr: SocketAddr, _error: &NetError) {}
    fn on_client_connected(&self, _peer: &Arc<Peer>) {}
    fn on_client_disconnected(&self, _peer: &Arc<Peer>) {}
    fn on_message(&self, _message: Message, _from: &Arc<Peer>) {}
    fn on_error(&self, _error: &NetError) {}
}

/// State shared between the server handle, its accept loop, and its
/// peers.
pub(crate) struct ServerShared {
    pub(crate) handler: Arc<dyn ServerHandler>,
    pub(crate) registry: Registry,
    running: AtomicBool,
}

/// Live mapping of connection id to peer. Inserted by the accept loop,
/// removed by each peer's own teardown, read by any task broadcasting,
/// so every access goes through the lock.
pub(crate) struct Registry {
    peers: Mutex<HashMap<u64, Arc<Peer>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn insert(&self, peer: Arc<Peer>) {
        self.peers.lock().await.insert(peer.id(), peer);
    }

    pub(crate) async fn remove(&self, id: u64) -> Option<Arc<Peer>> {
        self.peers.lock().await.remove(&id)
    }

    async fn clear(&self) {
        self.peers.lock().await.clear();
    }

    async fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().await.values().cloned().collect()
    }

    async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }
}

struct Listening {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// Accepts connections and exchanges messages with every connected
/// peer. Inbound messages arrive at the handler together with the
/// originating [`Peer`].
pub struct Server {
    shared: Arc<ServerShared>,
    listening: Mutex<Option<Listening>>,
}

impl Server {
    pub fn new(handler: impl ServerHandler) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                handler: Arc::new(handler),
                registry: Registry::new(),
                running: AtomicBool::new(false),
            }),
            listening: Mutex::new(None),
        }
    }

    /// Binds `addr` (port 0 picks an ephemeral port) and starts the
    /// accept loop, returning the bound address. A no-op returning the
    /// existing address if already running. On bind failure
    /// `on_server_failed_to_start` fires and no partial state remains:
    /// no task, no socket, not running.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr, NetError> {
        let mut listening = self.listening.lock().await;
        if let Some(active) = listening.as_ref() {
            return Ok(active.local_addr);
        }

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let error = NetError::Bind { addr, source };
                warn!(%addr, %error, "server failed to start");
                self.shared.handler.on_server_failed_to_start(addr, &error);
                return Err(error);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(source) => {
                let error = NetError::Bind { addr, source };
                self.shared.handler.on_server_failed_to_start(addr, &error);
                return Err(error);
            }
        };

        self.shared.registry.clear().await;
        let (shutdown, shutdown_rx) = watch::channel(false);
        self.shared.running.store(true, Ordering::SeqCst);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            shutdown_rx,
            Arc::clone(&self.shared),
        ));
        *listening = Some(Listening {
            local_addr,
            shutdown,
            accept_task,
        });

        info!(%local_addr, "server started");
        self.shared.handler.on_server_started(local_addr);
        Ok(local_addr)
    }

    /// Stops the server: unblocks and joins the accept loop (bounded
    /// wait), disconnects every registered peer with a disconnect
    /// notice, and clears the registry. A no-op if not running.
    pub async fn stop(&self) {
        let listening = self.listening.lock().await.take();
        let Some(listening) = listening else {
            return;
        };

        self.shared.running.store(false, Ordering::SeqCst);
        listening.shutdown.send_replace(true);

        // Join the accept loop before sweeping the registry, so a
        // connection accepted just as the signal flipped is already
        // registered and gets disconnected with everyone else.
        if timeout(JOIN_WAIT, listening.accept_task).await.is_err() {
            warn!("accept loop did not stop within {JOIN_WAIT:?}");
        }

        for peer in self.shared.registry.snapshot().await {
            peer.disconnect(true).await;
        }
        self.shared.registry.clear().await;

        info!(addr = %listening.local_addr, "server stopped");
        self.shared.handler.on_server_stopped(listening.local_addr);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listening
            .lock()
            .await
            .as_ref()
            .map(|listening| listening.local_addr)
    }

    /// Number of currently connected peers.
    pub async fn connection_count(&self) -> usize {
        self.shared.registry.len().await
    }

    /// Snapshot of the currently connected peers.
    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.shared.registry.snapshot().await
    }

    /// Broadcasts to every registered peer. Fail-fast: delivery stops
    /// at the first peer that errors (for instance one caught mid
    /// disconnect), so a returned error means at-least-partial
    /// delivery, not none and not all.
    pub async fn send_to_all(&self, message: &Message) -> Result<(), NetError> {
        for peer in self.shared.registry.snapshot().await {
            peer.send(message).await?;
        }
        Ok(())
    }

    /// Sends to one peer; [`NetError::InvalidState`] if it is no longer
    /// connected.
    pub async fn send_to(&self, message: &Message, peer: &Peer) -> Result<(), NetError> {
        peer.send(message).await
    }

    /// Sends to exactly the currently registered peers matching the
    /// predicate, in the same fail-fast manner as [`Server::send_to_all`].
    pub async fn send_where<F>(&self, message: &Message, mut predicate: F) -> Result<(), NetError>
    where
        F: FnMut(&Peer) -> bool,
    {
        for peer in self.shared.registry.snapshot().await {
            if predicate(&peer) {
                peer.send(message).await?;
            }
        }
        Ok(())
    }
}

/// Accepts until the shutdown signal flips. Accept errors are
/// transient: they are reported and the loop keeps listening, because
/// the only way to stop accepting is to close the listener.
async fn accept_loop(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    shared: Arc<ServerShared>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                let _ = changed;
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "accepted connection");
                    Peer::spawn(stream, addr, &shared).await;
                }
                Err(source) => {
                    let error = NetError::Transport(source);
                    warn!(%error, "failed to accept connection");
                    shared.handler.on_error(&error);
                }
            }
        }
    }
    // Dropping the listener here closes the listening socket.
}
