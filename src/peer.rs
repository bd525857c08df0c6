//! The server-side representation of one accepted connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::channel::{drive_receive, Channel, FrameReceiver, LinkEvents, LoopExit, JOIN_WAIT};
use crate::error::NetError;
use crate::message::{Frame, Message};
use crate::server::ServerShared;
use crate::state::{ConnectionState, StateCell};

/// One accepted connection. A peer registers itself in the server's
/// registry on creation and deregisters during teardown, so it appears
/// in the registry exactly while it is connected. Single-use: a peer
/// never reconnects.
pub struct Peer {
    id: u64,
    addr: SocketAddr,
    channel: Arc<Channel>,
    state: StateCell,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    server: Weak<ServerShared>,
}

impl Peer {
    /// Wraps an accepted socket: registers the peer, fires
    /// `on_client_connected`, and starts its receive loop.
    pub(crate) async fn spawn(
        stream: TcpStream,
        addr: SocketAddr,
        server: &Arc<ServerShared>,
    ) -> Arc<Peer> {
        let (channel, receiver) = Channel::pair(stream);
        let peer = Arc::new(Peer {
            id: server.registry.next_id(),
            addr,
            channel: Arc::new(channel),
            state: StateCell::connected(),
            receive_task: Mutex::new(None),
            server: Arc::downgrade(server),
        });

        server.registry.insert(Arc::clone(&peer)).await;
        server.handler.on_client_connected(&peer);

        let task = tokio::spawn(receive_loop(Arc::clone(&peer), receiver));
        *peer.receive_task.lock().await = Some(task);
        peer
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Sends one message to this peer. Fails with
    /// [`NetError::InvalidState`] if the peer is no longer connected,
    /// which guards callers holding a stale handle against racing
    /// disconnects.
    pub async fn send(&self, message: &Message) -> Result<(), NetError> {
        if !self.state.is_connected() {
            return Err(NetError::InvalidState("peer is not connected"));
        }
        self.channel.send(&Frame::Message(message.clone())).await
    }

    /// Disconnects this peer. With `notify_peer` the remote endpoint is
    /// told first (this is how a server kicks a client); without it the
    /// socket is simply torn down. A no-op if already disconnected.
    pub async fn disconnect(self: &Arc<Self>, notify_peer: bool) {
        self.teardown(notify_peer, true).await;
    }

    /// Mirror of the endpoint teardown: runs at most once, deregisters
    /// from the server, and fires `on_client_disconnected`.
    async fn teardown(self: &Arc<Self>, notify_peer: bool, join_loop: bool) {
        if !self.state.begin_disconnect() {
            return;
        }

        if notify_peer {
            if let Err(error) = self.channel.send(&Frame::Disconnect).await {
                debug!(peer = self.id, %error, "disconnect notice not delivered");
            }
        }
        self.channel.close().await;

        if join_loop {
            let task = self.receive_task.lock().await.take();
            if let Some(task) = task {
                if timeout(JOIN_WAIT, task).await.is_err() {
                    warn!(peer = self.id, "receive loop did not stop within {JOIN_WAIT:?}");
                }
            }
        }

        self.state.finish_disconnect();
        if let Some(server) = self.server.upgrade() {
            server.registry.remove(self.id).await;
            debug!(peer = self.id, "peer disconnected");
            server.handler.on_client_disconnected(self);
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state.current())
            .finish()
    }
}

struct PeerEvents(Arc<Peer>);

impl LinkEvents for PeerEvents {
    fn deliver(&self, message: Message) {
        if let Some(server) = self.0.server.upgrade() {
            server.handler.on_message(message, &self.0);
        }
    }

    fn decode_failed(&self, error: NetError) {
        warn!(peer = self.0.id, %error, "discarding undecodable frame");
        if let Some(server) = self.0.server.upgrade() {
            server.handler.on_error(&error);
        }
    }
}

async fn receive_loop(peer: Arc<Peer>, receiver: FrameReceiver) {
    let events = PeerEvents(Arc::clone(&peer));
    match drive_receive(receiver, &events).await {
        LoopExit::RemoteDisconnect => {
            debug!(peer = peer.id, "client requested disconnect");
            peer.teardown(false, false).await;
        }
        LoopExit::Closed => {
            peer.teardown(false, false).await;
        }
        LoopExit::Transport(error) => {
            warn!(peer = peer.id, %error, "receive loop transport failure");
            if let Some(server) = peer.server.upgrade() {
                server.handler.on_error(&error);
            }
            peer.teardown(false, false).await;
        }
    }
}
