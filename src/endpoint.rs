//! The client role: one outbound connection at a time, reusable across
//! connect/disconnect cycles.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::channel::{drive_receive, Channel, FrameReceiver, LinkEvents, LoopExit, JOIN_WAIT};
use crate::error::NetError;
use crate::message::{Frame, Message};
use crate::state::{ConnectionState, StateCell};

/// Immutable per-endpoint configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Upper bound on a connect attempt. `None` blocks indefinitely.
    pub connect_timeout: Option<Duration>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl EndpointConfig {
    /// Builds a config from a millisecond timeout: zero means no
    /// timeout, negative values are rejected.
    pub fn from_millis(timeout_ms: i64) -> Result<Self, NetError> {
        match timeout_ms {
            ms if ms < 0 => Err(NetError::InvalidConfig(format!(
                "connect timeout must not be negative, got {ms}"
            ))),
            0 => Ok(Self {
                connect_timeout: None,
            }),
            ms => Ok(Self {
                connect_timeout: Some(Duration::from_millis(ms as u64)),
            }),
        }
    }
}

/// Lifecycle and message callbacks for the client role.
///
/// Every method defaults to a no-op; implementors override what they
/// need. Callbacks run on the endpoint's own tasks and must not block;
/// a handler that wants to send from a callback should hold its own
/// handle to the endpoint and spawn.
pub trait EndpointHandler: Send + Sync + 'static {
    fn on_connected(&self, _addr: SocketAddr) {}
    fn on_disconnected(&self) {}
    fn on_failed_to_connect(&self, _addr: SocketAddr, _error: &NetError) {}
    fn on_message(&self, _message: Message) {}
    fn on_error(&self, _error: &NetError) {}
}

/// Orchestrates one outbound connection: connect with a timeout, a
/// dedicated receive loop, and a graceful disconnect handshake.
pub struct Endpoint {
    inner: Arc<Inner>,
}

struct Inner {
    config: EndpointConfig,
    handler: Arc<dyn EndpointHandler>,
    state: StateCell,
    active: Mutex<Option<Active>>,
}

struct Active {
    channel: Arc<Channel>,
    receive_task: Option<JoinHandle<()>>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, handler: impl EndpointHandler) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                handler: Arc::new(handler),
                state: StateCell::new(),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.is_connected()
    }

    /// Connects to `addr`, honoring the configured timeout. A no-op if
    /// already connecting or connected. On success the receive loop is
    /// started and `on_connected` fires; on failure the endpoint resets
    /// to `Disconnected`, `on_failed_to_connect` fires, and the error
    /// is returned. There is no automatic retry, and a failed attempt
    /// leaves no task or socket behind. A disconnect that completes
    /// while the attempt is in flight wins: the late success is
    /// dropped and [`NetError::InvalidState`] is returned.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), NetError> {
        if !self.inner.state.begin_connect() {
            return Ok(());
        }

        let stream = match self.attempt(addr).await {
            Ok(stream) => stream,
            Err(error) => {
                self.inner.state.reset();
                warn!(%addr, %error, "connect failed");
                self.inner.handler.on_failed_to_connect(addr, &error);
                return Err(error);
            }
        };

        let receiver = {
            let mut active = self.inner.active.lock().await;
            // A disconnect issued while the attempt was in flight has
            // already completed its teardown; honor it by dropping the
            // fresh stream instead of resurrecting the connection.
            if !self.inner.state.mark_connected() {
                debug!(%addr, "connect abandoned, endpoint was disconnected during the attempt");
                return Err(NetError::InvalidState(
                    "endpoint was disconnected during connect",
                ));
            }
            let (channel, receiver) = Channel::pair(stream);
            *active = Some(Active {
                channel: Arc::new(channel),
                receive_task: None,
            });
            receiver
        };

        let task = tokio::spawn(receive_loop(Arc::clone(&self.inner), receiver));
        if let Some(active) = self.inner.active.lock().await.as_mut() {
            active.receive_task = Some(task);
        }

        debug!(%addr, "connected");
        self.inner.handler.on_connected(addr);
        Ok(())
    }

    async fn attempt(&self, addr: SocketAddr) -> Result<TcpStream, NetError> {
        let connect = TcpStream::connect(addr);
        match self.inner.config.connect_timeout {
            Some(limit) => match timeout(limit, connect).await {
                Ok(result) => result.map_err(|source| NetError::Connect { addr, source }),
                Err(_) => Err(NetError::ConnectTimeout {
                    addr,
                    timeout: limit,
                }),
            },
            None => connect.await.map_err(|source| NetError::Connect { addr, source }),
        }
    }

    /// Tears the connection down. With `notify_peer` a disconnect frame
    /// is sent first (best effort, a failure to deliver it is ignored)
    /// so the remote side can distinguish a graceful departure from a
    /// dropped socket. A no-op if already disconnected. Fires
    /// `on_disconnected` exactly once per connection.
    pub async fn disconnect(&self, notify_peer: bool) {
        self.inner.teardown(notify_peer, true).await;
    }

    /// Sends one application message. Fails with
    /// [`NetError::InvalidState`] unless connected.
    pub async fn send(&self, message: &Message) -> Result<(), NetError> {
        let channel = {
            let active = self.inner.active.lock().await;
            match active.as_ref() {
                Some(active) if self.inner.state.is_connected() => Arc::clone(&active.channel),
                _ => return Err(NetError::InvalidState("endpoint is not connected")),
            }
        };
        channel.send(&Frame::Message(message.clone())).await
    }
}

impl Inner {
    /// The single teardown path. `begin_disconnect` makes it run at
    /// most once per connection regardless of who initiates it; losers
    /// of that race return immediately. `join_loop` is false when the
    /// caller is the receive loop itself.
    async fn teardown(&self, notify_peer: bool, join_loop: bool) {
        if !self.state.begin_disconnect() {
            return;
        }

        let active = self.active.lock().await.take();
        if let Some(active) = active {
            if notify_peer {
                if let Err(error) = active.channel.send(&Frame::Disconnect).await {
                    debug!(%error, "disconnect notice not delivered");
                }
            }
            active.channel.close().await;
            if join_loop {
                if let Some(task) = active.receive_task {
                    if timeout(JOIN_WAIT, task).await.is_err() {
                        warn!("receive loop did not stop within {JOIN_WAIT:?}");
                    }
                }
            }
        }

        self.state.finish_disconnect();
        debug!("disconnected");
        self.handler.on_disconnected();
    }
}

impl LinkEvents for Inner {
    fn deliver(&self, message: Message) {
        self.handler.on_message(message);
    }

    fn decode_failed(&self, error: NetError) {
        warn!(%error, "discarding undecodable frame");
        self.handler.on_error(&error);
    }
}

async fn receive_loop(inner: Arc<Inner>, receiver: FrameReceiver) {
    match drive_receive(receiver, &*inner).await {
        LoopExit::RemoteDisconnect => {
            debug!("peer requested disconnect");
            inner.teardown(false, false).await;
        }
        LoopExit::Closed => {
            inner.teardown(false, false).await;
        }
        LoopExit::Transport(error) => {
            warn!(%error, "receive loop transport failure");
            inner.handler.on_error(&error);
            inner.teardown(false, false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_timeout_is_rejected() {
        let result = EndpointConfig::from_millis(-1);
        assert!(matches!(result, Err(NetError::InvalidConfig(_))));
    }

    #[test]
    fn zero_timeout_means_no_timeout() {
        let config = EndpointConfig::from_millis(0).expect("config");
        assert!(config.connect_timeout.is_none());
    }

    #[test]
    fn positive_timeout_is_kept() {
        let config = EndpointConfig::from_millis(250).expect("config");
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn default_matches_the_classic_five_seconds() {
        let config = EndpointConfig::default();
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(5)));
    }
}
