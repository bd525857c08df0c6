//! One owned socket with an exclusive-send, single-reader contract.
//!
//! A [`Channel`] holds the write half of a stream behind a lock, so any
//! number of callers (application sends plus the disconnect handshake)
//! can race on `send` and frames never interleave. The read half lives
//! in the [`FrameReceiver`], which is owned by exactly one receive
//! loop, so reads need no lock. Closing the channel is idempotent and
//! unblocks a pending receive.

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::error::NetError;
use crate::message::{read_frame, write_frame, Frame, Message};

use std::time::Duration;

/// Bounded wait for an owning loop task during teardown. Exceeding it
/// is logged and tolerated, never fatal.
pub(crate) const JOIN_WAIT: Duration = Duration::from_millis(100);

/// The send half of an established connection.
pub(crate) struct Channel {
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

impl Channel {
    /// Splits a stream into the shared send half and the single-reader
    /// receive half.
    pub(crate) fn pair(stream: TcpStream) -> (Channel, FrameReceiver) {
        let (read, write) = stream.into_split();
        let (closed, closed_rx) = watch::channel(false);
        (
            Channel {
                writer: Mutex::new(write),
                closed,
            },
            FrameReceiver {
                reader: BufReader::new(read),
                closed: closed_rx,
            },
        )
    }

    /// Writes one full frame and flushes before returning. Concurrent
    /// senders serialize on the writer lock.
    pub(crate) async fn send(&self, frame: &Frame) -> Result<(), NetError> {
        if *self.closed.borrow() {
            return Err(NetError::Closed);
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame).await
    }

    /// Closes the channel. Idempotent: the first call flips the close
    /// signal (unblocking a pending `recv`) and shuts the write half
    /// down; later calls do nothing.
    pub(crate) async fn close(&self) {
        let was_closed = self.closed.send_replace(true);
        if was_closed {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(error) = writer.shutdown().await {
            debug!(?error, "writer shutdown failed");
        }
    }
}

/// The receive half. Only the connection's receive loop holds it.
pub(crate) struct FrameReceiver {
    reader: BufReader<OwnedReadHalf>,
    closed: watch::Receiver<bool>,
}

impl FrameReceiver {
    /// Blocks until one full frame arrives. `Ok(None)` means the stream
    /// hit EOF or the channel was closed locally.
    pub(crate) async fn recv(&mut self) -> Result<Option<Frame>, NetError> {
        if *self.closed.borrow_and_update() {
            return Ok(None);
        }
        tokio::select! {
            changed = self.closed.changed() => {
                let _ = changed;
                Ok(None)
            }
            frame = read_frame(&mut self.reader) => frame,
        }
    }
}

/// How a receive loop ended.
pub(crate) enum LoopExit {
    /// The peer sent the disconnect frame; tear down without echoing
    /// another notice.
    RemoteDisconnect,
    /// EOF or local close.
    Closed,
    /// Unrecoverable read failure.
    Transport(NetError),
}

/// What a role wrapper plugs into the shared receive loop.
pub(crate) trait LinkEvents {
    fn deliver(&self, message: Message);
    fn decode_failed(&self, error: NetError);
}

/// The receive loop body shared by the client endpoint and the
/// server-side peer. Undecodable frames are reported and skipped; every
/// other outcome ends the loop and the caller runs its teardown.
pub(crate) async fn drive_receive<E: LinkEvents>(mut rx: FrameReceiver, events: &E) -> LoopExit {
    loop {
        match rx.recv().await {
            Ok(Some(Frame::Message(message))) => events.deliver(message),
            Ok(Some(Frame::Disconnect)) => return LoopExit::RemoteDisconnect,
            Ok(None) => return LoopExit::Closed,
            Err(error) if error.is_protocol() => events.decode_failed(error),
            Err(error) => return LoopExit::Transport(error),
        }
    }
}
