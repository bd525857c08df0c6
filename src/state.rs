//! Connection lifecycle states shared by the client and server roles.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of one connection. The channel for a connection exists
/// only while the state is `Connecting`, `Connected`, or
/// `Disconnecting`; `Disconnected` is the terminal (and initial) state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

const DISCONNECTED: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;
const DISCONNECTING: u8 = 3;

/// Atomic state holder with compare-and-swap transitions.
///
/// `begin_disconnect` doubles as the exactly-once teardown guard: of
/// all the paths racing to tear a connection down (local disconnect,
/// remote notice, transport failure), only the one that wins the swap
/// runs the teardown and fires the disconnected callback.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(DISCONNECTED))
    }

    /// A cell born connected, for accepted sockets.
    pub(crate) fn connected() -> Self {
        Self(AtomicU8::new(CONNECTED))
    }

    pub(crate) fn current(&self) -> ConnectionState {
        match self.0.load(Ordering::SeqCst) {
            CONNECTING => ConnectionState::Connecting,
            CONNECTED => ConnectionState::Connected,
            DISCONNECTING => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.0.load(Ordering::SeqCst) == CONNECTED
    }

    /// `Disconnected -> Connecting`; false if a connection already
    /// exists in any form.
    pub(crate) fn begin_connect(&self) -> bool {
        self.0
            .compare_exchange(DISCONNECTED, CONNECTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// `Connecting -> Connected`; false if a disconnect won the race
    /// while the attempt was in flight, in which case the cell stays
    /// where the teardown left it.
    pub(crate) fn mark_connected(&self) -> bool {
        self.0
            .compare_exchange(CONNECTING, CONNECTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Back to `Disconnected` after a failed connect attempt.
    pub(crate) fn reset(&self) {
        self.0.store(DISCONNECTED, Ordering::SeqCst);
    }

    /// `Connected|Connecting -> Disconnecting`; false if teardown is
    /// already under way or done.
    pub(crate) fn begin_disconnect(&self) -> bool {
        self.0
            .compare_exchange(CONNECTED, DISCONNECTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            || self
                .0
                .compare_exchange(CONNECTING, DISCONNECTING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// `Disconnecting -> Disconnected`.
    pub(crate) fn finish_disconnect(&self) {
        self.0.store(DISCONNECTED, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle() {
        let cell = StateCell::new();
        assert_eq!(cell.current(), ConnectionState::Disconnected);

        assert!(cell.begin_connect());
        assert_eq!(cell.current(), ConnectionState::Connecting);

        assert!(cell.mark_connected());
        assert!(cell.is_connected());

        assert!(cell.begin_disconnect());
        assert_eq!(cell.current(), ConnectionState::Disconnecting);

        cell.finish_disconnect();
        assert_eq!(cell.current(), ConnectionState::Disconnected);

        // Reusable for a later connect.
        assert!(cell.begin_connect());
    }

    #[test]
    fn connect_is_exclusive() {
        let cell = StateCell::new();
        assert!(cell.begin_connect());
        assert!(!cell.begin_connect());

        assert!(cell.mark_connected());
        assert!(!cell.begin_connect());
    }

    #[test]
    fn completed_disconnect_blocks_a_late_mark_connected() {
        let cell = StateCell::new();
        assert!(cell.begin_connect());
        assert!(cell.begin_disconnect());
        cell.finish_disconnect();

        assert!(!cell.mark_connected());
        assert_eq!(cell.current(), ConnectionState::Disconnected);
    }

    #[test]
    fn disconnect_happens_once() {
        let cell = StateCell::connected();
        assert!(cell.begin_disconnect());
        assert!(!cell.begin_disconnect());

        cell.finish_disconnect();
        assert!(!cell.begin_disconnect());
    }

    #[test]
    fn disconnect_interrupts_connecting() {
        let cell = StateCell::new();
        assert!(cell.begin_connect());
        assert!(cell.begin_disconnect());
    }

    #[test]
    fn reset_after_failed_connect() {
        let cell = StateCell::new();
        assert!(cell.begin_connect());
        cell.reset();
        assert_eq!(cell.current(), ConnectionState::Disconnected);
        assert!(cell.begin_connect());
    }
}
