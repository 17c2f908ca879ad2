//! Boundary between the client core and whatever carries frames to the host.

use crate::serialization::InboundMessage;

/// Receives state changes reported by a [`Transport`].
pub trait ConnectionListener {
    fn on_connect(&mut self);
    fn on_disconnect(&mut self, code: i32, message: &str);
}

/// One connection to the host process.
///
/// Every call that can change the connection state takes the listener that
/// should hear about it; a transport never stores callbacks of its own.
pub trait Transport: Send {
    /// Advances connection setup. Success is reported later through
    /// `is_open` and `on_connect`, failure through `on_disconnect` (or
    /// silently when nothing was established yet).
    fn open(&mut self, listener: &mut dyn ConnectionListener);

    fn is_open(&self) -> bool;

    /// Next complete inbound message, or `None` when nothing complete is
    /// buffered right now.
    fn read(&mut self, listener: &mut dyn ConnectionListener) -> Option<InboundMessage>;

    /// Sends one already-encoded message.
    fn write(&mut self, frame: &[u8], listener: &mut dyn ConnectionListener);

    fn close(&mut self, listener: &mut dyn ConnectionListener);
}

/// Listener that discards everything, for teardown paths.
pub(crate) struct Silent;

impl ConnectionListener for Silent {
    fn on_connect(&mut self) {}
    fn on_disconnect(&mut self, _code: i32, _message: &str) {}
}
