//! Application callbacks

use radionet_wire::Message;

/// Receives what the engine delivers to the application
pub trait MessageHandler: Send {
    /// A message addressed to this node
    fn on_message(&mut self, msg: &Message);

    /// Controller time, seconds since the epoch
    fn on_time(&mut self, _seconds: u32) {}
}

impl<F> MessageHandler for F
where
    F: FnMut(&Message) + Send,
{
    fn on_message(&mut self, msg: &Message) {
        self(msg)
    }
}

/// Handler that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl MessageHandler for NoopHandler {
    fn on_message(&mut self, _msg: &Message) {}
}
