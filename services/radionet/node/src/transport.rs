//! Radio transport seam

use radionet_wire::FrameBuf;

/// Which receive pipe a frame arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipe {
    /// Addressed to this node as next hop
    Node,
    /// Sent to the broadcast address
    Broadcast,
}

/// A packet radio
///
/// Frames are at most 32 bytes. `send` reports whether the frame left the
/// radio and, for unicast, whether the next hop acknowledged it at the link
/// layer. Broadcasts are never acknowledged.
pub trait Transport: Send {
    /// Listen on `address` plus the broadcast pipe
    fn set_address(&mut self, address: u8);

    /// Transmit `frame` to `next_hop`
    fn send(&mut self, next_hop: u8, frame: &[u8], broadcast: bool) -> bool;

    /// Next waiting frame, if any. Never blocks.
    fn receive(&mut self) -> Option<(Pipe, FrameBuf)>;

    /// Enter low-power mode
    fn power_down(&mut self) {}

    /// Leave low-power mode
    fn power_up(&mut self) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn set_address(&mut self, address: u8) {
        (**self).set_address(address)
    }

    fn send(&mut self, next_hop: u8, frame: &[u8], broadcast: bool) -> bool {
        (**self).send(next_hop, frame, broadcast)
    }

    fn receive(&mut self) -> Option<(Pipe, FrameBuf)> {
        (**self).receive()
    }

    fn power_down(&mut self) {
        (**self).power_down()
    }

    fn power_up(&mut self) {
        (**self).power_up()
    }
}
