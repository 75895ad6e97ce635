//! Station-side transport for whole-packet chain I/O

use crate::error::Result;
use crate::packet::Packet;
use std::time::Duration;

mod mock;
mod serial;

pub use mock::MockLink;
pub use serial::SerialLink;

/// Framed, half-duplex link to the head of a chain.
///
/// The chain protocol has no framing bytes: a packet is simply the next
/// `PACKET_SIZE` bytes on the line. A `Link` therefore only deals in
/// whole packets; a receive that cannot complete before its deadline
/// discards the partial bytes and reports [`crate::Error::TimedOut`].
///
/// Links are half-duplex by contract: the owning Reader drives one
/// send/receive exchange to completion before starting the next.
pub trait Link: Send {
    /// Transmit one crafted packet.
    fn send(&mut self, packet: &Packet) -> Result<()>;

    /// Block until a full packet arrives or the deadline elapses.
    ///
    /// On [`crate::Error::TimedOut`] no partial state is retained; the
    /// next call starts from a clean buffer.
    fn receive(&mut self, deadline: Duration) -> Result<Packet>;

    /// Drive the power pin high.
    fn power_on(&mut self) -> Result<()>;

    /// Drive the power pin low.
    fn power_off(&mut self) -> Result<()>;

    /// Power-cycle the chain; the only recovery for a stalled node.
    fn power_cycle(&mut self) -> Result<()>;

    /// Current state of the power pin.
    fn powered(&self) -> bool;

    /// Human-readable port label for event messages.
    fn label(&self) -> &str;
}
