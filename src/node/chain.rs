//! In-process chain simulation
//!
//! Wires N [`Node`]s head-to-tail and exposes the whole chain through
//! the station [`Link`] trait, so Readers run unmodified against
//! simulated hardware. Byte routing mirrors the physical wiring:
//!
//! ```text
//! station ── up ──> node 0 ── down ──> node 1 ── down ──> node 2
//!         <─ up ───        <── up ───         <── up ───
//! ```
//!
//! Upstream output of node `i` feeds the downstream buffer of node
//! `i-1` (or the station inbox for the head); downstream output feeds
//! the upstream buffer of node `i+1` (the tail's falls off the end).

use super::runtime::{Emit, Node};
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::transport::Link;
use std::collections::VecDeque;
use std::time::Duration;

pub struct VirtualChain {
    nodes: Vec<Node>,
    inbox: VecDeque<Packet>,
    powered: bool,
}

impl VirtualChain {
    pub fn new() -> Self {
        VirtualChain {
            nodes: Vec::new(),
            inbox: VecDeque::new(),
            powered: true,
        }
    }

    /// Append a node at the tail of the chain.
    pub fn push_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    /// Direct access for test seeding (SRAM patterns, sensor words).
    pub fn node_mut(&mut self, index: usize) -> &mut Node {
        &mut self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Run every node until the chain goes quiet, routing each emitted
    /// packet one hop. Hop-by-hop forwarding terminates because every
    /// packet either dies at the tail, is answered, or reaches the
    /// station inbox.
    fn pump(&mut self) {
        loop {
            let mut active = false;
            for i in 0..self.nodes.len() {
                for emit in self.nodes[i].poll() {
                    active = true;
                    match emit {
                        Emit::Up(bytes) => {
                            if i == 0 {
                                match Packet::decode(&bytes) {
                                    Ok(packet) => self.inbox.push_back(packet),
                                    Err(e) => {
                                        log::warn!("Dropping malformed chain output: {}", e)
                                    }
                                }
                            } else {
                                self.nodes[i - 1].feed_downstream(&bytes);
                            }
                        }
                        Emit::Down(bytes) => {
                            if i + 1 < self.nodes.len() {
                                self.nodes[i + 1].feed_upstream(&bytes);
                            }
                            // The tail has nothing below; bytes vanish
                            // into the unterminated line.
                        }
                    }
                }
            }
            if !active {
                break;
            }
        }
    }
}

impl Default for VirtualChain {
    fn default() -> Self {
        Self::new()
    }
}

impl Link for VirtualChain {
    fn send(&mut self, packet: &Packet) -> Result<()> {
        let wire = packet.encode()?;
        if !self.powered {
            // Dead line: bytes go nowhere, matching a powered-off hub.
            return Ok(());
        }
        if let Some(head) = self.nodes.first_mut() {
            head.feed_upstream(&wire);
        }
        self.pump();
        Ok(())
    }

    fn receive(&mut self, _deadline: Duration) -> Result<Packet> {
        self.inbox.pop_front().ok_or(Error::TimedOut)
    }

    fn power_on(&mut self) -> Result<()> {
        self.powered = true;
        Ok(())
    }

    fn power_off(&mut self) -> Result<()> {
        self.powered = false;
        self.inbox.clear();
        Ok(())
    }

    fn power_cycle(&mut self) -> Result<()> {
        self.inbox.clear();
        for node in &mut self.nodes {
            node.power_on_reset();
        }
        self.powered = true;
        Ok(())
    }

    fn powered(&self) -> bool {
        self.powered
    }

    fn label(&self) -> &str {
        "virtual-chain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::EchoInterpreter;
    use crate::packet::{Command, BROADCAST_UID, PING_ALL};

    fn chain(uids: &[(&str, u32)]) -> VirtualChain {
        let mut chain = VirtualChain::new();
        for (uid, sram) in uids {
            chain.push_node(Node::new(uid, *sram, Box::new(EchoInterpreter)));
        }
        chain
    }

    fn ping_all() -> Packet {
        let mut pkt = Packet::new();
        pkt.set_command(Command::Ping);
        pkt.set_options(PING_ALL);
        pkt.set_pic(0);
        pkt.set_uid_raw(BROADCAST_UID);
        pkt.finalize();
        pkt
    }

    #[test]
    fn test_single_device_ping() {
        let uid = "A".repeat(25);
        let mut chain = chain(&[(&uid, 16384)]);

        chain.send(&ping_all()).unwrap();

        let ack = chain.receive(Duration::from_millis(10)).unwrap();
        assert_eq!(ack.command(), Some(Command::Ack));
        assert_eq!(ack.uid(), uid);
        assert_eq!(ack.pic(), 1);
        assert_eq!(ack.options(), 16384);
        assert!(ack.checksum_valid());

        assert!(matches!(
            chain.receive(Duration::from_millis(10)),
            Err(Error::TimedOut)
        ));
    }

    #[test]
    fn test_three_device_ping_orders_by_position() {
        let mut chain = chain(&[("X", 4096), ("Y", 4096), ("Z", 4096)]);
        chain.send(&ping_all()).unwrap();

        let expected = [("X", 1u8), ("Y", 2), ("Z", 3)];
        for (uid, pic) in expected {
            let ack = chain.receive(Duration::from_millis(10)).unwrap();
            assert_eq!(ack.command(), Some(Command::Ack));
            assert_eq!(ack.uid(), uid);
            assert_eq!(ack.pic(), pic);
        }
    }

    #[test]
    fn test_read_addressed_to_middle_node() {
        let mut chain = chain(&[("X", 4096), ("Y", 4096), ("Z", 4096)]);
        chain.node_mut(1).sram_mut().fill_block(3, 0x42);

        let mut pkt = Packet::new();
        pkt.set_command(Command::Read);
        pkt.set_uid("Y");
        pkt.set_options(3);
        pkt.finalize();
        chain.send(&pkt).unwrap();

        let reply = chain.receive(Duration::from_millis(10)).unwrap();
        assert_eq!(reply.command(), Some(Command::Ack));
        assert_eq!(reply.uid(), "Y");
        // pic counts the hops the request took to reach Y.
        assert_eq!(reply.pic(), 2);
        assert!(reply.data().iter().all(|&b| b == 0x42));
    }

    #[test]
    fn test_corrupted_request_answered_by_head() {
        let mut chain = chain(&[("X", 4096), ("Y", 4096)]);

        let mut pkt = Packet::new();
        pkt.set_command(Command::Read);
        pkt.set_uid("Y");
        pkt.finalize();
        pkt.force_checksum(pkt.checksum() ^ 0x0100);
        chain.send(&pkt).unwrap();

        let err = chain.receive(Duration::from_millis(10)).unwrap();
        assert_eq!(err.command(), Some(Command::Err));
        assert_eq!(err.options(), crate::packet::ERR_CHECKSUM_MISMATCH);
        assert_eq!(err.pic(), 1);
    }

    #[test]
    fn test_unknown_uid_falls_off_the_tail() {
        let mut chain = chain(&[("X", 4096), ("Y", 4096)]);

        let mut pkt = Packet::new();
        pkt.set_command(Command::Read);
        pkt.set_uid("NOBODY");
        pkt.finalize();
        chain.send(&pkt).unwrap();

        assert!(matches!(
            chain.receive(Duration::from_millis(10)),
            Err(Error::TimedOut)
        ));
    }

    #[test]
    fn test_power_off_silences_the_chain() {
        let mut chain = chain(&[("X", 4096)]);
        chain.power_off().unwrap();
        chain.send(&ping_all()).unwrap();
        assert!(matches!(
            chain.receive(Duration::from_millis(10)),
            Err(Error::TimedOut)
        ));

        chain.power_on().unwrap();
        chain.send(&ping_all()).unwrap();
        assert!(chain.receive(Duration::from_millis(10)).is_ok());
    }
}
