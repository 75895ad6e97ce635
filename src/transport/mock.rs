//! Mock link for unit testing

use super::Link;
use crate::error::{Error, Result};
use crate::packet::Packet;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mock link that replays scripted responses and records every send.
#[derive(Clone)]
pub struct MockLink {
    inner: Arc<Mutex<MockLinkInner>>,
}

struct MockLinkInner {
    responses: VecDeque<Packet>,
    sent: Vec<Packet>,
    powered: bool,
    power_cycles: u32,
}

impl MockLink {
    pub fn new() -> Self {
        MockLink {
            inner: Arc::new(Mutex::new(MockLinkInner {
                responses: VecDeque::new(),
                sent: Vec::new(),
                powered: true,
                power_cycles: 0,
            })),
        }
    }

    /// Queue a packet to be handed out by the next `receive()`.
    pub fn push_response(&self, packet: Packet) {
        self.inner.lock().unwrap().responses.push_back(packet);
    }

    /// All packets sent so far.
    pub fn sent(&self) -> Vec<Packet> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.inner.lock().unwrap().sent.len()
    }

    pub fn clear_sent(&self) {
        self.inner.lock().unwrap().sent.clear();
    }

    pub fn power_cycles(&self) -> u32 {
        self.inner.lock().unwrap().power_cycles
    }

    pub fn set_powered(&self, on: bool) {
        self.inner.lock().unwrap().powered = on;
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl Link for MockLink {
    fn send(&mut self, packet: &Packet) -> Result<()> {
        // Same contract as the serial path: refuse un-crafted packets.
        packet.encode()?;
        self.inner.lock().unwrap().sent.push(packet.clone());
        Ok(())
    }

    fn receive(&mut self, _deadline: Duration) -> Result<Packet> {
        self.inner
            .lock()
            .unwrap()
            .responses
            .pop_front()
            .ok_or(Error::TimedOut)
    }

    fn power_on(&mut self) -> Result<()> {
        self.inner.lock().unwrap().powered = true;
        Ok(())
    }

    fn power_off(&mut self) -> Result<()> {
        self.inner.lock().unwrap().powered = false;
        Ok(())
    }

    fn power_cycle(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.powered = true;
        inner.power_cycles += 1;
        Ok(())
    }

    fn powered(&self) -> bool {
        self.inner.lock().unwrap().powered
    }

    fn label(&self) -> &str {
        "mock"
    }
}
