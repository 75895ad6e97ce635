//! Per-device forwarding state machine
//!
//! Every node runs this logic identically, regardless of chain
//! position. Two independent one-packet buffers keep the directions
//! apart: the upstream buffer receives from the station side, the
//! downstream buffer receives return traffic from the node below. The
//! feed methods are the DMA-completion analogues and only copy bytes
//! and bump a counter; all protocol work happens in [`Node::poll`].
//!
//! # Packet Handling
//!
//! - A packet that fails its CRC is answered with `ERR/options=1`
//!   upstream and never dispatched.
//! - `pic` increments on every arrival; a response's pic therefore
//!   carries the originator's distance from the station.
//! - A full downstream buffer is retransmitted upstream verbatim, no
//!   inspection (the return-path bucket brigade).
//! - Every transmitted packet is re-finalized, because `pic` and other
//!   fields mutate at every hop.

use super::interp::Interpreter;
use super::memory::{OutputRegion, SramModel, StagingRegion};
use crate::packet::{
    Command, Packet, BROADCAST_UID, DATA_SIZE, ERR_CHECKSUM_MISMATCH, PACKET_SIZE, PING_ALL,
    SENSORS_TEMP, SENSORS_VDD, UID_SIZE,
};

/// A packet leaving the node, already encoded for the wire.
#[derive(Debug)]
pub enum Emit {
    /// Toward the station (or the node above).
    Up(Vec<u8>),
    /// Toward the node below.
    Down(Vec<u8>),
}

/// Raw sensor words exposed through the `SENSORS` command.
///
/// Calibration words a part does not carry stay zero; the station notes
/// that when it decodes the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorBlock {
    pub temp_raw: u16,
    pub vdd_raw: u16,
    pub temp30_cal: u16,
    pub temp110_cal: u16,
    pub vdd_cal: u16,
}

impl SensorBlock {
    /// Lay the requested subset out as little-endian 16-bit fields.
    fn encode(&self, subset: u32) -> Vec<u8> {
        let words: &[u16] = match subset {
            SENSORS_TEMP => &[self.temp110_cal, self.temp30_cal, self.temp_raw],
            SENSORS_VDD => &[self.vdd_cal, self.vdd_raw],
            _ => &[
                self.temp110_cal,
                self.temp30_cal,
                self.temp_raw,
                self.vdd_cal,
                self.vdd_raw,
            ],
        };
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

/// One chain node.
pub struct Node {
    uid: [u8; UID_SIZE],
    sram: SramModel,
    staging: StagingRegion,
    output: OutputRegion,
    interpreter: Box<dyn Interpreter>,
    sensors: SensorBlock,
    up_buf: [u8; PACKET_SIZE],
    up_count: usize,
    down_buf: [u8; PACKET_SIZE],
    down_count: usize,
}

impl Node {
    pub fn new(uid: &str, sram_size: u32, interpreter: Box<dyn Interpreter>) -> Self {
        let mut uid_field = [0u8; UID_SIZE];
        let bytes = uid.as_bytes();
        let n = bytes.len().min(UID_SIZE);
        uid_field[..n].copy_from_slice(&bytes[..n]);

        let seed = bytes.iter().fold(0x5EED_u64, |acc, &b| {
            acc.wrapping_mul(31).wrapping_add(b as u64)
        });

        Node {
            uid: uid_field,
            sram: SramModel::new(sram_size as usize, seed),
            staging: StagingRegion::new(),
            output: OutputRegion::new(),
            interpreter,
            sensors: SensorBlock::default(),
            up_buf: [0u8; PACKET_SIZE],
            up_count: 0,
            down_buf: [0u8; PACKET_SIZE],
            down_count: 0,
        }
    }

    /// Render a 96-bit hardware id the way the boards do: 24 uppercase
    /// hex characters, NUL-padded into the 25-byte field.
    pub fn uid_from_words(high: u32, mid: u32, low: u32) -> String {
        format!("{:08X}{:08X}{:08X}", high, mid, low)
    }

    pub fn uid(&self) -> String {
        crate::packet::format_uid(&self.uid)
    }

    pub fn sram_size(&self) -> u32 {
        self.sram.size() as u32
    }

    pub fn set_sensors(&mut self, sensors: SensorBlock) {
        self.sensors = sensors;
    }

    /// Direct SRAM access for simulation harnesses.
    pub fn sram_mut(&mut self) -> &mut SramModel {
        &mut self.sram
    }

    /// Power cycle: buffers drop, SRAM returns to its power-on pattern,
    /// staged source and interpreter output are gone.
    pub fn power_on_reset(&mut self) {
        self.up_count = 0;
        self.down_count = 0;
        self.sram.power_on_reset();
        self.staging.clear();
        self.output.reset();
    }

    /// DMA completion for the upstream direction: copy and count, no
    /// protocol work.
    pub fn feed_upstream(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(PACKET_SIZE - self.up_count);
        self.up_buf[self.up_count..self.up_count + n].copy_from_slice(&bytes[..n]);
        self.up_count += n;
    }

    /// DMA completion for the downstream direction.
    pub fn feed_downstream(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(PACKET_SIZE - self.down_count);
        self.down_buf[self.down_count..self.down_count + n].copy_from_slice(&bytes[..n]);
        self.down_count += n;
    }

    fn uid_matches(&self, packet: &Packet) -> bool {
        packet.is_broadcast() || packet.uid_raw() == &self.uid
    }

    /// One main-loop iteration. Returns every packet the node transmits
    /// as a result of the buffers' current state.
    pub fn poll(&mut self) -> Vec<Emit> {
        let mut emits = Vec::new();

        // Return-path bucket brigade: a full downstream buffer goes
        // straight back up, uninspected.
        if self.down_count == PACKET_SIZE {
            emits.push(Emit::Up(self.down_buf.to_vec()));
            self.down_count = 0;
        }

        if self.up_count < PACKET_SIZE {
            return emits;
        }

        // Whole packet arrived upstream; rearm the buffer.
        let mut packet = match Packet::decode(&self.up_buf) {
            Ok(p) => p,
            Err(_) => {
                self.up_count = 0;
                return emits;
            }
        };
        self.up_count = 0;

        let valid = packet.checksum_valid();
        packet.set_pic(packet.pic().wrapping_add(1));

        if !valid {
            packet.set_command(Command::Err);
            packet.set_options(ERR_CHECKSUM_MISMATCH);
            self.push(&mut emits, packet, Direction::Up);
            return emits;
        }

        match packet.command() {
            Some(Command::Ping) => {
                if packet.options() == PING_ALL {
                    // Announce ourselves, then let every further node do
                    // the same.
                    let mut reply = packet.clone();
                    reply.set_uid_raw(self.uid);
                    reply.set_command(Command::Ack);
                    reply.set_options(self.sram.size() as u32);
                    self.push(&mut emits, reply, Direction::Up);

                    let mut onward = packet;
                    onward.set_uid_raw(BROADCAST_UID);
                    self.push(&mut emits, onward, Direction::Down);
                } else if self.uid_matches(&packet) {
                    packet.set_command(Command::Ack);
                    packet.set_options(self.sram.size() as u32);
                    self.push(&mut emits, packet, Direction::Up);
                } else {
                    self.push(&mut emits, packet, Direction::Down);
                }
            }
            Some(Command::Read) => {
                if self.uid_matches(&packet) {
                    let block = self.sram.read_block(packet.options());
                    packet.set_data(&block);
                    packet.set_command(Command::Ack);
                    self.push(&mut emits, packet, Direction::Up);
                } else {
                    self.push(&mut emits, packet, Direction::Down);
                }
            }
            Some(Command::Write) => {
                if self.uid_matches(&packet) {
                    let offset = packet.options();
                    self.sram.write_block(offset, packet.data());
                    packet.set_command(Command::Ack);
                    self.push(&mut emits, packet, Direction::Up);
                } else {
                    self.push(&mut emits, packet, Direction::Down);
                }
            }
            Some(Command::Sensors) => {
                if self.uid_matches(&packet) {
                    let blob = self.sensors.encode(packet.options());
                    packet.set_data(&blob);
                    packet.set_command(Command::Ack);
                    self.push(&mut emits, packet, Direction::Up);
                } else {
                    self.push(&mut emits, packet, Direction::Down);
                }
            }
            Some(Command::Load) => {
                if self.uid_matches(&packet) {
                    let mut block = [0u8; DATA_SIZE];
                    block.copy_from_slice(packet.data());
                    self.staging.write_block(packet.options(), &block);
                    packet.set_command(Command::Ack);
                    self.push(&mut emits, packet, Direction::Up);
                } else {
                    self.push(&mut emits, packet, Direction::Down);
                }
            }
            Some(Command::Exec) => {
                if self.uid_matches(&packet) {
                    if packet.options() == 1 {
                        self.output.reset();
                    }
                    let code = self
                        .interpreter
                        .eval(self.staging.source(), &mut self.output);
                    packet.set_options(code as u32);
                    packet.set_command(Command::Ack);
                    self.push(&mut emits, packet, Direction::Up);
                } else {
                    self.push(&mut emits, packet, Direction::Down);
                }
            }
            Some(Command::Retr) => {
                if self.uid_matches(&packet) {
                    let block = self.output.read_block(packet.options());
                    packet.set_data(&block);
                    packet.set_command(Command::Ack);
                    self.push(&mut emits, packet, Direction::Up);
                } else {
                    self.push(&mut emits, packet, Direction::Down);
                }
            }
            // Station-bound error propagation; responses never arrive on
            // the upstream side, so anything else keeps moving up.
            Some(Command::Ack) | Some(Command::Err) | None => {
                self.push(&mut emits, packet, Direction::Up);
            }
        }

        emits
    }

    fn push(&self, emits: &mut Vec<Emit>, mut packet: Packet, direction: Direction) {
        packet.finalize();
        // A crafted packet always encodes.
        let wire = match packet.encode() {
            Ok(w) => w.to_vec(),
            Err(_) => return,
        };
        emits.push(match direction {
            Direction::Up => Emit::Up(wire),
            Direction::Down => Emit::Down(wire),
        });
    }
}

enum Direction {
    Up,
    Down,
}
