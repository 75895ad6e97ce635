//! Wire packet codec for the chain protocol
//!
//! # Wire Format
//!
//! Every packet on the wire is exactly `PACKET_SIZE` bytes:
//!
//! ```text
//! ┌─────────┬─────┬─────────────┬──────────┬───────────┬──────────────┐
//! │ command │ pic │ options     │ uid      │ data      │ checksum     │
//! │ 1 byte  │ 1   │ 4 bytes LE  │ 25 bytes │ D bytes   │ 2 bytes LE   │
//! └─────────┴─────┴─────────────┴──────────┴───────────┴──────────────┘
//! ```
//!
//! - **command**: operation code, see [`Command`]
//! - **pic**: Position In Chain, incremented by every forwarding hop
//! - **options**: command-specific parameter (block offset, ping mode,
//!   exec reset flag, error kind)
//! - **uid**: ASCII device identity, NUL-padded; 25 bytes of `0xFF` is
//!   the broadcast sentinel
//! - **data**: one memory block, sensor blob, or interpreter fragment
//! - **checksum**: CRC-16 (polynomial 0xA001 reflected, initial value 0)
//!   over all preceding bytes with the checksum field zeroed
//!
//! A packet must be [`finalize`](Packet::finalize)d before it can be
//! [`encode`](Packet::encode)d; mutating any field clears the crafted
//! bit, so a hop that rewrites `pic` is forced to recompute the CRC.

use crate::error::{Error, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;

/// Bytes of payload carried by one packet. Build-time constant; the
/// Discovery-class deployment uses smaller SRAM regions.
#[cfg(not(feature = "discovery"))]
pub const DATA_SIZE: usize = 1024;
#[cfg(feature = "discovery")]
pub const DATA_SIZE: usize = 512;

/// Bytes in the device identity field.
pub const UID_SIZE: usize = 25;

/// Total size of a packet on the wire.
pub const PACKET_SIZE: usize = 6 + UID_SIZE + DATA_SIZE + 2;

/// UID sentinel that every node accepts as its own identity.
pub const BROADCAST_UID: [u8; UID_SIZE] = [0xFF; UID_SIZE];

/// Start address of the SRAM on the target boards.
pub const SRAM_BASE: u32 = 0x2000_0000;

/// Blocks in a device's interpreter output region.
pub const OUTPUT_BLOCKS: u32 = 4;

/// Operation codes understood by the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    /// Packet has been received and handled correctly.
    Ack = 1,
    /// Identify devices in a chain.
    Ping = 2,
    /// Read a region of memory.
    Read = 3,
    /// Write to a region of memory.
    Write = 4,
    /// Read the sensors of a device.
    Sensors = 5,
    /// Load custom code into a device.
    Load = 6,
    /// Execute custom code on a device.
    Exec = 7,
    /// Retrieve results from executing code.
    Retr = 8,
    /// Error while receiving a packet.
    Err = 255,
}

// Options values for PING
pub const PING_OWN: u32 = 0;
pub const PING_ALL: u32 = 1;

// Options values for SENSORS
pub const SENSORS_ALL: u32 = 0;
pub const SENSORS_TEMP: u32 = 1;
pub const SENSORS_VDD: u32 = 2;

// Options values for ERR
pub const ERR_CHECKSUM_MISMATCH: u32 = 1;

// ============================================================================
// CRC-16 - single canonical implementation for the chain protocol
// ============================================================================

const fn build_crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u16; 256] = build_crc_table();

/// Byte-at-a-time table-driven CRC-16 (polynomial 0xA001 reflected).
///
/// The same routine runs on the station and on every node; the chain
/// has no other integrity mechanism.
#[inline]
pub fn crc16(init: u16, data: &[u8]) -> u16 {
    let mut crc = init;
    for &b in data {
        crc = (crc >> 8) ^ CRC_TABLE[((crc ^ b as u16) & 0xFF) as usize];
    }
    crc
}

/// Strip the NUL padding from a raw UID field.
pub fn format_uid(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Render the absolute SRAM address of a block offset as `0xXXXXXXXX`.
pub fn block_address(offset: u32) -> String {
    format!("0x{:08X}", SRAM_BASE + offset * DATA_SIZE as u32)
}

/// One chain packet.
///
/// Field setters clear the crafted bit; [`finalize`](Self::finalize)
/// recomputes the checksum over the canonical (checksum-zeroed) image
/// and sets it again. [`encode`](Self::encode) refuses un-crafted
/// packets so nothing leaves the station without a valid CRC.
#[derive(Clone)]
pub struct Packet {
    command: u8,
    pic: u8,
    options: u32,
    uid: [u8; UID_SIZE],
    data: [u8; DATA_SIZE],
    checksum: u16,
    crafted: bool,
}

impl Packet {
    pub fn new() -> Self {
        Packet {
            command: Command::Ping.into(),
            pic: 0,
            options: 0,
            uid: [0u8; UID_SIZE],
            data: [0u8; DATA_SIZE],
            checksum: 0,
            crafted: false,
        }
    }

    // ========================================================================
    // Field access
    // ========================================================================

    /// Raw operation code. Unknown codes are preserved so that nodes can
    /// forward traffic they do not understand.
    #[inline]
    pub fn command_code(&self) -> u8 {
        self.command
    }

    /// Typed operation code, if the raw byte is a known command.
    #[inline]
    pub fn command(&self) -> Option<Command> {
        Command::try_from(self.command).ok()
    }

    #[inline]
    pub fn pic(&self) -> u8 {
        self.pic
    }

    #[inline]
    pub fn options(&self) -> u32 {
        self.options
    }

    #[inline]
    pub fn uid_raw(&self) -> &[u8; UID_SIZE] {
        &self.uid
    }

    /// UID with the NUL padding stripped.
    pub fn uid(&self) -> String {
        format_uid(&self.uid)
    }

    #[inline]
    pub fn data(&self) -> &[u8; DATA_SIZE] {
        &self.data
    }

    #[inline]
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    #[inline]
    pub fn is_crafted(&self) -> bool {
        self.crafted
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.uid == BROADCAST_UID
    }

    // ========================================================================
    // Field setters - each clears the crafted bit
    // ========================================================================

    pub fn set_command(&mut self, command: Command) {
        self.command = command.into();
        self.crafted = false;
    }

    pub fn set_command_code(&mut self, command: u8) {
        self.command = command;
        self.crafted = false;
    }

    pub fn set_pic(&mut self, pic: u8) {
        self.pic = pic;
        self.crafted = false;
    }

    pub fn set_options(&mut self, options: u32) {
        self.options = options;
        self.crafted = false;
    }

    /// Set the UID from an ASCII string, NUL-padded to the field width.
    /// Longer identities are truncated to `UID_SIZE` bytes.
    pub fn set_uid(&mut self, uid: &str) {
        let bytes = uid.as_bytes();
        let n = bytes.len().min(UID_SIZE);
        self.uid = [0u8; UID_SIZE];
        self.uid[..n].copy_from_slice(&bytes[..n]);
        self.crafted = false;
    }

    pub fn set_uid_raw(&mut self, uid: [u8; UID_SIZE]) {
        self.uid = uid;
        self.crafted = false;
    }

    /// Set the payload. Shorter slices are NUL-padded; longer slices are
    /// truncated to `DATA_SIZE` (callers validate lengths beforehand).
    pub fn set_data(&mut self, data: &[u8]) {
        let n = data.len().min(DATA_SIZE);
        self.data = [0u8; DATA_SIZE];
        self.data[..n].copy_from_slice(&data[..n]);
        self.crafted = false;
    }

    /// Overwrite the stored checksum without recomputing it. Only useful
    /// for corruption tests; a packet forged this way still reports
    /// itself as crafted.
    pub fn force_checksum(&mut self, checksum: u16) {
        self.checksum = checksum;
    }

    // ========================================================================
    // Crafting
    // ========================================================================

    /// Serialize with the checksum field zeroed; this is the image the
    /// CRC is computed over on both ends of the wire.
    fn canonical_bytes(&self) -> [u8; PACKET_SIZE] {
        let mut buf = [0u8; PACKET_SIZE];
        buf[0] = self.command;
        buf[1] = self.pic;
        buf[2..6].copy_from_slice(&self.options.to_le_bytes());
        buf[6..6 + UID_SIZE].copy_from_slice(&self.uid);
        buf[6 + UID_SIZE..PACKET_SIZE - 2].copy_from_slice(&self.data);
        buf
    }

    /// Compute the checksum over the canonical form and install it,
    /// marking the packet ready for transmission. Idempotent.
    pub fn finalize(&mut self) -> &mut Self {
        self.checksum = crc16(0, &self.canonical_bytes());
        self.crafted = true;
        self
    }

    /// Recompute the CRC over the canonical form and compare it with the
    /// stored checksum.
    pub fn checksum_valid(&self) -> bool {
        crc16(0, &self.canonical_bytes()) == self.checksum
    }

    /// Serialize for the wire. Fails with [`Error::Uncrafted`] when
    /// `finalize()` has not run since the last mutation.
    pub fn encode(&self) -> Result<[u8; PACKET_SIZE]> {
        if !self.crafted {
            return Err(Error::Uncrafted);
        }
        let mut buf = self.canonical_bytes();
        buf[PACKET_SIZE - 2..].copy_from_slice(&self.checksum.to_le_bytes());
        Ok(buf)
    }

    /// Parse a whole wire packet. The checksum is carried over as
    /// received; callers decide what a mismatch means with
    /// [`checksum_valid`](Self::checksum_valid).
    pub fn decode(bytes: &[u8]) -> Result<Packet> {
        if bytes.len() != PACKET_SIZE {
            return Err(Error::MalformedLength {
                expected: PACKET_SIZE,
                got: bytes.len(),
            });
        }

        let mut uid = [0u8; UID_SIZE];
        uid.copy_from_slice(&bytes[6..6 + UID_SIZE]);
        let mut data = [0u8; DATA_SIZE];
        data.copy_from_slice(&bytes[6 + UID_SIZE..PACKET_SIZE - 2]);

        Ok(Packet {
            command: bytes[0],
            pic: bytes[1],
            options: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            uid,
            data,
            checksum: u16::from_le_bytes([bytes[PACKET_SIZE - 2], bytes[PACKET_SIZE - 1]]),
            crafted: true,
        })
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.command() {
            Some(cmd) => format!("{:?}", cmd).to_uppercase(),
            None => format!("0x{:02X}", self.command),
        };
        write!(
            f,
            "<Packet {} {:03}:{} [0x{:08X}] CRC(0x{:04X})>",
            name,
            self.pic,
            self.uid(),
            self.options,
            self.checksum
        )
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
