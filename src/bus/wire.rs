//! Bus wire format
//!
//! Length-prefixed framing over TCP:
//!
//! ```text
//! ┌──────────────────┬────────────────┬──────┬─────────────────────┐
//! │ Length (4 bytes) │ Topic (ASCII)  │ 0x00 │ Payload (variable)  │
//! │ Big-endian u32   │                │      │ MessagePack binary  │
//! └──────────────────┴────────────────┴──────┴─────────────────────┘
//! ```
//!
//! - **Length field**: topic + NUL + payload, big-endian
//! - **Payload**: MessagePack-encoded record (maps use string keys)
//! - **Maximum frame size**: 1MB

use crate::bus::CommandRecord;
use crate::error::{Error, Result};
use serde::Serialize;
use std::io::{Read, Write};

/// Upper bound on a single frame.
pub const MAX_FRAME: usize = 1024 * 1024;

/// Write one frame.
pub fn write_frame<W: Write>(writer: &mut W, topic: &str, payload: &[u8]) -> Result<()> {
    let frame_length = (topic.len() + 1 + payload.len()) as u32;
    writer.write_all(&frame_length.to_be_bytes())?;
    writer.write_all(topic.as_bytes())?;
    writer.write_all(&[0])?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the read timed out before a length prefix
/// arrived, so callers can poll a shutdown flag between frames.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<(String, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(Error::Other(format!("Frame too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;

    let split = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Other("Frame topic is not terminated".to_string()))?;
    let topic = String::from_utf8_lossy(&body[..split]).into_owned();
    let payload = body[split + 1..].to_vec();
    Ok(Some((topic, payload)))
}

/// MessagePack-encode a record for a frame payload.
pub fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(record).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a command record from a frame payload.
pub fn decode_command(payload: &[u8]) -> Result<CommandRecord> {
    rmp_serde::from_slice(payload).map_err(|e| Error::Serialization(e.to_string()))
}
