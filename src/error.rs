//! Error types for sramlink
//!
//! # Error Recovery Strategies
//!
//! Different error types require different recovery approaches:
//!
//! ## Configuration Errors (Fix and Restart)
//!
//! - **`Config`**: Configuration file is invalid. Fatal at startup; the
//!   process exits with code 1.
//!
//! ## Transport Errors (Command-Level Recovery)
//!
//! - **`Serial`** / **`Io`**: Serial port or socket trouble. A Reader
//!   handler reports these as ERROR events and returns without mutating
//!   its chain table; the dispatcher keeps running.
//! - **`TimedOut`**: A full packet did not arrive before the deadline.
//!   Partial reads are discarded, so the next receive starts clean.
//!
//! ## Protocol Errors (Log and Continue)
//!
//! - **`MalformedLength`**: Received byte count does not match the wire
//!   packet size. The offending bytes are dropped.
//! - **`Uncrafted`**: A packet was handed to the transport before
//!   `finalize()` installed its checksum. Always a programming error on
//!   the caller's side.
//! - **`Json`** / **`Serialization`**: A bus frame or record failed to
//!   round-trip. The frame is discarded and the connection stays up.

use thiserror::Error;

/// Errors that can occur in sramlink
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Receive deadline elapsed before a full packet arrived")]
    TimedOut,

    #[error("Packet size {got} does not match {expected}")]
    MalformedLength { expected: usize, got: usize },

    #[error("Packet is not crafted; call finalize() before sending")]
    Uncrafted,

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
