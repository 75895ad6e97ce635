//! sramlink - chain protocol stack and station daemon for SRAM-PUF
//! data acquisition
//!
//! The platform harvests SRAM power-on state and environmental
//! telemetry from daisy-chained microcontrollers. This crate provides
//! the protocol core: the wire packet codec, the per-device node
//! runtime (exercised in-process by a virtual chain), the station-side
//! serial transport, chain membership table, Readers, Dispatchers, the
//! structured event logbook, and the record contracts toward the
//! message bus and the sample store.

pub mod bus;
pub mod chain;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logbook;
pub mod node;
pub mod packet;
pub mod reader;
pub mod station;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use packet::{Command, Packet, DATA_SIZE, PACKET_SIZE};
