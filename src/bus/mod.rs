//! Message-bus contract
//!
//! The broker itself is an external collaborator; the station only
//! depends on two record flows: a subscription yielding command records
//! and a publisher taking event records. Both run over TCP with
//! length-prefixed MessagePack frames (see [`wire`]).
//!
//! A command record is a flat map with at least a `command` field:
//!
//! ```json
//! { "command": "write", "device": "0123...", "offset": 2, "data": [ ... ] }
//! ```

mod tcp;
pub mod wire;

pub use tcp::{publish_command, CommandBus, CommandSubscription, EventPublisher};

/// Incoming command record: a flat field map, pattern-matched by the
/// dispatcher.
pub type CommandRecord = serde_json::Map<String, serde_json::Value>;

/// Topic prefix for command frames.
pub const COMMAND_TOPIC_PREFIX: &str = "commands";

/// Topic prefix for event frames.
pub const EVENT_TOPIC_PREFIX: &str = "events";
