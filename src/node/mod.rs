//! Device node runtime
//!
//! The state machine every chain node executes, independent of its
//! position: receive a packet on the upstream side, verify it, handle
//! or forward it, and shuttle return traffic from the node below back
//! up. The same logic drives the firmware port and the in-process
//! [`VirtualChain`] used for simulation and tests.

mod chain;
mod interp;
mod memory;
mod runtime;

pub use chain::VirtualChain;
pub use interp::{EchoInterpreter, Interpreter};
pub use memory::{OutputRegion, SramModel, StagingRegion};
pub use runtime::{Emit, Node, SensorBlock};
