//! Station-side command executors
//!
//! A Reader binds to one chain link and translates each high-level
//! command into packet exchanges: craft, send, collect, decode, log.
//! Variants cover different physical board families behind the same
//! UART line layer; they may restrict or re-interpret the capability
//! set but must keep each handler's externally observable contract.

mod stm32;

pub use stm32::Stm32Reader;

use crate::bus::CommandRecord;
use crate::logbook::Logbook;
use crate::store::SampleStore;
use serde::Serialize;

/// Result status of one handled command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

/// What a handler hands back to the dispatcher.
#[derive(Debug)]
pub struct Outcome {
    pub status: Status,
    /// Structured response payload; `None` for handlers with nothing to
    /// report beyond their events.
    pub response: Option<serde_json::Value>,
}

impl Outcome {
    pub fn ok() -> Self {
        Outcome {
            status: Status::Ok,
            response: None,
        }
    }

    pub fn ok_with(response: serde_json::Value) -> Self {
        Outcome {
            status: Status::Ok,
            response: Some(response),
        }
    }

    pub fn error() -> Self {
        Outcome {
            status: Status::Error,
            response: None,
        }
    }

    pub fn error_with(response: serde_json::Value) -> Self {
        Outcome {
            status: Status::Error,
            response: Some(response),
        }
    }
}

/// Collaborators a handler may touch while it runs.
pub struct HandlerCtx<'a> {
    pub logbook: &'a Logbook,
    pub store: &'a mut dyn SampleStore,
}

/// The capability set every Reader variant implements.
///
/// Precondition lattice: every handler except `power_on`, `power_off`
/// and `status` requires the port powered on; every one of those except
/// `ping` also requires a non-empty membership table. Violations
/// surface as ERROR events with fixed message templates.
pub trait Reader: Send {
    /// Label of the board family this Reader drives.
    fn board_kind(&self) -> &str;

    fn handle_power_on(&mut self, cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome;
    fn handle_power_off(&mut self, cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome;
    fn handle_status(&mut self, cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome;
    fn handle_ping(&mut self, cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome;
    fn handle_read(&mut self, cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome;
    fn handle_write(&mut self, cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome;
    fn handle_write_invert(&mut self, cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome;
    fn handle_sensors(&mut self, cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome;
    fn handle_load(&mut self, cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome;
    fn handle_exec(&mut self, cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome;
    fn handle_retrieve(&mut self, cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome;
}
