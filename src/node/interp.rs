//! Embedded interpreter seam
//!
//! Devices expose a byte-code engine for user-defined code (`LOAD` the
//! source, `EXEC` it, `RETR` the output). The engine itself is opaque
//! to the protocol: the chain only transports source text in, a return
//! code out, and the output region out.

use super::memory::OutputRegion;

/// The on-device code engine behind `EXEC`.
///
/// `eval` runs the staged source and pushes any produced cells into the
/// output region; the returned code travels back to the station in the
/// response `options` field (0 = success).
pub trait Interpreter: Send {
    fn eval(&mut self, source: &[u8], out: &mut OutputRegion) -> i32;
}

/// Minimal interpreter for virtual chains: evaluates the source as
/// whitespace-separated integer literals and emits each one. Any other
/// token aborts with a non-zero code.
pub struct EchoInterpreter;

impl Interpreter for EchoInterpreter {
    fn eval(&mut self, source: &[u8], out: &mut OutputRegion) -> i32 {
        let text = match std::str::from_utf8(source) {
            Ok(t) => t,
            Err(_) => return 2,
        };
        for token in text.split_whitespace() {
            match token.parse::<i32>() {
                Ok(value) => out.push(value),
                Err(_) => return 1,
            }
        }
        0
    }
}
