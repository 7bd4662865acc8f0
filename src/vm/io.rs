//! The two abstract host channels the interpreter communicates through:
//! `input` delivers whole lines on demand, `output` receives text
//! fragments. Both are modeled as `std::sync::mpsc` channels, the idiomatic
//! stand-in for "a dedicated interpreter thread communicating via bounded
//! queues" the design notes call for.

use crate::error::{VmError, VmResult};
use std::sync::mpsc::{Receiver, Sender};

pub struct Io {
    input: Receiver<String>,
    output: Sender<String>,
}

impl Io {
    pub fn new(input: Receiver<String>, output: Sender<String>) -> Self {
        Self { input, output }
    }

    /// Blocks for one whole line. A closed channel while a `read` is
    /// pending is fatal, per the channel contract.
    pub fn read_line(&self) -> VmResult<String> {
        self.input.recv().map_err(|_| VmError::InputClosed)
    }

    /// Emits a text fragment in program order. The receiving end decides
    /// whether to buffer or display it; a closed receiver is silently
    /// dropped since a detached host is not this interpreter's problem.
    pub fn emit(&self, fragment: impl Into<String>) {
        let _ = self.output.send(fragment.into());
    }
}
