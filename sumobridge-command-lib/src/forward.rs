//! Command forwarding to the motor controller
//!
//! Fire-and-forget: nothing is read back from the serial line and failed
//! writes are reported, not retried.

use std::io::{self, Write};

use derive_more::Display;
use log::{debug, warn};

use crate::mode::ModeController;

/// What happened to an extracted command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ForwardOutcome {
    /// Command bytes written to the serial channel
    #[display("sent {_0} bytes")]
    Sent(usize),
    /// The request carried no command
    #[display("no command")]
    NoCommand,
    /// `cmd=` was present but empty
    #[display("empty command")]
    EmptyCommand,
    /// Command dropped, bot mode not yet active
    #[display("dropped, mode not yet active")]
    ModeInactive,
    /// The serial write failed
    #[display("write failed: {_0}")]
    WriteFailed(io::ErrorKind),
}

/// Write `command` verbatim to the serial channel if bot mode is active.
///
/// The mode is checked on every call; nothing is cached between requests.
pub fn forward<S: Write>(command: Option<&[u8]>, controller: &mut ModeController<S>) -> ForwardOutcome {
    let Some(command) = command else {
        return ForwardOutcome::NoCommand;
    };
    if command.is_empty() {
        return ForwardOutcome::EmptyCommand;
    }

    let Some(serial) = controller.serial_mut() else {
        warn!("Command {} dropped, mode not yet active", hex::encode(command));
        return ForwardOutcome::ModeInactive;
    };

    match serial.write_all(command).and_then(|()| serial.flush()) {
        Ok(()) => {
            debug!("Forwarded command {}", hex::encode(command));
            ForwardOutcome::Sent(command.len())
        }
        Err(e) => {
            warn!("Serial write of {} failed: {e}", hex::encode(command));
            ForwardOutcome::WriteFailed(e.kind())
        }
    }
}
