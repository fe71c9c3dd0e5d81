//! Bot-mode state machine
//!
//! The device boots in [`Mode::Normal`], where the UART belongs to the
//! diagnostic console. A button press switches it to [`Mode::Bot`], where the
//! UART belongs to the motor controller. The switch happens once; only a
//! restart returns to `Normal`.
//!
//! [`ModeController`] owns both the mode cell and the serial channel, so the
//! channel can only be reached after it has been constructed by the
//! transition. Other tasks observe the mode through a [`ModeHandle`].

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use atomic_enum::atomic_enum;
use derive_more::{Display, Error, From};
use log::{debug, info};

/// Which consumer owns the serial line
#[atomic_enum]
#[derive(PartialEq, Eq, Display)]
pub enum Mode {
    /// Serial line reserved for the diagnostic console
    #[display("NORMAL")]
    Normal = 0,
    /// Serial line reserved for forwarding commands
    #[display("BOT")]
    Bot,
}

/// Read-only view of the current mode, cheap to clone into other tasks
#[derive(Clone)]
pub struct ModeHandle(Arc<AtomicMode>);

impl ModeHandle {
    pub fn current(&self) -> Mode {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_bot(&self) -> bool {
        self.current() == Mode::Bot
    }
}

/// Platform steps of the NORMAL -> BOT transition, run in this order.
pub trait BotModeSetup {
    /// Serial channel handed to the forwarder
    type Serial: io::Write;

    /// Detach the diagnostic console from the serial line
    fn release_console(&mut self);

    /// Fixed delay so the line is quiet before it is reconfigured
    fn settle(&mut self);

    /// Construct the serial channel (9600 baud, 8N1)
    fn open_serial(&mut self) -> io::Result<Self::Serial>;
}

/// What [`ModeController::activate`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Transition {
    /// NORMAL -> BOT ran to completion
    #[display("activated")]
    Activated,
    /// Already in BOT, nothing ran
    #[display("already active")]
    AlreadyActive,
}

/// Failure while switching to BOT mode. The mode stays NORMAL.
#[derive(Debug, Display, Error, From)]
pub enum ActivationError {
    #[display("failed to open serial channel: {_0}")]
    OpenSerial(io::Error),
}

/// Single owner of the mode cell and the serial channel
pub struct ModeController<S> {
    mode: Arc<AtomicMode>,
    serial: Option<S>,
}

impl<S> Default for ModeController<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ModeController<S> {
    pub fn new() -> Self {
        Self {
            mode: Arc::new(AtomicMode::new(Mode::Normal)),
            serial: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode.load(Ordering::Acquire)
    }

    pub fn handle(&self) -> ModeHandle {
        ModeHandle(self.mode.clone())
    }

    /// The serial channel, only once BOT mode is active
    pub fn serial_mut(&mut self) -> Option<&mut S> {
        if self.mode() == Mode::Bot {
            self.serial.as_mut()
        } else {
            None
        }
    }

    /// Switch to BOT mode.
    ///
    /// Repeated calls are no-ops: the setup steps run at most once to
    /// completion. If the serial channel cannot be opened the mode stays
    /// NORMAL and the console is not reattached.
    pub fn activate<B>(&mut self, setup: &mut B) -> Result<Transition, ActivationError>
    where
        B: BotModeSetup<Serial = S>,
    {
        if self.mode() == Mode::Bot {
            debug!("Bot mode already active, ignoring activation");
            return Ok(Transition::AlreadyActive);
        }

        info!("Switching to bot mode");
        setup.release_console();
        setup.settle();
        let serial = setup.open_serial()?;
        self.serial = Some(serial);
        self.mode.store(Mode::Bot, Ordering::Release);

        Ok(Transition::Activated)
    }
}
