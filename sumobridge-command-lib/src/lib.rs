//! Command bridge core for SumoBridge
//!
//! This library turns raw HTTP-shaped requests into motor commands and gates
//! them on bot mode. It is hardware-agnostic: the firmware supplies the
//! sockets and the UART, the host tools supply TCP and stdout, and the tests
//! supply in-memory buffers.

pub mod connection;
pub mod forward;
pub mod mode;
pub mod request;

pub use connection::{handle_connection, ConnectionReport, POST_STATUS_LINE, REPLY_OK};
pub use forward::{forward, ForwardOutcome};
pub use mode::{ActivationError, BotModeSetup, Mode, ModeController, ModeHandle, Transition};
pub use request::{
    classify, extract_get_command, extract_post_command, Command, Method, PostScan, ScanLimits,
    COMMAND_MARKER, HTTP_MARKER,
};
