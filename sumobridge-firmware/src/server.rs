//! Command listener and accept loop
//!
//! One connection at a time: accept, handle, close, repeat. The listener is
//! polled in non-blocking mode so a pending bot mode request is picked up
//! between connections even when no client is around. Accepted streams are
//! blocking with no timeout; a client that stalls holds up everyone else.

use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};

use anyhow::Result;
use esp_idf_hal::delay::FreeRtos;
use log::{debug, error, info, warn};
use sumobridge_command_lib::{handle_connection, ModeController, ScanLimits, Transition};

use crate::bot_uart::{BotUart, EspBotModeSetup};
use crate::config::Config;

/// Sleep between listener polls when nobody is connecting
const ACCEPT_POLL_MS: u32 = 20;

/// How accepted connections are wrapped
enum Transport {
    Plain,
    #[cfg(feature = "tls")]
    Tls(crate::tls::TlsAcceptor),
}

impl Transport {
    fn from_config(config: &Config) -> Self {
        if !config.tls.enabled {
            return Self::Plain;
        }

        #[cfg(feature = "tls")]
        match crate::tls::TlsAcceptor::from_config(&config.tls) {
            Ok(acceptor) => return Self::Tls(acceptor),
            Err(e) => warn!("TLS unavailable ({e}), serving plain TCP"),
        }
        #[cfg(not(feature = "tls"))]
        warn!("TLS requested but firmware built without the `tls` feature, serving plain TCP");

        Self::Plain
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Plain => "TCP",
            #[cfg(feature = "tls")]
            Self::Tls(_) => "TLS",
        }
    }
}

/// Pending bot mode request from the button task
struct ActivationSignal(Option<oneshot::Receiver<()>>);

impl ActivationSignal {
    /// Consume the request if one has arrived and run the transition.
    fn poll(&mut self, controller: &mut ModeController<BotUart>, setup: &mut EspBotModeSetup) {
        let Some(rx) = &self.0 else {
            return;
        };

        match rx.try_recv() {
            Ok(()) => {
                self.0 = None;
                match controller.activate(setup) {
                    // Console is already silenced at this point; logging is best effort
                    Ok(Transition::Activated) => info!("Bot mode active"),
                    Ok(Transition::AlreadyActive) => debug!("Bot mode was already active"),
                    Err(e) => error!("Bot mode switch failed: {e}"),
                }
            }
            Err(oneshot::TryRecvError::Empty) => {}
            Err(oneshot::TryRecvError::Disconnected) => {
                warn!("Bot mode button task ended, bot mode can no longer be entered");
                self.0 = None;
            }
        }
    }
}

/// Run the accept loop forever.
pub fn run(
    config: &Config,
    controller: &mut ModeController<BotUart>,
    setup: &mut EspBotModeSetup,
    activation_rx: oneshot::Receiver<()>,
) -> Result<()> {
    let port = config.listen_port;
    let limits = config.scan.limits();
    let transport = Transport::from_config(config);

    info!("Command server starting on port {port} ({})...", transport.name());
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;
    info!("Command server listening on port {port}");

    let mut activation = ActivationSignal(Some(activation_rx));

    loop {
        activation.poll(controller, setup);

        match listener.accept() {
            Ok((stream, addr)) => {
                info!("Client connected from {addr} (mode {})", controller.mode());
                if let Err(e) = serve_client(stream, &transport, controller, &limits) {
                    warn!("Client {addr}: {e}");
                }
                debug!("Client {addr} closed");
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                FreeRtos::delay_ms(ACCEPT_POLL_MS);
            }
            Err(e) => {
                warn!("Accept error: {e}");
                FreeRtos::delay_ms(ACCEPT_POLL_MS);
            }
        }
    }
}

/// Handle one client; the stream is closed when it goes out of scope
fn serve_client(
    stream: TcpStream,
    transport: &Transport,
    controller: &mut ModeController<BotUart>,
    limits: &ScanLimits,
) -> Result<()> {
    // lwIP may hand out accepted sockets with the listener's O_NONBLOCK
    stream.set_nonblocking(false)?;

    let report = match transport {
        Transport::Plain => handle_connection(stream, controller, limits),
        #[cfg(feature = "tls")]
        Transport::Tls(acceptor) => handle_connection(acceptor.accept(stream)?, controller, limits),
    };

    info!(
        "{} request: {}{}",
        report.method,
        report.outcome,
        if report.replied { "" } else { " (reply not delivered)" }
    );
    Ok(())
}
