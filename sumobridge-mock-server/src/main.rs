//! Host stand-in for the SumoBridge firmware
//!
//! Runs the same request handling and bot mode gate as the device, over a
//! plain TCP listener. Pressing Enter plays the role of the bot mode button;
//! the "bot UART" is stdout or a file.
//!
//! Usage: cargo run -p sumobridge-mock-server -- [OPTIONS]
//! Then send commands with sumobridge-client to 127.0.0.1:8443

use clap::Parser;
use std::fs::File;
use std::io::{self, BufRead, ErrorKind, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;
use sumobridge_command_lib::{
    handle_connection, BotModeSetup, ModeController, ScanLimits, Transition,
};

#[derive(Parser, Debug)]
#[command(name = "sumobridge-mock")]
#[command(about = "Mock SumoBridge command bridge")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8443")]
    port: u16,

    /// Write forwarded command bytes to this file instead of stdout
    #[arg(short, long)]
    serial_out: Option<PathBuf>,

    /// Settle delay when entering bot mode, in milliseconds
    #[arg(long, default_value = "1000")]
    settle_ms: u64,

    /// Enter bot mode at startup instead of waiting for Enter
    #[arg(short, long)]
    bot: bool,

    /// Longest request or body line accepted, in bytes
    #[arg(long, default_value_t = ScanLimits::default().max_line_len)]
    max_line_len: usize,

    /// Body lines scanned for a command before giving up
    #[arg(long, default_value_t = ScanLimits::default().max_body_lines)]
    max_body_lines: usize,
}

/// Forwarded bytes go here, echoed in hex on stderr
struct SerialOut {
    sink: Box<dyn Write + Send>,
}

impl Write for SerialOut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.sink.write(buf)?;
        eprintln!("SERIAL: {}", hex::encode(&buf[..n]));
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

struct HostSetup {
    settle: Duration,
    serial_out: Option<PathBuf>,
}

impl BotModeSetup for HostSetup {
    type Serial = SerialOut;

    fn release_console(&mut self) {
        println!("BOT MODE 9600bps");
    }

    fn settle(&mut self) {
        std::thread::sleep(self.settle);
    }

    fn open_serial(&mut self) -> io::Result<SerialOut> {
        let sink: Box<dyn Write + Send> = match &self.serial_out {
            Some(path) => Box::new(File::create(path)?),
            None => Box::new(io::stdout()),
        };
        Ok(SerialOut { sink })
    }
}

fn activate(controller: &mut ModeController<SerialOut>, setup: &mut HostSetup) {
    match controller.activate(setup) {
        Ok(Transition::Activated) => println!("Mode: {}", controller.mode()),
        Ok(Transition::AlreadyActive) => println!("Already in {} mode", controller.mode()),
        Err(e) => eprintln!("Bot mode switch failed: {e}"),
    }
}

/// Stdin "button": the first Enter requests bot mode
fn spawn_button(tx: oneshot::Sender<()>) {
    std::thread::spawn(move || {
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => {}
            Ok(_) => {
                println!("Button pressed");
                let _ = tx.send(());
            }
        }
    });
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    let requested = ScanLimits {
        max_line_len: args.max_line_len,
        max_body_lines: args.max_body_lines,
    };
    let limits = requested.clamped();
    if limits != requested {
        eprintln!("Scan limits {requested:?} out of range, using {limits:?}");
    }
    let mut setup = HostSetup {
        settle: Duration::from_millis(args.settle_ms),
        serial_out: args.serial_out,
    };
    let mut controller = ModeController::new();

    let mut activation = if args.bot {
        activate(&mut controller, &mut setup);
        None
    } else {
        let (tx, rx) = oneshot::channel();
        spawn_button(tx);
        println!("Press Enter to enter bot mode");
        Some(rx)
    };

    println!("Mock SumoBridge starting on 0.0.0.0:{}...", args.port);
    let listener = TcpListener::bind(("0.0.0.0", args.port))?;
    listener.set_nonblocking(true)?;
    println!("Mock SumoBridge ready - waiting for connections...");

    loop {
        if let Some(rx) = &activation {
            match rx.try_recv() {
                Ok(()) => {
                    activation = None;
                    activate(&mut controller, &mut setup);
                }
                Err(oneshot::TryRecvError::Empty) => {}
                Err(oneshot::TryRecvError::Disconnected) => activation = None,
            }
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                println!("Client connected: {addr}");
                stream.set_nonblocking(false)?;
                let report = handle_connection(stream, &mut controller, &limits);
                println!(
                    "{} request: {}{}",
                    report.method,
                    report.outcome,
                    if report.replied { "" } else { " (reply not delivered)" }
                );
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => eprintln!("Connection error: {e}"),
        }
    }
}
