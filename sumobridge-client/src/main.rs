//! SumoBridge command client
//!
//! Sends motor commands to a SumoBridge (or the mock server) the way the
//! controller board does: one connection per command, as a GET query or a
//! form-encoded POST body. Prints the bridge's reply and the round trip time.
//!
//! Usage: cargo run -p sumobridge-client -- [OPTIONS] <COMMANDS>...

use clap::Parser;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "sumobridge-send")]
#[command(about = "Send motor commands to a SumoBridge")]
struct Args {
    /// Bridge address to connect to
    #[arg(short, long, default_value = "127.0.0.1:8443")]
    address: String,

    /// Send commands as a POST form body instead of a GET query
    #[arg(short, long)]
    post: bool,

    /// Send each command this many times
    #[arg(short, long, default_value = "1")]
    repeat: u32,

    /// Pause between requests in milliseconds
    #[arg(short, long, default_value = "0")]
    interval: u64,

    /// Commands to send, e.g. F B L R S
    #[arg(required = true)]
    commands: Vec<String>,
}

fn get_request(command: &str) -> Vec<u8> {
    format!("GET /?cmd={command} HTTP/1.1\r\n\r\n").into_bytes()
}

fn post_request(command: &str) -> Vec<u8> {
    let body = format!("cmd={command}\r\n");
    format!(
        "POST / HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

/// Send one command and return everything the bridge answered.
fn send_command(address: &str, command: &str, post: bool) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(address)?;
    stream.set_nodelay(true)?;

    let request = if post {
        post_request(command)
    } else {
        get_request(command)
    };
    stream.write_all(&request)?;
    // The bridge reads the POST body until end of stream
    stream.shutdown(Shutdown::Write)?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    Ok(String::from_utf8_lossy(&response).to_string())
}

fn run(args: &Args) -> std::io::Result<()> {
    let method = if args.post { "POST" } else { "GET" };
    let interval = Duration::from_millis(args.interval);
    let mut sent = 0u32;
    let mut total_latency = Duration::ZERO;

    for command in &args.commands {
        for _ in 0..args.repeat {
            let start = Instant::now();
            let response = send_command(&args.address, command, args.post)?;
            let latency = start.elapsed();
            sent += 1;
            total_latency += latency;

            println!(
                "{method} {command}: {} ({:.2}ms)",
                response.escape_debug(),
                latency.as_secs_f64() * 1000.0
            );

            if !interval.is_zero() {
                std::thread::sleep(interval);
            }
        }
    }

    if sent > 1 {
        println!(
            "\n{sent} requests, avg latency {:.3}ms",
            (total_latency / sent).as_secs_f64() * 1000.0
        );
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
