//! One request, start to finish
//!
//! The accept loop hands each accepted stream to [`handle_connection`], which
//! reads the request line, extracts and forwards the command, and writes the
//! reply. Closing the connection is left to the caller (drop the stream).

use std::io::{BufReader, Read, Write};

use log::{debug, info, warn};

use crate::forward::{forward, ForwardOutcome};
use crate::mode::ModeController;
use crate::request::{
    classify, extract_get_command, extract_post_command, read_line, trim_line_ending, LineRead,
    Method, PostScan, ScanLimits,
};

/// Reply body sent after every request
pub const REPLY_OK: &[u8] = b"OK";

/// Status line sent on the POST path before the body is read
pub const POST_STATUS_LINE: &[u8] = b"HTTP/1.1 200 OK\r\n";

/// Summary of a handled connection, for logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionReport {
    pub method: Method,
    pub outcome: ForwardOutcome,
    /// Every reply write succeeded
    pub replied: bool,
}

/// Handle a single request on `stream`.
///
/// Never fails: malformed requests, dropped commands and broken clients all
/// end in a report. The client gets `OK` whether or not a command was
/// forwarded. Reads have no timeout, so a client that never sends a line
/// break blocks here.
pub fn handle_connection<T, S>(
    stream: T,
    controller: &mut ModeController<S>,
    limits: &ScanLimits,
) -> ConnectionReport
where
    T: Read + Write,
    S: Write,
{
    let mut reader = BufReader::new(stream);

    let request_line = match read_line(&mut reader, limits.max_line_len) {
        Ok(LineRead::Line(line)) => line,
        Ok(LineRead::Eof) => {
            debug!("Client sent nothing");
            Vec::new()
        }
        Ok(LineRead::Overlong) => {
            debug!("Request line longer than {} bytes", limits.max_line_len);
            Vec::new()
        }
        Err(e) => {
            debug!("Failed to read request line: {e}");
            Vec::new()
        }
    };
    info!("Request: {}", String::from_utf8_lossy(trim_line_ending(&request_line)));

    let method = classify(&request_line);
    let mut replied = true;

    let command = match method {
        Method::Get => extract_get_command(&request_line),
        Method::Post => {
            // Answer first so the client is not left waiting while it streams the body
            replied &= send(reader.get_mut(), POST_STATUS_LINE);
            let scan = extract_post_command(&mut reader, limits);
            if !matches!(scan, PostScan::Found(_)) {
                debug!("POST body scan ended without command: {scan:?}");
            }
            scan.into_command()
        }
        Method::Unrecognized => None,
    };

    let outcome = forward(command.as_deref(), controller);
    replied &= send(reader.get_mut(), REPLY_OK);

    ConnectionReport {
        method,
        outcome,
        replied,
    }
}

fn send<W: Write>(stream: &mut W, data: &[u8]) -> bool {
    match stream.write_all(data).and_then(|()| stream.flush()) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to send reply: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::BotModeSetup;
    use std::io::{self, Cursor};

    /// In-memory client connection: canned request in, reply captured
    struct MockStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
        fail_writes: bool,
    }

    impl MockStream {
        fn new(request: &str) -> Self {
            Self {
                input: Cursor::new(request.as_bytes().to_vec()),
                output: Vec::new(),
                fail_writes: false,
            }
        }
    }

    impl Write for &mut MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_writes {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for &mut MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    struct VecSetup;

    impl BotModeSetup for VecSetup {
        type Serial = Vec<u8>;

        fn release_console(&mut self) {}

        fn settle(&mut self) {}

        fn open_serial(&mut self) -> io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn controller(bot: bool) -> ModeController<Vec<u8>> {
        let mut controller = ModeController::new();
        if bot {
            controller.activate(&mut VecSetup).unwrap();
        }
        controller
    }

    fn serial_bytes(controller: &mut ModeController<Vec<u8>>) -> Vec<u8> {
        controller.serial_mut().cloned().unwrap_or_default()
    }

    #[test]
    fn test_get_command_forwarded() {
        let mut controller = controller(true);
        let mut stream = MockStream::new("GET /?cmd=F HTTP/1.1\r\n\r\n");

        let report = handle_connection(&mut stream, &mut controller, &ScanLimits::default());

        assert_eq!(report.method, Method::Get);
        assert_eq!(report.outcome, ForwardOutcome::Sent(1));
        assert!(report.replied);
        assert_eq!(serial_bytes(&mut controller), b"F");
        assert_eq!(stream.output, b"OK");
    }

    #[test]
    fn test_get_without_command() {
        let mut controller = controller(true);
        let mut stream = MockStream::new("GET /favicon.ico HTTP/1.1\r\n\r\n");

        let report = handle_connection(&mut stream, &mut controller, &ScanLimits::default());

        assert_eq!(report.method, Method::Unrecognized);
        assert_eq!(report.outcome, ForwardOutcome::NoCommand);
        assert!(serial_bytes(&mut controller).is_empty());
        assert_eq!(stream.output, b"OK");
    }

    #[test]
    fn test_post_in_normal_mode_dropped() {
        let mut controller = controller(false);
        let mut stream = MockStream::new(concat!(
            "POST / HTTP/1.1\r\n",
            "Host: sumobridge.local\r\n",
            "Content-Type: application/x-www-form-urlencoded\r\n",
            "Content-Length: 5\r\n",
            "\r\n",
            "cmd=L",
        ));

        let report = handle_connection(&mut stream, &mut controller, &ScanLimits::default());

        assert_eq!(report.method, Method::Post);
        assert_eq!(report.outcome, ForwardOutcome::ModeInactive);
        assert!(controller.serial_mut().is_none());
        assert_eq!(stream.output, b"HTTP/1.1 200 OK\r\nOK");
    }

    #[test]
    fn test_post_in_bot_mode_forwarded() {
        let mut controller = controller(true);
        let mut stream = MockStream::new(concat!(
            "POST / HTTP/1.1\r\n",
            "Content-Type: application/x-www-form-urlencoded\r\n",
            "\r\n",
            "cmd=R\r\n",
        ));

        let report = handle_connection(&mut stream, &mut controller, &ScanLimits::default());

        assert_eq!(report.outcome, ForwardOutcome::Sent(1));
        assert_eq!(serial_bytes(&mut controller), b"R");
        assert_eq!(stream.output, b"HTTP/1.1 200 OK\r\nOK");
    }

    #[test]
    fn test_post_without_command_line() {
        let mut controller = controller(true);
        let mut stream = MockStream::new("POST / HTTP/1.1\r\nHost: bot\r\n\r\nspeed=3");

        let report = handle_connection(&mut stream, &mut controller, &ScanLimits::default());

        assert_eq!(report.outcome, ForwardOutcome::NoCommand);
        assert!(serial_bytes(&mut controller).is_empty());
        assert_eq!(stream.output, b"HTTP/1.1 200 OK\r\nOK");
    }

    #[test]
    fn test_empty_request() {
        let mut controller = controller(true);
        let mut stream = MockStream::new("");

        let report = handle_connection(&mut stream, &mut controller, &ScanLimits::default());

        assert_eq!(report.method, Method::Unrecognized);
        assert_eq!(report.outcome, ForwardOutcome::NoCommand);
        assert_eq!(stream.output, b"OK");
    }

    #[test]
    fn test_truncated_get_not_forwarded() {
        let mut controller = controller(true);
        let mut stream = MockStream::new("GET /?cmd=F");

        let report = handle_connection(&mut stream, &mut controller, &ScanLimits::default());

        assert_eq!(report.method, Method::Get);
        assert_eq!(report.outcome, ForwardOutcome::NoCommand);
        assert!(serial_bytes(&mut controller).is_empty());
    }

    #[test]
    fn test_overlong_request_line() {
        let mut controller = controller(true);
        let request = format!("GET /?cmd=F&pad={} HTTP/1.1\r\n", "a".repeat(64));
        let mut stream = MockStream::new(&request);
        let limits = ScanLimits {
            max_line_len: 32,
            max_body_lines: 4,
        };

        let report = handle_connection(&mut stream, &mut controller, &limits);

        assert_eq!(report.method, Method::Unrecognized);
        assert!(serial_bytes(&mut controller).is_empty());
        assert_eq!(stream.output, b"OK");
    }

    #[test]
    fn test_reply_failure_still_forwards() {
        let mut controller = controller(true);
        let mut stream = MockStream::new("GET /?cmd=S HTTP/1.1\r\n\r\n");
        stream.fail_writes = true;

        let report = handle_connection(&mut stream, &mut controller, &ScanLimits::default());

        assert_eq!(report.outcome, ForwardOutcome::Sent(1));
        assert!(!report.replied);
        assert_eq!(serial_bytes(&mut controller), b"S");
    }
}
