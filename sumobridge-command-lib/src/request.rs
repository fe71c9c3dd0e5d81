//! Request classification and command extraction
//!
//! Requests are never parsed as HTTP. The first line decides the method and
//! the command is cut out of the raw bytes with literal substring searches:
//!
//! ```text
//! GET /?cmd=F HTTP/1.1        -> "F"   (between `cmd=` and ` HTTP`)
//! POST / HTTP/1.1             -> scan following lines for `cmd=`
//! cmd=L\r\n                   -> "L"   (everything after `cmd=`, minus CR/LF)
//! ```
//!
//! Any occurrence of `cmd=` counts, even inside unrelated data such as a
//! header value.

use std::io::{self, BufRead, Read};

use derive_more::Display;
use smallvec::SmallVec;

/// Bytes that introduce a command in a query string or form body
pub const COMMAND_MARKER: &[u8] = b"cmd=";

/// Bytes that close a command on a GET request line
pub const HTTP_MARKER: &[u8] = b" HTTP";

const GET_TOKEN: &[u8] = b"GET";
const POST_TOKEN: &[u8] = b"POST";

/// An extracted command. Almost always a single motor action byte.
pub type Command = SmallVec<[u8; 8]>;

/// Method of an inbound request, as far as the bridge cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Method {
    /// GET line that carries `cmd=` in its target
    #[display("GET")]
    Get,
    /// POST line; the command (if any) is in a later line
    #[display("POST")]
    Post,
    /// Anything else, including an empty or truncated line
    #[display("unrecognized")]
    Unrecognized,
}

/// Caps applied while reading request lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanLimits {
    /// Longest line (including the terminator) read from the client
    pub max_line_len: usize,
    /// Lines read after a POST request line before giving up
    pub max_body_lines: usize,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            max_line_len: 512,
            max_body_lines: 32,
        }
    }
}

impl ScanLimits {
    /// Shortest accepted line cap; must fit a request line like `GET /?cmd=F HTTP/1.1`
    pub const MIN_LINE_LEN: usize = 64;
    pub const MAX_LINE_LEN: usize = 4096;
    pub const MAX_BODY_LINES: usize = 256;

    /// Limits forced into the supported ranges
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            max_line_len: self.max_line_len.clamp(Self::MIN_LINE_LEN, Self::MAX_LINE_LEN),
            max_body_lines: self.max_body_lines.clamp(1, Self::MAX_BODY_LINES),
        }
    }
}

/// Result of reading one line with [`read_line`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    /// A complete line, terminator included (the last line of a stream may lack one)
    Line(Vec<u8>),
    /// `max_line_len` bytes arrived without a line break
    Overlong,
    /// The stream returned no bytes
    Eof,
}

/// Outcome of scanning POST body lines for a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostScan {
    /// A line containing `cmd=` was found
    Found(Command),
    /// The stream ended before any `cmd=` line
    EndOfStream,
    /// Too many lines, or a line too long
    LimitReached,
    /// Reading failed (client went away mid-request)
    Aborted(io::ErrorKind),
}

impl PostScan {
    /// The command, if one was found
    pub fn into_command(self) -> Option<Command> {
        match self {
            Self::Found(command) => Some(command),
            Self::EndOfStream | Self::LimitReached | Self::Aborted(_) => None,
        }
    }
}

/// Byte offset of the first occurrence of `needle` in `haystack`
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

/// Classify a request by its first line.
///
/// A GET line without `cmd=` has nothing to forward and is `Unrecognized`,
/// never `Post`.
pub fn classify(line: &[u8]) -> Method {
    if contains(line, GET_TOKEN) && contains(line, COMMAND_MARKER) {
        Method::Get
    } else if contains(line, POST_TOKEN) {
        Method::Post
    } else {
        Method::Unrecognized
    }
}

/// Extract the command from a GET request line.
///
/// The command is the slice between the end of `cmd=` and the next ` HTTP`.
/// Returns `None` when either marker is missing, so a malformed line can never
/// forward an unbounded slice.
pub fn extract_get_command(line: &[u8]) -> Option<Command> {
    let start = find(line, COMMAND_MARKER)? + COMMAND_MARKER.len();
    let rest = &line[start..];
    let len = find(rest, HTTP_MARKER)?;
    Some(Command::from_slice(&rest[..len]))
}

/// Extract the command from a single body line: everything after `cmd=` up to
/// the line terminator.
pub fn extract_body_command(line: &[u8]) -> Option<Command> {
    let start = find(line, COMMAND_MARKER)? + COMMAND_MARKER.len();
    Some(Command::from_slice(trim_line_ending(&line[start..])))
}

/// Strip one trailing `\n` and then one trailing `\r`
pub fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Read one line of at most `max_len` bytes.
///
/// A last line without terminator that ends the stream at exactly `max_len`
/// bytes is still a `Line`; `Overlong` means more bytes of the same line follow.
pub fn read_line<R: BufRead>(reader: &mut R, max_len: usize) -> io::Result<LineRead> {
    let mut line = Vec::new();
    let read = reader
        .by_ref()
        .take(max_len as u64)
        .read_until(b'\n', &mut line)?;

    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if read >= max_len && line.last() != Some(&b'\n') && !reader.fill_buf()?.is_empty() {
        return Ok(LineRead::Overlong);
    }
    Ok(LineRead::Line(line))
}

/// Scan the lines following a POST request line for a command.
///
/// Headers, the blank separator line and the body are all just lines here.
/// Scanning stops at the first line containing `cmd=`, at end of stream, on a
/// read error, or once `limits` are exhausted.
pub fn extract_post_command<R: BufRead>(reader: &mut R, limits: &ScanLimits) -> PostScan {
    for _ in 0..limits.max_body_lines {
        match read_line(reader, limits.max_line_len) {
            Ok(LineRead::Line(line)) => {
                if let Some(command) = extract_body_command(&line) {
                    return PostScan::Found(command);
                }
            }
            Ok(LineRead::Eof) => return PostScan::EndOfStream,
            Ok(LineRead::Overlong) => return PostScan::LimitReached,
            Err(e) => return PostScan::Aborted(e.kind()),
        }
    }
    PostScan::LimitReached
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that hands out `data` and then fails
    struct FailingReader {
        data: Cursor<Vec<u8>>,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.data.read(buf)?;
            if n == 0 {
                Err(io::Error::from(io::ErrorKind::ConnectionReset))
            } else {
                Ok(n)
            }
        }
    }

    fn body(lines: &[&str]) -> Cursor<Vec<u8>> {
        Cursor::new(lines.concat().into_bytes())
    }

    #[test]
    fn test_find() {
        assert_eq!(find(b"GET /?cmd=F HTTP/1.1", b"cmd="), Some(6));
        assert_eq!(find(b"GET /?cmd=F HTTP/1.1", b" HTTP"), Some(11));
        assert_eq!(find(b"abc", b"abcd"), None);
        assert_eq!(find(b"", b"cmd="), None);
        assert_eq!(find(b"abc", b""), Some(0));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(b"GET /?cmd=F HTTP/1.1\r\n"), Method::Get);
        assert_eq!(classify(b"POST / HTTP/1.1\r\n"), Method::Post);
        assert_eq!(classify(b"POST /?cmd=F HTTP/1.1\r\n"), Method::Post);
        assert_eq!(classify(b"PUT /?cmd=F HTTP/1.1\r\n"), Method::Unrecognized);
        assert_eq!(classify(b""), Method::Unrecognized);
    }

    #[test]
    fn test_get_without_marker_is_not_post() {
        assert_eq!(classify(b"GET /favicon.ico HTTP/1.1\r\n"), Method::Unrecognized);
    }

    #[test]
    fn test_marker_found_anywhere() {
        // Literal search, so a marker inside another parameter still counts
        assert_eq!(classify(b"GET /?xcmd=B HTTP/1.1"), Method::Get);
        assert_eq!(extract_get_command(b"GET /?xcmd=B HTTP/1.1").as_deref(), Some(&b"B"[..]));
    }

    #[test]
    fn test_extract_get_command() {
        for cmd in ["F", "L", "R", "S", "", "FL", "speed=3&x", "cmd=", "HTTP"] {
            let line = format!("GET /?cmd={cmd} HTTP/1.1\r\n");
            assert_eq!(
                extract_get_command(line.as_bytes()).as_deref(),
                Some(cmd.as_bytes()),
                "command {cmd:?}"
            );
        }
    }

    #[test]
    fn test_extract_get_command_binary() {
        let line = b"GET /?cmd=\x00\xff HTTP/1.0";
        assert_eq!(extract_get_command(line).as_deref(), Some(&[0x00, 0xff][..]));
    }

    #[test]
    fn test_extract_get_missing_http() {
        assert_eq!(extract_get_command(b"GET /?cmd=F"), None);
        assert_eq!(extract_get_command(b"GET /?cmd=F\r\n"), None);
        // ` HTTP` before the marker does not close the command
        assert_eq!(extract_get_command(b"GET / HTTP/1.1 ?cmd=F"), None);
    }

    #[test]
    fn test_extract_get_missing_marker() {
        assert_eq!(extract_get_command(b"GET /favicon.ico HTTP/1.1\r\n"), None);
        assert_eq!(extract_get_command(b""), None);
        assert_eq!(extract_get_command(b"cmd"), None);
    }

    #[test]
    fn test_extract_body_command() {
        assert_eq!(extract_body_command(b"cmd=R\r\n").as_deref(), Some(&b"R"[..]));
        assert_eq!(extract_body_command(b"cmd=R\n").as_deref(), Some(&b"R"[..]));
        assert_eq!(extract_body_command(b"cmd=R").as_deref(), Some(&b"R"[..]));
        assert_eq!(extract_body_command(b"cmd=\r\n").as_deref(), Some(&b""[..]));
        assert_eq!(extract_body_command(b"speed=3\r\n"), None);
    }

    #[test]
    fn test_trim_line_ending() {
        assert_eq!(trim_line_ending(b"a\r\n"), b"a");
        assert_eq!(trim_line_ending(b"a\n"), b"a");
        assert_eq!(trim_line_ending(b"a\r"), b"a");
        assert_eq!(trim_line_ending(b"a\n\r"), b"a\n");
        assert_eq!(trim_line_ending(b""), b"");
    }

    #[test]
    fn test_read_line() {
        let mut reader = Cursor::new(b"one\r\ntwo".to_vec());
        assert_eq!(read_line(&mut reader, 64).unwrap(), LineRead::Line(b"one\r\n".to_vec()));
        assert_eq!(read_line(&mut reader, 64).unwrap(), LineRead::Line(b"two".to_vec()));
        assert_eq!(read_line(&mut reader, 64).unwrap(), LineRead::Eof);
    }

    #[test]
    fn test_read_line_overlong() {
        let mut reader = Cursor::new(b"0123456789\n".to_vec());
        assert_eq!(read_line(&mut reader, 4).unwrap(), LineRead::Overlong);

        // A line that exactly fits, terminator included
        let mut reader = Cursor::new(b"012\n".to_vec());
        assert_eq!(read_line(&mut reader, 4).unwrap(), LineRead::Line(b"012\n".to_vec()));
    }

    #[test]
    fn test_read_line_full_length_at_end_of_stream() {
        let mut reader = Cursor::new(b"cmd=LLLL".to_vec());
        assert_eq!(read_line(&mut reader, 8).unwrap(), LineRead::Line(b"cmd=LLLL".to_vec()));

        let mut reader = Cursor::new(b"cmd=LLLLL".to_vec());
        assert_eq!(read_line(&mut reader, 8).unwrap(), LineRead::Overlong);
    }

    #[test]
    fn test_post_command_fills_last_line_exactly() {
        let limits = ScanLimits {
            max_line_len: 8,
            max_body_lines: 32,
        };
        let mut reader = body(&["\r\n", "cmd=LLLL"]);
        assert_eq!(
            extract_post_command(&mut reader, &limits),
            PostScan::Found(Command::from_slice(b"LLLL"))
        );
    }

    #[test]
    fn test_scan_limits_clamped() {
        assert_eq!(ScanLimits::default().clamped(), ScanLimits::default());

        let zero = ScanLimits {
            max_line_len: 0,
            max_body_lines: 0,
        }
        .clamped();
        assert_eq!(zero.max_line_len, ScanLimits::MIN_LINE_LEN);
        assert_eq!(zero.max_body_lines, 1);

        let huge = ScanLimits {
            max_line_len: usize::MAX,
            max_body_lines: usize::MAX,
        }
        .clamped();
        assert_eq!(huge.max_line_len, ScanLimits::MAX_LINE_LEN);
        assert_eq!(huge.max_body_lines, ScanLimits::MAX_BODY_LINES);
    }

    #[test]
    fn test_clamped_zero_limits_still_find_command() {
        let limits = ScanLimits {
            max_line_len: 0,
            max_body_lines: 0,
        }
        .clamped();
        let mut reader = body(&["cmd=L\r\n"]);
        assert_eq!(
            extract_post_command(&mut reader, &limits),
            PostScan::Found(Command::from_slice(b"L"))
        );
    }

    #[test]
    fn test_post_command_after_headers() {
        let mut reader = body(&[
            "Content-Type: application/x-www-form-urlencoded\r\n",
            "\r\n",
            "cmd=R\r\n",
        ]);
        assert_eq!(
            extract_post_command(&mut reader, &ScanLimits::default()),
            PostScan::Found(Command::from_slice(b"R"))
        );
    }

    #[test]
    fn test_post_command_without_trailing_newline() {
        let mut reader = body(&["Host: bot\r\n", "\r\n", "cmd=L"]);
        assert_eq!(
            extract_post_command(&mut reader, &ScanLimits::default()).into_command().as_deref(),
            Some(&b"L"[..])
        );
    }

    #[test]
    fn test_post_stops_at_first_marker() {
        let mut reader = body(&["cmd=F\r\n", "cmd=B\r\n"]);
        assert_eq!(
            extract_post_command(&mut reader, &ScanLimits::default()),
            PostScan::Found(Command::from_slice(b"F"))
        );
        // The second line is left unread
        assert_eq!(read_line(&mut reader, 64).unwrap(), LineRead::Line(b"cmd=B\r\n".to_vec()));
    }

    #[test]
    fn test_post_end_of_stream() {
        let mut reader = body(&["Content-Type: text/plain\r\n", "\r\n", "speed=3\r\n"]);
        assert_eq!(
            extract_post_command(&mut reader, &ScanLimits::default()),
            PostScan::EndOfStream
        );

        let mut reader = body(&[]);
        assert_eq!(
            extract_post_command(&mut reader, &ScanLimits::default()),
            PostScan::EndOfStream
        );
    }

    #[test]
    fn test_post_line_cap() {
        let limits = ScanLimits {
            max_line_len: 64,
            max_body_lines: 3,
        };
        let mut reader = body(&["a\r\n", "b\r\n", "c\r\n", "cmd=R\r\n"]);
        assert_eq!(extract_post_command(&mut reader, &limits), PostScan::LimitReached);

        let mut reader = body(&["a\r\n", "b\r\n", "cmd=R\r\n"]);
        assert_eq!(
            extract_post_command(&mut reader, &limits),
            PostScan::Found(Command::from_slice(b"R"))
        );
    }

    #[test]
    fn test_post_overlong_line() {
        let limits = ScanLimits {
            max_line_len: 8,
            max_body_lines: 32,
        };
        let mut reader = body(&["X-Padding: aaaaaaaaaaaaaaaa\r\n", "cmd=R\r\n"]);
        assert_eq!(extract_post_command(&mut reader, &limits), PostScan::LimitReached);
    }

    #[test]
    fn test_post_read_error() {
        let mut reader = io::BufReader::new(FailingReader {
            data: Cursor::new(b"Host: bot\r\n".to_vec()),
        });
        assert_eq!(
            extract_post_command(&mut reader, &ScanLimits::default()),
            PostScan::Aborted(io::ErrorKind::ConnectionReset)
        );
    }
}
