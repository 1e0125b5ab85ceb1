//! Client-server communication protocol definitions.
//!
//! This module defines the frames exchanged between the calculator client and
//! every server variant, and the text codec that carries them:
//!
//! ```text
//! request:  OP:ADD;OP1:10.5;OP2:5.2;
//! response: RES:15.7;ERR:NULL;STYPE:concurrent_tcp_async;
//! ```
//!
//! Numbers are laid out like C's `%g`, which any `strtod`-style parser reads,
//! but carry as many digits as needed to decode to the exact same `f64`.

use std::fmt;
use std::io::{ErrorKind, Read};
use std::str::FromStr;

use crate::error::{CalcError, Result};

/// Upper bound of one frame on the wire, in bytes.
pub const MAX_FRAME_LEN: usize = 1024;

/// Every frame, request or response, carries exactly this many fields.
const FIELD_COUNT: usize = 3;

const MAX_NUMBER_WIDTH: usize = 64;
const MAX_ERROR_WIDTH: usize = 255;
const MAX_TAG_WIDTH: usize = 127;
/// Decimal exponents from here on are written in exponent notation.
const MAX_FIXED_EXPONENT: i32 = 17;

/// Sentinel written in the `ERR` field when there is no error.
const NO_ERROR: &str = "NULL";

/// An arithmetic operation, or the request to end a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `ADD`
    Add,
    /// `SUB`
    Subtract,
    /// `MUL`
    Multiply,
    /// `DIV`
    Divide,
    /// `EXT`, asks a stream server to hang up.
    Exit,
}

impl Operation {
    /// The four operations a server actually computes.
    pub const ARITHMETIC: [Operation; 4] = [
        Operation::Add,
        Operation::Subtract,
        Operation::Multiply,
        Operation::Divide,
    ];

    /// The 3-letter wire token.
    pub fn code(self) -> &'static str {
        match self {
            Operation::Add => "ADD",
            Operation::Subtract => "SUB",
            Operation::Multiply => "MUL",
            Operation::Divide => "DIV",
            Operation::Exit => "EXT",
        }
    }
}

impl FromStr for Operation {
    type Err = CalcError;

    fn from_str(code: &str) -> Result<Self> {
        match code {
            "ADD" => Ok(Operation::Add),
            "SUB" => Ok(Operation::Subtract),
            "MUL" => Ok(Operation::Multiply),
            "DIV" => Ok(Operation::Divide),
            "EXT" => Ok(Operation::Exit),
            other => Err(CalcError::Format(format!("unknown operation {other:?}"))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Client request message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Request {
    /// What to compute.
    pub operation: Operation,
    /// Left operand, `OP1`.
    pub lhs: f64,
    /// Right operand, `OP2`.
    pub rhs: f64,
}

impl Request {
    /// Build a request.
    pub fn new(operation: Operation, lhs: f64, rhs: f64) -> Self {
        Self { operation, lhs, rhs }
    }

    /// Write the request frame.
    pub fn encode(&self) -> Vec<u8> {
        format!(
            "OP:{};OP1:{};OP2:{};",
            self.operation.code(),
            format_number(self.lhs),
            format_number(self.rhs)
        )
        .into_bytes()
    }

    /// Parse one request frame.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut fields = Fields::new(frame)?;
        let operation = fields.next("OP", 3)?.parse::<Operation>()?;
        let lhs = parse_number(fields.next("OP1", MAX_NUMBER_WIDTH)?)?;
        let rhs = parse_number(fields.next("OP2", MAX_NUMBER_WIDTH)?)?;
        fields.finish()?;
        Ok(Self { operation, lhs, rhs })
    }
}

/// Server response message.
///
/// A response always means the request reached a server. `error` carries an
/// application failure such as a division by zero; transport failures never
/// produce a `Response` at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The computed value, `0` when `error` is set.
    pub result: f64,
    /// Application error reported by the server.
    pub error: Option<String>,
    /// Which server variant handled the request.
    pub server_tag: String,
}

impl Response {
    /// A successful computation.
    pub fn ok(result: f64, server_tag: impl Into<String>) -> Self {
        Self {
            result,
            error: None,
            server_tag: server_tag.into(),
        }
    }

    /// A request the server processed but could not satisfy.
    pub fn failed(error: impl Into<String>, server_tag: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            result: 0.0,
            error: (!error.is_empty()).then_some(error),
            server_tag: server_tag.into(),
        }
    }

    /// Write the response frame.
    ///
    /// Text fields are clamped to their wire width and `;` is replaced so the
    /// output is always one well-formed frame.
    pub fn encode(&self) -> Vec<u8> {
        let error = match self.error.as_deref() {
            Some(error) if !error.is_empty() => sanitize(error, MAX_ERROR_WIDTH),
            _ => NO_ERROR.to_string(),
        };
        let mut tag = sanitize(&self.server_tag, MAX_TAG_WIDTH);
        if tag.is_empty() {
            tag.push('?');
        }
        format!(
            "RES:{};ERR:{};STYPE:{};",
            format_number(self.result),
            error,
            tag
        )
        .into_bytes()
    }

    /// Parse one response frame.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut fields = Fields::new(frame)?;
        let result = parse_number(fields.next("RES", MAX_NUMBER_WIDTH)?)?;
        let error = match fields.next("ERR", MAX_ERROR_WIDTH)? {
            NO_ERROR => None,
            error => Some(error.to_string()),
        };
        let server_tag = fields.next("STYPE", MAX_TAG_WIDTH)?.to_string();
        fields.finish()?;
        Ok(Self {
            result,
            error,
            server_tag,
        })
    }
}

/// Length of the first complete frame in `buf`, if there is one.
///
/// A frame is complete once its last field terminator has arrived.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    buf.iter()
        .enumerate()
        .filter(|(_, b)| **b == b';')
        .nth(FIELD_COUNT - 1)
        .map(|(i, _)| i + 1)
}

/// Format a number in C's `%g` layout with the fewest digits that parse back
/// to the same value.
///
/// Exponent notation (`1e+20`, `5e-05`) is used when the decimal exponent is
/// below -4 or at least 17; otherwise the number is written in fixed notation.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // `{:e}` yields the shortest round-trip mantissa.
    let scientific = format!("{value:e}");
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= MAX_FIXED_EXPONENT {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exponent.unsigned_abs())
    } else {
        value.to_string()
    }
}

fn parse_number(field: &str) -> Result<f64> {
    field
        .parse()
        .map_err(|_| CalcError::Format(format!("invalid number {field:?}")))
}

fn sanitize(text: &str, width: usize) -> String {
    text.chars()
        .map(|c| match c {
            ';' => ',',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '?',
        })
        .take(width)
        .collect()
}

/// Length-checked walk over the `KEY:value;` fields of one frame.
struct Fields<'a> {
    rest: &'a str,
}

impl<'a> Fields<'a> {
    fn new(frame: &'a [u8]) -> Result<Self> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(CalcError::Format(format!(
                "frame of {} bytes exceeds {MAX_FRAME_LEN}",
                frame.len()
            )));
        }
        if !frame.is_ascii() {
            return Err(CalcError::Format("frame is not ASCII".to_string()));
        }
        let rest = std::str::from_utf8(frame)
            .map_err(|_| CalcError::Format("frame is not ASCII".to_string()))?;
        Ok(Self { rest })
    }

    fn next(&mut self, key: &str, width: usize) -> Result<&'a str> {
        let rest = self
            .rest
            .strip_prefix(key)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| CalcError::Format(format!("expected field {key}")))?;
        let end = rest
            .find(';')
            .ok_or_else(|| CalcError::Format(format!("field {key} is not terminated")))?;
        let value = &rest[..end];
        if value.is_empty() {
            return Err(CalcError::Format(format!("field {key} is empty")));
        }
        if value.len() > width {
            return Err(CalcError::Format(format!(
                "field {key} is longer than {width} bytes"
            )));
        }
        self.rest = &rest[end + 1..];
        Ok(value)
    }

    fn finish(self) -> Result<()> {
        if self.rest.trim_end_matches(|c: char| c.is_ascii_whitespace()).is_empty() {
            Ok(())
        } else {
            Err(CalcError::Format("trailing bytes after frame".to_string()))
        }
    }
}

/// Reads successive frames off a blocking byte stream.
///
/// Bytes past the end of one frame are kept for the next call.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames.
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let skip = self
                .buf
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            self.buf.drain(..skip);

            if let Some(len) = frame_len(&self.buf) {
                return Ok(Some(self.buf.drain(..len).collect()));
            }
            if self.buf.len() >= MAX_FRAME_LEN {
                return Err(CalcError::Format(format!(
                    "no frame within {MAX_FRAME_LEN} bytes"
                )));
            }

            let mut chunk = [0u8; 512];
            let n = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(CalcError::Transport(
                        "stream closed in the middle of a frame".to_string(),
                    ))
                };
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_wire_format() {
        let request = Request::new(Operation::Add, 10.5, 5.2);
        assert_eq!(request.encode(), b"OP:ADD;OP1:10.5;OP2:5.2;");
        assert_eq!(Request::decode(b"OP:ADD;OP1:10.5;OP2:5.2;").unwrap(), request);
    }

    #[test]
    fn response_wire_format() {
        let response = Response::ok(15.7, "concurrent_tcp_async");
        assert_eq!(
            response.encode(),
            b"RES:15.7;ERR:NULL;STYPE:concurrent_tcp_async;"
        );

        let failed = Response::failed("Division by zero", "iterative_udp");
        assert_eq!(
            failed.encode(),
            b"RES:0;ERR:Division by zero;STYPE:iterative_udp;"
        );
    }

    #[test]
    fn requests_round_trip() {
        let values = [
            0.0,
            -0.0,
            1.5,
            -3.25,
            1e20,
            1.0e-7,
            123456.789,
            42.0,
            1.0 / 3.0,
            0.1 + 0.2,
            f64::MAX,
            f64::MIN_POSITIVE,
        ];
        for operation in [
            Operation::Add,
            Operation::Subtract,
            Operation::Multiply,
            Operation::Divide,
            Operation::Exit,
        ] {
            for (lhs, rhs) in values.iter().zip(values.iter().rev()) {
                let request = Request::new(operation, *lhs, *rhs);
                assert_eq!(Request::decode(&request.encode()).unwrap(), request);
            }
        }
    }

    #[test]
    fn responses_round_trip() {
        for response in [
            Response::ok(7.0, "reactor"),
            Response::ok(-0.5, "iterative_tcp"),
            Response::ok(1.0 / 3.0, "iterative_udp"),
            Response::ok(0.1 + 0.2, "concurrent_tcp_threads"),
            Response::ok(f64::MAX, "concurrent_udp_threads"),
            Response::ok(-f64::MAX, "concurrent_tcp_async"),
            Response::failed("Division by zero", "concurrent_udp_async"),
        ] {
            assert_eq!(Response::decode(&response.encode()).unwrap(), response);
        }
    }

    #[test]
    fn null_sentinel_is_no_error() {
        let response = Response::decode(b"RES:3;ERR:NULL;STYPE:x;").unwrap();
        assert_eq!(response.error, None);
        assert_eq!(Response::failed("", "x").error, None);
    }

    #[test]
    fn numbers_use_shortest_digits() {
        assert_eq!(format_number(7.0), "7");
        assert_eq!(format_number(15.7), "15.7");
        assert_eq!(format_number(-2.5), "-2.5");
        assert_eq!(format_number(1e20), "1e+20");
        assert_eq!(format_number(0.0001), "0.0001");
        assert_eq!(format_number(0.00001), "1e-05");
        assert_eq!(format_number(12345678901.0), "12345678901");
        assert_eq!(format_number(1.0 / 3.0), "0.3333333333333333");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_number(f64::MAX), "1.7976931348623157e+308");
        assert_eq!(format_number(f64::INFINITY), "inf");
    }

    #[test]
    fn malformed_requests_are_rejected() {
        let cases: [&[u8]; 11] = [
            b"",
            b"OP:ADD;OP1:1;",
            b"OP:ADD;OP2:1;OP1:2;",
            b"OP1:1;OP:ADD;OP2:2;",
            b"OP:XYZ;OP1:1;OP2:2;",
            b"OP:ADDX;OP1:1;OP2:2;",
            b"OP:ADD;OP1:1.5e;OP2:2;",
            b"OP:ADD;OP1:1;OP2:2",
            b"OP:ADD;OP1:;OP2:2;",
            b"OP:ADD;OP1:1;OP2:2;garbage",
            b"OP:ADD;OP1:\xff;OP2:2;",
        ];
        for case in cases {
            assert!(
                matches!(Request::decode(case), Err(CalcError::Format(_))),
                "accepted {:?}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let long_number = format!("OP:ADD;OP1:{};OP2:1;", "1".repeat(65));
        assert!(Request::decode(long_number.as_bytes()).is_err());

        let long_tag = format!("RES:1;ERR:NULL;STYPE:{};", "t".repeat(128));
        assert!(Response::decode(long_tag.as_bytes()).is_err());

        let huge = vec![b'1'; MAX_FRAME_LEN + 1];
        assert!(Request::decode(&huge).is_err());
    }

    #[test]
    fn malformed_responses_are_rejected() {
        assert!(Response::decode(b"RES:1;ERR:NULL;").is_err());
        assert!(Response::decode(b"RES:one;ERR:NULL;STYPE:x;").is_err());
        assert!(Response::decode(b"RES:1;ERR:;STYPE:x;").is_err());
        assert!(Response::decode(b"ERR:NULL;RES:1;STYPE:x;").is_err());
    }

    #[test]
    fn trailing_whitespace_is_tolerated() {
        assert!(Request::decode(b"OP:MUL;OP1:2;OP2:3;\r\n").is_ok());
    }

    #[test]
    fn encode_sanitizes_text_fields() {
        let response = Response::failed("bad; input", "tag;with;semicolons");
        let decoded = Response::decode(&response.encode()).unwrap();
        assert_eq!(decoded.error.as_deref(), Some("bad, input"));
        assert_eq!(decoded.server_tag, "tag,with,semicolons");
    }

    #[test]
    fn frame_len_waits_for_last_field() {
        assert_eq!(frame_len(b"OP:ADD;OP1:1;"), None);
        assert_eq!(frame_len(b"OP:ADD;OP1:1;OP2:2;OP:"), Some(19));
    }

    #[test]
    fn frame_reader_splits_stream() {
        let input = b"OP:ADD;OP1:1;OP2:2;\nOP:EXT;OP1:0;OP2:0;".to_vec();
        let mut reader = FrameReader::new(Cursor::new(input));
        assert_eq!(reader.read_frame().unwrap().unwrap(), b"OP:ADD;OP1:1;OP2:2;");
        assert_eq!(reader.read_frame().unwrap().unwrap(), b"OP:EXT;OP1:0;OP2:0;");
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn frame_reader_reports_truncation() {
        let mut reader = FrameReader::new(Cursor::new(b"OP:ADD;OP1:1".to_vec()));
        assert!(matches!(reader.read_frame(), Err(CalcError::Transport(_))));

        let mut reader = FrameReader::new(Cursor::new(vec![b'x'; 2048]));
        assert!(matches!(reader.read_frame(), Err(CalcError::Format(_))));
    }
}
