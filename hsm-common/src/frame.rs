//! # Frame Codec
//!
//! Purpose: Encode HSM commands and decode HSM responses using the
//! length-prefixed ASCII framing spoken on the wire.
//!
//! ## Design Principles
//! 1. **Stateless Codec**: `FrameCodec` only carries the header width, so a
//!    single instance is shared by every connection.
//! 2. **Buffer Reuse**: `encode_into` appends to a caller-owned buffer.
//! 3. **Byte-Exact**: Decoded responses keep the header and body untouched.
//! 4. **Fail Fast**: Malformed headers are rejected before any body read.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+---------------------------+
//! | header: W hex digits | body: len(body) ASCII     |
//! +----------------------+---------------------------+
//!
//! "NC" with W = 4  =>  "0002NC"
//! ```

use std::io::{ErrorKind, Read};

use crate::error::{FrameError, FrameResult};

/// Canonical header width in hex digits.
pub const DEFAULT_HEADER_WIDTH: u8 = 4;

/// Widest header supported; keeps the body length inside `u32`.
pub const MAX_HEADER_WIDTH: u8 = 8;

/// Upper bound on response bodies. This is a sanity limit, not a
/// protocol one: a 4-digit header could announce up to 65535 bytes.
pub const MAX_RESPONSE_BODY: usize = 10_000;

/// Encoder/decoder for the hex-length-prefixed frame format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    width: u8,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(DEFAULT_HEADER_WIDTH)
    }
}

impl FrameCodec {
    /// Creates a codec with `width` hex digits of header.
    ///
    /// The width is clamped into `1..=MAX_HEADER_WIDTH`.
    pub fn new(width: u8) -> Self {
        FrameCodec {
            width: width.clamp(1, MAX_HEADER_WIDTH),
        }
    }

    /// Header width in bytes.
    pub fn width(&self) -> usize {
        self.width as usize
    }

    /// Largest body length the header can represent (`16^W - 1`),
    /// saturated to `usize::MAX` on narrow targets.
    pub fn max_body_len(&self) -> usize {
        let max = (1u64 << (4 * u32::from(self.width))) - 1;
        usize::try_from(max).unwrap_or(usize::MAX)
    }

    /// Formats the uppercase, zero-padded header for `len` body bytes.
    pub fn header_for(&self, len: usize) -> String {
        format!("{:0width$X}", len, width = self.width())
    }

    /// Encodes `command` into a freshly allocated frame.
    pub fn encode(&self, command: &str) -> FrameResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.width() + command.len());
        self.encode_into(command, &mut out)?;
        Ok(out)
    }

    /// Appends the framed `command` to `out`.
    ///
    /// `out` is left untouched when the command cannot be encoded.
    pub fn encode_into(&self, command: &str, out: &mut Vec<u8>) -> FrameResult<()> {
        if !command.is_ascii() {
            return Err(FrameError::NonAscii);
        }
        let max = self.max_body_len();
        if command.len() > max {
            return Err(FrameError::BodyTooLong {
                len: command.len(),
                max,
            });
        }
        out.extend_from_slice(self.header_for(command.len()).as_bytes());
        out.extend_from_slice(command.as_bytes());
        Ok(())
    }

    /// Reads one response frame from `reader`.
    ///
    /// Returns header and body as a single string. Consumes exactly
    /// `W + body_len` bytes on success.
    pub fn decode<R: Read>(&self, reader: &mut R) -> FrameResult<String> {
        let mut header = vec![0u8; self.width()];
        let read = read_full(reader, &mut header)?;
        if read < header.len() {
            return Err(FrameError::Truncated {
                expected: header.len(),
                read,
            });
        }

        let length = parse_header(&header)?;
        if length == 0 || length > MAX_RESPONSE_BODY {
            return Err(FrameError::InvalidLength { length });
        }

        let mut body = vec![0u8; length];
        let read = read_full(reader, &mut body)?;
        if read < length {
            return Err(FrameError::Truncated {
                expected: length,
                read,
            });
        }

        header.extend_from_slice(&body);
        Ok(String::from_utf8_lossy(&header).into_owned())
    }

    /// Checks whether `src` starts with a complete frame.
    ///
    /// Returns `Ok(Some(total_len))` for a complete frame and `Ok(None)`
    /// when more bytes are needed. Bodies longer than `max_body` fail with
    /// `InvalidLength`; empty bodies are accepted. Used by stream servers
    /// that buffer partial reads.
    pub fn frame_len(&self, src: &[u8], max_body: usize) -> FrameResult<Option<usize>> {
        let width = self.width();
        if src.len() < width {
            return Ok(None);
        }
        let length = parse_header(&src[..width])?;
        if length > max_body {
            return Err(FrameError::InvalidLength { length });
        }
        let total = width + length;
        if src.len() < total {
            return Ok(None);
        }
        Ok(Some(total))
    }
}

fn parse_header(header: &[u8]) -> FrameResult<usize> {
    let mut value = 0usize;
    for &b in header {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => {
                return Err(FrameError::BadHeader {
                    header: String::from_utf8_lossy(header).into_owned(),
                })
            }
        };
        value = (value << 4) | digit as usize;
    }
    Ok(value)
}

// Like `read_exact`, but reports how many bytes arrived before EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> FrameResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(filled)
}
