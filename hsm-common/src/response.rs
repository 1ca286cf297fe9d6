//! # Response Convention
//!
//! Decoded responses keep their frame header so downstream code can
//! slice fields at fixed offsets. Every command built on this client
//! shares the same body layout:
//!
//! ```text
//! +--------------+-------------------+-----------------+-----------+
//! | header: W    | response code: 2  | error code: 2   | payload   |
//! +--------------+-------------------+-----------------+-----------+
//!
//! "000CNP00DEADBEEF" => response "NP", error "00", payload "DEADBEEF"
//! ```

use std::fmt;

/// Error code the HSM returns when a command succeeded.
pub const ERROR_CODE_OK: &str = "00";

/// Full decoded response frame (header + body).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    raw: String,
    header_width: usize,
}

/// Fields of a response body, borrowed from the raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFields<'a> {
    pub response_code: &'a str,
    pub error_code: &'a str,
    pub payload: &'a str,
}

impl ResponseFields<'_> {
    /// True when the response code matches and the error code is `00`.
    pub fn is_success(&self, expected_code: &str) -> bool {
        self.response_code == expected_code && self.error_code == ERROR_CODE_OK
    }
}

impl Response {
    /// Wraps a decoded frame. `header_width` must match the codec used.
    pub fn new(raw: String, header_width: usize) -> Self {
        Response { raw, header_width }
    }

    /// The frame exactly as received.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn into_string(self) -> String {
        self.raw
    }

    pub fn header(&self) -> &str {
        self.raw.get(..self.header_width).unwrap_or(&self.raw)
    }

    pub fn body(&self) -> &str {
        self.raw.get(self.header_width..).unwrap_or("")
    }

    /// Splits the body into response code, error code and payload.
    ///
    /// Returns `None` when the body is shorter than the two code fields.
    pub fn fields(&self) -> Option<ResponseFields<'_>> {
        let body = self.body();
        Some(ResponseFields {
            response_code: body.get(0..2)?,
            error_code: body.get(2..4)?,
            payload: body.get(4..)?,
        })
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl AsRef<str> for Response {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}
