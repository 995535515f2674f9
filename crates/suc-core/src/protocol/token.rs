//! Response unit classification.
//!
//! The device answers commands with NUL-terminated ASCII tokens. This module
//! turns one raw response unit into a typed value.

use std::fmt;

use super::constants::{CMD_ACKNOWLEDGMENT, CMD_POSTAMBLE, TOKEN_TERMINATOR};

/// One response unit read from the device.
#[derive(Clone, PartialEq, Eq)]
pub enum Response {
    /// `AcKnOwLeDgMeNt\0`
    Acknowledgment,
    /// `PoStAmBlE\0`
    Postamble,
    /// Nothing arrived before the read timed out.
    Empty,
    /// Anything else, kept verbatim for diagnostics.
    Other(Vec<u8>),
}

impl Response {
    /// Classify a response unit. Tokens must match exactly, terminator included.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            Response::Empty
        } else if is_token(bytes, CMD_ACKNOWLEDGMENT) {
            Response::Acknowledgment
        } else if is_token(bytes, CMD_POSTAMBLE) {
            Response::Postamble
        } else {
            Response::Other(bytes.to_vec())
        }
    }

    /// Acknowledgment or postamble, the two answers a command accepts.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Response::Acknowledgment | Response::Postamble)
    }

    /// Get ASCII representation, non-printable bytes shown as '.'.
    pub fn as_ascii(&self) -> String {
        match self {
            Response::Acknowledgment => String::from_utf8_lossy(CMD_ACKNOWLEDGMENT).into_owned(),
            Response::Postamble => String::from_utf8_lossy(CMD_POSTAMBLE).into_owned(),
            Response::Empty => String::new(),
            Response::Other(bytes) => bytes
                .iter()
                .take(32)
                .map(|&b| {
                    if b.is_ascii_graphic() || b == b' ' {
                        b as char
                    } else {
                        '.'
                    }
                })
                .collect(),
        }
    }
}

/// Exact token match: `token` followed by a single NUL and nothing else.
pub fn is_token(bytes: &[u8], token: &[u8]) -> bool {
    bytes.len() == token.len() + 1
        && bytes.starts_with(token)
        && bytes[token.len()] == TOKEN_TERMINATOR
}

/// Lenient match used for the handshake, which only checks the token prefix.
pub fn starts_with_token(bytes: &[u8], token: &[u8]) -> bool {
    bytes.starts_with(token)
}

/// Append the wire terminator to a command.
pub fn terminated(command: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(command.len() + 1);
    out.extend_from_slice(command);
    out.push(TOKEN_TERMINATOR);
    out
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Other(bytes) => {
                write!(f, "Response::Other({} bytes '{}')", bytes.len(), self.as_ascii())
            }
            other => write!(f, "Response::{}", other),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Empty => write!(f, "<empty>"),
            _ => write!(f, "{}", self.as_ascii()),
        }
    }
}
