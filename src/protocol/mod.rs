//! Protocol definitions shared by all instrument families.
//!
//! This module contains:
//! - Port framing (terminators, single-byte polling window)
//! - Response units and the shape a command expects next
//! - The [`Command`] trait implemented by each family's command enum
//! - Field decoding/encoding helpers in [`parser`]

pub mod parser;

use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Acknowledge byte.
pub const ACK: u8 = 0x06;

/// Negative-acknowledge byte.
pub const NAK: u8 = 0x15;

/// Carriage return, the command terminator of every supported family.
pub const CR: &[u8] = b"\r";

/// Carriage return + line feed.
pub const CRLF: &[u8] = b"\r\n";

/// Per-port framing rules, fixed for the lifetime of a [`Chain`](crate::Chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    /// Appended to every encoded command.
    pub command_terminator: &'static [u8],
    /// Terminates line-shaped replies.
    pub response_terminator: &'static [u8],
    /// Deadline for a single-byte reply.
    pub byte_timeout: Duration,
    /// Interval between single-byte read attempts.
    pub poll_interval: Duration,
    /// Bare byte sent instead of a line when the command has a syntax error.
    pub syntax_error_byte: Option<u8>,
    /// Strip leading/trailing spaces from lines before decoding.
    pub strip_padding: bool,
}

impl Framing {
    /// Ismatec MCP pumps: `\r` out, `\r\n` back, `#` on syntax error.
    pub const MCP: Self = Self {
        command_terminator: CR,
        response_terminator: CRLF,
        byte_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(10),
        syntax_error_byte: Some(b'#'),
        strip_padding: true,
    };

    /// Hamilton MVP valve positioners: `\r` both ways.
    pub const MVP: Self = Self {
        command_terminator: CR,
        response_terminator: CR,
        byte_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(10),
        syntax_error_byte: None,
        strip_padding: true,
    };
}

/// Kind of the next response unit a command expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// One raw byte, no terminator.
    Byte,
    /// One line up to the port's response terminator.
    Line,
}

/// One unit read back from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseUnit {
    /// A raw byte.
    Byte(u8),
    /// A line, terminator removed.
    Line(String),
}

impl ResponseUnit {
    /// The unit rendered for diagnostics.
    #[must_use]
    pub fn to_lossy_string(&self) -> String {
        match self {
            Self::Byte(b) => char::from(*b).to_string(),
            Self::Line(line) => line.clone(),
        }
    }
}

impl fmt::Display for ResponseUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Byte(b) => write!(f, "byte 0x{b:02x}"),
            Self::Line(line) => write!(f, "line {line:?}"),
        }
    }
}

/// What the dispatcher should do after feeding units to a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<R> {
    /// Read another unit of the given kind.
    Read(UnitKind),
    /// The exchange is complete.
    Done(R),
}

/// A single outbound instruction plus the rules for decoding its reply.
///
/// Implementations are pure: they never touch the transport. The
/// dispatcher calls [`Command::advance`] with the units received so far
/// (starting with none) until it returns [`Step::Done`]. Each call must
/// validate the newest unit, so structural errors surface as soon as they
/// are visible and a decoded reply is produced only once every unit has
/// been checked.
pub trait Command: fmt::Debug {
    /// Decoded reply type.
    type Reply;

    /// Wire form of the command, without terminator.
    fn encode(&self) -> String;

    /// Validates `units` and decides whether more are needed.
    fn advance(&self, units: &[ResponseUnit]) -> Result<Step<Self::Reply>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_nak_values() {
        assert_eq!(ACK, 0x06);
        assert_eq!(NAK, 0x15);
    }

    #[test]
    fn test_family_framing() {
        assert_eq!(Framing::MCP.command_terminator, b"\r");
        assert_eq!(Framing::MCP.response_terminator, b"\r\n");
        assert_eq!(Framing::MCP.syntax_error_byte, Some(b'#'));
        assert_eq!(Framing::MVP.response_terminator, b"\r");
        assert_eq!(Framing::MVP.byte_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_response_unit_display() {
        assert_eq!(ResponseUnit::Byte(ACK).to_string(), "byte 0x06");
        assert_eq!(ResponseUnit::Line("1a".into()).to_string(), "line \"1a\"");
        assert_eq!(ResponseUnit::Byte(b'*').to_lossy_string(), "*");
    }
}
