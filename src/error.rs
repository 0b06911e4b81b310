//! Error types for the multidrop library.

use thiserror::Error;

/// The main error type for multidrop operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport is not connected.
    #[error("not connected")]
    NotConnected,

    /// No response was observed inside the protocol window.
    #[error("command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The reply did not have the expected structure.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The instrument explicitly rejected the command.
    #[error("command rejected by instrument (NAK)")]
    Nak,

    /// The instrument reported a syntax error for the command.
    #[error("instrument reported an invalid command")]
    InvalidCommand,

    /// A caller-supplied value is outside the documented range.
    ///
    /// Raised before anything is written to the transport.
    #[error("{name} = {value} is out of range [{min}, {max}]")]
    ValueOutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// The address is not valid for the instrument family.
    #[error("invalid bus address: {address}")]
    UnknownAddress { address: String },
}

/// Reply decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The echoed line differs from what was sent.
    #[error("echo mismatch: sent {sent:?}, received {received:?}")]
    EchoMismatch { sent: String, received: String },

    /// The reply does not match the expected shape, digits or symbols.
    #[error("unexpected response: {response:?}")]
    UnexpectedResponse { response: String },

    /// The unit suffix of a numeric field is not the expected one.
    #[error("unexpected unit: expected {expected:?}, got {got:?}")]
    UnexpectedUnit { expected: String, got: String },
}

impl ParseError {
    /// Shorthand for [`ParseError::UnexpectedResponse`].
    pub(crate) fn unexpected(response: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            response: response.into(),
        }
    }
}

/// Result type alias for multidrop operations.
pub type Result<T> = std::result::Result<T, Error>;
