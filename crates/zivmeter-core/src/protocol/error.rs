//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to the meter
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The serial port could not be opened or configured
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// A request could not be encoded
    #[error("Could not build request: {0}")]
    Build(String),

    /// No complete reply before the deadline
    #[error("No complete reply within {after_ms}ms")]
    Timeout {
        /// Configured reply timeout
        after_ms: u64,
    },

    /// Received bytes cannot form a valid reply
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The meter answered but the reply was rejected
    #[error("Meter reply rejected with code {0}")]
    Parse(i32),

    /// A logical name does not parse
    #[error("Invalid logical name: {0}")]
    InvalidLogicalName(String),

    /// The step produced no request bytes
    #[error("Nothing queued for transmission")]
    EmptyRequest,

    /// Transport read or write failed
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error stems from the link rather than from the meter's answer
    pub fn is_link_fault(&self) -> bool {
        matches!(
            self,
            ProtocolError::SerialError(_)
                | ProtocolError::Timeout { .. }
                | ProtocolError::MalformedFrame(_)
                | ProtocolError::IoError(_)
        )
    }
}
