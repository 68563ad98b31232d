//! Core error type for all APDU operations
//!
//! This module provides a centralized error type used throughout the cie_apdu_core crate.
//! Transport and response errors convert into it so callers can bubble any failure with `?`.

use crate::response::error::{ResponseError, StatusError};
use crate::response::status::StatusWord;
use crate::transport::TransportError;

/// Result type alias using the crate error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Core error type that encompasses all possible errors in the crate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error raised by the transport layer
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Error raised while parsing a response
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// Invalid command length
    #[error("Invalid command length: {0}")]
    InvalidCommandLength(usize),

    /// Status error from response
    #[error("Status error {status}: {}", status.description())]
    Status {
        /// Status word that caused the error
        status: StatusWord,
    },
}

impl Error {
    /// Create a new status error
    pub const fn status(sw1: u8, sw2: u8) -> Self {
        Self::Status {
            status: StatusWord::new(sw1, sw2),
        }
    }

    /// Get the status word carried by this error, if any
    pub const fn status_word(&self) -> Option<StatusWord> {
        match self {
            Self::Status { status } => Some(*status),
            Self::Response(ResponseError::Status(e)) => Some(e.status),
            _ => None,
        }
    }
}

impl From<StatusError> for Error {
    fn from(error: StatusError) -> Self {
        Self::Status {
            status: error.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_display() {
        let err = Error::status(0x6A, 0x82);
        assert_eq!(err.status_word(), Some(StatusWord::new(0x6A, 0x82)));
        assert_eq!(err.to_string(), "Status error 6A 82: File not found");

        let err: Error = StatusError::new(0x69, 0x83).into();
        assert_eq!(err.status_word(), Some(StatusWord::new(0x69, 0x83)));
    }

    #[test]
    fn test_transport_error_converts() {
        let err: Error = TransportError::CardRemoved.into();
        assert!(matches!(err, Error::Transport(TransportError::CardRemoved)));
        assert_eq!(err.status_word(), None);
    }
}
