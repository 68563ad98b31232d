//! Error types specific to APDU responses

use super::status::StatusWord;

/// A response carried a status word other than 90 00
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Status error {status}: {}", status.description())]
pub struct StatusError {
    /// Status word that caused the error
    pub status: StatusWord,
}

impl StatusError {
    /// Create a new status error
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self {
            status: StatusWord::new(sw1, sw2),
        }
    }
}

/// Error for APDU response processing
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    /// Fewer than two bytes were received
    #[error("Incomplete response")]
    Incomplete,

    /// Non-success status word
    #[error(transparent)]
    Status(#[from] StatusError),
}
