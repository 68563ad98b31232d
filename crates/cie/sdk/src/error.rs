//! Protocol error taxonomy
//!
//! [`ProtocolError`] is the single terminal error of every operation. Each variant carries the
//! event name the mobile bridges report, so front ends can forward it without a mapping table.

use cie_apdu_core::{Error as ApduCoreError, StatusWord, TransportError};

use crate::validation::ValidationError;

/// Result type alias for protocol operations
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Terminal error of a CIE operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The tag answered but is not a CIE
    #[error("The card is not a CIE")]
    NotACard,

    /// The radio link or reader connection dropped
    #[error("Connection with the card lost")]
    TagLost,

    /// `stop_reading` was called while the operation was running
    #[error("Operation cancelled by the user")]
    CancelledByUser,

    /// Malformed response, unexpected status word or secure messaging failure
    #[error("APDU error: {0}")]
    ApduError(String),

    /// The card rejected the PIN
    #[error("Wrong PIN, {0} attempts left")]
    WrongPin(u8),

    /// The PIN is blocked, no further attempts are possible on this card
    #[error("Card blocked")]
    CardBlocked,

    /// A certificate is outside its validity window
    #[error("Certificate expired")]
    CertificateExpired,

    /// A certificate is revoked, untrusted or carries a bad signature
    #[error("Certificate revoked")]
    CertificateRevoked,

    /// The identity provider refused the assertion or could not be reached
    #[error("Authentication error: {0}")]
    NetworkAuthError(String),

    /// Any other failure
    #[error("{0}")]
    GenericError(String),

    /// The operation deadline elapsed
    #[error("Operation timed out")]
    Timeout,

    /// Local validation rejected the input before contacting the card
    #[error(transparent)]
    InvalidInput(#[from] ValidationError),

    /// Another operation owns the reader
    #[error("Another operation is already in progress")]
    AlreadyInProgress,
}

impl ProtocolError {
    /// Create an APDU error
    pub fn apdu<S: Into<String>>(message: S) -> Self {
        Self::ApduError(message.into())
    }

    /// Create a generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::GenericError(message.into())
    }

    /// APDU error for an unexpected status word
    pub fn status(context: &str, status: StatusWord) -> Self {
        Self::ApduError(format!("{context}: {status} ({})", status.description()))
    }

    /// Event name used by the bridges
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NotACard => "NOT_A_CIE",
            Self::TagLost => "TAG_LOST",
            Self::CancelledByUser => "CANCELLED_BY_USER",
            Self::ApduError(_) => "APDU_ERROR",
            Self::WrongPin(_) => "WRONG_PIN",
            Self::CardBlocked => "CARD_BLOCKED",
            Self::CertificateExpired => "CERTIFICATE_EXPIRED",
            Self::CertificateRevoked => "CERTIFICATE_REVOKED",
            Self::NetworkAuthError(_) => "AUTHENTICATION_ERROR",
            Self::GenericError(_) => "GENERIC_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::InvalidInput(ValidationError::InvalidPin) => "PIN_REGEX_NOT_VALID",
            Self::InvalidInput(ValidationError::InvalidUrl(_)) => "INVALID_AUTH_URL",
            Self::InvalidInput(_) => "GENERIC_ERROR",
            Self::AlreadyInProgress => "THREADING_ERROR",
        }
    }

    /// Remaining PIN attempts, only for [`ProtocolError::WrongPin`]
    pub const fn attempts_left(&self) -> Option<u8> {
        match self {
            Self::WrongPin(n) => Some(*n),
            _ => None,
        }
    }

    /// Whether the error belongs to the transport category
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::TagLost | Self::Timeout | Self::CancelledByUser)
    }
}

impl From<TransportError> for ProtocolError {
    fn from(error: TransportError) -> Self {
        match error {
            e if e.is_link_lost() => Self::TagLost,
            TransportError::Timeout => Self::Timeout,
            TransportError::Cancelled => Self::CancelledByUser,
            other => Self::GenericError(other.to_string()),
        }
    }
}

impl From<ApduCoreError> for ProtocolError {
    fn from(error: ApduCoreError) -> Self {
        match error {
            ApduCoreError::Transport(e) => e.into(),
            ApduCoreError::Response(e) => Self::ApduError(e.to_string()),
            ApduCoreError::Status { status } => Self::status("Unexpected status", status),
            other => Self::GenericError(other.to_string()),
        }
    }
}

impl From<iso7816_tlv::TlvError> for ProtocolError {
    fn from(error: iso7816_tlv::TlvError) -> Self {
        Self::ApduError(format!("Malformed TLV: {error}"))
    }
}
