//! Input validation performed before anything is sent to the card
//!
//! Every `start_*` operation runs these checks synchronously, so a malformed PIN, CAN or URL
//! never produces a single APDU.

use tracing::warn;
use url::Url;

/// Length of the CIE PIN
pub const PIN_LENGTH: usize = 8;

/// Length of the Card Access Number printed on the card
pub const CAN_LENGTH: usize = 6;

/// Error type for input validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The PIN is not exactly eight digits
    #[error("PIN must be exactly {PIN_LENGTH} digits")]
    InvalidPin,

    /// The CAN is not exactly six digits
    #[error("CAN must be exactly {CAN_LENGTH} digits")]
    InvalidCan,

    /// The authentication or IdP URL could not be used
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The input was not the expected length
    #[error("Input has incorrect length: expected at most {max}, got {actual}")]
    IncorrectLength {
        /// Largest accepted length
        max: usize,
        /// Actual length
        actual: usize,
    },

    /// Empty challenge for internal authentication
    #[error("Challenge must not be empty")]
    EmptyChallenge,
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

fn is_digits(input: &str, len: usize) -> bool {
    input.len() == len && input.bytes().all(|b| b.is_ascii_digit())
}

/// Validates a PIN: exactly eight ASCII digits
pub fn validate_pin(pin: &str) -> ValidationResult<()> {
    if !is_digits(pin, PIN_LENGTH) {
        warn!(len = pin.len(), "Rejected malformed PIN");
        return Err(ValidationError::InvalidPin);
    }
    Ok(())
}

/// Validates a Card Access Number: exactly six ASCII digits
pub fn validate_can(can: &str) -> ValidationResult<()> {
    if !is_digits(can, CAN_LENGTH) {
        warn!(len = can.len(), "Rejected malformed CAN");
        return Err(ValidationError::InvalidCan);
    }
    Ok(())
}

/// Parses a URL and requires an `https` or `http` scheme with a host
pub fn validate_url(url: &str) -> ValidationResult<Url> {
    let parsed = Url::parse(url).map_err(|e| ValidationError::InvalidUrl(e.to_string()))?;
    if !matches!(parsed.scheme(), "https" | "http") {
        return Err(ValidationError::InvalidUrl(format!(
            "unsupported scheme {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ValidationError::InvalidUrl("missing host".to_string()));
    }
    Ok(parsed)
}

/// Validates an internal authentication challenge
///
/// The challenge is signed raw by the chip, so it has to fit one RSA block with PKCS#1 padding.
pub fn validate_challenge(challenge: &[u8]) -> ValidationResult<()> {
    const MAX_CHALLENGE: usize = 117;
    match challenge.len() {
        0 => Err(ValidationError::EmptyChallenge),
        n if n > MAX_CHALLENGE => Err(ValidationError::IncorrectLength {
            max: MAX_CHALLENGE,
            actual: n,
        }),
        _ => Ok(()),
    }
}
