//! Output helpers for the CIE CLI

pub(crate) mod reader;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use clap::ValueEnum;

/// How binary results are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum Encoding {
    /// Lowercase hexadecimal
    Hex,
    /// Standard padded base64
    Base64,
    /// URL-safe base64 without padding
    Base64url,
}

impl Encoding {
    pub(crate) fn encode(self, data: &[u8]) -> String {
        match self {
            Self::Hex => hex::encode(data),
            Self::Base64 => STANDARD.encode(data),
            Self::Base64url => URL_SAFE_NO_PAD.encode(data),
        }
    }
}

/// Decode a challenge given as hex, falling back to base64
pub(crate) fn decode_challenge(input: &str) -> eyre::Result<Vec<u8>> {
    let input = input.trim();
    if let Ok(bytes) = hex::decode(input.trim_start_matches("0x")) {
        return Ok(bytes);
    }
    STANDARD
        .decode(input)
        .or_else(|_| URL_SAFE_NO_PAD.decode(input))
        .map_err(|_| eyre::eyre!("Challenge must be hex or base64"))
}
