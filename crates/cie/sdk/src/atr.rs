//! Card family detection from the ATR
//!
//! Each known chip family is identified by a byte signature that must appear in the ATR as an
//! ordered, not necessarily contiguous, subsequence. Signatures are tried in priority order and
//! the first match wins.

use derive_more::Display;
use tracing::debug;

/// Chip vendor or family of a CIE
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CardProfile {
    /// NXP chip
    #[display("NXP")]
    Nxp,
    /// Gemalto chip, first generation
    #[display("GEMALTO")]
    Gemalto,
    /// Gemalto chip, second generation
    #[display("GEMALTO_2")]
    Gemalto2,
    /// STMicroelectronics chip
    #[display("ST")]
    St,
    /// Actalis chip
    #[display("ACTALIS")]
    Actalis,
    /// No known signature matched
    #[display("UNKNOWN")]
    Unknown,
}

const ACTALIS: &[u8] = &[
    0x80, 0x00, 0x43, 0x01, 0xB8, 0x46, 0x04, 0x10, 0x10, 0x10, 0x10, 0x47, 0x03, 0x94, 0x01,
    0xE0, 0x7F, 0x66, 0x08, 0x02, 0x02, 0x04, 0xD6, 0x02, 0x02, 0x07, 0xE3, 0xE0, 0x10, 0x02,
    0x02, 0x01, 0x04, 0x02, 0x02, 0x00, 0xE6, 0x02, 0x02, 0x00, 0xE6, 0x02, 0x02, 0x00, 0xE6,
    0x78, 0x08, 0x06, 0x06, 0x2B, 0x81, 0x22, 0xF8, 0x78, 0x02,
];

const ST: &[u8] = &[
    0x80, 0x00, 0x43, 0x01, 0xB9, 0x46, 0x04, 0x00, 0x00, 0x00, 0x10, 0x47, 0x03, 0x94, 0x01,
    0x81, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x00, 0x95, 0x00, 0x00, 0x00, 0x00, 0x8A, 0x00, 0x01,
    0xE0, 0x10, 0x02, 0x02, 0x00, 0xFF, 0x02, 0x02, 0x00, 0xFF, 0x02, 0x02, 0x01, 0x00, 0x02,
    0x02, 0x01, 0x00, 0x78, 0x08, 0x06, 0x06, 0x2B, 0x81, 0x22, 0xF8, 0x78, 0x02, 0x82, 0x02,
    0x90, 0x00,
];

const NXP: &[u8] = &[
    0x80, 0x00, 0x43, 0x01, 0xB8, 0x46, 0x04, 0x10, 0x10, 0x10, 0x10, 0x47, 0x03, 0x94,
];

const GEMALTO_2: &[u8] = &[0x47, 0x03, 0x94, 0x41, 0xC0];

/// "IasEccRoot"
const GEMALTO: &[u8] = &[0x49, 0x61, 0x73, 0x45, 0x63, 0x63, 0x52, 0x6F, 0x6F, 0x74];

/// Signatures in priority order
const SIGNATURES: &[(CardProfile, &[u8])] = &[
    (CardProfile::Actalis, ACTALIS),
    (CardProfile::St, ST),
    (CardProfile::Nxp, NXP),
    (CardProfile::Gemalto2, GEMALTO_2),
    (CardProfile::Gemalto, GEMALTO),
];

impl CardProfile {
    /// Signature bytes of this profile, empty for [`CardProfile::Unknown`]
    pub fn signature(self) -> &'static [u8] {
        SIGNATURES
            .iter()
            .find(|(profile, _)| *profile == self)
            .map_or(&[], |(_, signature)| *signature)
    }
}

/// Whether `signature` occurs in `atr` as an ordered subsequence
fn is_subsequence(signature: &[u8], atr: &[u8]) -> bool {
    let mut remaining = atr.iter();
    signature
        .iter()
        .all(|byte| remaining.any(|candidate| candidate == byte))
}

/// Classify an ATR, never fails
pub fn classify(atr: &[u8]) -> CardProfile {
    let profile = SIGNATURES
        .iter()
        .find(|(_, signature)| is_subsequence(signature, atr))
        .map_or(CardProfile::Unknown, |(profile, _)| *profile);
    debug!(atr = %hex::encode(atr), %profile, "Classified ATR");
    profile
}
