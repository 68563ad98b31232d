//! Success payloads of the orchestrators

use crate::atr::CardProfile;

/// ATR and detected card profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributesResult {
    /// Raw ATR as stored in EF.ATR
    pub atr: Vec<u8>,
    /// Profile matched by the classifier
    pub card_profile: CardProfile,
}

/// Outcome of the PIN authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationResult {
    /// URL the caller continues the login flow with
    pub redirect_url: String,
}

/// Data bundle of the internal authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalAuthResult {
    /// Identification number of the chip
    pub nis: Vec<u8>,
    /// Internal-authentication public key file
    pub public_key: Vec<u8>,
    /// Security object of the CIE application
    pub sod: Vec<u8>,
    /// Challenge signed by the chip
    pub signed_challenge: Vec<u8>,
}

/// eMRTD data groups read under PACE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MrtdResult {
    /// DG1, the machine readable zone
    pub dg1: Vec<u8>,
    /// DG11, additional personal details
    pub dg11: Vec<u8>,
    /// Document security object
    pub sod: Vec<u8>,
}

/// Internal authentication bundle together with the eMRTD data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalAuthAndMrtdResult {
    /// Internal authentication part
    pub nis_data: InternalAuthResult,
    /// eMRTD part
    pub mrtd_data: MrtdResult,
}

/// Holder details from the user authentication certificate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateResult {
    /// Given name
    pub name: Option<String>,
    /// Surname
    pub surname: Option<String>,
    /// Italian fiscal code
    pub fiscal_code: Option<String>,
    /// Serial number of the card
    pub doc_serial_number: Option<String>,
}

/// Exactly one of these is produced per successful operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// See [`AttributesResult`]
    Attributes(AttributesResult),
    /// See [`AuthenticationResult`]
    Authentication(AuthenticationResult),
    /// See [`InternalAuthResult`]
    InternalAuth(InternalAuthResult),
    /// See [`MrtdResult`]
    Mrtd(MrtdResult),
    /// See [`InternalAuthAndMrtdResult`]
    InternalAuthAndMrtd(InternalAuthAndMrtdResult),
    /// See [`CertificateResult`]
    Certificate(CertificateResult),
}

impl ReadResult {
    /// Name of the success event the bridges emit for this result
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Attributes(_) => "onAttributesSuccess",
            Self::Authentication(_) => "onSuccess",
            Self::InternalAuth(_) => "onInternalAuthenticationSuccess",
            Self::Mrtd(_) => "onMRTDWithPaceSuccess",
            Self::InternalAuthAndMrtd(_) => "onInternalAuthAndMRTDWithPaceSuccess",
            Self::Certificate(_) => "onCertificateSuccess",
        }
    }
}
