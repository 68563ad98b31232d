//! Application selection, file reading, PIN verification and on-card signatures
//!
//! Every exchange goes through [`Session::send`], so it is protected once a secure channel is
//! established and plain before.

use std::collections::HashSet;

use bytes::Bytes;
use cie_apdu_core::{Command, Response, StatusWord};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::events::ProtocolStep;
use crate::session::Session;
use crate::validation::validate_pin;

/// IAS application
pub const AID_IAS: &[u8] = &[
    0xA0, 0x00, 0x00, 0x00, 0x30, 0x80, 0x00, 0x00, 0x00, 0x09, 0x81, 0x60, 0x01,
];
/// CIE application
pub const AID_CIE: &[u8] = &[0xA0, 0x00, 0x00, 0x00, 0x00, 0x39];
/// eMRTD application
pub const AID_MRTD: &[u8] = &[0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x01];

/// Master file
pub const FID_MF: [u8; 2] = [0x3F, 0x00];
/// EF.ATR in the master file
pub const FID_ATR: [u8; 2] = [0x2F, 0x01];
/// Identification number of the chip
pub const FID_NIS: [u8; 2] = [0x10, 0x01];
/// Card serial number
pub const FID_SERIAL: [u8; 2] = [0x10, 0x02];
/// User authentication certificate
pub const FID_USER_CERTIFICATE: [u8; 2] = [0x10, 0x03];
/// Internal authentication public key
pub const FID_INT_AUTH_KEY: [u8; 2] = [0x10, 0x04];
/// Chip CV certificate
pub const FID_CHIP_CERTIFICATE: [u8; 2] = [0x10, 0x05];
/// Security object of the CIE application
pub const FID_SOD: [u8; 2] = [0x10, 0x06];
/// eMRTD DG1
pub const FID_DG1: [u8; 2] = [0x01, 0x01];
/// eMRTD DG11
pub const FID_DG11: [u8; 2] = [0x01, 0x0B];
/// eMRTD document security object
pub const FID_MRTD_SOD: [u8; 2] = [0x01, 0x1D];

/// Largest READ BINARY chunk, keeps protected responses within a short APDU
pub const MAX_READ_CHUNK: u8 = 0xDF;

const MAX_OFFSET: usize = 0x7FFF;

/// Key reference of the authentication key used for signatures
const SIGNATURE_KEY_REFERENCE: u8 = 0x81;
/// PKCS#1 v1.5 with a caller supplied DigestInfo
const SIGNATURE_ALGORITHM: u8 = 0x02;

/// DER prefix of a SHA-256 DigestInfo
pub const SHA256_DIGEST_INFO_PREFIX: &[u8] = &[
    0x30, 0x31, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05,
    0x00, 0x04, 0x20,
];

/// Require a 9000 status, returning the payload
pub(crate) fn expect_success(response: Response, context: &str) -> Result<Bytes> {
    if response.is_success() {
        return Ok(response.payload().cloned().unwrap_or_default());
    }
    Err(ProtocolError::status(context, response.status()))
}

/// SELECT an application by AID
pub fn select_application(session: &mut Session, aid: &[u8]) -> Result<StatusWord> {
    let command = Command::new_with_data(0x00, 0xA4, 0x04, 0x0C, aid.to_vec());
    let response = session.send(&command)?;
    debug!(aid = %hex::encode_upper(aid), status = %response.status(), "Select application");
    Ok(response.status())
}

/// SELECT the master file
pub fn select_root(session: &mut Session) -> Result<()> {
    session.emit(ProtocolStep::SelectRoot);
    let command = Command::new_with_data(0x00, 0xA4, 0x00, 0x0C, FID_MF.to_vec());
    expect_success(session.send(&command)?, "Select master file").map(drop)
}

/// SELECT an elementary file by identifier
pub fn select_file(session: &mut Session, fid: [u8; 2]) -> Result<()> {
    let command = Command::new_with_data(0x00, 0xA4, 0x02, 0x0C, fid.to_vec());
    let response = session.send(&command)?;
    expect_success(response, &format!("Select file {}", hex::encode_upper(fid))).map(drop)
}

/// READ BINARY the current file until its end
pub fn read_binary(session: &mut Session) -> Result<Vec<u8>> {
    let mut content = Vec::new();
    loop {
        if content.len() > MAX_OFFSET {
            return Err(ProtocolError::apdu("File exceeds the addressable size"));
        }
        let [hi, lo] = (content.len() as u16).to_be_bytes();
        let command = Command::new_with_le(0x00, 0xB0, hi, lo, u32::from(MAX_READ_CHUNK));
        let response = session.send(&command)?;
        let status = response.status();
        let chunk = response.data();

        if status.is_success() {
            content.extend_from_slice(chunk);
            if chunk.len() < usize::from(MAX_READ_CHUNK) {
                break;
            }
        } else if status.is_end_of_file() {
            // 6B 00 also lands here when the size is a multiple of the chunk
            content.extend_from_slice(chunk);
            break;
        } else {
            return Err(ProtocolError::status("Read binary", status));
        }
    }
    Ok(content)
}

/// Select and read a whole file
pub fn read_file(session: &mut Session, fid: [u8; 2]) -> Result<Vec<u8>> {
    session.emit(ProtocolStep::SelectForReadFile);
    select_file(session, fid)?;
    session.emit(ProtocolStep::ReadFile);
    let content = read_binary(session)?;
    debug!(fid = %hex::encode_upper(fid), len = content.len(), "File read");
    Ok(content)
}

/// INTERNAL AUTHENTICATE, the chip signs `data` raw with its internal key
pub fn internal_authenticate(session: &mut Session, data: &[u8]) -> Result<Vec<u8>> {
    let command = Command::new_with_data_and_le(0x00, 0x88, 0x00, 0x00, data.to_vec(), 256);
    Ok(expect_success(session.send(&command)?, "Internal authenticate")?.to_vec())
}

/// DigestInfo for a SHA-256 digest
pub fn sha256_digest_info(digest: &[u8]) -> Vec<u8> {
    [SHA256_DIGEST_INFO_PREFIX, digest].concat()
}

/// Sign a DigestInfo with the user authentication key
pub fn sign(session: &mut Session, digest_info: &[u8]) -> Result<Vec<u8>> {
    session.emit(ProtocolStep::SetSignatureKey);
    let mse = Command::new_with_data(
        0x00,
        0x22,
        0x41,
        0xB6,
        vec![0x80, 0x01, SIGNATURE_ALGORITHM, 0x84, 0x01, SIGNATURE_KEY_REFERENCE],
    );
    expect_success(session.send(&mse)?, "Set signature key")?;

    session.emit(ProtocolStep::Sign);
    let pso = Command::new_with_data_and_le(0x00, 0x2A, 0x9E, 0x9A, digest_info.to_vec(), 256);
    Ok(expect_success(session.send(&pso)?, "Compute digital signature")?.to_vec())
}

/// PIN verification remembering cards that reported a blocked PIN
///
/// Cards are keyed by their serial number. Once a card is seen blocked every later attempt
/// fails with [`ProtocolError::CardBlocked`] without an APDU.
#[derive(Debug, Default)]
pub struct PinVerifier {
    blocked: Mutex<HashSet<Vec<u8>>>,
}

impl PinVerifier {
    /// Create a verifier with no blocked card
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the card with `serial` was seen blocked
    pub fn is_blocked(&self, serial: &[u8]) -> bool {
        self.blocked.lock().contains(serial)
    }

    fn mark_blocked(&self, serial: &[u8]) {
        warn!(serial = %String::from_utf8_lossy(serial), "Card PIN blocked");
        self.blocked.lock().insert(serial.to_vec());
    }

    /// VERIFY the user PIN
    ///
    /// The format is checked first; a malformed PIN never reaches the card.
    pub fn verify_pin(&self, session: &mut Session, serial: &[u8], pin: &str) -> Result<()> {
        validate_pin(pin)?;
        if self.is_blocked(serial) {
            return Err(ProtocolError::CardBlocked);
        }

        session.emit(ProtocolStep::VerifyPin);
        let command = Command::new_with_data(0x00, 0x20, 0x00, 0x81, pin.as_bytes().to_vec());
        let status = session.send(&command)?.status();

        if status.is_success() {
            info!("PIN verified");
            return Ok(());
        }
        match status.wrong_pin_attempts() {
            Some(0) => {
                self.mark_blocked(serial);
                Err(ProtocolError::CardBlocked)
            }
            Some(attempts) => {
                warn!(attempts, "Wrong PIN");
                Err(ProtocolError::WrongPin(attempts))
            }
            None if status.is_authentication_blocked() => {
                self.mark_blocked(serial);
                Err(ProtocolError::CardBlocked)
            }
            None => Err(ProtocolError::status("Verify PIN", status)),
        }
    }
}
