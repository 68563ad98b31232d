//! PACE with generic mapping on NIST P-256, AES-128 secure messaging
//!
//! The chip sends a nonce encrypted under a key derived from the CAN. Both sides map the
//! nonce onto a fresh generator `G' = s·G + H`, where `H` comes from an anonymous ECDH, run
//! an ephemeral ECDH on `G'` and confirm the derived keys with CMAC tokens over each other's
//! ephemeral public key.

use std::time::SystemTime;

use cie_apdu_core::Command;
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::PrimeField;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{FieldBytes, NonZeroScalar, ProjectivePoint, PublicKey, Scalar};
use rand_v8::rngs::OsRng;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::certificate::TrustStore;
use crate::chip_auth;
use crate::crypto::{self, KDF_PI};
use crate::error::{ProtocolError, Result};
use crate::events::ProtocolStep;
use crate::reader::{self, AID_CIE, expect_success};
use crate::secure_messaging::SecureChannelContext;
use crate::session::{Session, SessionState};
use crate::tlv;
use crate::validation::validate_can;

/// id-PACE-ECDH-GM-AES-CBC-CMAC-128
pub const PACE_OID: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x04, 0x02, 0x02];

/// Standardized domain parameters 12, NIST P-256
pub const PARAMETER_ID_P256: u8 = 0x0C;

/// Password reference of the CAN
pub const PASSWORD_CAN: u8 = 0x02;

const CLA_CHAINING: u8 = 0x10;

/// Comparison whose timing does not depend on where the inputs differ
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Uncompressed SEC1 encoding
pub fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(false).as_bytes().to_vec()
}

/// Decode and validate a SEC1 point
pub fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    PublicKey::from_sec1_bytes(bytes)
        .map(|key| key.to_projective())
        .map_err(|_| ProtocolError::generic("Invalid EC public key"))
}

/// Nonce as a scalar
pub fn nonce_scalar(nonce: &[u8]) -> Result<Scalar> {
    if nonce.len() > 32 {
        return Err(ProtocolError::generic("PACE nonce too long"));
    }
    let mut bytes = FieldBytes::default();
    bytes[32 - nonce.len()..].copy_from_slice(nonce);
    Option::<Scalar>::from(Scalar::from_repr(bytes))
        .ok_or_else(|| ProtocolError::generic("PACE nonce out of range"))
}

/// Generic mapping `G' = s·G + H`
pub fn map_generator(nonce: &Scalar, shared: &ProjectivePoint) -> Result<ProjectivePoint> {
    let mapped = ProjectivePoint::GENERATOR * nonce + shared;
    if mapped == ProjectivePoint::IDENTITY {
        return Err(ProtocolError::generic("PACE mapping produced the identity"));
    }
    Ok(mapped)
}

/// Authentication token over the peer's ephemeral public key
pub fn authentication_token(k_mac: &[u8; 16], peer_public: &[u8]) -> Result<[u8; 8]> {
    let input = tlv::constructed(
        &[0x7F, 0x49],
        vec![tlv::primitive(&[0x06], PACE_OID)?, tlv::primitive(&[0x86], peer_public)?],
    )?
    .to_vec();
    let mac = crypto::aes_cmac(k_mac, &input);
    let mut token = [0u8; 8];
    token.copy_from_slice(&mac[..8]);
    Ok(token)
}

/// Key derived from the CAN
pub fn password_key(can: &str) -> [u8; 16] {
    crypto::kdf_aes128(can.as_bytes(), KDF_PI)
}

fn general_authenticate(session: &mut Session, last: bool, tag: u8, value: &[u8]) -> Result<Vec<u8>> {
    let cla = if last { 0x00 } else { CLA_CHAINING };
    let data = tlv::encode_dynamic_auth_data(tag, value)?;
    let command = Command::new_with_data_and_le(cla, 0x86, 0x00, 0x00, data, 256);
    Ok(expect_success(session.send(&command)?, "PACE general authenticate")?.to_vec())
}

/// Establish an AES secure channel from the CAN
///
/// The CAN is validated before anything is sent. Once the channel is up the chip CV
/// certificate is read from the CIE application and checked against `trust` on the date of
/// `now`; the returned context is the one installed on the session.
pub fn establish_pace<'s>(
    session: &'s mut Session,
    can: &str,
    trust: &TrustStore,
    now: SystemTime,
) -> Result<&'s SecureChannelContext> {
    validate_can(can)?;
    session.transition(SessionState::Authenticating)?;

    session.emit(ProtocolStep::PaceSetup);
    let mut mse = vec![0x80, PACE_OID.len() as u8];
    mse.extend_from_slice(PACE_OID);
    mse.extend_from_slice(&[0x83, 0x01, PASSWORD_CAN, 0x84, 0x01, PARAMETER_ID_P256]);
    let command = Command::new_with_data(0x00, 0x22, 0xC1, 0xA4, mse);
    expect_success(session.send(&command)?, "PACE set authentication template")?;

    session.emit(ProtocolStep::PaceNonce);
    let response = general_authenticate(session, false, 0x80, &[])?;
    let mut nonce = Zeroizing::new(tlv::dynamic_auth_data(&response, 0x80)?);
    crypto::aes_cbc_decrypt(&password_key(can), &[0u8; 16], &mut nonce)?;
    let nonce = nonce_scalar(&nonce)?;

    session.emit(ProtocolStep::PaceMapping);
    let map_key = NonZeroScalar::random(&mut OsRng);
    let map_public = ProjectivePoint::GENERATOR * *map_key;
    let response = general_authenticate(session, false, 0x81, &encode_point(&map_public))?;
    let chip_map_public = decode_point(&tlv::dynamic_auth_data(&response, 0x82)?)?;
    let generator = map_generator(&nonce, &(chip_map_public * *map_key))?;

    session.emit(ProtocolStep::PaceKeyAgreement);
    let ephemeral = NonZeroScalar::random(&mut OsRng);
    let ephemeral_public = encode_point(&(generator * *ephemeral));
    let response = general_authenticate(session, false, 0x83, &ephemeral_public)?;
    let chip_public = tlv::dynamic_auth_data(&response, 0x84)?;
    if chip_public == ephemeral_public {
        warn!("Chip echoed the terminal ephemeral key");
        return Err(ProtocolError::generic("Identical PACE ephemeral keys"));
    }
    let chip_point = decode_point(&chip_public)?;
    let shared = diffie_hellman(ephemeral, chip_point.to_affine());
    let secret = shared.raw_secret_bytes();
    let channel = SecureChannelContext::aes128_from_secret(secret, 0);
    let k_mac = crypto::kdf_aes128(secret, crypto::KDF_MAC);

    session.emit(ProtocolStep::PaceMutualAuth);
    let token = authentication_token(&k_mac, &chip_public)?;
    let response = general_authenticate(session, true, 0x85, &token)?;
    let chip_token = tlv::dynamic_auth_data(&response, 0x86)?;
    let expected = authentication_token(&k_mac, &ephemeral_public)?;
    if !constant_time_eq(&chip_token, &expected) {
        warn!("PACE token mismatch");
        return Err(ProtocolError::generic("PACE authentication token mismatch"));
    }

    session.set_secure_channel(channel)?;
    debug!("PACE secure messaging established");

    session.emit(ProtocolStep::SelectCie);
    let status = reader::select_application(session, AID_CIE)?;
    if !status.is_success() {
        return Err(ProtocolError::status("Select CIE application", status));
    }
    chip_auth::verify_chip_certificate(session, trust, now)?;

    info!("PACE completed");
    session
        .secure_channel()
        .ok_or_else(|| ProtocolError::generic("PACE channel missing"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_password_key() {
        // SHA-1("123456" || 00000003), first 16 bytes
        assert_eq!(password_key("123456"), hex!("591468cda83d65219cccb8560233600f"));
    }

    #[test]
    fn test_generic_mapping_agrees() {
        let nonce = nonce_scalar(&hex!("3F00C4D39D153F2B2A214A078D899B22")).unwrap();
        let terminal = NonZeroScalar::random(&mut OsRng);
        let chip = NonZeroScalar::random(&mut OsRng);
        let terminal_public = ProjectivePoint::GENERATOR * *terminal;
        let chip_public = ProjectivePoint::GENERATOR * *chip;

        let g_terminal = map_generator(&nonce, &(chip_public * *terminal)).unwrap();
        let g_chip = map_generator(&nonce, &(terminal_public * *chip)).unwrap();
        assert_eq!(g_terminal, g_chip);
        assert_ne!(g_terminal, ProjectivePoint::GENERATOR);
    }

    #[test]
    fn test_point_encoding() {
        let point = ProjectivePoint::GENERATOR * Scalar::from(7u64);
        let encoded = encode_point(&point);
        assert_eq!(encoded.len(), 65);
        assert_eq!(encoded[0], 0x04);
        assert_eq!(decode_point(&encoded).unwrap(), point);
        assert!(decode_point(&encoded[..64]).is_err());
    }

    #[test]
    fn test_tokens_differ_by_key() {
        let k_mac = [0x11; 16];
        let a = authentication_token(&k_mac, &[0x04; 65]).unwrap();
        let b = authentication_token(&k_mac, &[0x05; 65]).unwrap();
        assert_ne!(a, b);
        assert!(constant_time_eq(&a, &a));
        assert!(!constant_time_eq(&a, &b[..4]));
    }
}
