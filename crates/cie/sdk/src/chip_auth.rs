//! Diffie-Hellman chip authentication of the CIE application
//!
//! The chip publishes its DH group through GET DATA, the terminal runs an ephemeral key
//! agreement with the chip's static group key, and both sides derive 3DES secure messaging
//! keys from the shared secret. Authenticity of the chip is then proven by its CV
//! certificate and by an INTERNAL AUTHENTICATE over a fresh random challenge.

use std::time::SystemTime;

use cie_apdu_core::Command;
use rand_v8::RngCore;
use rand_v8::rngs::OsRng;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::certificate::{CvCertificate, TrustStore};
use crate::error::{ProtocolError, Result};
use crate::events::ProtocolStep;
use crate::reader::{self, AID_CIE, AID_IAS, FID_CHIP_CERTIFICATE, FID_INT_AUTH_KEY, expect_success};
use crate::secure_messaging::SecureChannelContext;
use crate::session::{Session, SessionState};
use crate::tlv;

const GET_DATA_GENERATOR: u8 = 0x81;
const GET_DATA_PRIME: u8 = 0x82;
const GET_DATA_ORDER: u8 = 0x83;

/// Length of the terminal challenge of INTERNAL AUTHENTICATE
pub const CHALLENGE_LENGTH: usize = 8;

/// Multiplicative DH group published by the chip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhGroup {
    /// Generator
    pub g: BigUint,
    /// Prime modulus
    pub p: BigUint,
    /// Order of the subgroup generated by `g`
    pub q: BigUint,
}

impl DhGroup {
    /// Group from big-endian encodings
    pub fn from_bytes(g: &[u8], p: &[u8], q: &[u8]) -> Result<Self> {
        let group = Self {
            g: BigUint::from_bytes_be(g),
            p: BigUint::from_bytes_be(p),
            q: BigUint::from_bytes_be(q),
        };
        let one = BigUint::from(1u8);
        if group.p <= one || group.q <= one || group.g <= one || group.g >= group.p {
            return Err(ProtocolError::generic("Invalid DH group parameters"));
        }
        Ok(group)
    }

    /// Byte length of the modulus
    pub fn modulus_len(&self) -> usize {
        self.p.to_bytes_be().len()
    }

    /// Random private exponent in `2..q`
    pub fn generate_private(&self) -> Zeroizing<Vec<u8>> {
        let two = BigUint::from(2u8);
        loop {
            let mut bytes = Zeroizing::new(vec![0u8; self.q.to_bytes_be().len() + 8]);
            OsRng.fill_bytes(&mut bytes);
            let x = BigUint::from_bytes_be(&bytes) % &self.q;
            if x >= two {
                return Zeroizing::new(x.to_bytes_be());
            }
        }
    }

    /// `g^x mod p`
    pub fn public_key(&self, private: &[u8]) -> Vec<u8> {
        let x = BigUint::from_bytes_be(private);
        self.left_pad(self.g.modpow(&x, &self.p))
    }

    /// Check a peer public value: `1 < y < p-1` and `y^q = 1 mod p`
    pub fn check_public(&self, public: &[u8]) -> Result<BigUint> {
        let y = BigUint::from_bytes_be(public);
        let one = BigUint::from(1u8);
        if y <= one || y >= &self.p - &one {
            return Err(ProtocolError::generic("DH public value out of range"));
        }
        if y.modpow(&self.q, &self.p) != one {
            return Err(ProtocolError::generic("DH public value outside the subgroup"));
        }
        Ok(y)
    }

    /// Shared secret `y^x mod p`, left padded to the modulus length
    pub fn shared_secret(&self, private: &[u8], public: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let y = self.check_public(public)?;
        let x = BigUint::from_bytes_be(private);
        Ok(Zeroizing::new(self.left_pad(y.modpow(&x, &self.p))))
    }

    fn left_pad(&self, value: BigUint) -> Vec<u8> {
        let bytes = value.to_bytes_be();
        let len = self.modulus_len();
        let mut out = vec![0u8; len.saturating_sub(bytes.len())];
        out.extend_from_slice(&bytes);
        out
    }
}

/// Outcome of a successful chip authentication
#[derive(Debug, Clone)]
pub struct ChipAuthentication {
    /// Raw internal authentication public key file
    pub public_key_file: Vec<u8>,
    /// Internal authentication key
    pub public_key: RsaPublicKey,
    /// Verified chip certificate
    pub chip_certificate: CvCertificate,
}

/// Decode the internal authentication key file, `81` modulus and `82` exponent
pub fn parse_public_key_file(data: &[u8]) -> Result<RsaPublicKey> {
    let tlvs = tlv::parse_all(data)?;
    let modulus = tlv::find_primitive(&tlvs, &[0x81])?;
    let exponent = tlv::find_primitive(&tlvs, &[0x82])?;
    RsaPublicKey::new(BigUint::from_bytes_be(modulus), BigUint::from_bytes_be(exponent))
        .map_err(|e| ProtocolError::generic(format!("Invalid internal authentication key: {e}")))
}

/// Check an INTERNAL AUTHENTICATE answer against the chip key
pub fn verify_internal_signature(key: &RsaPublicKey, challenge: &[u8], signature: &[u8]) -> Result<()> {
    key.verify(Pkcs1v15Sign::new_unprefixed(), challenge, signature)
        .map_err(|_| {
            warn!("Chip signature does not verify");
            ProtocolError::generic("Chip internal authentication failed")
        })
}

/// Select the IAS and CIE applications; a card without them is not a CIE
pub fn select_cie(session: &mut Session) -> Result<()> {
    session.emit(ProtocolStep::SelectIas);
    let status = reader::select_application(session, AID_IAS)?;
    if !status.is_success() {
        warn!(%status, "IAS application missing");
        return Err(ProtocolError::NotACard);
    }
    session.emit(ProtocolStep::SelectCie);
    let status = reader::select_application(session, AID_CIE)?;
    if !status.is_success() {
        warn!(%status, "CIE application missing");
        return Err(ProtocolError::NotACard);
    }
    Ok(())
}

fn get_data(session: &mut Session, tag: u8) -> Result<Vec<u8>> {
    let command = Command::new_with_le(0x00, 0xCB, 0x00, tag, 256);
    Ok(expect_success(session.send(&command)?, "Get DH parameter")?.to_vec())
}

/// Read the chip CV certificate over the secure channel and verify it
pub fn verify_chip_certificate(
    session: &mut Session,
    trust: &TrustStore,
    now: SystemTime,
) -> Result<CvCertificate> {
    let raw = reader::read_file(session, FID_CHIP_CERTIFICATE)?;
    session.emit(ProtocolStep::VerifyChipCertificate);
    let certificate = CvCertificate::from_bytes(&raw)?;
    certificate.check(trust, now)?;
    if let Some(channel) = session.secure_channel_mut() {
        channel.set_chip_certificate(raw);
    }
    Ok(certificate)
}

/// Run the chip authentication on a connected session
///
/// On success the session carries a 3DES secure channel and the chip has proven possession of
/// the key certified by a trusted authority.
pub fn establish_chip_auth(
    session: &mut Session,
    trust: &TrustStore,
    now: SystemTime,
) -> Result<ChipAuthentication> {
    select_cie(session)?;
    session.transition(SessionState::Authenticating)?;

    session.emit(ProtocolStep::GetDhGenerator);
    let g = get_data(session, GET_DATA_GENERATOR)?;
    session.emit(ProtocolStep::GetDhPrime);
    let p = get_data(session, GET_DATA_PRIME)?;
    session.emit(ProtocolStep::GetDhOrder);
    let q = get_data(session, GET_DATA_ORDER)?;
    let group = DhGroup::from_bytes(&g, &p, &q)?;
    debug!(bits = group.modulus_len() * 8, "DH group");

    let public_key_file = reader::read_file(session, FID_INT_AUTH_KEY)?;
    let public_key = parse_public_key_file(&public_key_file)?;

    session.emit(ProtocolStep::SetDhParameters);
    let mse = Command::new_with_data(0x00, 0x22, 0x41, 0xA6, vec![0x83, 0x01, 0x01]);
    expect_success(session.send(&mse)?, "Set DH key agreement")?;

    session.emit(ProtocolStep::DhKeyExchange);
    let private = group.generate_private();
    let data = tlv::encode_dynamic_auth_data(0x81, &group.public_key(&private))?;
    let command = Command::new_with_data_and_le(0x00, 0x86, 0x00, 0x00, data, 256);
    let response = expect_success(session.send(&command)?, "DH key exchange")?;
    let chip_public = tlv::dynamic_auth_data(&response, 0x82)?;

    session.emit(ProtocolStep::DeriveSessionKeys);
    let secret = group.shared_secret(&private, &chip_public)?;
    session.set_secure_channel(SecureChannelContext::tdes_from_secret(&secret, 0))?;
    debug!("Secure messaging established");

    let chip_certificate = verify_chip_certificate(session, trust, now)?;
    if chip_certificate.public_key != public_key {
        warn!("Chip certificate key differs from the internal authentication key");
        return Err(ProtocolError::generic("Chip certificate key mismatch"));
    }

    session.emit(ProtocolStep::GenerateChallenge);
    let mut challenge = [0u8; CHALLENGE_LENGTH];
    OsRng.fill_bytes(&mut challenge);
    session.emit(ProtocolStep::ChipInternalAuth);
    let signature = reader::internal_authenticate(session, &challenge)?;
    session.emit(ProtocolStep::VerifyChipSignature);
    verify_internal_signature(&public_key, &challenge, &signature)?;

    info!("Chip authenticated");
    Ok(ChipAuthentication {
        public_key_file,
        public_key,
        chip_certificate,
    })
}
