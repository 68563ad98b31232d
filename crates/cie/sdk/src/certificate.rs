//! Card verifiable certificates of the chip and the trust store checking them
//!
//! A CV certificate is `7F21 { 7F4E body, 5F37 signature }`; the body carries the profile
//! identifier, the authority reference (CAR), the RSA public key, the holder reference (CHR)
//! and two BCD dates. The signature is RSA PKCS#1 v1.5 with SHA-256 over the encoded body,
//! checked with the trust anchor whose reference equals the CAR.

use std::collections::HashSet;
use std::fmt;
use std::time::SystemTime;

use der::DateTime;
use iso7816_tlv::ber::Tlv;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::tlv;

const TAG_CV_CERTIFICATE: &[u8] = &[0x7F, 0x21];
const TAG_BODY: &[u8] = &[0x7F, 0x4E];
const TAG_PROFILE: &[u8] = &[0x5F, 0x29];
const TAG_CAR: &[u8] = &[0x42];
const TAG_PUBLIC_KEY: &[u8] = &[0x7F, 0x49];
const TAG_MODULUS: &[u8] = &[0x81];
const TAG_EXPONENT: &[u8] = &[0x82];
const TAG_CHR: &[u8] = &[0x5F, 0x20];
const TAG_EFFECTIVE: &[u8] = &[0x5F, 0x25];
const TAG_EXPIRATION: &[u8] = &[0x5F, 0x24];
const TAG_SIGNATURE: &[u8] = &[0x5F, 0x37];

/// Calendar date as carried by CV certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CvDate {
    /// Full year
    pub year: u16,
    /// Month, 1 based
    pub month: u8,
    /// Day, 1 based
    pub day: u8,
}

impl CvDate {
    /// Decode six unpacked BCD digits `YYMMDD`
    pub fn from_bcd(digits: &[u8]) -> Option<Self> {
        let &[y1, y2, m1, m2, d1, d2] = digits else {
            return None;
        };
        if [y1, y2, m1, m2, d1, d2].iter().any(|d| *d > 9) {
            return None;
        }
        let date = Self {
            year: 2000 + u16::from(y1 * 10 + y2),
            month: m1 * 10 + m2,
            day: d1 * 10 + d2,
        };
        ((1..=12).contains(&date.month) && (1..=31).contains(&date.day)).then_some(date)
    }

    /// Encode as six unpacked BCD digits
    pub const fn to_bcd(self) -> [u8; 6] {
        let yy = (self.year % 100) as u8;
        [yy / 10, yy % 10, self.month / 10, self.month % 10, self.day / 10, self.day % 10]
    }

    /// UTC calendar date of `now`
    pub fn from_system_time(now: SystemTime) -> Result<Self> {
        let time = DateTime::from_system_time(now)
            .map_err(|e| ProtocolError::generic(format!("Clock outside the certificate range: {e}")))?;
        Ok(Self {
            year: time.year(),
            month: time.month(),
            day: time.day(),
        })
    }
}

impl fmt::Display for CvDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// RSA key trusted to sign chip certificates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustAnchor {
    /// Reference matched against the certificate CAR
    pub reference: Vec<u8>,
    /// Verification key
    pub key: RsaPublicKey,
}

/// Trust anchors and revoked references
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    anchors: Vec<TrustAnchor>,
    revoked: HashSet<Vec<u8>>,
}

impl TrustStore {
    /// Empty store, every certificate is rejected
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trust anchor
    pub fn add_anchor(&mut self, reference: impl Into<Vec<u8>>, key: RsaPublicKey) {
        self.anchors.push(TrustAnchor {
            reference: reference.into(),
            key,
        });
    }

    /// Builder variant of [`TrustStore::add_anchor`]
    pub fn with_anchor(mut self, reference: impl Into<Vec<u8>>, key: RsaPublicKey) -> Self {
        self.add_anchor(reference, key);
        self
    }

    /// Revoke a holder reference or X.509 serial number
    pub fn revoke(&mut self, reference: impl Into<Vec<u8>>) {
        self.revoked.insert(reference.into());
    }

    /// Whether `reference` was revoked
    pub fn is_revoked(&self, reference: &[u8]) -> bool {
        self.revoked.contains(reference)
    }

    /// Anchor for an authority reference
    pub fn anchor(&self, reference: &[u8]) -> Option<&TrustAnchor> {
        self.anchors.iter().find(|a| a.reference == reference)
    }

    /// Number of anchors
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// Whether no anchor is configured
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

/// Parsed chip CV certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvCertificate {
    /// Certificate profile identifier
    pub profile: Vec<u8>,
    /// Certification authority reference
    pub authority_reference: Vec<u8>,
    /// Holder public key
    pub public_key: RsaPublicKey,
    /// Certificate holder reference
    pub holder_reference: Vec<u8>,
    /// First day of validity
    pub effective: CvDate,
    /// Last day of validity
    pub expiration: CvDate,
    body: Vec<u8>,
    signature: Vec<u8>,
}

fn malformed(what: &str) -> ProtocolError {
    ProtocolError::generic(format!("Malformed chip certificate: {what}"))
}

impl CvCertificate {
    /// Parse the DER encoding; structural errors are `GenericError`
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::parse(data).map_err(|e| match e {
            ProtocolError::GenericError(_) => e,
            other => malformed(&other.to_string()),
        })
    }

    fn parse(data: &[u8]) -> Result<Self> {
        let outer = tlv::parse_single(data, TAG_CV_CERTIFICATE)?;
        let parts = tlv::children(&outer)?;
        let body = tlv::find_constructed(parts, TAG_BODY)?;
        let fields = tlv::children(body)?;
        let key_fields = tlv::children(tlv::find_constructed(fields, TAG_PUBLIC_KEY)?)?;

        let public_key = RsaPublicKey::new(
            BigUint::from_bytes_be(tlv::find_primitive(key_fields, TAG_MODULUS)?),
            BigUint::from_bytes_be(tlv::find_primitive(key_fields, TAG_EXPONENT)?),
        )
        .map_err(|e| malformed(&e.to_string()))?;
        let effective = CvDate::from_bcd(tlv::find_primitive(fields, TAG_EFFECTIVE)?)
            .ok_or_else(|| malformed("effective date"))?;
        let expiration = CvDate::from_bcd(tlv::find_primitive(fields, TAG_EXPIRATION)?)
            .ok_or_else(|| malformed("expiration date"))?;

        Ok(Self {
            profile: tlv::find_primitive(fields, TAG_PROFILE)?.to_vec(),
            authority_reference: tlv::find_primitive(fields, TAG_CAR)?.to_vec(),
            public_key,
            holder_reference: tlv::find_primitive(fields, TAG_CHR)?.to_vec(),
            effective,
            expiration,
            body: body.to_vec(),
            signature: tlv::find_primitive(parts, TAG_SIGNATURE)?.to_vec(),
        })
    }

    /// Check revocation, trust, signature and validity on `today`
    pub fn verify(&self, store: &TrustStore, today: CvDate) -> Result<()> {
        let chr = hex::encode_upper(&self.holder_reference);
        if store.is_revoked(&self.holder_reference) {
            warn!(%chr, "Chip certificate revoked");
            return Err(ProtocolError::CertificateRevoked);
        }
        let Some(anchor) = store.anchor(&self.authority_reference) else {
            warn!(car = %hex::encode_upper(&self.authority_reference), "Unknown certification authority");
            return Err(ProtocolError::CertificateRevoked);
        };
        let digest = Sha256::digest(&self.body);
        if anchor
            .key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &self.signature)
            .is_err()
        {
            warn!(%chr, "Chip certificate signature invalid");
            return Err(ProtocolError::CertificateRevoked);
        }
        if today < self.effective || today > self.expiration {
            warn!(%chr, effective = %self.effective, expiration = %self.expiration, %today, "Chip certificate outside validity");
            return Err(ProtocolError::CertificateExpired);
        }
        debug!(%chr, "Chip certificate verified");
        Ok(())
    }

    /// [`CvCertificate::verify`] on the UTC date of `now`
    pub fn check(&self, store: &TrustStore, now: SystemTime) -> Result<()> {
        self.verify(store, CvDate::from_system_time(now)?)
    }
}

/// Encode an unsigned certificate body
#[doc(hidden)]
pub fn encode_body(
    profile: &[u8],
    authority_reference: &[u8],
    public_key: &RsaPublicKey,
    holder_reference: &[u8],
    effective: CvDate,
    expiration: CvDate,
) -> Result<Vec<u8>> {
    use rsa::traits::PublicKeyParts;
    let key = tlv::constructed(
        TAG_PUBLIC_KEY,
        vec![
            tlv::primitive(TAG_MODULUS, &public_key.n().to_bytes_be())?,
            tlv::primitive(TAG_EXPONENT, &public_key.e().to_bytes_be())?,
        ],
    )?;
    let body = tlv::constructed(
        TAG_BODY,
        vec![
            tlv::primitive(TAG_PROFILE, profile)?,
            tlv::primitive(TAG_CAR, authority_reference)?,
            key,
            tlv::primitive(TAG_CHR, holder_reference)?,
            tlv::primitive(TAG_EFFECTIVE, &effective.to_bcd())?,
            tlv::primitive(TAG_EXPIRATION, &expiration.to_bcd())?,
        ],
    )?;
    Ok(body.to_vec())
}

/// Assemble a certificate from an encoded body and its signature
#[doc(hidden)]
pub fn encode_certificate(body: &[u8], signature: &[u8]) -> Result<Vec<u8>> {
    let (body, _) = Tlv::parse(body);
    let certificate = tlv::constructed(
        TAG_CV_CERTIFICATE,
        vec![body?, tlv::primitive(TAG_SIGNATURE, signature)?],
    )?;
    Ok(certificate.to_vec())
}
