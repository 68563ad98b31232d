//! User authentication certificate stored on the card
//!
//! Only the fields needed by the flows are extracted: holder names, fiscal code, serial
//! number, validity and the RSA key used to check card signatures. The issuer chain is not
//! verified here; the identity provider does that on its side.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use der::asn1::{Ia5StringRef, PrintableStringRef, Utf8StringRef};
use der::oid::ObjectIdentifier;
use der::{Decode, Encode};
use rsa::RsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use tracing::{debug, warn};
use x509_cert::Certificate;
use x509_cert::attr::AttributeTypeAndValue;

use crate::certificate::TrustStore;
use crate::error::{ProtocolError, Result};
use crate::result::CertificateResult;

const OID_GIVEN_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.42");
const OID_SURNAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.4");
const OID_SERIAL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.5");

/// Prefix of the fiscal code in the subject serial number
const FISCAL_CODE_PREFIX: &str = "TINIT-";

/// Decoded user certificate
#[derive(Debug, Clone)]
pub struct UserCertificate {
    /// Given name
    pub given_name: Option<String>,
    /// Surname
    pub surname: Option<String>,
    /// Fiscal code without the `TINIT-` prefix
    pub fiscal_code: Option<String>,
    /// Certificate serial number, big-endian
    pub serial_number: Vec<u8>,
    /// Start of validity, seconds since the Unix epoch
    pub not_before: Duration,
    /// End of validity, seconds since the Unix epoch
    pub not_after: Duration,
    /// Subject public key
    pub public_key: RsaPublicKey,
    /// DER encoding
    pub der: Vec<u8>,
}

fn attribute_string(atv: &AttributeTypeAndValue) -> Option<String> {
    let value = &atv.value;
    value
        .decode_as::<Utf8StringRef<'_>>()
        .map(|s| s.as_str().to_owned())
        .or_else(|_| value.decode_as::<PrintableStringRef<'_>>().map(|s| s.as_str().to_owned()))
        .or_else(|_| value.decode_as::<Ia5StringRef<'_>>().map(|s| s.as_str().to_owned()))
        .ok()
}

impl UserCertificate {
    /// Parse a DER certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let certificate = Certificate::from_der(der)
            .map_err(|e| ProtocolError::generic(format!("Malformed user certificate: {e}")))?;
        let tbs = &certificate.tbs_certificate;

        let find = |oid: ObjectIdentifier| {
            tbs.subject
                .0
                .iter()
                .flat_map(|rdn| rdn.0.iter())
                .find(|atv| atv.oid == oid)
                .and_then(attribute_string)
        };

        let spki = tbs
            .subject_public_key_info
            .to_der()
            .map_err(|e| ProtocolError::generic(format!("Malformed public key: {e}")))?;
        let public_key = RsaPublicKey::from_public_key_der(&spki)
            .map_err(|e| ProtocolError::generic(format!("Unsupported public key: {e}")))?;

        Ok(Self {
            given_name: find(OID_GIVEN_NAME),
            surname: find(OID_SURNAME),
            fiscal_code: find(OID_SERIAL_NUMBER).map(|serial| {
                serial
                    .strip_prefix(FISCAL_CODE_PREFIX)
                    .map_or_else(|| serial.clone(), str::to_owned)
            }),
            serial_number: tbs.serial_number.as_bytes().to_vec(),
            not_before: tbs.validity.not_before.to_unix_duration(),
            not_after: tbs.validity.not_after.to_unix_duration(),
            public_key,
            der: der.to_vec(),
        })
    }

    /// Whether `now` falls in the validity window
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        now.duration_since(UNIX_EPOCH)
            .is_ok_and(|now| now >= self.not_before && now <= self.not_after)
    }

    /// Check validity and revocation
    pub fn check(&self, store: &TrustStore, now: SystemTime) -> Result<()> {
        if !self.is_valid_at(now) {
            warn!(serial = %hex::encode_upper(&self.serial_number), "User certificate expired");
            return Err(ProtocolError::CertificateExpired);
        }
        if store.is_revoked(&self.serial_number) {
            warn!(serial = %hex::encode_upper(&self.serial_number), "User certificate revoked");
            return Err(ProtocolError::CertificateRevoked);
        }
        debug!(serial = %hex::encode_upper(&self.serial_number), "User certificate accepted");
        Ok(())
    }

    /// Holder details together with the card serial number
    pub fn to_result(&self, doc_serial_number: Option<String>) -> CertificateResult {
        CertificateResult {
            name: self.given_name.clone(),
            surname: self.surname.clone(),
            fiscal_code: self.fiscal_code.clone(),
            doc_serial_number,
        }
    }
}
