//! ISO 7816-4 / ICAO 9303-11 secure messaging
//!
//! [`SecureChannelContext`] wraps commands into protected APDUs and unwraps protected responses.
//! Every response MAC is checked before any data object is interpreted; a mismatch fails closed.

use std::fmt;

use bytes::{BufMut, BytesMut};
use cie_apdu_core::command::{MAX_EXTENDED_LE, MAX_SHORT_LE};
use cie_apdu_core::{Command, Response, StatusWord};
use tracing::{trace, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, AES_BLOCK, CryptoError, DES_BLOCK, KDF_ENC, KDF_MAC};
use crate::error::{ProtocolError, Result};

const TAG_ENCRYPTED_ODD: u8 = 0x85;
const TAG_ENCRYPTED: u8 = 0x87;
const TAG_STATUS: u8 = 0x99;
const TAG_LE: u8 = 0x97;
const TAG_MAC: u8 = 0x8E;
const PADDING_INDICATOR: u8 = 0x01;

/// Block cipher family of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmCipher {
    /// Two-key 3DES with retail MAC
    Tdes,
    /// AES-128 with CMAC
    Aes128,
}

impl SmCipher {
    const fn block_size(self) -> usize {
        match self {
            Self::Tdes => DES_BLOCK,
            Self::Aes128 => AES_BLOCK,
        }
    }
}

impl From<CryptoError> for ProtocolError {
    fn from(error: CryptoError) -> Self {
        Self::ApduError(format!("Secure messaging: {error}"))
    }
}

/// Session keys and send sequence counter of an established secure channel
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecureChannelContext {
    #[zeroize(skip)]
    cipher: SmCipher,
    k_enc: [u8; 16],
    k_mac: [u8; 16],
    ssc: u64,
    chip_certificate: Vec<u8>,
}

impl fmt::Debug for SecureChannelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannelContext")
            .field("cipher", &self.cipher)
            .field("ssc", &self.ssc)
            .field("chip_certificate_len", &self.chip_certificate.len())
            .finish_non_exhaustive()
    }
}

impl SecureChannelContext {
    /// Create a channel from explicit keys
    pub const fn new(cipher: SmCipher, k_enc: [u8; 16], k_mac: [u8; 16], ssc: u64) -> Self {
        Self {
            cipher,
            k_enc,
            k_mac,
            ssc,
            chip_certificate: Vec::new(),
        }
    }

    /// 3DES channel with keys derived from a shared secret
    pub fn tdes_from_secret(secret: &[u8], ssc: u64) -> Self {
        Self::new(
            SmCipher::Tdes,
            crypto::kdf_3des(secret, KDF_ENC),
            crypto::kdf_3des(secret, KDF_MAC),
            ssc,
        )
    }

    /// AES-128 channel with keys derived from a shared secret
    pub fn aes128_from_secret(secret: &[u8], ssc: u64) -> Self {
        Self::new(
            SmCipher::Aes128,
            crypto::kdf_aes128(secret, KDF_ENC),
            crypto::kdf_aes128(secret, KDF_MAC),
            ssc,
        )
    }

    /// Cipher family
    pub const fn cipher(&self) -> SmCipher {
        self.cipher
    }

    /// Current send sequence counter
    pub const fn ssc(&self) -> u64 {
        self.ssc
    }

    /// Raw chip certificate verified while the channel was set up
    pub fn chip_certificate(&self) -> &[u8] {
        &self.chip_certificate
    }

    pub(crate) fn set_chip_certificate(&mut self, certificate: Vec<u8>) {
        self.chip_certificate = certificate;
    }

    /// Whether keys are present
    pub fn is_established(&self) -> bool {
        self.k_enc.iter().chain(&self.k_mac).any(|b| *b != 0)
    }

    fn encrypt(&self, data: &mut [u8]) -> Result<()> {
        match self.cipher {
            SmCipher::Tdes => crypto::tdes_encrypt(&self.k_enc, data)?,
            SmCipher::Aes128 => crypto::aes_cbc_encrypt(&self.k_enc, &self.aes_iv(), data)?,
        }
        Ok(())
    }

    fn decrypt(&self, data: &mut [u8]) -> Result<()> {
        match self.cipher {
            SmCipher::Tdes => crypto::tdes_decrypt(&self.k_enc, data)?,
            SmCipher::Aes128 => crypto::aes_cbc_decrypt(&self.k_enc, &self.aes_iv(), data)?,
        }
        Ok(())
    }

    fn aes_iv(&self) -> [u8; 16] {
        crypto::aes_encrypt_block(&self.k_enc, self.ssc_block())
    }

    fn ssc_block(&self) -> [u8; 16] {
        let mut block = [0u8; 16];
        block[8..].copy_from_slice(&self.ssc.to_be_bytes());
        block
    }

    /// MAC over `zeros || SSC || data`, `data` being already padded
    fn mac(&self, padded: &[u8]) -> Result<[u8; 8]> {
        let bs = self.cipher.block_size();
        let mut input = Vec::with_capacity(bs + padded.len());
        input.extend_from_slice(&self.ssc_block()[16 - bs..]);
        input.extend_from_slice(padded);
        let mac = match self.cipher {
            SmCipher::Tdes => crypto::retail_mac(&self.k_mac, &input)?,
            SmCipher::Aes128 => {
                let full = crypto::aes_cmac(&self.k_mac, &input);
                let mut truncated = [0u8; 8];
                truncated.copy_from_slice(&full[..8]);
                truncated
            }
        };
        input.zeroize();
        Ok(mac)
    }

    /// Wrap a plain command into a protected one
    pub fn protect(&mut self, command: &Command) -> Result<Command> {
        self.ssc = self.ssc.wrapping_add(1);
        let bs = self.cipher.block_size();
        let cla = command.class() | 0x0C;
        let header = [cla, command.instruction(), command.p1(), command.p2()];

        let mut objects = BytesMut::new();
        if !command.data().is_empty() {
            let mut payload = crypto::pad(command.data(), bs);
            self.encrypt(&mut payload)?;
            if command.instruction() & 1 == 0 {
                objects.put_u8(TAG_ENCRYPTED);
                put_ber_length(&mut objects, payload.len() + 1);
                objects.put_u8(PADDING_INDICATOR);
            } else {
                objects.put_u8(TAG_ENCRYPTED_ODD);
                put_ber_length(&mut objects, payload.len());
            }
            objects.put_slice(&payload);
        }

        if command.expected_length().is_some() {
            let le = command.le_bytes();
            // Extended Le carries a leading zero byte only without data, drop it inside DO97
            let le = if le.len() == 3 { le.slice(1..) } else { le };
            objects.put_u8(TAG_LE);
            put_ber_length(&mut objects, le.len());
            objects.put_slice(&le);
        }

        let mut mac_input = crypto::pad(&header, bs);
        mac_input.extend_from_slice(&objects);
        let mac = self.mac(&crypto::pad(&mac_input, bs))?;
        objects.put_u8(TAG_MAC);
        objects.put_u8(mac.len() as u8);
        objects.put_slice(&mac);

        let extended =
            objects.len() > 255 || command.expected_length().is_some_and(|le| le > MAX_SHORT_LE);
        let le = if extended { MAX_EXTENDED_LE } else { MAX_SHORT_LE };

        trace!(ssc = self.ssc, ins = command.instruction(), "Protected command");
        Ok(Command::new_with_data_and_le(
            cla,
            command.instruction(),
            command.p1(),
            command.p2(),
            objects.freeze(),
            le,
        ))
    }

    /// Verify and unwrap a protected response
    ///
    /// An error status answered in plain, without data objects, is passed through so callers
    /// can interpret it. A plain success is never accepted.
    pub fn unprotect(&mut self, response: &Response) -> Result<Response> {
        self.ssc = self.ssc.wrapping_add(1);
        let status = response.status();
        let data = response.data();

        if data.is_empty() {
            if status.is_sm_data_error() {
                warn!(%status, "Card rejected secure messaging objects");
                return Err(ProtocolError::status("Secure messaging rejected", status));
            }
            if status.is_success() {
                warn!("Unprotected success response on secure channel");
                return Err(ProtocolError::apdu("Missing secure messaging objects"));
            }
            return Ok(Response::error(status));
        }

        let Some((body, mac_object)) = data.split_last_chunk::<10>() else {
            return Err(ProtocolError::apdu("Protected response too short"));
        };
        if mac_object[0] != TAG_MAC || mac_object[1] != 0x08 {
            return Err(ProtocolError::apdu("Missing DO8E"));
        }
        let expected = self.mac(&crypto::pad(body, self.cipher.block_size()))?;
        if expected != mac_object[2..] {
            warn!(ssc = self.ssc, "Response MAC mismatch");
            return Err(ProtocolError::apdu("Response MAC verification failed"));
        }

        let mut encrypted: Option<(u8, &[u8])> = None;
        let mut status_object: Option<&[u8]> = None;
        for (tag, value) in DataObjects::new(body) {
            let value = value?;
            match tag {
                TAG_ENCRYPTED | TAG_ENCRYPTED_ODD => encrypted = Some((tag, value)),
                TAG_STATUS => status_object = Some(value),
                other => {
                    return Err(ProtocolError::apdu(format!(
                        "Unexpected data object {other:02X}"
                    )));
                }
            }
        }

        let protected_status = match status_object {
            Some([sw1, sw2]) => StatusWord::new(*sw1, *sw2),
            _ => return Err(ProtocolError::apdu("Missing or malformed DO99")),
        };
        if protected_status != status {
            return Err(ProtocolError::apdu("DO99 does not match the status word"));
        }

        let plain = match encrypted {
            None => Vec::new(),
            Some((TAG_ENCRYPTED, [PADDING_INDICATOR, ciphertext @ ..])) => {
                let mut buffer = ciphertext.to_vec();
                self.decrypt(&mut buffer)?;
                let plain = crypto::unpad(&buffer)?.to_vec();
                buffer.zeroize();
                plain
            }
            Some((TAG_ENCRYPTED_ODD, ciphertext)) => {
                let mut buffer = ciphertext.to_vec();
                self.decrypt(&mut buffer)?;
                buffer
            }
            Some(_) => return Err(ProtocolError::apdu("Malformed DO87")),
        };

        Ok(Response::new(Some(plain.into()), status))
    }
}

fn put_ber_length(buf: &mut BytesMut, len: usize) {
    match len {
        0..=0x7F => buf.put_u8(len as u8),
        0x80..=0xFF => {
            buf.put_u8(0x81);
            buf.put_u8(len as u8);
        }
        _ => {
            buf.put_u8(0x82);
            buf.put_u16(len as u16);
        }
    }
}

/// Iterator over single-byte-tag BER data objects
struct DataObjects<'a> {
    rest: &'a [u8],
}

impl<'a> DataObjects<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { rest: data }
    }
}

impl<'a> Iterator for DataObjects<'a> {
    type Item = (u8, Result<&'a [u8]>);

    fn next(&mut self) -> Option<Self::Item> {
        let (&tag, rest) = self.rest.split_first()?;
        let malformed = || ProtocolError::apdu("Malformed data object length");
        let parsed = match rest {
            [len @ 0..=0x7F, tail @ ..] => Some((*len as usize, tail)),
            [0x81, len, tail @ ..] => Some((*len as usize, tail)),
            [0x82, hi, lo, tail @ ..] => Some((u16::from_be_bytes([*hi, *lo]) as usize, tail)),
            _ => None,
        };
        match parsed {
            Some((len, tail)) if tail.len() >= len => {
                self.rest = &tail[len..];
                Some((tag, Ok(&tail[..len])))
            }
            _ => {
                self.rest = &[];
                Some((tag, Err(malformed())))
            }
        }
    }
}
