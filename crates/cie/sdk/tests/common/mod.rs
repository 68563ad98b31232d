//! Virtual CIE answering the SDK over an in-memory transport
//!
//! The card side implements the file system, the PIN counter, DH chip authentication,
//! PACE-ECDH-GM on P-256, secure messaging in both cipher suites and RSA signatures, so every
//! orchestrator can run end to end without hardware.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use cie_apdu_core::{CardConnector, CardTransport, Command, StatusWord, TransportError};
use cie_sdk::certificate::{CvDate, TrustStore, encode_body, encode_certificate};
use cie_sdk::crypto;
use cie_sdk::pace;
use cie_sdk::reader::{
    AID_CIE, AID_IAS, AID_MRTD, FID_ATR, FID_CHIP_CERTIFICATE, FID_DG1, FID_DG11, FID_INT_AUTH_KEY,
    FID_MRTD_SOD, FID_NIS, FID_SERIAL, FID_SOD, FID_USER_CERTIFICATE,
};
use cie_sdk::{CardProfile, CieConfig, CieReader, Event, ReadResult};
use crossbeam_channel::Receiver;
use p256::ecdh::diffie_hellman;
use p256::{NonZeroScalar, ProjectivePoint};
use parking_lot::Mutex;
use rand_v8::RngCore;
use rand_v8::rngs::OsRng;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

pub const CA_KEY: &str = include_str!("../fixtures/ca_key.pem");
pub const CHIP_KEY: &str = include_str!("../fixtures/chip_key.pem");
pub const USER_KEY: &str = include_str!("../fixtures/user_key.pem");
pub const USER_CERT: &[u8] = include_bytes!("../fixtures/user_cert.der");
pub const USER_CERT_EXPIRED: &[u8] = include_bytes!("../fixtures/user_cert_expired.der");

pub const PIN: &str = "12345678";
pub const CAN: &str = "123456";
pub const SERIAL: &[u8] = b"CA00000AA";
pub const CA_REFERENCE: &[u8] = b"ITCVCA00001";
pub const CHIP_REFERENCE: &[u8] = b"ITCHIP00001";
pub const IDP_URL: &str = "https://idserver.servizicie.interno.gov.it/idp/";

// RFC 5114 section 2.1 group
const DH_P: &str = "B10B8F96A080E01DDE92DE5EAE5D54EC52C99FBCFB06A3C69A6A9DCA52D23B616073E28675A23D189838EF1E2EE652C013ECB4AEA906112324975C3CD49B83BFACCBDD7D90C4BD7098488E9C219A73724EFFD6FAE5644738FAA31A4FF55BCCC0A151AF5F0DC8B4BD45BF37DF365C1A65E68CFDA76D4DA708DF1FB2BC2E4A4371";
const DH_G: &str = "A4D1CBD5C3FD34126765A442EFB99905F8104DD258AC507FD6406CFF14266D31266FEA1E5C41564B777E690F5504F213160217B4B01B886A5E91547F9E2749F4D7FBD7D3B9A92EE1909D0D2263F80A76A6A24C087A091F531DBF0A0169B6A28AD662A4D18E73AFA32D779D5918D08BC8858F4DCEF97C2A24855E6EEB22B3B2E5";
const DH_Q: &str = "F518AA8781A8DF278ABA4E7D64B7CB9D49462353";
const DH_CHIP_PRIVATE: &str = "66DDAFEAC1609CB5B963BB0CB3FF8B3E047F336C";

const SW_OK: u16 = 0x9000;

pub fn private_key(pem: &str) -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs8_pem(pem).unwrap()
}

/// Trust store holding the test certification authority
pub fn trust_store() -> TrustStore {
    TrustStore::new().with_anchor(CA_REFERENCE, private_key(CA_KEY).to_public_key())
}

/// Chip CV certificate valid around today
pub fn chip_certificate() -> Vec<u8> {
    let today = CvDate::from_system_time(SystemTime::now()).unwrap();
    signed_chip_certificate(
        CvDate { year: today.year - 1, month: 1, day: 1 },
        CvDate { year: today.year + 5, month: 12, day: 31 },
        false,
    )
}

/// Chip CV certificate that ended last year
pub fn expired_chip_certificate() -> Vec<u8> {
    let today = CvDate::from_system_time(SystemTime::now()).unwrap();
    signed_chip_certificate(
        CvDate { year: today.year - 6, month: 1, day: 1 },
        CvDate { year: today.year - 1, month: 12, day: 31 },
        false,
    )
}

/// Chip CV certificate with a corrupted signature
pub fn tampered_chip_certificate() -> Vec<u8> {
    let today = CvDate::from_system_time(SystemTime::now()).unwrap();
    signed_chip_certificate(
        CvDate { year: today.year - 1, month: 1, day: 1 },
        CvDate { year: today.year + 5, month: 12, day: 31 },
        true,
    )
}

fn signed_chip_certificate(effective: CvDate, expiration: CvDate, tamper: bool) -> Vec<u8> {
    let chip = private_key(CHIP_KEY).to_public_key();
    let body = encode_body(&[0x00], CA_REFERENCE, &chip, CHIP_REFERENCE, effective, expiration).unwrap();
    let mut signature = private_key(CA_KEY)
        .sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(&body))
        .unwrap();
    if tamper {
        let last = signature.len() - 1;
        signature[last] ^= 0x01;
    }
    encode_certificate(&body, &signature).unwrap()
}

fn ber_length(len: usize) -> Vec<u8> {
    match len {
        0..=0x7F => vec![len as u8],
        0x80..=0xFF => vec![0x81, len as u8],
        _ => vec![0x82, (len >> 8) as u8, len as u8],
    }
}

fn encode_do(tag: u8, value: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(ber_length(value.len()));
    out.extend_from_slice(value);
    out
}

/// Next single-byte-tag data object: tag, value, remainder
fn next_do(buf: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = buf.split_first()?;
    let (&first, rest) = rest.split_first()?;
    let (len, rest) = match first {
        0x81 => {
            let (&len, rest) = rest.split_first()?;
            (usize::from(len), rest)
        }
        0x82 => {
            let (len, rest) = rest.split_first_chunk::<2>()?;
            (usize::from(u16::from_be_bytes(*len)), rest)
        }
        len if len < 0x80 => (usize::from(len), rest),
        _ => return None,
    };
    (rest.len() >= len).then(|| (tag, &rest[..len], &rest[len..]))
}

/// `7C { tag value }` as sent by the card
fn dynamic_auth(tag: u8, value: &[u8]) -> Vec<u8> {
    encode_do(0x7C, &encode_do(tag, value))
}

/// Inner object of a terminal `7C`, `None` for `7C00`
fn dynamic_auth_child(data: &[u8]) -> Option<Option<(u8, Vec<u8>)>> {
    let (tag, inner, _) = next_do(data)?;
    if tag != 0x7C {
        return None;
    }
    if inner.is_empty() {
        return Some(None);
    }
    let (child, value, _) = next_do(inner)?;
    Some(Some((child, value.to_vec())))
}

/// Card side of secure messaging
#[derive(Debug)]
struct CardChannel {
    aes: bool,
    k_enc: [u8; 16],
    k_mac: [u8; 16],
    ssc: u64,
}

impl CardChannel {
    fn block_size(&self) -> usize {
        if self.aes { crypto::AES_BLOCK } else { crypto::DES_BLOCK }
    }

    fn ssc_block(&self) -> [u8; 16] {
        let mut block = [0u8; 16];
        block[8..].copy_from_slice(&self.ssc.to_be_bytes());
        block
    }

    fn mac(&self, data: &[u8]) -> [u8; 8] {
        let bs = self.block_size();
        let mut input = self.ssc_block()[16 - bs..].to_vec();
        input.extend(crypto::pad(data, bs));
        if self.aes {
            let mut mac = [0u8; 8];
            mac.copy_from_slice(&crypto::aes_cmac(&self.k_mac, &input)[..8]);
            mac
        } else {
            crypto::retail_mac(&self.k_mac, &input).unwrap()
        }
    }

    fn iv(&self) -> [u8; 16] {
        crypto::aes_encrypt_block(&self.k_enc, self.ssc_block())
    }

    fn decrypt(&self, data: &[u8]) -> Option<Vec<u8>> {
        let mut buffer = data.to_vec();
        if self.aes {
            crypto::aes_cbc_decrypt(&self.k_enc, &self.iv(), &mut buffer).ok()?;
        } else {
            crypto::tdes_decrypt(&self.k_enc, &mut buffer).ok()?;
        }
        crypto::unpad(&buffer).ok().map(<[u8]>::to_vec)
    }

    fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut buffer = crypto::pad(data, self.block_size());
        if self.aes {
            crypto::aes_cbc_encrypt(&self.k_enc, &self.iv(), &mut buffer).unwrap();
        } else {
            crypto::tdes_encrypt(&self.k_enc, &mut buffer).unwrap();
        }
        buffer
    }

    /// Verify and decrypt a protected command
    fn unwrap(&mut self, command: &Command) -> Option<Command> {
        self.ssc += 1;
        let data = command.data();
        let mut rest = data;
        let mut plain = None;
        let mut le = None;
        loop {
            let (tag, value, next) = next_do(rest)?;
            match tag {
                0x87 => plain = Some(self.decrypt(value.get(1..)?)?),
                0x85 => plain = Some(self.decrypt(value)?),
                0x97 => {
                    le = Some(match value {
                        [0x00] => 256,
                        [short] => u32::from(*short),
                        [0x00, 0x00] => 65536,
                        [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
                        _ => return None,
                    })
                }
                0x8E => {
                    let mac_input_len = data.len() - rest.len();
                    let mut input = crypto::pad(&command.header(), self.block_size());
                    input.extend_from_slice(&data[..mac_input_len]);
                    if self.mac(&input).as_slice() != value || !next.is_empty() {
                        return None;
                    }
                    break;
                }
                _ => return None,
            }
            rest = next;
        }

        let mut unwrapped = Command::new(command.class() & !0x0C, command.instruction(), command.p1(), command.p2());
        if let Some(plain) = plain {
            unwrapped = unwrapped.with_data(plain);
        }
        if let Some(le) = le {
            unwrapped = unwrapped.with_le(le);
        }
        Some(unwrapped)
    }

    /// Protect a response; errors without data go back as a bare status word
    fn wrap(&mut self, data: &[u8], status: u16) -> Vec<u8> {
        self.ssc += 1;
        let sw = status.to_be_bytes();
        if status != SW_OK && data.is_empty() {
            return sw.to_vec();
        }
        let mut body = Vec::new();
        if !data.is_empty() {
            let mut value = vec![0x01];
            value.extend(self.encrypt(data));
            body.extend(encode_do(0x87, &value));
        }
        body.extend(encode_do(0x99, &sw));
        let mac = self.mac(&body);
        body.extend(encode_do(0x8E, &mac));
        body.extend_from_slice(&sw);
        body
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Application {
    None,
    Master,
    Ias,
    Cie,
    Mrtd,
}

#[derive(Debug, Default)]
struct PaceState {
    nonce: Vec<u8>,
    generator: Option<ProjectivePoint>,
    chip_public: Vec<u8>,
    terminal_public: Vec<u8>,
    keys: Option<([u8; 16], [u8; 16])>,
}

/// State of the virtual card, shared between connector and tests
#[derive(Debug)]
pub struct VirtualCie {
    pub atr: Vec<u8>,
    pub is_cie: bool,
    pub pin: String,
    pub pin_tries: u8,
    pub can: String,
    pub stall: Option<Duration>,
    /// Commands answered before the card leaves the field
    pub remove_after: Option<usize>,
    files: HashMap<(Application, [u8; 2]), Vec<u8>>,
    chip_key: RsaPrivateKey,
    user_key: RsaPrivateKey,
    // Per connection
    application: Application,
    selected: Option<Vec<u8>>,
    channel: Option<CardChannel>,
    pin_verified: bool,
    pace: Option<PaceState>,
    /// Unwrapped command headers in arrival order
    pub log: Vec<[u8; 4]>,
}

impl VirtualCie {
    pub fn new() -> Self {
        let chip_key = private_key(CHIP_KEY);
        let chip_public = chip_key.to_public_key();
        let mut key_file = encode_do(0x81, &chip_public.n().to_bytes_be());
        key_file.extend(encode_do(0x82, &chip_public.e().to_bytes_be()));

        let mut atr = vec![0x3B, 0x8F, 0x80, 0x01];
        atr.extend_from_slice(CardProfile::St.signature());

        let mut files = HashMap::new();
        files.insert((Application::Master, FID_ATR), atr.clone());
        files.insert((Application::Cie, FID_NIS), b"NIS123456789".to_vec());
        files.insert((Application::Cie, FID_SERIAL), SERIAL.to_vec());
        files.insert((Application::Cie, FID_USER_CERTIFICATE), USER_CERT.to_vec());
        files.insert((Application::Cie, FID_INT_AUTH_KEY), key_file);
        files.insert((Application::Cie, FID_CHIP_CERTIFICATE), chip_certificate());
        files.insert((Application::Cie, FID_SOD), pattern(0x30, 600));
        files.insert((Application::Mrtd, FID_DG1), pattern(0x61, 93));
        files.insert((Application::Mrtd, FID_DG11), pattern(0x6B, 0xDF * 2));
        files.insert((Application::Mrtd, FID_MRTD_SOD), pattern(0x77, 1500));

        Self {
            atr,
            is_cie: true,
            pin: PIN.into(),
            pin_tries: 3,
            can: CAN.into(),
            stall: None,
            remove_after: None,
            files,
            chip_key,
            user_key: private_key(USER_KEY),
            application: Application::None,
            selected: None,
            channel: None,
            pin_verified: false,
            pace: None,
            log: Vec::new(),
        }
    }

    pub fn set_chip_certificate(&mut self, certificate: Vec<u8>) {
        self.files.insert((Application::Cie, FID_CHIP_CERTIFICATE), certificate);
    }

    pub fn set_user_certificate(&mut self, certificate: &[u8]) {
        self.files.insert((Application::Cie, FID_USER_CERTIFICATE), certificate.to_vec());
    }

    pub fn file(&self, fid: [u8; 2]) -> Vec<u8> {
        [Application::Master, Application::Cie, Application::Mrtd]
            .iter()
            .find_map(|app| self.files.get(&(*app, fid)).cloned())
            .unwrap_or_default()
    }

    /// Number of logged commands with instruction `ins`
    pub fn count(&self, ins: u8) -> usize {
        self.log.iter().filter(|header| header[1] == ins).count()
    }

    fn reset_connection(&mut self) {
        self.application = Application::None;
        self.selected = None;
        self.channel = None;
        self.pin_verified = false;
        self.pace = None;
    }

    fn process(&mut self, raw: &[u8]) -> Vec<u8> {
        let Ok(command) = Command::from_bytes(raw) else {
            return 0x6700u16.to_be_bytes().to_vec();
        };
        let protected = command.class() & 0x0C == 0x0C;
        let command = match (&mut self.channel, protected) {
            (Some(channel), true) => match channel.unwrap(&command) {
                Some(command) => command,
                None => {
                    self.channel = None;
                    return 0x6988u16.to_be_bytes().to_vec();
                }
            },
            (Some(_), false) => {
                self.channel = None;
                return 0x6882u16.to_be_bytes().to_vec();
            }
            (None, true) => return 0x6882u16.to_be_bytes().to_vec(),
            (None, false) => command,
        };
        self.log.push(command.header());

        let (data, status) = self.execute(&command);
        match (&mut self.channel, protected) {
            (Some(channel), true) => channel.wrap(&data, status),
            _ => {
                let mut response = data;
                response.extend_from_slice(&status.to_be_bytes());
                response
            }
        }
    }

    fn execute(&mut self, command: &Command) -> (Vec<u8>, u16) {
        match command.instruction() {
            0xA4 => self.select(command),
            0xB0 => self.read_binary(command),
            0xCB => self.get_data(command),
            0x22 => self.manage_security_environment(command),
            0x86 if self.pace.is_some() => self.pace_step(command),
            0x86 => self.dh_key_exchange(command),
            0x88 => self.internal_authenticate(command),
            0x20 => self.verify(command),
            0x2A => self.sign(command),
            _ => (Vec::new(), 0x6D00),
        }
    }

    fn select(&mut self, command: &Command) -> (Vec<u8>, u16) {
        let data = command.data();
        match command.p1() {
            0x04 => {
                let application = if data == AID_IAS && self.is_cie {
                    Application::Ias
                } else if data == AID_CIE && self.is_cie {
                    Application::Cie
                } else if data == AID_MRTD && self.is_cie {
                    Application::Mrtd
                } else {
                    return (Vec::new(), 0x6A82);
                };
                self.application = application;
                self.selected = None;
                (Vec::new(), SW_OK)
            }
            0x00 if data == [0x3F, 0x00] => {
                self.application = Application::Master;
                self.selected = None;
                (Vec::new(), SW_OK)
            }
            0x02 => {
                let Ok(fid) = <[u8; 2]>::try_from(data) else {
                    return (Vec::new(), 0x6700);
                };
                match self.files.get(&(self.application, fid)) {
                    Some(content) => {
                        self.selected = Some(content.clone());
                        (Vec::new(), SW_OK)
                    }
                    None => (Vec::new(), 0x6A82),
                }
            }
            _ => (Vec::new(), 0x6A86),
        }
    }

    fn read_binary(&mut self, command: &Command) -> (Vec<u8>, u16) {
        let Some(content) = &self.selected else {
            return (Vec::new(), 0x6986);
        };
        let offset = usize::from(u16::from_be_bytes([command.p1() & 0x7F, command.p2()]));
        if offset >= content.len() {
            return (Vec::new(), 0x6B00);
        }
        let le = command.expected_length().unwrap_or(256) as usize;
        let end = content.len().min(offset + le);
        (content[offset..end].to_vec(), SW_OK)
    }

    fn get_data(&mut self, command: &Command) -> (Vec<u8>, u16) {
        let value = match command.p2() {
            0x81 => DH_G,
            0x82 => DH_P,
            0x83 => DH_Q,
            _ => return (Vec::new(), 0x6A88),
        };
        (hex::decode(value).unwrap(), SW_OK)
    }

    fn manage_security_environment(&mut self, command: &Command) -> (Vec<u8>, u16) {
        match (command.p1(), command.p2()) {
            (0xC1, 0xA4) => {
                let mut expected = vec![0x80, pace::PACE_OID.len() as u8];
                expected.extend_from_slice(pace::PACE_OID);
                if !command.data().starts_with(&expected) {
                    return (Vec::new(), 0x6A80);
                }
                self.pace = Some(PaceState::default());
                (Vec::new(), SW_OK)
            }
            (0x41, 0xA6) | (0x41, 0xB6) => (Vec::new(), SW_OK),
            _ => (Vec::new(), 0x6A86),
        }
    }

    fn dh_key_exchange(&mut self, command: &Command) -> (Vec<u8>, u16) {
        let Some(Some((0x81, terminal_public))) = dynamic_auth_child(command.data()) else {
            return (Vec::new(), 0x6A80);
        };
        let p = BigUint::parse_bytes(DH_P.as_bytes(), 16).unwrap();
        let g = BigUint::parse_bytes(DH_G.as_bytes(), 16).unwrap();
        let x = BigUint::parse_bytes(DH_CHIP_PRIVATE.as_bytes(), 16).unwrap();
        let modulus_len = p.to_bytes_be().len();
        let left_pad = |value: BigUint| {
            let bytes = value.to_bytes_be();
            let mut out = vec![0u8; modulus_len - bytes.len()];
            out.extend(bytes);
            out
        };

        let chip_public = left_pad(g.modpow(&x, &p));
        let secret = left_pad(BigUint::from_bytes_be(&terminal_public).modpow(&x, &p));
        self.channel = Some(CardChannel {
            aes: false,
            k_enc: crypto::kdf_3des(&secret, crypto::KDF_ENC),
            k_mac: crypto::kdf_3des(&secret, crypto::KDF_MAC),
            ssc: 0,
        });
        (dynamic_auth(0x82, &chip_public), SW_OK)
    }

    fn pace_step(&mut self, command: &Command) -> (Vec<u8>, u16) {
        let can = self.can.clone();
        let Some(state) = self.pace.as_mut() else {
            return (Vec::new(), 0x6985);
        };
        let Some(child) = dynamic_auth_child(command.data()) else {
            return (Vec::new(), 0x6A80);
        };

        match child {
            None => {
                let mut nonce = vec![0u8; 16];
                OsRng.fill_bytes(&mut nonce);
                state.nonce = nonce.clone();
                crypto::aes_cbc_encrypt(&pace::password_key(&can), &[0u8; 16], &mut nonce).unwrap();
                (dynamic_auth(0x80, &nonce), SW_OK)
            }
            Some((0x81, terminal_map)) => {
                let Ok(terminal_map) = pace::decode_point(&terminal_map) else {
                    return (Vec::new(), 0x6A80);
                };
                let map_key = NonZeroScalar::random(&mut OsRng);
                let map_public = ProjectivePoint::GENERATOR * *map_key;
                let nonce = pace::nonce_scalar(&state.nonce).unwrap();
                state.generator = Some(pace::map_generator(&nonce, &(terminal_map * *map_key)).unwrap());
                (dynamic_auth(0x82, &pace::encode_point(&map_public)), SW_OK)
            }
            Some((0x83, terminal_public)) => {
                let (Some(generator), Ok(terminal_point)) =
                    (state.generator, pace::decode_point(&terminal_public))
                else {
                    return (Vec::new(), 0x6A80);
                };
                let ephemeral = NonZeroScalar::random(&mut OsRng);
                let public = pace::encode_point(&(generator * *ephemeral));
                let shared = diffie_hellman(ephemeral, terminal_point.to_affine());
                let secret = shared.raw_secret_bytes();
                state.keys = Some((
                    crypto::kdf_aes128(secret, crypto::KDF_ENC),
                    crypto::kdf_aes128(secret, crypto::KDF_MAC),
                ));
                state.chip_public = public.clone();
                state.terminal_public = terminal_public;
                (dynamic_auth(0x84, &public), SW_OK)
            }
            Some((0x85, terminal_token)) => {
                let Some((k_enc, k_mac)) = state.keys else {
                    return (Vec::new(), 0x6985);
                };
                let expected = pace::authentication_token(&k_mac, &state.chip_public).unwrap();
                if terminal_token != expected {
                    self.pace = None;
                    return (Vec::new(), 0x6300);
                }
                let token = pace::authentication_token(&k_mac, &state.terminal_public).unwrap();
                self.pace = None;
                self.channel = Some(CardChannel {
                    aes: true,
                    k_enc,
                    k_mac,
                    ssc: 0,
                });
                (dynamic_auth(0x86, &token), SW_OK)
            }
            Some(_) => (Vec::new(), 0x6A80),
        }
    }

    fn internal_authenticate(&mut self, command: &Command) -> (Vec<u8>, u16) {
        match self.chip_key.sign(Pkcs1v15Sign::new_unprefixed(), command.data()) {
            Ok(signature) => (signature, SW_OK),
            Err(_) => (Vec::new(), 0x6700),
        }
    }

    fn verify(&mut self, command: &Command) -> (Vec<u8>, u16) {
        if self.pin_tries == 0 {
            return (Vec::new(), 0x6983);
        }
        if command.data() == self.pin.as_bytes() {
            self.pin_tries = 3;
            self.pin_verified = true;
            return (Vec::new(), SW_OK);
        }
        self.pin_tries -= 1;
        (Vec::new(), 0x63C0 | u16::from(self.pin_tries))
    }

    fn sign(&mut self, command: &Command) -> (Vec<u8>, u16) {
        if !self.pin_verified {
            return (Vec::new(), 0x6982);
        }
        match self.user_key.sign(Pkcs1v15Sign::new_unprefixed(), command.data()) {
            Ok(signature) => (signature, SW_OK),
            Err(_) => (Vec::new(), 0x6A80),
        }
    }
}

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

/// Transport bound to the shared card
#[derive(Debug)]
pub struct VirtualTransport {
    card: Arc<Mutex<VirtualCie>>,
    answered: usize,
}

impl CardTransport for VirtualTransport {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        let (stall, remove_after) = {
            let card = self.card.lock();
            (card.stall, card.remove_after)
        };
        if let Some(stall) = stall {
            thread::sleep(stall);
        }
        if remove_after.is_some_and(|limit| self.answered >= limit) {
            return Err(TransportError::CardRemoved);
        }
        self.answered += 1;
        Ok(Bytes::from(self.card.lock().process(command)))
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.card.lock().reset_connection();
        Ok(())
    }
}

/// Connector presenting the virtual card, or nothing
#[derive(Debug, Clone)]
pub struct VirtualConnector {
    pub card: Arc<Mutex<VirtualCie>>,
    pub present: bool,
}

impl VirtualConnector {
    pub fn new(card: VirtualCie) -> Self {
        Self {
            card: Arc::new(Mutex::new(card)),
            present: true,
        }
    }

    pub fn absent() -> Self {
        Self {
            present: false,
            ..Self::new(VirtualCie::new())
        }
    }
}

impl CardConnector for VirtualConnector {
    type Transport = VirtualTransport;

    fn poll(&mut self, timeout: Duration) -> Result<Option<Self::Transport>, TransportError> {
        if !self.present {
            thread::sleep(timeout);
            return Ok(None);
        }
        self.card.lock().reset_connection();
        Ok(Some(VirtualTransport {
            card: Arc::clone(&self.card),
            answered: 0,
        }))
    }
}

/// Reader over `card`, trusting the test authority
pub fn reader(card: VirtualCie) -> (CieReader<VirtualConnector>, Arc<Mutex<VirtualCie>>) {
    let connector = VirtualConnector::new(card);
    let handle = Arc::clone(&connector.card);
    let reader = CieReader::new(connector, &CieConfig::default())
        .unwrap()
        .with_trust_store(trust_store());
    (reader, handle)
}

/// Drain events until the terminal one
pub fn collect(events: &Receiver<Event>) -> Vec<Event> {
    let mut collected = Vec::new();
    while let Ok(event) = events.recv_timeout(Duration::from_secs(30)) {
        let terminal = event.is_terminal();
        collected.push(event);
        if terminal {
            break;
        }
    }
    collected
}

/// Progress values must never decrease and exactly one terminal event ends the stream
pub fn assert_well_formed(events: &[Event]) {
    let mut last = 0.0f32;
    for event in &events[..events.len() - 1] {
        match event {
            Event::Progress { progress, .. } => {
                assert!(*progress >= last, "progress went back from {last} to {progress}");
                assert!(*progress <= 1.0);
                last = *progress;
            }
            other => panic!("terminal event before the end: {other:?}"),
        }
    }
    assert!(events.last().is_some_and(Event::is_terminal));
}

pub fn success(events: &[Event]) -> ReadResult {
    match events.last() {
        Some(Event::Success(result)) => result.clone(),
        other => panic!("expected success, got {other:?}"),
    }
}

pub fn user_public_key() -> RsaPublicKey {
    private_key(USER_KEY).to_public_key()
}

pub fn status(value: u16) -> StatusWord {
    StatusWord::from_u16(value)
}
