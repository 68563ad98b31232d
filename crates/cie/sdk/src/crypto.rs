//! Symmetric primitives used by secure messaging
//!
//! 3DES (two-key EDE, CBC with zero IV, ISO 9797-1 retail MAC) and AES-128 (CBC, CMAC), plus the
//! SHA-1 based key derivation of ICAO 9303-11 §9.7.1. MAC functions expect input that is
//! already padded with [`pad`].

use aes::Aes128;
use cbc::{Decryptor, Encryptor};
use cipher::{
    BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
    block_padding::NoPadding, generic_array::GenericArray,
};
use cmac::{Cmac, Mac};
use des::{Des, TdesEde2};
use sha1::{Digest, Sha1};

/// KDF counter for the encryption key
pub const KDF_ENC: u32 = 1;
/// KDF counter for the MAC key
pub const KDF_MAC: u32 = 2;
/// KDF counter for the PACE password key
pub const KDF_PI: u32 = 3;

/// DES block size
pub const DES_BLOCK: usize = 8;
/// AES block size
pub const AES_BLOCK: usize = 16;

/// Errors raised by the block cipher helpers
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// Input length is not a multiple of the block size
    #[error("Data is not aligned to the cipher block size")]
    BlockAlignment,
    /// ISO 9797-1 method 2 padding marker missing
    #[error("Invalid padding")]
    Padding,
}

/// Force odd parity on every byte of a DES key
pub fn set_parity_bits(key: &mut [u8]) {
    for byte in key {
        *byte &= 0xFE;
        *byte |= 1 ^ (byte.count_ones() as u8 & 1);
    }
}

fn sha1_kdf(seed: &[u8], counter: u32) -> [u8; 16] {
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(counter.to_be_bytes());
    let hash = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&hash[..16]);
    key
}

/// Two-key 3DES key derivation, parity bits adjusted
pub fn kdf_3des(seed: &[u8], counter: u32) -> [u8; 16] {
    let mut key = sha1_kdf(seed, counter);
    set_parity_bits(&mut key);
    key
}

/// AES-128 key derivation
pub fn kdf_aes128(seed: &[u8], counter: u32) -> [u8; 16] {
    sha1_kdf(seed, counter)
}

/// ISO 9797-1 padding method 2: append 0x80 then zeros up to the block size
pub fn pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let mut padded = Vec::with_capacity((data.len() + 1).next_multiple_of(block_size));
    padded.extend_from_slice(data);
    padded.push(0x80);
    padded.resize(padded.len().next_multiple_of(block_size), 0x00);
    padded
}

/// Strip ISO 9797-1 padding method 2
pub fn unpad(data: &[u8]) -> Result<&[u8], CryptoError> {
    let end = data
        .iter()
        .rposition(|b| *b != 0x00)
        .ok_or(CryptoError::Padding)?;
    if data[end] != 0x80 {
        return Err(CryptoError::Padding);
    }
    Ok(&data[..end])
}

const fn check_aligned(data: &[u8], block_size: usize) -> Result<(), CryptoError> {
    if data.len() % block_size == 0 {
        Ok(())
    } else {
        Err(CryptoError::BlockAlignment)
    }
}

/// ISO 9797-1 MAC algorithm 3 with DES (retail MAC) over padded data
pub fn retail_mac(key: &[u8; 16], padded: &[u8]) -> Result<[u8; 8], CryptoError> {
    check_aligned(padded, DES_BLOCK)?;
    let (k1, k2) = key.split_at(DES_BLOCK);
    let des1 = Des::new(GenericArray::from_slice(k1));
    let des2 = Des::new(GenericArray::from_slice(k2));

    let mut state = GenericArray::from([0u8; DES_BLOCK]);
    for block in padded.chunks_exact(DES_BLOCK) {
        state.iter_mut().zip(block).for_each(|(s, b)| *s ^= b);
        des1.encrypt_block(&mut state);
    }
    des2.decrypt_block(&mut state);
    des1.encrypt_block(&mut state);
    Ok(state.into())
}

/// 3DES CBC encryption in place, zero IV
pub fn tdes_encrypt(key: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError> {
    check_aligned(data, DES_BLOCK)?;
    let len = data.len();
    Encryptor::<TdesEde2>::new(key.into(), &[0u8; DES_BLOCK].into())
        .encrypt_padded_mut::<NoPadding>(data, len)
        .map_err(|_| CryptoError::BlockAlignment)?;
    Ok(())
}

/// 3DES CBC decryption in place, zero IV
pub fn tdes_decrypt(key: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError> {
    check_aligned(data, DES_BLOCK)?;
    Decryptor::<TdesEde2>::new(key.into(), &[0u8; DES_BLOCK].into())
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| CryptoError::BlockAlignment)?;
    Ok(())
}

/// Encrypt a single AES block (ECB)
pub fn aes_encrypt_block(key: &[u8; 16], block: [u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut block = GenericArray::from(block);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// AES-128 CBC encryption in place
pub fn aes_cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError> {
    check_aligned(data, AES_BLOCK)?;
    let len = data.len();
    Encryptor::<Aes128>::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(data, len)
        .map_err(|_| CryptoError::BlockAlignment)?;
    Ok(())
}

/// AES-128 CBC decryption in place
pub fn aes_cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError> {
    check_aligned(data, AES_BLOCK)?;
    Decryptor::<Aes128>::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| CryptoError::BlockAlignment)?;
    Ok(())
}

/// AES-128 CMAC, full 16-byte tag
pub fn aes_cmac(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(key.into());
    mac.update(data);
    mac.finalize().into_bytes().into()
}
