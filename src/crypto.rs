//! Tuya protocol encryption and decryption primitives.
//! AES-128-ECB with PKCS#7 padding (v3.3) and AES-128-GCM with AAD (v3.5).

use crate::error::{Result, TuyaError};
use aes::Aes128;
use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use cipher::{BlockDecryptMut, BlockEncryptMut};
use ecb::{Decryptor, Encryptor};

pub const KEY_LEN: usize = 16;
pub const BLOCK_LEN: usize = 16;
pub const GCM_NONCE_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;

/// TuyaCipher provides AES-128 encryption and decryption in ECB and GCM modes.
///
/// Pure byte transforms: no state is mutated after construction.
pub struct TuyaCipher {
    /// 16-byte encryption key
    key: [u8; KEY_LEN],
    /// Cached GCM cipher
    gcm: Aes128Gcm,
}

impl TuyaCipher {
    /// Create a new TuyaCipher with a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        let k: [u8; KEY_LEN] = key.try_into().map_err(|_| {
            TuyaError::Crypto(format!("key must be {} bytes, got {}", KEY_LEN, key.len()))
        })?;
        let gcm = Aes128Gcm::new(&k.into());
        Ok(Self { key: k, gcm })
    }

    /// AES-128-ECB with PKCS#7 padding. Deterministic, no IV.
    pub fn encrypt_legacy(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());

        let padding_len = BLOCK_LEN - plaintext.len() % BLOCK_LEN;
        let mut buf = Vec::with_capacity(plaintext.len() + padding_len);
        buf.extend_from_slice(plaintext);
        buf.resize(plaintext.len() + padding_len, padding_len as u8);

        for chunk in buf.chunks_mut(BLOCK_LEN) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }
        buf
    }

    /// Inverse of [`encrypt_legacy`](Self::encrypt_legacy).
    ///
    /// Fails on unaligned input or malformed padding.
    pub fn decrypt_legacy(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(TuyaError::Crypto(format!(
                "ciphertext length {} is not a positive multiple of {}",
                ciphertext.len(),
                BLOCK_LEN
            )));
        }

        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        let mut plaintext = ciphertext.to_vec();
        for chunk in plaintext.chunks_mut(BLOCK_LEN) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }

        let pad_len = plaintext[plaintext.len() - 1] as usize;
        if pad_len == 0 || pad_len > BLOCK_LEN {
            return Err(TuyaError::Crypto("bad padding".into()));
        }
        if plaintext[plaintext.len() - pad_len..]
            .iter()
            .any(|&b| b as usize != pad_len)
        {
            return Err(TuyaError::Crypto("bad padding".into()));
        }
        plaintext.truncate(plaintext.len() - pad_len);
        Ok(plaintext)
    }

    /// AES-128-GCM. Returns `ciphertext || tag`.
    pub fn encrypt_aead(&self, plaintext: &[u8], nonce: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::nonce(nonce)?;
        self.gcm
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| TuyaError::Crypto("AES-GCM encryption failed".into()))
    }

    /// Opens `ciphertext || tag`. A tag that does not verify is a hard error.
    pub fn decrypt_aead(&self, sealed: &[u8], nonce: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < GCM_TAG_LEN {
            return Err(TuyaError::Crypto("sealed payload shorter than tag".into()));
        }
        let nonce = Self::nonce(nonce)?;
        // No fallback to another key: a failed tag is surfaced as-is.
        self.gcm
            .decrypt(nonce, Payload { msg: sealed, aad })
            .map_err(|_| TuyaError::Crypto("authentication failed".into()))
    }

    fn nonce(nonce: &[u8]) -> Result<&Nonce<aes_gcm::aead::consts::U12>> {
        if nonce.len() != GCM_NONCE_LEN {
            return Err(TuyaError::Crypto(format!(
                "nonce must be {} bytes, got {}",
                GCM_NONCE_LEN,
                nonce.len()
            )));
        }
        Ok(Nonce::from_slice(nonce))
    }
}
