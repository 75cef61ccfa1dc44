//! Authenticated encryption using ChaCha20-Poly1305.
//!
//! Two nonce modes are provided:
//! - [`encrypt`]: random nonce, for record bodies and wrapped keys
//! - [`encrypt_deterministic`]: nonce derived from key and plaintext, so equal
//!   inputs yield equal ciphertexts. Used only for attribute names, which must
//!   map to stable storage keys.

use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Size of nonce in bytes (96 bits for ChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 12;

/// Size of authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Encrypted data with the nonce needed for decryption.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    /// The nonce used for encryption (unique per encryption).
    pub nonce: [u8; NONCE_SIZE],
    /// The encrypted ciphertext (includes auth tag).
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Returns the total size of the encrypted data.
    pub fn len(&self) -> usize {
        NONCE_SIZE + self.ciphertext.len()
    }

    /// Returns true if the ciphertext is empty.
    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decryption("data too short".to_string()));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[..NONCE_SIZE]);
        Ok(Self {
            nonce,
            ciphertext: bytes[NONCE_SIZE..].to_vec(),
        })
    }

    /// Encodes to base64 for storage/transmission.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    /// Decodes from base64.
    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::Decryption(format!("invalid base64: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Encodes to URL-safe base64 without padding (usable as a map key).
    pub fn to_key_string(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_bytes())
    }

    /// Decodes from [`EncryptedData::to_key_string`] output.
    pub fn from_key_string(encoded: &str) -> CryptoResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| CryptoError::Decryption(format!("invalid key string: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

fn seal(key: &DerivedKey, nonce_bytes: [u8; NONCE_SIZE], plaintext: &[u8]) -> CryptoResult<EncryptedData> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    Ok(EncryptedData {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Encrypts plaintext under a random nonce.
pub fn encrypt(key: &DerivedKey, plaintext: &[u8]) -> CryptoResult<EncryptedData> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    seal(key, nonce_bytes, plaintext)
}

/// Encrypts plaintext under a nonce derived from SHA-256(key ‖ plaintext).
///
/// Equal plaintexts under the same key produce equal output. Only use this for
/// short identifiers whose equality is not secret from key holders.
pub fn encrypt_deterministic(key: &DerivedKey, plaintext: &[u8]) -> CryptoResult<EncryptedData> {
    let digest = Sha256::new()
        .chain_update(key.as_bytes())
        .chain_update(plaintext)
        .finalize();
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&digest[..NONCE_SIZE]);
    seal(key, nonce_bytes, plaintext)
}

/// Decrypts ciphertext produced by either encryption mode.
pub fn decrypt(key: &DerivedKey, encrypted: &EncryptedData) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = Nonce::from_slice(&encrypted.nonce);

    cipher
        .decrypt(nonce, encrypted.ciphertext.as_ref())
        .map_err(|_| {
            CryptoError::Decryption("decryption failed (wrong key or tampered data)".to_string())
        })
}

/// Encrypts a string and returns base64-encoded result.
pub fn encrypt_string(key: &DerivedKey, plaintext: &str) -> CryptoResult<String> {
    Ok(encrypt(key, plaintext.as_bytes())?.to_base64())
}

/// Decrypts a base64-encoded string.
pub fn decrypt_string(key: &DerivedKey, encoded: &str) -> CryptoResult<String> {
    let encrypted = EncryptedData::from_base64(encoded)?;
    let plaintext = decrypt(key, &encrypted)?;
    String::from_utf8(plaintext).map_err(|e| CryptoError::Encoding(format!("invalid UTF-8: {e}")))
}
