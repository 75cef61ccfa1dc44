//! Per-entity keys for Variable-Encrypted attribute naming.
//!
//! An entity that accepts arbitrary attribute names can hide those names from
//! anyone without its key: every name is encrypted deterministically under a
//! random [`EntityKey`], and the key itself is stored in the entity's record
//! metadata wrapped by the envelope cipher as a [`WrappedKey`].

use crate::cipher::{self, EncryptedData};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{generate_random_key, DerivedKey};
use serde::{Deserialize, Serialize};

/// A per-entity key as stored in record metadata (`m.k`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// The key bytes, encrypted (or plain base64 when the cipher has no key).
    pub k: String,
    /// Salt of the master key derivation, empty when not applicable.
    pub s: String,
    /// Nonce of the wrapping encryption, empty when not encrypted.
    pub iv: String,
}

/// A symmetric key owned by one entity.
#[derive(Clone, Debug)]
pub struct EntityKey {
    key: DerivedKey,
}

impl EntityKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        Self {
            key: generate_random_key(),
        }
    }

    /// Wraps raw key material.
    pub fn from_key(key: DerivedKey) -> Self {
        Self { key }
    }

    /// Returns the raw key.
    pub fn key(&self) -> &DerivedKey {
        &self.key
    }

    /// Encrypts an attribute name into a stable storage key.
    pub fn encrypt_name(&self, name: &str) -> CryptoResult<String> {
        Ok(cipher::encrypt_deterministic(&self.key, name.as_bytes())?.to_key_string())
    }

    /// Recovers the attribute name from a storage key.
    pub fn decrypt_name(&self, storage_key: &str) -> CryptoResult<String> {
        let encrypted = EncryptedData::from_key_string(storage_key)?;
        let plain = cipher::decrypt(&self.key, &encrypted)?;
        String::from_utf8(plain).map_err(|e| CryptoError::Encoding(format!("invalid UTF-8: {e}")))
    }
}
