//! Record sealing capability.
//!
//! The engine never sees raw master keys: it depends on `Arc<dyn
//! EnvelopeCipher>` to seal persisted records and to wrap per-entity keys.
//! [`PassthroughCipher`] leaves data readable (tests, unencrypted stores);
//! [`MasterKeyCipher`] encrypts under a password-derived key.

use crate::cipher::{self, EncryptedData};
use crate::entity_key::{EntityKey, WrappedKey};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{derive_key, DerivedKey, KdfParams, Salt};
use base64::{engine::general_purpose::STANDARD, Engine};

/// Encrypts and decrypts persisted record payloads.
pub trait EnvelopeCipher: Send + Sync {
    /// Returns true when this cipher actually encrypts.
    fn is_encrypting(&self) -> bool;

    /// Seals a plaintext payload belonging to `soul`.
    fn encrypt(&self, soul: &str, plain: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Opens a payload previously produced by [`EnvelopeCipher::encrypt`].
    fn decrypt(&self, soul: &str, sealed: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Wraps a per-entity key for storage in record metadata.
    fn wrap_key(&self, key: &EntityKey) -> CryptoResult<WrappedKey>;

    /// Recovers a per-entity key from record metadata.
    fn unwrap_key(&self, wrapped: &WrappedKey) -> CryptoResult<EntityKey>;
}

/// No-op cipher. Payloads and wrapped keys pass through as plaintext.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCipher;

impl EnvelopeCipher for PassthroughCipher {
    fn is_encrypting(&self) -> bool {
        false
    }

    fn encrypt(&self, _soul: &str, plain: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(plain.to_vec())
    }

    fn decrypt(&self, _soul: &str, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(sealed.to_vec())
    }

    fn wrap_key(&self, key: &EntityKey) -> CryptoResult<WrappedKey> {
        Ok(WrappedKey {
            k: STANDARD.encode(key.key().as_bytes()),
            s: String::new(),
            iv: String::new(),
        })
    }

    fn unwrap_key(&self, wrapped: &WrappedKey) -> CryptoResult<EntityKey> {
        let bytes = STANDARD
            .decode(&wrapped.k)
            .map_err(|e| CryptoError::Encoding(format!("invalid key: {e}")))?;
        Ok(EntityKey::from_key(DerivedKey::from_slice(&bytes)?))
    }
}

/// Cipher keyed by a master key, typically derived from a password.
#[derive(Debug, Clone)]
pub struct MasterKeyCipher {
    master: DerivedKey,
    salt: Option<Salt>,
}

impl MasterKeyCipher {
    /// Creates a cipher from an existing master key.
    pub fn new(master: DerivedKey) -> Self {
        Self { master, salt: None }
    }

    /// Derives the master key from a password with Argon2id.
    pub fn from_password(password: &str, salt: Salt, params: &KdfParams) -> CryptoResult<Self> {
        let master = derive_key(password, &salt, params)?;
        Ok(Self {
            master,
            salt: Some(salt),
        })
    }

    /// The salt the master key was derived with, if any.
    pub fn salt(&self) -> Option<&Salt> {
        self.salt.as_ref()
    }
}

impl EnvelopeCipher for MasterKeyCipher {
    fn is_encrypting(&self) -> bool {
        true
    }

    fn encrypt(&self, _soul: &str, plain: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(cipher::encrypt(&self.master, plain)?.to_base64().into_bytes())
    }

    fn decrypt(&self, _soul: &str, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        let encoded = std::str::from_utf8(sealed)
            .map_err(|e| CryptoError::Encoding(format!("sealed payload is not text: {e}")))?;
        cipher::decrypt(&self.master, &EncryptedData::from_base64(encoded)?)
    }

    fn wrap_key(&self, key: &EntityKey) -> CryptoResult<WrappedKey> {
        let sealed = cipher::encrypt(&self.master, key.key().as_bytes())?;
        Ok(WrappedKey {
            k: STANDARD.encode(&sealed.ciphertext),
            s: self.salt.as_ref().map(Salt::to_base64).unwrap_or_default(),
            iv: STANDARD.encode(sealed.nonce),
        })
    }

    fn unwrap_key(&self, wrapped: &WrappedKey) -> CryptoResult<EntityKey> {
        let decode = |field: &str, what: &str| {
            STANDARD
                .decode(field)
                .map_err(|e| CryptoError::Encoding(format!("invalid {what}: {e}")))
        };
        let nonce_bytes = decode(&wrapped.iv, "nonce")?;
        let nonce: [u8; cipher::NONCE_SIZE] = nonce_bytes
            .try_into()
            .map_err(|_| CryptoError::Encoding("nonce has wrong length".to_string()))?;
        let sealed = EncryptedData {
            nonce,
            ciphertext: decode(&wrapped.k, "key")?,
        };
        let raw = cipher::decrypt(&self.master, &sealed)?;
        Ok(EntityKey::from_key(DerivedKey::from_slice(&raw)?))
    }
}
