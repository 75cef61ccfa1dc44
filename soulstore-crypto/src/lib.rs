//! Encryption layer for soulstore.
//!
//! - [`cipher`]: ChaCha20-Poly1305 AEAD over raw bytes, plus a deterministic
//!   mode used for attribute names
//! - [`key`]: Argon2id password derivation and random key generation
//! - [`EntityKey`]: per-entity symmetric key for Variable-Encrypted naming,
//!   stored wrapped under the master key as `{k, s, iv}`
//! - [`EnvelopeCipher`]: the capability the engine uses to seal persisted
//!   records; [`PassthroughCipher`] for plaintext operation and
//!   [`MasterKeyCipher`] for encrypted stores

pub mod cipher;
mod entity_key;
mod envelope;
mod error;
pub mod key;

pub use cipher::EncryptedData;
pub use entity_key::{EntityKey, WrappedKey};
pub use envelope::{EnvelopeCipher, MasterKeyCipher, PassthroughCipher};
pub use error::{CryptoError, CryptoResult};
pub use key::{derive_key, generate_random_key, DerivedKey, KdfParams, Salt};
